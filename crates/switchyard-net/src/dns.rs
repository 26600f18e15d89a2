//! Async DNS resolver with caching
//!
//! Backs custom DNS settings: DoH/DoT hostnames are resolved here before
//! the addresses go into a tunnel config. Lookups are bounded by a
//! timeout and failures resolve to an empty list.

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use switchyard_core::HostResolver;
use thiserror::Error;
use tracing::{debug, info, warn};

/// DNS resolution errors
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("Resolution failed: {0}")]
    ResolutionFailed(String),

    #[error("No addresses found for domain")]
    NoAddresses,

    #[error("Lookup timed out")]
    Timeout,

    #[error("Resolver error: {0}")]
    ResolverError(String),
}

/// DNS resolver configuration
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Cache TTL for successful lookups
    pub cache_ttl: Duration,
    pub max_cache_entries: usize,
    /// System resolver, or Cloudflare when false
    pub use_system_dns: bool,
    pub timeout: Duration,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            max_cache_entries: 256,
            use_system_dns: true,
            timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Clone)]
struct CacheEntry {
    addresses: Vec<IpAddr>,
    expires_at: Instant,
}

pub struct DnsResolver {
    resolver: TokioAsyncResolver,
    cache: RwLock<HashMap<String, CacheEntry>>,
    config: DnsConfig,
}

impl DnsResolver {
    pub fn new(config: DnsConfig) -> Result<Self, DnsError> {
        let resolver = if config.use_system_dns {
            TokioAsyncResolver::tokio_from_system_conf().map_err(|e| DnsError::ResolverError(e.to_string()))?
        } else {
            TokioAsyncResolver::tokio(ResolverConfig::cloudflare(), ResolverOpts::default())
        };

        info!("DNS resolver initialized (system: {})", config.use_system_dns);

        Ok(Self {
            resolver,
            cache: RwLock::new(HashMap::new()),
            config,
        })
    }

    pub fn with_defaults() -> Result<Self, DnsError> {
        Self::new(DnsConfig::default())
    }

    /// Resolve a domain to IP addresses
    pub async fn lookup(&self, domain: &str) -> Result<Vec<IpAddr>, DnsError> {
        let normalized = domain.trim().trim_end_matches('.').to_lowercase();

        if let Ok(ip) = normalized.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        if let Some(cached) = self.get_cached(&normalized) {
            debug!("DNS cache hit for: {}", normalized);
            return Ok(cached);
        }

        debug!("DNS lookup for: {}", normalized);
        let lookup = tokio::time::timeout(self.config.timeout, self.resolver.lookup_ip(normalized.as_str()))
            .await
            .map_err(|_| DnsError::Timeout)?
            .map_err(|e| DnsError::ResolutionFailed(e.to_string()))?;

        let addresses: Vec<IpAddr> = lookup.iter().collect();
        if addresses.is_empty() {
            return Err(DnsError::NoAddresses);
        }

        self.cache_addresses(&normalized, &addresses);
        Ok(addresses)
    }

    pub fn clear_cache(&self) {
        self.cache.write().unwrap_or_else(PoisonError::into_inner).clear();
        info!("DNS cache cleared");
    }

    /// (total, unexpired) cache entries
    pub fn cache_stats(&self) -> (usize, usize) {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let valid = cache.values().filter(|e| e.expires_at > now).count();
        (cache.len(), valid)
    }

    fn get_cached(&self, domain: &str) -> Option<Vec<IpAddr>> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        cache
            .get(domain)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.addresses.clone())
    }

    fn cache_addresses(&self, domain: &str, addresses: &[IpAddr]) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);

        if cache.len() >= self.config.max_cache_entries {
            let now = Instant::now();
            cache.retain(|_, v| v.expires_at > now);

            if cache.len() >= self.config.max_cache_entries {
                let evict: Vec<_> = cache.keys().take(cache.len() / 4 + 1).cloned().collect();
                for key in evict {
                    cache.remove(&key);
                }
            }
        }

        cache.insert(
            domain.to_string(),
            CacheEntry {
                addresses: addresses.to_vec(),
                expires_at: Instant::now() + self.config.cache_ttl,
            },
        );
    }
}

#[async_trait]
impl HostResolver for DnsResolver {
    async fn resolve(&self, host: &str) -> Vec<IpAddr> {
        match self.lookup(host).await {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!("Failed to resolve {}: {}", host, e);
                Vec::new()
            }
        }
    }
}
