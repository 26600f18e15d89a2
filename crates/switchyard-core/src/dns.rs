//! Custom DNS values
//!
//! A user may override tunnel DNS with plain addresses, a DNS-over-HTTPS
//! URL or a DNS-over-TLS host. The hostnames are resolved to server
//! addresses before templating, under a bounded timeout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// Hostname resolution seam
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// All addresses for `host`; empty when resolution fails
    async fn resolve(&self, host: &str) -> Vec<IpAddr>;
}

/// User-configured DNS override
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CustomDns {
    /// Literal server addresses
    Ip(Vec<String>),
    /// DNS-over-HTTPS endpoint URL
    OverHttps(String),
    /// DNS-over-TLS server hostname
    OverTls(String),
}

impl CustomDns {
    /// Host that needs resolving, if any
    fn host(&self) -> Option<String> {
        match self {
            CustomDns::Ip(_) => None,
            CustomDns::OverHttps(endpoint) => url::Url::parse(endpoint)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.trim_matches(['[', ']']).to_string())),
            CustomDns::OverTls(host) => Some(host.trim().to_string()),
        }
    }
}

/// Resolve a custom DNS value to server addresses.
///
/// Literal addresses never touch the network. Hostnames that are already
/// IP literals are returned as-is. Anything that fails or exceeds
/// `timeout` yields an empty list and the caller keeps its default DNS.
pub async fn resolve_custom_dns(
    resolver: &dyn HostResolver,
    value: &CustomDns,
    timeout: Duration,
) -> Vec<IpAddr> {
    if let CustomDns::Ip(addresses) = value {
        return addresses.iter().filter_map(|a| a.trim().parse().ok()).collect();
    }

    let Some(host) = value.host().filter(|h| !h.is_empty()) else {
        warn!("Custom DNS value has no usable host: {:?}", value);
        return Vec::new();
    };

    if let Ok(ip) = host.parse::<IpAddr>() {
        return vec![ip];
    }

    match tokio::time::timeout(timeout, resolver.resolve(&host)).await {
        Ok(addresses) => {
            debug!("Resolved custom DNS host {} to {} addresses", host, addresses.len());
            addresses
        }
        Err(_) => {
            warn!("Custom DNS resolution for {} timed out after {:?}", host, timeout);
            Vec::new()
        }
    }
}
