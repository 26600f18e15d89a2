//! Credential Store
//!
//! Fetches per-protocol credentials from the API and keeps the last good
//! set in local persistence. A failed fetch falls back to that cached set;
//! only a fetch failure with nothing cached reaches the caller.
//!
//! There is no retry loop here; the orchestrator owns retry policy.

use crate::keys::KeyPair;
use crate::persistence::{Persistence, StoreError};
use crate::protocol::ProtocolName;
use crate::remote::{ApiError, CredentialApi, UserPass};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where the WireGuard client private key lives
pub const WIREGUARD_KEY_FILE: &str = "keys/wireguard.key";

/// Cached copy of the server OpenVPN template
pub const SERVER_TEMPLATE_FILE: &str = "templates/server.ovpn";

/// WireGuard interface and peer parameters
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireGuardCredentials {
    pub private_key: String,
    pub public_key: String,
    pub preshared_key: String,
    pub allowed_ips: String,
    pub address: String,
    pub dns: String,
}

/// Protocol-tagged credential union
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol")]
pub enum Credentials {
    #[serde(rename = "OpenVPN")]
    OpenVpn { username: String, password: String },
    #[serde(rename = "IKEv2")]
    IKEv2 { username: String, password: String },
    WireGuard(WireGuardCredentials),
}

impl Credentials {
    pub fn protocol(&self) -> ProtocolName {
        match self {
            Credentials::OpenVpn { .. } => ProtocolName::OpenVpn,
            Credentials::IKEv2 { .. } => ProtocolName::IKEv2,
            Credentials::WireGuard(_) => ProtocolName::WireGuard,
        }
    }

    /// Username/password for OpenVPN and IKEv2
    pub fn user_pass(&self) -> Option<(&str, &str)> {
        match self {
            Credentials::OpenVpn { username, password }
            | Credentials::IKEv2 { username, password } => Some((username, password)),
            Credentials::WireGuard(_) => None,
        }
    }

    /// Reject any empty field
    pub fn validate(&self) -> Result<(), CredentialError> {
        let fields: Vec<(&'static str, &str)> = match self {
            Credentials::OpenVpn { username, password }
            | Credentials::IKEv2 { username, password } => {
                vec![("username", username.as_str()), ("password", password.as_str())]
            }
            Credentials::WireGuard(wg) => vec![
                ("private_key", wg.private_key.as_str()),
                ("public_key", wg.public_key.as_str()),
                ("preshared_key", wg.preshared_key.as_str()),
                ("allowed_ips", wg.allowed_ips.as_str()),
                ("address", wg.address.as_str()),
                ("dns", wg.dns.as_str()),
            ],
        };

        match fields.iter().find(|(_, value)| value.trim().is_empty()) {
            Some((field, _)) => Err(CredentialError::Invalid {
                protocol: self.protocol(),
                field: *field,
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::OpenVpn { username, .. } | Credentials::IKEv2 { username, .. } => f
                .debug_struct(self.protocol().as_str())
                .field("username", username)
                .field("password", &"[redacted]")
                .finish(),
            Credentials::WireGuard(wg) => f
                .debug_struct("WireGuard")
                .field("public_key", &wg.public_key)
                .field("address", &wg.address)
                .field("private_key", &"[redacted]")
                .finish(),
        }
    }
}

/// Whether a set came straight from the API or from local storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Cached,
}

/// Credentials plus their freshness tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSet {
    pub credentials: Credentials,
    pub freshness: Freshness,
}

impl CredentialSet {
    pub fn fresh(credentials: Credentials) -> Self {
        Self {
            credentials,
            freshness: Freshness::Fresh,
        }
    }

    pub fn cached(credentials: Credentials) -> Self {
        Self {
            credentials,
            freshness: Freshness::Cached,
        }
    }

    pub fn protocol(&self) -> ProtocolName {
        self.credentials.protocol()
    }

    pub fn is_cached(&self) -> bool {
        self.freshness == Freshness::Cached
    }
}

/// OpenVPN base template and where it came from
#[derive(Debug, Clone)]
pub struct ServerTemplate {
    pub text: String,
    pub freshness: Freshness,
}

/// Credential errors
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("No {0} credentials available (fetch failed and nothing cached)")]
    Unavailable(ProtocolName),

    #[error("Server config template unavailable")]
    TemplateUnavailable,

    #[error("{protocol} credentials have an empty {field}")]
    Invalid {
        protocol: ProtocolName,
        field: &'static str,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Why a fetch produced no credentials; either way the cache is consulted
#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("WireGuard key storage: {0}")]
    KeyStorage(#[from] StoreError),
}

/// Fetches, caches and serves per-protocol credentials
pub struct CredentialStore {
    api: Arc<dyn CredentialApi>,
    persistence: Arc<dyn Persistence>,
    fetch_timeout: Duration,
}

impl CredentialStore {
    pub fn new(
        api: Arc<dyn CredentialApi>,
        persistence: Arc<dyn Persistence>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            api,
            persistence,
            fetch_timeout,
        }
    }

    /// Credentials for `protocol`, fresh if the API answers in time,
    /// otherwise the last cached set.
    ///
    /// A fresh set is only returned once it is cached; a failed save is
    /// reported as [`CredentialError::Storage`].
    pub async fn get_credentials(&self, protocol: ProtocolName) -> Result<CredentialSet, CredentialError> {
        match self.fetch(protocol).await {
            Ok(credentials) => {
                self.persistence.save_credentials(&credentials).await.map_err(|e| {
                    warn!("Failed to cache {} credentials: {}", protocol, e);
                    e
                })?;
                info!("Fetched fresh {} credentials", protocol);
                Ok(CredentialSet::fresh(credentials))
            }
            Err(e) => {
                warn!("{} credential fetch failed: {}", protocol, e);
                self.load_cached(protocol).await
            }
        }
    }

    async fn load_cached(&self, protocol: ProtocolName) -> Result<CredentialSet, CredentialError> {
        match self.persistence.load_credentials(protocol).await {
            Ok(Some(credentials)) if credentials.validate().is_ok() => {
                info!("Using cached {} credentials", protocol);
                Ok(CredentialSet::cached(credentials))
            }
            Ok(Some(_)) => {
                warn!("Cached {} credentials are incomplete, ignoring", protocol);
                Err(CredentialError::Unavailable(protocol))
            }
            Ok(None) => Err(CredentialError::Unavailable(protocol)),
            Err(e) => {
                warn!("Failed to read cached {} credentials: {}", protocol, e);
                Err(CredentialError::Unavailable(protocol))
            }
        }
    }

    async fn fetch(&self, protocol: ProtocolName) -> Result<Credentials, FetchError> {
        let request = async {
            match protocol {
                ProtocolName::OpenVpn => {
                    let UserPass { username, password } = self.api.fetch_openvpn_credentials().await?;
                    Ok::<_, FetchError>(Credentials::OpenVpn { username, password })
                }
                ProtocolName::IKEv2 => {
                    let UserPass { username, password } = self.api.fetch_ikev2_credentials().await?;
                    Ok(Credentials::IKEv2 { username, password })
                }
                ProtocolName::WireGuard => self.fetch_wireguard().await,
            }
        };

        let credentials = tokio::time::timeout(self.fetch_timeout, request)
            .await
            .map_err(|_| FetchError::Api(ApiError::Timeout))??;

        credentials
            .validate()
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        Ok(credentials)
    }

    async fn fetch_wireguard(&self) -> Result<Credentials, FetchError> {
        let keys = self.client_keys().await?;
        let public_key = keys.public.to_base64();

        let grant = self.api.fetch_wireguard_credentials(&public_key).await?;

        Ok(Credentials::WireGuard(WireGuardCredentials {
            private_key: keys.private.to_base64(),
            public_key,
            preshared_key: grant.preshared_key,
            allowed_ips: grant.allowed_ips,
            address: grant.address,
            dns: grant.dns,
        }))
    }

    /// Load the device key, generating and saving one on first use.
    ///
    /// Only an absent or undecodable key is replaced. A failed read is an
    /// error so a transient fault never overwrites the registered key.
    async fn client_keys(&self) -> Result<KeyPair, StoreError> {
        let stored = self
            .persistence
            .read_file(WIREGUARD_KEY_FILE)
            .await?
            .and_then(|b| String::from_utf8(b).ok());

        let (keys, generated) = KeyPair::load_or_generate(stored.as_deref());
        if generated {
            info!("Generated new WireGuard client key {:?}", keys.public);
            self.persistence
                .save_file(WIREGUARD_KEY_FILE, keys.private.to_base64().as_bytes())
                .await?;
        }
        Ok(keys)
    }

    /// Drop the cached set for one protocol so the next attempt refetches
    pub async fn invalidate(&self, protocol: ProtocolName) -> Result<(), CredentialError> {
        info!("Invalidating cached {} credentials", protocol);
        self.persistence.remove_credentials(protocol).await?;
        Ok(())
    }

    /// Wipe every cached secret. Required on logout and account switch.
    pub async fn clear_all(&self) -> Result<(), CredentialError> {
        for protocol in ProtocolName::all() {
            self.persistence.remove_credentials(*protocol).await?;
        }
        self.persistence.remove_file(WIREGUARD_KEY_FILE).await?;
        self.persistence.remove_file(SERVER_TEMPLATE_FILE).await?;

        info!("Cleared all cached credentials");
        Ok(())
    }

    /// OpenVPN base template with the same fetch-then-cache rule
    pub async fn server_config_template(&self) -> Result<ServerTemplate, CredentialError> {
        let fetched = tokio::time::timeout(self.fetch_timeout, self.api.fetch_server_config_template())
            .await
            .map_err(|_| ApiError::Timeout)
            .and_then(|r| r);

        match fetched {
            Ok(text) if !text.trim().is_empty() => {
                if let Err(e) = self.persistence.save_file(SERVER_TEMPLATE_FILE, text.as_bytes()).await {
                    warn!("Failed to cache server config template: {}", e);
                }
                Ok(ServerTemplate {
                    text,
                    freshness: Freshness::Fresh,
                })
            }
            other => {
                if let Err(e) = other {
                    debug!("Server config template fetch failed: {}", e);
                }
                let cached = self
                    .persistence
                    .read_file(SERVER_TEMPLATE_FILE)
                    .await
                    .ok()
                    .flatten()
                    .and_then(|b| String::from_utf8(b).ok())
                    .filter(|t| !t.trim().is_empty());

                match cached {
                    Some(text) => Ok(ServerTemplate {
                        text,
                        freshness: Freshness::Cached,
                    }),
                    None => Err(CredentialError::TemplateUnavailable),
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use crate::persistence::tests::FaultyPersistence;
    use crate::remote::WireGuardGrant;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Scriptable API double shared with the orchestrator tests
    pub(crate) struct FakeApi {
        pub fail: AtomicBool,
        pub delay: Duration,
        pub calls: AtomicUsize,
        pub template: Option<String>,
    }

    impl FakeApi {
        pub fn working() -> Self {
            Self {
                fail: AtomicBool::new(false),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                template: None,
            }
        }

        pub fn failing() -> Self {
            let api = Self::working();
            api.fail.store(true, Ordering::SeqCst);
            api
        }

        async fn answer<T>(&self, value: T) -> Result<T, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                Err(ApiError::Network("unreachable".into()))
            } else {
                Ok(value)
            }
        }
    }

    #[async_trait]
    impl CredentialApi for FakeApi {
        async fn fetch_openvpn_credentials(&self) -> Result<UserPass, ApiError> {
            self.answer(UserPass::new("ovpn-user", "ovpn-pass")).await
        }

        async fn fetch_ikev2_credentials(&self) -> Result<UserPass, ApiError> {
            self.answer(UserPass::new("ike-user", "ike-pass")).await
        }

        async fn fetch_wireguard_credentials(
            &self,
            _client_public_key: &str,
        ) -> Result<WireGuardGrant, ApiError> {
            self.answer(WireGuardGrant {
                preshared_key: "psk".into(),
                allowed_ips: "0.0.0.0/0".into(),
                address: "100.64.0.2/32".into(),
                dns: "10.255.255.1".into(),
            })
            .await
        }

        async fn fetch_server_config_template(&self) -> Result<String, ApiError> {
            match &self.template {
                Some(t) => self.answer(t.clone()).await,
                None => Err(ApiError::Status(404)),
            }
        }
    }

    fn store(api: FakeApi, persistence: Arc<MemoryPersistence>) -> CredentialStore {
        CredentialStore::new(Arc::new(api), persistence, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_fresh_fetch_is_persisted() {
        let persistence = Arc::new(MemoryPersistence::new());
        let store = store(FakeApi::working(), persistence.clone());

        let set = store.get_credentials(ProtocolName::OpenVpn).await.unwrap();
        assert_eq!(set.freshness, Freshness::Fresh);

        let cached = persistence.load_credentials(ProtocolName::OpenVpn).await.unwrap();
        assert_eq!(cached, Some(set.credentials));
    }

    #[tokio::test]
    async fn test_fetch_failure_falls_back_to_cache() {
        let persistence = Arc::new(MemoryPersistence::new());
        let cached = Credentials::OpenVpn {
            username: "old".into(),
            password: "secret".into(),
        };
        persistence.save_credentials(&cached).await.unwrap();

        let store = store(FakeApi::failing(), persistence);
        let set = store.get_credentials(ProtocolName::OpenVpn).await.unwrap();

        assert!(set.is_cached());
        assert_eq!(set.credentials, cached);
    }

    #[tokio::test]
    async fn test_fetch_failure_without_cache_is_unavailable() {
        let store = store(FakeApi::failing(), Arc::new(MemoryPersistence::new()));

        let result = store.get_credentials(ProtocolName::OpenVpn).await;
        assert!(matches!(result, Err(CredentialError::Unavailable(ProtocolName::OpenVpn))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fetch_times_out_to_cache() {
        let persistence = Arc::new(MemoryPersistence::new());
        let cached = Credentials::IKEv2 {
            username: "u".into(),
            password: "p".into(),
        };
        persistence.save_credentials(&cached).await.unwrap();

        let mut api = FakeApi::working();
        api.delay = Duration::from_secs(60);
        let store = store(api, persistence);

        let set = store.get_credentials(ProtocolName::IKEv2).await.unwrap();
        assert!(set.is_cached());
    }

    #[tokio::test]
    async fn test_wireguard_key_is_generated_once() {
        let persistence = Arc::new(MemoryPersistence::new());
        let store = store(FakeApi::working(), persistence.clone());

        let first = store.get_credentials(ProtocolName::WireGuard).await.unwrap();
        let second = store.get_credentials(ProtocolName::WireGuard).await.unwrap();

        match (first.credentials, second.credentials) {
            (Credentials::WireGuard(a), Credentials::WireGuard(b)) => {
                assert_eq!(a.private_key, b.private_key);
                assert_eq!(a.address, "100.64.0.2/32");
            }
            other => panic!("unexpected credentials: {:?}", other),
        }
        assert!(persistence.read_file(WIREGUARD_KEY_FILE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_key_read_failure_keeps_stored_key() {
        let persistence = Arc::new(FaultyPersistence::default());
        let store = CredentialStore::new(Arc::new(FakeApi::working()), persistence.clone(), Duration::from_secs(5));

        let first = store.get_credentials(ProtocolName::WireGuard).await.unwrap();
        let key_before = persistence.inner.read_file(WIREGUARD_KEY_FILE).await.unwrap();
        assert!(key_before.is_some());

        persistence.failing_reads.store(1, Ordering::SeqCst);
        let second = store.get_credentials(ProtocolName::WireGuard).await.unwrap();
        assert!(second.is_cached());
        assert_eq!(second.credentials, first.credentials);
        assert_eq!(persistence.inner.read_file(WIREGUARD_KEY_FILE).await.unwrap(), key_before);

        let third = store.get_credentials(ProtocolName::WireGuard).await.unwrap();
        assert_eq!(third.freshness, Freshness::Fresh);
        assert_eq!(third.credentials, first.credentials);
    }

    #[tokio::test]
    async fn test_key_read_failure_without_cache_is_unavailable() {
        let persistence = Arc::new(FaultyPersistence::default());
        persistence.failing_reads.store(1, Ordering::SeqCst);
        let store = CredentialStore::new(Arc::new(FakeApi::working()), persistence.clone(), Duration::from_secs(5));

        let result = store.get_credentials(ProtocolName::WireGuard).await;
        assert!(matches!(result, Err(CredentialError::Unavailable(ProtocolName::WireGuard))));
        assert!(persistence.inner.read_file(WIREGUARD_KEY_FILE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_write_failure_is_reported() {
        let persistence = Arc::new(FaultyPersistence::default());
        persistence.failing_credential_saves.store(1, Ordering::SeqCst);
        let store = CredentialStore::new(Arc::new(FakeApi::working()), persistence.clone(), Duration::from_secs(5));

        let result = store.get_credentials(ProtocolName::OpenVpn).await;
        assert!(matches!(result, Err(CredentialError::Storage(_))));
        assert!(persistence.load_credentials(ProtocolName::OpenVpn).await.unwrap().is_none());

        let set = store.get_credentials(ProtocolName::OpenVpn).await.unwrap();
        assert_eq!(set.freshness, Freshness::Fresh);
        assert_eq!(persistence.load_credentials(ProtocolName::OpenVpn).await.unwrap(), Some(set.credentials));
    }

    #[tokio::test]
    async fn test_invalidate_and_clear_all() {
        let persistence = Arc::new(MemoryPersistence::new());
        let store = store(FakeApi::working(), persistence.clone());

        store.get_credentials(ProtocolName::OpenVpn).await.unwrap();
        store.get_credentials(ProtocolName::WireGuard).await.unwrap();

        store.invalidate(ProtocolName::OpenVpn).await.unwrap();
        assert!(persistence.load_credentials(ProtocolName::OpenVpn).await.unwrap().is_none());
        assert!(persistence.load_credentials(ProtocolName::WireGuard).await.unwrap().is_some());

        store.clear_all().await.unwrap();
        assert!(persistence.load_credentials(ProtocolName::WireGuard).await.unwrap().is_none());
        assert_eq!(persistence.file_count(), 0);
    }

    #[tokio::test]
    async fn test_server_template_cache_fallback() {
        let persistence = Arc::new(MemoryPersistence::new());
        let mut api = FakeApi::working();
        api.template = Some("client\ndev tun\n".into());
        let store = CredentialStore::new(Arc::new(api), persistence.clone(), Duration::from_secs(5));

        let fresh = store.server_config_template().await.unwrap();
        assert_eq!(fresh.freshness, Freshness::Fresh);

        let offline = CredentialStore::new(Arc::new(FakeApi::failing()), persistence, Duration::from_secs(5));
        let cached = offline.server_config_template().await.unwrap();
        assert_eq!(cached.freshness, Freshness::Cached);
        assert_eq!(cached.text, "client\ndev tun\n");
    }

    #[test]
    fn test_validate_rejects_empty_fields() {
        let credentials = Credentials::OpenVpn {
            username: "user".into(),
            password: "".into(),
        };
        assert!(matches!(
            credentials.validate(),
            Err(CredentialError::Invalid { field: "password", .. })
        ));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let credentials = Credentials::IKEv2 {
            username: "user".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{:?}", credentials).contains("hunter2"));
    }
}
