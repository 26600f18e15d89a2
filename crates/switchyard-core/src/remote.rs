//! Remote credential API seam

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Username/password pair, issued by the API or entered for an imported config
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPass {
    pub username: String,
    pub password: String,
}

impl UserPass {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for UserPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPass")
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .finish()
    }
}

/// Peer parameters the API returns for a registered WireGuard public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireGuardGrant {
    pub preshared_key: String,
    pub allowed_ips: String,
    pub address: String,
    pub dns: String,
}

/// API errors. Opaque to the core beyond success or failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Session rejected by API")]
    Unauthorized,

    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Issues credentials and config templates
#[async_trait]
pub trait CredentialApi: Send + Sync {
    async fn fetch_openvpn_credentials(&self) -> Result<UserPass, ApiError>;

    async fn fetch_ikev2_credentials(&self) -> Result<UserPass, ApiError>;

    /// Register `client_public_key` and return the peer parameters for it
    async fn fetch_wireguard_credentials(
        &self,
        client_public_key: &str,
    ) -> Result<WireGuardGrant, ApiError>;

    /// Base OpenVPN config the servers expect, as text
    async fn fetch_server_config_template(&self) -> Result<String, ApiError>;
}
