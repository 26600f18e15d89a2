//! Tunnel provider seam
//!
//! The OS-level tunnel lives outside the core. It receives a finished
//! [`ConnectionConfig`] and reports one terminal outcome per attempt.

use crate::template::ConnectionConfig;
use async_trait::async_trait;

/// Why an attempt failed, as classified by the tunnel layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Server rejected the credentials
    Auth,
    /// Server unreachable or connection dropped during setup
    Network,
    /// No terminal status in time
    Timeout,
    /// Tunnel layer refused the configuration
    Rejected,
}

impl FailureKind {
    pub fn is_auth(&self) -> bool {
        matches!(self, FailureKind::Auth)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FailureKind::Auth => "authentication failed",
            FailureKind::Network => "network failure",
            FailureKind::Timeout => "timed out",
            FailureKind::Rejected => "configuration rejected",
        };
        f.write_str(label)
    }
}

/// Terminal result of one establish call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelOutcome {
    Connected,
    Failed(FailureKind),
    /// Tunnel went down before connecting, with no classification
    Disconnected,
}

impl TunnelOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelOutcome::Connected)
    }

    pub fn failure(&self) -> Option<FailureKind> {
        match self {
            TunnelOutcome::Connected => None,
            TunnelOutcome::Failed(kind) => Some(*kind),
            TunnelOutcome::Disconnected => Some(FailureKind::Network),
        }
    }
}

/// OS tunnel provider
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Apply `config` and wait for a terminal outcome
    async fn establish(&self, config: &ConnectionConfig) -> TunnelOutcome;

    /// Tear down whatever is up or coming up
    async fn stop(&self);
}
