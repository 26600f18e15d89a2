//! Runtime settings
//!
//! Loaded from TOML or JSON. Every field has a default so an empty file
//! is a valid configuration.
//!
//! ```toml
//! connect_timeout_secs = 20
//! max_consecutive_failures = 4
//! ranking = ["WireGuard", "UDP", "TCP", "IKEv2"]
//!
//! [custom_dns]
//! type = "over_https"
//! value = "https://dns.quad9.net/dns-query"
//!
//! [ports]
//! tcp = ["443", "8080"]
//!
//! [mode]
//! type = "auto"
//! ```

use crate::dns::CustomDns;
use crate::orchestrator::OrchestratorPolicy;
use crate::protocol::{CANONICAL_KINDS, ConnectionKind, PortTable};
use crate::selector::{ConnectionMode, SelectorConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported settings format")]
    UnsupportedFormat,

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Remote credential fetch bound
    #[serde(default = "default_fetch_timeout")]
    pub credential_fetch_timeout_secs: u64,
    /// Custom DNS hostname resolution bound
    #[serde(default = "default_dns_timeout")]
    pub dns_timeout_secs: u64,
    #[serde(default = "default_debounce")]
    pub status_debounce_ms: u64,
    /// Tunnel establish bound per candidate
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    /// How long a successful port keeps priority
    #[serde(default = "default_good_ttl")]
    pub good_protocol_ttl_secs: u64,
    #[serde(default = "default_ranking")]
    pub ranking: Vec<ConnectionKind>,
    #[serde(default)]
    pub manual_fallback: bool,
    /// Append `udp-stuffing`/`tcp-split-reset` and WireGuard stuffing
    #[serde(default)]
    pub circumvent_censorship: bool,
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// PEM appended to imported OpenVPN configs without `<cert>`
    #[serde(default)]
    pub bundled_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub custom_dns: Option<CustomDns>,
    #[serde(default)]
    pub ports: PortTable,
    #[serde(default)]
    pub mode: ConnectionMode,
}

fn default_fetch_timeout() -> u64 {
    5
}

fn default_dns_timeout() -> u64 {
    3
}

fn default_debounce() -> u64 {
    100
}

fn default_connect_timeout() -> u64 {
    20
}

fn default_max_failures() -> u32 {
    4
}

fn default_good_ttl() -> u64 {
    12 * 60 * 60
}

fn default_ranking() -> Vec<ConnectionKind> {
    CANONICAL_KINDS.to_vec()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            credential_fetch_timeout_secs: default_fetch_timeout(),
            dns_timeout_secs: default_dns_timeout(),
            status_debounce_ms: default_debounce(),
            connect_timeout_secs: default_connect_timeout(),
            max_consecutive_failures: default_max_failures(),
            good_protocol_ttl_secs: default_good_ttl(),
            ranking: default_ranking(),
            manual_fallback: false,
            circumvent_censorship: false,
            api_base_url: None,
            data_dir: None,
            bundled_cert_path: None,
            custom_dns: None,
            ports: PortTable::default(),
            mode: ConnectionMode::Auto,
        }
    }
}

impl Settings {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|e| SettingsError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let settings: Self = toml::from_str(content).map_err(|e| SettingsError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from JSON file
    pub fn from_json_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|e| SettingsError::Io(e.to_string()))?;
        Self::from_json(&content)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, SettingsError> {
        let settings: Self = serde_json::from_str(content).map_err(|e| SettingsError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load by file extension
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "toml" => Self::from_toml_file(path),
            "json" => Self::from_json_file(path),
            _ => Err(SettingsError::UnsupportedFormat),
        }
    }

    /// Export as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Export as JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_consecutive_failures == 0 {
            return Err(SettingsError::Invalid("max_consecutive_failures must be at least 1".into()));
        }
        if self.ranking.is_empty() {
            return Err(SettingsError::Invalid("ranking is empty".into()));
        }
        for (name, secs) in [
            ("credential_fetch_timeout_secs", self.credential_fetch_timeout_secs),
            ("dns_timeout_secs", self.dns_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
        ] {
            if secs == 0 {
                return Err(SettingsError::Invalid(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }

    pub fn credential_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.credential_fetch_timeout_secs)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_timeout_secs)
    }

    pub fn status_debounce(&self) -> Duration {
        Duration::from_millis(self.status_debounce_ms)
    }

    pub fn selector_config(&self) -> SelectorConfig {
        SelectorConfig {
            ranking: self.ranking.clone(),
            ports: self.ports.clone(),
            good_protocol_ttl: Duration::from_secs(self.good_protocol_ttl_secs),
            manual_fallback: self.manual_fallback,
            mode: self.mode.clone(),
        }
    }

    pub fn orchestrator_policy(&self) -> OrchestratorPolicy {
        OrchestratorPolicy {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            max_consecutive_failures: self.max_consecutive_failures,
            dns_timeout: self.dns_timeout(),
        }
    }
}
