//! Config Templater
//!
//! Turns a candidate, a server and credentials into config text the
//! tunnel layer can consume, and parses/repairs configs users import.
//!
//! # Outputs
//!
//! | Protocol | Format | Source |
//! |----------|--------|--------|
//! | OpenVPN | `.ovpn` directives | base template with `proto`/`remote` rewritten |
//! | WireGuard | `[Interface]`/`[Peer]` blocks | assembled from credentials |
//! | IKEv2 | key/value profile | assembled from server and username |
//!
//! Building fails closed: a config without a server address, with a
//! forbidden directive, or with credentials for another protocol is never
//! returned.

mod ikev2;
mod import;
mod openvpn;
mod wireguard;

pub use import::ParsedConfig;
pub use openvpn::DEFAULT_TEMPLATE as DEFAULT_OPENVPN_TEMPLATE;

use crate::credentials::{CredentialSet, Credentials};
use crate::custom_config::CustomConfigDescriptor;
use crate::keys::KeyError;
use crate::protocol::{Candidate, PortTable, ProtocolError, ProtocolName};
use crate::remote::UserPass;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use tracing::{debug, info};

/// Template errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("Invalid config data: {0}")]
    InvalidConfigData(String),

    #[error("Candidate is {candidate} but credentials are for {credentials}")]
    ProtocolMismatch {
        candidate: ProtocolName,
        credentials: ProtocolName,
    },

    #[error("{0} config requires credentials")]
    MissingCredentials(ProtocolName),
}

impl TemplateError {
    fn invalid(reason: impl Into<String>) -> Self {
        TemplateError::InvalidConfigData(reason.into())
    }
}

impl From<ProtocolError> for TemplateError {
    fn from(e: ProtocolError) -> Self {
        TemplateError::InvalidConfigData(e.to_string())
    }
}

impl From<KeyError> for TemplateError {
    fn from(e: KeyError) -> Self {
        TemplateError::InvalidConfigData(format!("bad WireGuard key: {}", e))
    }
}

/// VPN server the config points at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerNode {
    /// IP address or hostname used for `remote`/`Endpoint`
    pub address: String,
    /// TLS/IKE identity, when it differs from `address`
    #[serde(default)]
    pub hostname: Option<String>,
    /// Peer key for WireGuard (base64)
    #[serde(default)]
    pub wg_public_key: Option<String>,
    /// Certificate name for `verify-x509-name`
    #[serde(default)]
    pub ovpn_x509: Option<String>,
}

impl ServerNode {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            hostname: None,
            wg_public_key: None,
            ovpn_x509: None,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_wg_public_key(mut self, key: impl Into<String>) -> Self {
        self.wg_public_key = Some(key.into());
        self
    }

    pub fn with_x509_name(mut self, name: impl Into<String>) -> Self {
        self.ovpn_x509 = Some(name.into());
        self
    }
}

/// Text format of a built config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    OpenVpn,
    WireGuard,
    IKEv2,
}

impl ConfigFormat {
    pub fn for_protocol(protocol: ProtocolName) -> Self {
        match protocol {
            ProtocolName::OpenVpn => ConfigFormat::OpenVpn,
            ProtocolName::WireGuard => ConfigFormat::WireGuard,
            ProtocolName::IKEv2 => ConfigFormat::IKEv2,
        }
    }

    /// File extension used when the config is written to disk
    pub fn extension(&self) -> &'static str {
        match self {
            ConfigFormat::OpenVpn => "ovpn",
            ConfigFormat::WireGuard => "conf",
            ConfigFormat::IKEv2 => "ikev2",
        }
    }
}

/// A config ready for the tunnel layer.
///
/// Only the templater constructs these, and only after every check passed.
#[derive(Clone)]
pub struct ConnectionConfig {
    candidate: Candidate,
    server_address: String,
    credentials: Option<CredentialSet>,
    text: String,
    format: ConfigFormat,
}

impl ConnectionConfig {
    pub fn candidate(&self) -> &Candidate {
        &self.candidate
    }

    pub fn server_address(&self) -> &str {
        &self.server_address
    }

    /// Credentials handed to the tunnel alongside the text. Imported
    /// configs without `auth-user-pass` carry none.
    pub fn credentials(&self) -> Option<&CredentialSet> {
        self.credentials.as_ref()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn format(&self) -> ConfigFormat {
        self.format
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("candidate", &self.candidate)
            .field("server_address", &self.server_address)
            .field("format", &self.format)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

/// Per-build inputs that vary between attempts
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildContext<'a> {
    /// OpenVPN base template from the API; the bundled skeleton otherwise
    pub base_template: Option<&'a str>,
    /// Resolved custom DNS servers overriding the issued ones
    pub dns_servers: &'a [IpAddr],
}

/// Builds and repairs protocol configs
#[derive(Debug, Clone)]
pub struct ConfigTemplater {
    ports: PortTable,
    circumvent_censorship: bool,
    bundled_cert: Option<String>,
    base_template: String,
}

impl ConfigTemplater {
    pub fn new(ports: PortTable) -> Self {
        Self {
            ports,
            circumvent_censorship: false,
            bundled_cert: None,
            base_template: DEFAULT_OPENVPN_TEMPLATE.to_string(),
        }
    }

    pub fn with_censorship_circumvention(mut self, enabled: bool) -> Self {
        self.circumvent_censorship = enabled;
        self
    }

    /// PEM certificate appended to imported OpenVPN configs lacking `<cert>`
    pub fn with_bundled_cert(mut self, pem: impl Into<String>) -> Self {
        self.bundled_cert = Some(pem.into());
        self
    }

    pub fn with_base_template(mut self, template: impl Into<String>) -> Self {
        self.base_template = template.into();
        self
    }

    pub fn port_table(&self) -> &PortTable {
        &self.ports
    }

    /// Build from the bundled base template with issued DNS
    pub fn build(
        &self,
        candidate: &Candidate,
        server: &ServerNode,
        credentials: &CredentialSet,
    ) -> Result<ConnectionConfig, TemplateError> {
        self.build_with(candidate, server, credentials, &BuildContext::default())
    }

    pub fn build_with(
        &self,
        candidate: &Candidate,
        server: &ServerNode,
        credentials: &CredentialSet,
        context: &BuildContext<'_>,
    ) -> Result<ConnectionConfig, TemplateError> {
        let address = server.address.trim();
        if address.is_empty() {
            return Err(TemplateError::invalid("server address is empty"));
        }
        if credentials.protocol() != candidate.protocol() {
            return Err(TemplateError::ProtocolMismatch {
                candidate: candidate.protocol(),
                credentials: credentials.protocol(),
            });
        }
        credentials
            .credentials
            .validate()
            .map_err(|e| TemplateError::invalid(e.to_string()))?;

        let text = match &credentials.credentials {
            Credentials::OpenVpn { .. } => openvpn::render(
                context.base_template.unwrap_or(self.base_template.as_str()),
                candidate,
                server,
                context.dns_servers,
                self.circumvent_censorship,
            )?,
            Credentials::WireGuard(wg) => wireguard::render(
                wg,
                candidate,
                server,
                context.dns_servers,
                self.circumvent_censorship,
            )?,
            Credentials::IKEv2 { username, .. } => ikev2::render(candidate, server, username),
        };

        let format = ConfigFormat::for_protocol(candidate.protocol());
        verify_endpoint(format, &text)?;
        info!("Built {} config for {}", candidate, address);

        Ok(ConnectionConfig {
            candidate: candidate.clone(),
            server_address: address.to_string(),
            credentials: Some(credentials.clone()),
            text,
            format,
        })
    }

    /// Parse and repair a user-imported config.
    ///
    /// Without a `protocol_guess` the format is sniffed from the content.
    pub fn parse_imported_config(
        &self,
        bytes: &[u8],
        protocol_guess: Option<ProtocolName>,
    ) -> Result<ParsedConfig, TemplateError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| TemplateError::invalid("config is not valid UTF-8"))?;

        let protocol = match protocol_guess {
            Some(protocol) => protocol,
            None => import::sniff(text)
                .ok_or_else(|| TemplateError::invalid("unrecognized config format"))?,
        };
        debug!("Parsing imported config as {}", protocol);

        match protocol {
            ProtocolName::OpenVpn => import::parse_openvpn(text, &self.ports, self.bundled_cert.as_deref()),
            ProtocolName::WireGuard => import::parse_wireguard(text, &self.ports),
            ProtocolName::IKEv2 => Err(TemplateError::invalid("IKEv2 profiles cannot be imported")),
        }
    }

    /// Config for a previously imported file
    pub fn build_custom(
        &self,
        descriptor: &CustomConfigDescriptor,
        text: &str,
        credentials: Option<&UserPass>,
    ) -> Result<ConnectionConfig, TemplateError> {
        let candidate = descriptor.candidate()?;
        let address = descriptor.server_address.trim();
        if address.is_empty() {
            return Err(TemplateError::invalid("server address is empty"));
        }

        let credentials = match descriptor.protocol_type {
            ProtocolName::OpenVpn => {
                import::reject_forbidden(text)?;
                match (descriptor.auth_required, credentials) {
                    (true, None) => return Err(TemplateError::MissingCredentials(ProtocolName::OpenVpn)),
                    (true, Some(user_pass)) => {
                        let set = CredentialSet::fresh(Credentials::OpenVpn {
                            username: user_pass.username.clone(),
                            password: user_pass.password.clone(),
                        });
                        set.credentials
                            .validate()
                            .map_err(|e| TemplateError::invalid(e.to_string()))?;
                        Some(set)
                    }
                    (false, _) => None,
                }
            }
            ProtocolName::WireGuard => None,
            ProtocolName::IKEv2 => return Err(TemplateError::invalid("IKEv2 profiles cannot be imported")),
        };

        let format = ConfigFormat::for_protocol(descriptor.protocol_type);
        verify_endpoint(format, text)?;

        Ok(ConnectionConfig {
            candidate,
            server_address: address.to_string(),
            credentials,
            text: text.to_string(),
            format,
        })
    }
}

/// Final guard: the text must name a non-empty server
fn verify_endpoint(format: ConfigFormat, text: &str) -> Result<(), TemplateError> {
    let found = match format {
        ConfigFormat::OpenVpn => text.lines().any(|line| {
            let mut parts = line.split_whitespace();
            parts.next() == Some("remote") && parts.next().is_some()
        }),
        ConfigFormat::WireGuard => key_values(text)
            .any(|(key, value)| key.eq_ignore_ascii_case("endpoint") && !import::split_host_port(value).0.is_empty()),
        ConfigFormat::IKEv2 => key_values(text).any(|(key, value)| key == "ServerAddress" && !value.is_empty()),
    };

    if found {
        Ok(())
    } else {
        Err(TemplateError::invalid("config has no server endpoint"))
    }
}

fn key_values(text: &str) -> impl Iterator<Item = (&str, &str)> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim(), value.trim()))
}
