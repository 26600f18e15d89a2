//! Protocols, transports and connection candidates
//!
//! Protocol identity is a closed enum everywhere inside the core. The
//! string forms (`"OpenVPN"`, `"UDP"`, ...) only show up when a value is
//! serialized or written into config text.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tunneling protocol family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolName {
    #[serde(rename = "OpenVPN")]
    OpenVpn,
    #[serde(rename = "IKEv2")]
    IKEv2,
    WireGuard,
}

impl ProtocolName {
    pub fn all() -> &'static [ProtocolName] {
        &[ProtocolName::WireGuard, ProtocolName::OpenVpn, ProtocolName::IKEv2]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolName::OpenVpn => "OpenVPN",
            ProtocolName::IKEv2 => "IKEv2",
            ProtocolName::WireGuard => "WireGuard",
        }
    }
}

impl fmt::Display for ProtocolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolName {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openvpn" | "ovpn" => Ok(ProtocolName::OpenVpn),
            "ikev2" => Ok(ProtocolName::IKEv2),
            "wireguard" | "wg" => Ok(ProtocolName::WireGuard),
            _ => Err(ProtocolError::UnknownProtocol(s.to_string())),
        }
    }
}

/// Transport carried under the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    /// Value used on an OpenVPN `proto` line
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }

    /// Parse an OpenVPN `proto` argument (`udp`, `udp6`, `tcp-client`, ...)
    pub fn from_proto_directive(value: &str) -> Option<Self> {
        let value = value.to_ascii_lowercase();
        if value.starts_with("udp") {
            Some(Transport::Udp)
        } else if value.starts_with("tcp") {
            Some(Transport::Tcp)
        } else {
            None
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection kind used for ranking and port lookup.
///
/// OpenVPN is split by transport since its UDP and TCP flavours succeed
/// or fail independently on restrictive networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionKind {
    WireGuard,
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "TCP")]
    Tcp,
    IKEv2,
}

/// Default automatic ranking, most likely to succeed first
pub const CANONICAL_KINDS: [ConnectionKind; 4] = [
    ConnectionKind::WireGuard,
    ConnectionKind::Udp,
    ConnectionKind::Tcp,
    ConnectionKind::IKEv2,
];

impl ConnectionKind {
    pub fn protocol(&self) -> ProtocolName {
        match self {
            ConnectionKind::WireGuard => ProtocolName::WireGuard,
            ConnectionKind::Udp | ConnectionKind::Tcp => ProtocolName::OpenVpn,
            ConnectionKind::IKEv2 => ProtocolName::IKEv2,
        }
    }

    pub fn transport(&self) -> Transport {
        match self {
            ConnectionKind::Tcp => Transport::Tcp,
            _ => Transport::Udp,
        }
    }

    pub fn from_parts(protocol: ProtocolName, transport: Transport) -> Result<Self, ProtocolError> {
        match (protocol, transport) {
            (ProtocolName::OpenVpn, Transport::Udp) => Ok(ConnectionKind::Udp),
            (ProtocolName::OpenVpn, Transport::Tcp) => Ok(ConnectionKind::Tcp),
            (ProtocolName::WireGuard, Transport::Udp) => Ok(ConnectionKind::WireGuard),
            (ProtocolName::IKEv2, Transport::Udp) => Ok(ConnectionKind::IKEv2),
            (protocol, transport) => Err(ProtocolError::InvalidTransport { protocol, transport }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::WireGuard => "WireGuard",
            ConnectionKind::Udp => "UDP",
            ConnectionKind::Tcp => "TCP",
            ConnectionKind::IKEv2 => "IKEv2",
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wireguard" | "wg" => Ok(ConnectionKind::WireGuard),
            "udp" => Ok(ConnectionKind::Udp),
            "tcp" => Ok(ConnectionKind::Tcp),
            "ikev2" => Ok(ConnectionKind::IKEv2),
            _ => Err(ProtocolError::UnknownProtocol(s.to_string())),
        }
    }
}

/// One protocol + port + transport combination to attempt
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "CandidateRecord", into = "CandidateRecord")]
pub struct Candidate {
    protocol: ProtocolName,
    port: String,
    transport: Transport,
}

impl Candidate {
    /// Build a candidate, rejecting empty or non-numeric ports
    pub fn new(kind: ConnectionKind, port: impl Into<String>) -> Result<Self, ProtocolError> {
        let port: String = port.into();
        let port = port.trim().to_string();
        if port.is_empty() {
            return Err(ProtocolError::EmptyPort);
        }
        if port.parse::<u16>().map(|p| p == 0).unwrap_or(true) {
            return Err(ProtocolError::InvalidPort(port));
        }

        Ok(Self {
            protocol: kind.protocol(),
            port,
            transport: kind.transport(),
        })
    }

    pub fn from_parts(
        protocol: ProtocolName,
        transport: Transport,
        port: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        Self::new(ConnectionKind::from_parts(protocol, transport)?, port)
    }

    pub fn protocol(&self) -> ProtocolName {
        self.protocol
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn kind(&self) -> ConnectionKind {
        match (self.protocol, self.transport) {
            (ProtocolName::OpenVpn, Transport::Tcp) => ConnectionKind::Tcp,
            (ProtocolName::OpenVpn, Transport::Udp) => ConnectionKind::Udp,
            (ProtocolName::WireGuard, _) => ConnectionKind::WireGuard,
            (ProtocolName::IKEv2, _) => ConnectionKind::IKEv2,
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.port)
    }
}

#[derive(Serialize, Deserialize)]
struct CandidateRecord {
    protocol: ProtocolName,
    port: String,
    transport: Transport,
}

impl TryFrom<CandidateRecord> for Candidate {
    type Error = ProtocolError;

    fn try_from(record: CandidateRecord) -> Result<Self, Self::Error> {
        Candidate::from_parts(record.protocol, record.transport, record.port)
    }
}

impl From<Candidate> for CandidateRecord {
    fn from(candidate: Candidate) -> Self {
        Self {
            protocol: candidate.protocol,
            port: candidate.port,
            transport: candidate.transport,
        }
    }
}

/// Known-good ports per connection kind, in configuration order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortTable {
    #[serde(default = "default_wireguard_ports")]
    pub wireguard: Vec<String>,
    #[serde(default = "default_udp_ports")]
    pub udp: Vec<String>,
    #[serde(default = "default_tcp_ports")]
    pub tcp: Vec<String>,
    #[serde(default = "default_ikev2_ports")]
    pub ikev2: Vec<String>,
}

fn to_strings(ports: &[&str]) -> Vec<String> {
    ports.iter().map(|p| p.to_string()).collect()
}

fn default_wireguard_ports() -> Vec<String> {
    to_strings(&["443", "80", "53", "123", "1194", "65142"])
}

fn default_udp_ports() -> Vec<String> {
    to_strings(&["443", "80", "53", "1194", "54783"])
}

fn default_tcp_ports() -> Vec<String> {
    to_strings(&["443", "587", "21", "22", "80", "143", "3306", "8080", "54783", "1194"])
}

fn default_ikev2_ports() -> Vec<String> {
    to_strings(&["500", "4500"])
}

impl Default for PortTable {
    fn default() -> Self {
        Self {
            wireguard: default_wireguard_ports(),
            udp: default_udp_ports(),
            tcp: default_tcp_ports(),
            ikev2: default_ikev2_ports(),
        }
    }
}

impl PortTable {
    pub fn ports(&self, kind: ConnectionKind) -> &[String] {
        match kind {
            ConnectionKind::WireGuard => &self.wireguard,
            ConnectionKind::Udp => &self.udp,
            ConnectionKind::Tcp => &self.tcp,
            ConnectionKind::IKEv2 => &self.ikev2,
        }
    }

    pub fn first_port(&self, kind: ConnectionKind) -> Option<&str> {
        self.ports(kind).first().map(String::as_str)
    }

    pub fn contains(&self, kind: ConnectionKind, port: &str) -> bool {
        self.ports(kind).iter().any(|p| p == port)
    }
}

/// Protocol value errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("{protocol} does not run over {transport}")]
    InvalidTransport {
        protocol: ProtocolName,
        transport: Transport,
    },

    #[error("Candidate port is empty")]
    EmptyPort,

    #[error("Invalid port: {0}")]
    InvalidPort(String),
}
