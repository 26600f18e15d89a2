//! WireGuard config assembly

use super::{ServerNode, TemplateError};
use crate::credentials::WireGuardCredentials;
use crate::keys::{PrivateKey, PublicKey};
use crate::protocol::Candidate;
use std::net::{IpAddr, Ipv6Addr};

/// `host:port`, bracketing IPv6 literals
pub(super) fn endpoint(address: &str, port: &str) -> String {
    if address.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]:{}", address, port)
    } else {
        format!("{}:{}", address, port)
    }
}

pub(super) fn render(
    credentials: &WireGuardCredentials,
    candidate: &Candidate,
    server: &ServerNode,
    dns_servers: &[IpAddr],
    udp_stuffing: bool,
) -> Result<String, TemplateError> {
    PrivateKey::from_base64(&credentials.private_key)?;

    let server_key = server
        .wg_public_key
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or_else(|| TemplateError::InvalidConfigData("server has no WireGuard public key".into()))?;
    PublicKey::from_base64(server_key)?;

    let dns = if dns_servers.is_empty() {
        credentials.dns.clone()
    } else {
        dns_servers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };

    let lines = [
        "[Interface]".to_string(),
        format!("PrivateKey = {}", credentials.private_key),
        format!("Address = {}", credentials.address),
        format!("DNS = {}", dns),
        String::new(),
        "[Peer]".to_string(),
        format!("PublicKey = {}", server_key),
        format!("AllowedIPs = {}", credentials.allowed_ips),
        format!("Endpoint = {}", endpoint(server.address.trim(), candidate.port())),
        format!("udp_stuffing = {}", udp_stuffing),
        format!("PresharedKey = {}", credentials.preshared_key),
    ];

    let mut text = lines.join("\n");
    text.push('\n');
    Ok(text)
}
