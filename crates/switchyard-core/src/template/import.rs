//! Imported config parsing and repair
//!
//! Repairs applied to OpenVPN imports, and nothing else:
//! - `route`/`route-ipv6` lines are dropped (routing is managed here)
//! - a missing `proto` becomes the second canonical kind, inserted above `remote`
//! - a `remote` without a port gets the first port for its kind
//! - a missing `<cert>` block is filled from the bundled certificate
//!
//! `fragment` is never repaired; its presence rejects the file.

use super::openvpn::{directive, fragment_error};
use super::TemplateError;
use crate::custom_config::CustomConfigDescriptor;
use crate::protocol::{
    CANONICAL_KINDS, Candidate, ConnectionKind, PortTable, ProtocolName, Transport,
};
use tracing::{debug, info};

/// A validated import: descriptor plus the repaired file content
#[derive(Debug, Clone)]
pub struct ParsedConfig {
    pub descriptor: CustomConfigDescriptor,
    pub text: String,
}

/// Guess the format from content
pub(super) fn sniff(text: &str) -> Option<ProtocolName> {
    let mut openvpn = false;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.eq_ignore_ascii_case("[interface]") || trimmed.eq_ignore_ascii_case("[peer]") {
            return Some(ProtocolName::WireGuard);
        }
        if matches!(directive(line), Some("remote") | Some("client") | Some("proto")) {
            openvpn = true;
        }
    }
    openvpn.then_some(ProtocolName::OpenVpn)
}

pub(super) fn reject_forbidden(text: &str) -> Result<(), TemplateError> {
    if text.lines().any(|line| directive(line) == Some("fragment")) {
        Err(fragment_error())
    } else {
        Ok(())
    }
}

/// Split `host:port`, `[v6]:port`, or a bare host
pub(super) fn split_host_port(value: &str) -> (&str, Option<&str>) {
    let value = value.trim();

    if let Some(rest) = value.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((host, tail)) => (host, tail.strip_prefix(':').filter(|p| !p.is_empty())),
            None => ("", None),
        };
    }

    match value.split_once(':') {
        // more than one colon is a bare IPv6 address
        Some((_, tail)) if tail.contains(':') => (value, None),
        Some((host, port)) => (host, Some(port).filter(|p| !p.is_empty())),
        None => (value, None),
    }
}

struct RemoteLine {
    index: usize,
    host: String,
    port: Option<String>,
}

pub(super) fn parse_openvpn(
    text: &str,
    ports: &PortTable,
    bundled_cert: Option<&str>,
) -> Result<ParsedConfig, TemplateError> {
    let mut lines: Vec<String> = Vec::new();
    let mut proto: Option<Transport> = None;
    let mut remote_proto: Option<Transport> = None;
    let mut remote: Option<RemoteLine> = None;
    let mut has_cert = false;
    let mut auth_required = false;

    for line in text.lines() {
        match directive(line) {
            Some("fragment") => return Err(fragment_error()),
            Some("route") | Some("route-ipv6") => {
                debug!("Stripping imported route: {}", line.trim());
                continue;
            }
            Some("proto") if proto.is_none() => {
                let value = line.split_whitespace().nth(1).unwrap_or_default();
                proto = Some(Transport::from_proto_directive(value).ok_or_else(|| {
                    TemplateError::InvalidConfigData(format!("unsupported proto '{}'", value))
                })?);
            }
            Some("remote") if remote.is_none() => {
                let mut args = line.split_whitespace().skip(1);
                let host = args.next().unwrap_or_default().to_string();
                let port = args.next().map(str::to_string);
                // `remote host port proto` form
                remote_proto = args.next().and_then(Transport::from_proto_directive);
                remote = Some(RemoteLine {
                    index: lines.len(),
                    host,
                    port,
                });
            }
            Some("<cert>") => has_cert = true,
            Some("auth-user-pass") => auth_required = true,
            _ => {}
        }
        lines.push(line.to_string());
    }

    let mut remote = remote
        .filter(|r| !r.host.is_empty())
        .ok_or_else(|| TemplateError::InvalidConfigData("config has no remote server address".into()))?;

    // a protocol named on the remote line beats the `proto` directive
    let transport = match remote_proto.or(proto) {
        Some(transport) => transport,
        None => {
            let default = CANONICAL_KINDS[1];
            info!("Imported config has no proto, defaulting to {}", default);
            lines.insert(remote.index, format!("proto {}", default.transport()));
            remote.index += 1;
            default.transport()
        }
    };
    let kind = ConnectionKind::from_parts(ProtocolName::OpenVpn, transport)?;

    let port = match remote.port.take() {
        Some(port) => port,
        None => {
            let port = ports.first_port(kind).ok_or_else(|| {
                TemplateError::InvalidConfigData(format!("no known port for {}", kind))
            })?;
            lines[remote.index] = format!("remote {} {}", remote.host, port);
            port.to_string()
        }
    };
    let candidate = Candidate::new(kind, port)?;

    if !has_cert {
        if let Some(cert) = bundled_cert {
            lines.push("<cert>".to_string());
            lines.extend(cert.trim().lines().map(str::to_string));
            lines.push("</cert>".to_string());
        }
    }

    let mut text = lines.join("\n");
    text.push('\n');

    Ok(ParsedConfig {
        descriptor: CustomConfigDescriptor::new(&remote.host, &candidate, auth_required),
        text,
    })
}

pub(super) fn parse_wireguard(text: &str, ports: &PortTable) -> Result<ParsedConfig, TemplateError> {
    let endpoint = text
        .lines()
        .filter_map(|line| line.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("endpoint"))
        .map(|(_, value)| value.trim())
        .unwrap_or_default();

    let (host, port) = split_host_port(endpoint);
    if host.is_empty() {
        return Err(TemplateError::InvalidConfigData("config has no Endpoint address".into()));
    }

    let port = match port {
        Some(port) => port,
        None => ports.first_port(ConnectionKind::WireGuard).ok_or_else(|| {
            TemplateError::InvalidConfigData("no known WireGuard port".into())
        })?,
    };
    let candidate = Candidate::new(ConnectionKind::WireGuard, port)?;

    let mut text = text.trim_end().to_string();
    text.push('\n');

    Ok(ParsedConfig {
        descriptor: CustomConfigDescriptor::new(host, &candidate, false),
        text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CERT: &str = "-----BEGIN CERTIFICATE-----\nMIIBbundled\n-----END CERTIFICATE-----\n";

    #[test]
    fn test_routes_stripped_and_proto_inserted() {
        let text = "client\ndev tun\nroute 10.0.0.0 255.0.0.0\nremote vpn.example.org 1194\nroute 192.168.0.0 255.255.0.0\n";
        let parsed = parse_openvpn(text, &PortTable::default(), None).unwrap();
        let lines: Vec<&str> = parsed.text.lines().collect();

        assert!(!parsed.text.contains("route "));
        assert_eq!(lines[2], "proto udp");
        assert_eq!(lines[3], "remote vpn.example.org 1194");
        assert_eq!(parsed.descriptor.candidate().unwrap().kind(), CANONICAL_KINDS[1]);
    }

    #[test]
    fn test_fragment_rejected_regardless_of_content() {
        let text = "client\nproto tcp\nremote vpn.example.org 443\n<cert>\nabc\n</cert>\n  fragment 1400\n";
        let result = parse_openvpn(text, &PortTable::default(), Some(CERT));
        assert!(matches!(result, Err(TemplateError::InvalidConfigData(_))));
    }

    #[test]
    fn test_missing_port_uses_port_table() {
        let text = "client\nproto tcp\nremote vpn.example.org\n";
        let parsed = parse_openvpn(text, &PortTable::default(), None).unwrap();

        assert_eq!(parsed.descriptor.port, "443");
        assert!(parsed.text.contains("remote vpn.example.org 443"));
    }

    #[test]
    fn test_bundled_cert_appended_only_when_missing() {
        let text = "client\nproto udp\nremote a.example.org 443\n";
        let parsed = parse_openvpn(text, &PortTable::default(), Some(CERT)).unwrap();
        assert!(parsed.text.contains("<cert>\n-----BEGIN CERTIFICATE-----"));
        assert!(parsed.text.trim_end().ends_with("</cert>"));

        let text = "client\nproto udp\nremote a.example.org 443\n<cert>\nown\n</cert>\n";
        let parsed = parse_openvpn(text, &PortTable::default(), Some(CERT)).unwrap();
        assert!(!parsed.text.contains("MIIBbundled"));
    }

    #[test]
    fn test_missing_remote_is_invalid() {
        let result = parse_openvpn("client\nproto udp\nremote\n", &PortTable::default(), None);
        assert!(matches!(result, Err(TemplateError::InvalidConfigData(_))));
    }

    #[test]
    fn test_remote_inline_proto() {
        let parsed = parse_openvpn("client\nremote a.example.org 8080 tcp\n", &PortTable::default(), None).unwrap();
        assert_eq!(parsed.descriptor.transport, Transport::Tcp);
        assert_eq!(parsed.descriptor.port, "8080");
    }

    #[test]
    fn test_proto_after_remote_applies() {
        let parsed = parse_openvpn("client\nremote a.example.org 443\nproto tcp\n", &PortTable::default(), None).unwrap();
        assert_eq!(parsed.descriptor.transport, Transport::Tcp);
        assert!(!parsed.text.contains("proto udp"));

        let parsed = parse_openvpn("client\nproto udp\nremote a.example.org 443 tcp\n", &PortTable::default(), None).unwrap();
        assert_eq!(parsed.descriptor.transport, Transport::Tcp);
    }

    #[test]
    fn test_wireguard_endpoint() {
        let text = "[Interface]\nPrivateKey = abc=\n\n[Peer]\nPublicKey = def=\nEndpoint = 198.51.100.9:51820\n";
        let parsed = parse_wireguard(text, &PortTable::default()).unwrap();

        assert_eq!(parsed.descriptor.server_address, "198.51.100.9");
        assert_eq!(parsed.descriptor.port, "51820");
        assert!(!parsed.descriptor.auth_required);
    }

    #[test]
    fn test_wireguard_without_endpoint() {
        let text = "[Interface]\nPrivateKey = abc=\n\n[Peer]\nEndpoint = :51820\n";
        let result = parse_wireguard(text, &PortTable::default());
        assert!(matches!(result, Err(TemplateError::InvalidConfigData(_))));
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("[2001:db8::1]:443"), ("2001:db8::1", Some("443")));
        assert_eq!(split_host_port("2001:db8::1"), ("2001:db8::1", None));
        assert_eq!(split_host_port("edge.example.net:80"), ("edge.example.net", Some("80")));
        assert_eq!(split_host_port("edge.example.net"), ("edge.example.net", None));
    }

    #[test]
    fn test_sniff() {
        assert_eq!(sniff("[Interface]\nAddress = 10.0.0.2/32\n"), Some(ProtocolName::WireGuard));
        assert_eq!(sniff("# comment\nclient\nremote a 1\n"), Some(ProtocolName::OpenVpn));
        assert_eq!(sniff("hello world"), None);
    }
}
