//! OpenVPN directive rewriting

use super::{ServerNode, TemplateError};
use crate::protocol::Candidate;
use std::net::IpAddr;
use tracing::debug;

/// Bundled client skeleton used when the API template is unavailable
pub const DEFAULT_TEMPLATE: &str = "\
client
dev tun
resolv-retry infinite
nobind
persist-key
persist-tun
remote-cert-tls server
auth-user-pass
cipher AES-256-GCM
auth SHA512
verb 3
";

const PROTO_INDEX: usize = 2;
const REMOTE_INDEX: usize = 3;
const X509_INDEX: usize = 4;

/// First token of a directive line; `None` for blanks and comments
pub(super) fn directive(line: &str) -> Option<&str> {
    let token = line.split_whitespace().next()?;
    if token.starts_with('#') || token.starts_with(';') {
        None
    } else {
        Some(token)
    }
}

pub(super) fn fragment_error() -> TemplateError {
    TemplateError::InvalidConfigData("fragment directive is not supported".into())
}

pub(super) fn render(
    base: &str,
    candidate: &Candidate,
    server: &ServerNode,
    dns_servers: &[IpAddr],
    circumvent_censorship: bool,
) -> Result<String, TemplateError> {
    let proto_line = format!("proto {}", candidate.transport());
    let remote_line = format!("remote {} {}", server.address.trim(), candidate.port());
    let x509_line = server
        .ovpn_x509
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| format!("verify-x509-name {} name", name));

    let mut lines: Vec<String> = Vec::new();
    let mut has_proto = false;
    let mut has_remote = false;
    let mut has_x509 = false;

    for line in base.lines() {
        match directive(line) {
            Some("fragment") => return Err(fragment_error()),
            Some("local-proxy") | Some("ns-cert-type") => {
                debug!("Dropping template directive: {}", line.trim());
            }
            // Every proto/remote collapses into one rewritten line.
            Some("proto") => {
                if !has_proto {
                    lines.push(proto_line.clone());
                    has_proto = true;
                }
            }
            Some("remote") => {
                if !has_remote {
                    lines.push(remote_line.clone());
                    has_remote = true;
                }
            }
            Some("verify-x509-name") if x509_line.is_some() => {
                if let Some(x509) = x509_line.as_ref().filter(|_| !has_x509) {
                    lines.push(x509.clone());
                    has_x509 = true;
                }
            }
            Some("dhcp-option") if !dns_servers.is_empty() && is_dns_option(line) => {}
            _ => lines.push(line.to_string()),
        }
    }

    match (has_proto, has_remote) {
        (true, true) => {}
        (false, false) => {
            lines.insert(PROTO_INDEX.min(lines.len()), proto_line);
            lines.insert(REMOTE_INDEX.min(lines.len()), remote_line);
        }
        (false, true) => {
            let at = position(&lines, "remote").unwrap_or(lines.len());
            lines.insert(at, proto_line);
        }
        (true, false) => {
            let at = position(&lines, "proto").map(|i| i + 1).unwrap_or(lines.len());
            lines.insert(at, remote_line);
        }
    }

    if let Some(x509) = x509_line.filter(|_| !has_x509) {
        lines.insert(X509_INDEX.min(lines.len()), x509);
    }

    for dns in dns_servers {
        lines.push(format!("dhcp-option DNS {}", dns));
    }

    if circumvent_censorship {
        lines.push("udp-stuffing".to_string());
        lines.push("tcp-split-reset".to_string());
    }

    let mut text = lines.join("\n");
    text.push('\n');
    Ok(text)
}

fn position(lines: &[String], name: &str) -> Option<usize> {
    lines.iter().position(|line| directive(line) == Some(name))
}

fn is_dns_option(line: &str) -> bool {
    line.split_whitespace()
        .nth(1)
        .is_some_and(|option| option.eq_ignore_ascii_case("DNS"))
}
