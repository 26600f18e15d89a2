//! IKEv2 profile
//!
//! Username/password (EAP) authentication with AES-256-GCM, SHA-256 and
//! ECP-521 (group 21) on both SAs; the child SA's DH group gives PFS.

use super::ServerNode;
use crate::protocol::Candidate;

const LIFETIME_MINUTES: u32 = 1440;

pub(super) fn render(candidate: &Candidate, server: &ServerNode, username: &str) -> String {
    let address = server.address.trim();
    let remote_id = server
        .hostname
        .as_deref()
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .unwrap_or(address);

    let lines = [
        "[IKEv2]".to_string(),
        format!("ServerAddress = {}", address),
        format!("Port = {}", candidate.port()),
        format!("RemoteIdentifier = {}", remote_id),
        format!("LocalIdentifier = {}", username),
        "Authentication = EAP".to_string(),
        format!("Username = {}", username),
        "IkeEncryption = AES-256-GCM".to_string(),
        "IkeIntegrity = SHA2-256".to_string(),
        "IkeDhGroup = 21".to_string(),
        format!("IkeLifetimeMinutes = {}", LIFETIME_MINUTES),
        "ChildEncryption = AES-256-GCM".to_string(),
        "ChildIntegrity = SHA2-256".to_string(),
        "ChildDhGroup = 21".to_string(),
        format!("ChildLifetimeMinutes = {}", LIFETIME_MINUTES),
        "DeadPeerDetection = medium".to_string(),
    ];

    let mut text = lines.join("\n");
    text.push('\n');
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ConnectionKind;

    #[test]
    fn test_identifiers() {
        let candidate = Candidate::new(ConnectionKind::IKEv2, "500").unwrap();

        let text = render(&candidate, &ServerNode::new("10.1.1.1").with_hostname("ike.example.net"), "alice");
        assert!(text.contains("RemoteIdentifier = ike.example.net"));
        assert!(text.contains("LocalIdentifier = alice"));

        let text = render(&candidate, &ServerNode::new("10.1.1.1"), "alice");
        assert!(text.contains("RemoteIdentifier = 10.1.1.1"));
    }
}
