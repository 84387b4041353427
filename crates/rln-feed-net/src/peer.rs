//! Peer identity and information

use rln_feed_core::crypto::member_tag;
use rln_feed_core::MemberId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Unique peer identifier (the transport public key)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Create from transport public key
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(*public_key)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Pseudonymous member tag this peer's proofs are booked under
    pub fn member_tag(&self) -> MemberId {
        member_tag(&self.0)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Information about a connected peer, learned from its hello
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer identifier
    pub id: PeerId,
    /// Remote socket address
    pub addr: SocketAddr,
    /// Topics the peer subscribes to
    pub topics: Vec<String>,
    /// Last seen timestamp (unix millis)
    pub last_seen: u64,
}

impl PeerInfo {
    /// Create new peer info
    pub fn new(id: PeerId, addr: SocketAddr, topics: Vec<String>) -> Self {
        let mut info = Self {
            id,
            addr,
            topics,
            last_seen: 0,
        };
        info.touch();
        info
    }

    /// Whether the peer announced `topic`
    pub fn subscribes(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t == topic)
    }

    /// Update last seen time
    pub fn touch(&mut self) {
        use std::time::{SystemTime, UNIX_EPOCH};
        self.last_seen = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribes() {
        let info = PeerInfo::new(
            PeerId([1; 32]),
            "127.0.0.1:9000".parse().unwrap(),
            vec!["general".into()],
        );
        assert!(info.subscribes("general"));
        assert!(!info.subscribes("random"));
        assert!(info.last_seen > 0);
    }

    #[test]
    fn test_member_tag_differs_from_key() {
        let id = PeerId([3; 32]);
        assert_ne!(id.member_tag().0, id.0);
        assert_eq!(id.member_tag(), PeerId([3; 32]).member_tag());
    }
}
