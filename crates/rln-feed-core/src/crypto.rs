//! Hash derivations for rln-feed
//!
//! All derivations use BLAKE3 with domain separation prefixes.

use crate::canonical::canonical_bytes;
use crate::error::{Error, Result};
use crate::types::*;
use blake3::Hasher;

// =============================================================================
// DOMAIN SEPARATION PREFIXES
// =============================================================================

/// Domain prefix for payload hashes
pub const DOMAIN_PAYLOAD: &[u8] = b"rln-feed/payload";
/// Domain prefix for event proof signals
pub const DOMAIN_SIGNAL: &[u8] = b"rln-feed/signal";
/// Domain prefix for membership external nullifiers
pub const DOMAIN_MEMBERSHIP: &[u8] = b"rln-feed/membership";
/// Domain prefix for event external nullifiers
pub const DOMAIN_EVENT: &[u8] = b"rln-feed/event";
/// Domain prefix for topic storage keys
pub const DOMAIN_TOPIC: &[u8] = b"rln-feed/topic";
/// Domain prefix for session member tags
pub const DOMAIN_MEMBER: &[u8] = b"rln-feed/member";

// =============================================================================
// PAYLOADS AND HEADERS
// =============================================================================

/// `PayloadHash = BLAKE3("rln-feed/payload" || content)`
pub fn payload_hash(content: &[u8]) -> PayloadHash {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_PAYLOAD);
    hasher.update(content);
    PayloadHash(*hasher.finalize().as_bytes())
}

/// Build the header for freshly published content.
pub fn create_event_header(
    topic: impl Into<String>,
    content: &[u8],
    timestamp: u64,
    claimed_sender: impl Into<String>,
) -> EventHeader {
    EventHeader {
        topic: topic.into(),
        payload_hash: payload_hash(content),
        timestamp,
        claimed_sender: claimed_sender.into(),
    }
}

/// Check delivered content against the header's payload hash.
pub fn verify_payload_hash(header: &EventHeader, content: &[u8]) -> Result<()> {
    let computed = payload_hash(content);
    if computed != header.payload_hash {
        return Err(Error::HashMismatch {
            computed: hex::encode(computed.0),
            transmitted: hex::encode(header.payload_hash.0),
        });
    }
    Ok(())
}

/// Signal an event proof commits to.
///
/// `signal = BLAKE3("rln-feed/signal" || canonical_bytes(header))`
pub fn header_signal(header: &EventHeader) -> Result<Bytes32> {
    let bytes = canonical_bytes(header)?;
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_SIGNAL);
    hasher.update(&bytes);
    Ok(*hasher.finalize().as_bytes())
}

// =============================================================================
// EXTERNAL NULLIFIERS
// =============================================================================

/// `BLAKE3("rln-feed/membership" || epoch)`
pub fn membership_external_nullifier(epoch: u64) -> ExternalNullifier {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_MEMBERSHIP);
    hasher.update(&epoch.to_le_bytes());
    ExternalNullifier(*hasher.finalize().as_bytes())
}

/// `BLAKE3("rln-feed/event" || len(topic) || topic || epoch)`
pub fn event_external_nullifier(topic: &str, event_epoch: u64) -> ExternalNullifier {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_EVENT);
    hasher.update(&(topic.len() as u64).to_le_bytes());
    hasher.update(topic.as_bytes());
    hasher.update(&event_epoch.to_le_bytes());
    ExternalNullifier(*hasher.finalize().as_bytes())
}

// =============================================================================
// LOCAL KEYS
// =============================================================================

/// Fixed-width storage prefix for a topic.
pub fn topic_key(topic: &str) -> Bytes32 {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_TOPIC);
    hasher.update(topic.as_bytes());
    *hasher.finalize().as_bytes()
}

/// Pseudonymous member tag for a transport session key.
pub fn member_tag(transport_pubkey: &[u8]) -> MemberId {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_MEMBER);
    hasher.update(transport_pubkey);
    MemberId(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_hash_binds_content() {
        let header = create_event_header("general", b"hello", 1000, "anon");
        assert_eq!(header.payload_hash, payload_hash(b"hello"));
        assert!(verify_payload_hash(&header, b"hello").is_ok());
        assert!(matches!(
            verify_payload_hash(&header, b"hello!"),
            Err(Error::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_header_signal_covers_every_field() {
        let header = create_event_header("general", b"hello", 1000, "anon");
        let signal = header_signal(&header).unwrap();

        let mut other = header.clone();
        other.timestamp += 1;
        assert_ne!(signal, header_signal(&other).unwrap());

        let mut other = header.clone();
        other.claimed_sender = "someone".into();
        assert_ne!(signal, header_signal(&other).unwrap());

        assert_eq!(signal, header_signal(&header).unwrap());
    }

    #[test]
    fn test_external_nullifier_separation() {
        assert_ne!(membership_external_nullifier(1), membership_external_nullifier(2));
        assert_ne!(
            event_external_nullifier("a", 1),
            event_external_nullifier("a", 2)
        );
        assert_ne!(
            event_external_nullifier("a", 1),
            event_external_nullifier("b", 1)
        );
        // Topic length prefix keeps ("ab", x) and ("a", "b"..) apart
        assert_ne!(
            event_external_nullifier("ab", 1),
            event_external_nullifier("a", 1)
        );
    }

    #[test]
    fn test_member_tag_is_stable() {
        assert_eq!(member_tag(&[7; 32]), member_tag(&[7; 32]));
        assert_ne!(member_tag(&[7; 32]), member_tag(&[8; 32]));
    }
}
