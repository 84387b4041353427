//! Networking primitives for rln-feed peers
//!
//! This crate provides:
//! - Transport keypair management and signed session hellos
//! - TCP connections with length-prefixed framing
//! - Topic-filtered broadcast across connected peers
//! - Payload sealing for topics with a shared secret
//! - Backfill request/batch messages

pub mod crypto;
pub mod framing;
pub mod messages;
pub mod peer;
pub mod transport;

pub use crypto::{CryptoError, KeyPair, PayloadCipher};
pub use framing::{Frame, FrameCodec, FrameType};
pub use messages::{BackfillBatch, BackfillItem, BackfillRequest, Hello};
pub use peer::{PeerId, PeerInfo};
pub use transport::{Connection, Transport, TransportError};
