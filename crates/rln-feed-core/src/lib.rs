//! rln-feed core library
//!
//! Types, canonical encoding, wire codec, and verification for anonymous
//! topic feeds gated by rate-limiting nullifier (RLN) proofs.
//!
//! # Modules
//!
//! - [`types`]: Protocol types (EventHeader, Proof, PeerMessage, StoredEvent)
//! - [`canonical`]: Deterministic serialization and the proof clone pass
//! - [`wire`]: Fail-closed binary codec for peer messages
//! - [`crypto`]: Payload hashes and external nullifier derivations
//! - [`epoch`]: Membership/event epochs and timing parameters
//! - [`proof`]: Proof system seam and the hash-based development prover
//! - [`verify`]: Ordered verification of events and membership proofs
//! - [`error`]: Error types

pub mod canonical;
pub mod crypto;
pub mod epoch;
pub mod error;
pub mod proof;
pub mod types;
pub mod verify;
pub mod wire;

pub use epoch::ProtocolParams;
pub use error::{Error, Result};
pub use proof::{GroupContext, IdentitySecret, ProofSystem};
pub use types::*;
pub use wire::DecodeError;
