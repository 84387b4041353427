//! Core protocol types for RLN feeds
//!
//! Domain values here are always canonical: anything decoded from the wire
//! has already been through [`crate::wire`] validation and the proof clone
//! pass in [`crate::canonical`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte fixed-size array used for hashes and identifiers.
pub type Bytes32 = [u8; 32];

// =============================================================================
// IDENTITY TYPES (newtypes for type safety)
// =============================================================================

/// Pseudonymous member tag used for activity bookkeeping.
///
/// This is a per-session tag (derived from the transport key of the peer that
/// delivered a proof), never the prover's identity commitment.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(pub Bytes32);

/// Content address: BLAKE3("rln-feed/payload" || content)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PayloadHash(pub Bytes32);

/// Rate-limit slot tag published by an RLN proof
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Nullifier(pub Bytes32);

/// Public binding of a proof to a topic and epoch
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ExternalNullifier(pub Bytes32);

macro_rules! short_hex_display {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", hex::encode(&self.0[..8]))
                }
            }
        )*
    };
}

short_hex_display!(MemberId, PayloadHash, Nullifier, ExternalNullifier);

// =============================================================================
// MEMBERSHIP
// =============================================================================

/// A tracked member and the latest membership epoch it proved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Member {
    pub id: MemberId,
    pub epoch: u64,
}

// =============================================================================
// EVENT HEADER
// =============================================================================

/// Immutable metadata binding a topic post to its exact content.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EventHeader {
    pub topic: String,
    pub payload_hash: PayloadHash,
    /// Sender-chosen unix time in seconds
    pub timestamp: u64,
    /// Free-form pseudonym; carries no authority
    pub claimed_sender: String,
}

// =============================================================================
// PROOFS
// =============================================================================

/// Groth16-style proof points as emitted by snarkjs (decimal field elements).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnarkProof {
    pub pi_a: Vec<String>,
    pub pi_b: Vec<Vec<String>>,
    pub pi_c: Vec<String>,
    pub protocol: String,
    pub curve: String,
}

/// RLN proof: opaque SNARK plus the public values the protocol inspects.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Proof {
    pub public_signals: Vec<String>,
    pub snark_proof: SnarkProof,
    pub external_nullifier: ExternalNullifier,
    pub nullifier: Nullifier,
}

impl Proof {
    /// Rate-limit slot this proof consumes
    pub fn nullifier(&self) -> Nullifier {
        self.nullifier
    }

    /// Topic/epoch binding of this proof
    pub fn external_nullifier(&self) -> ExternalNullifier {
        self.external_nullifier
    }
}

// =============================================================================
// PEER MESSAGES
// =============================================================================

/// A published event as it travels between peers.
#[derive(Clone, Debug, PartialEq)]
pub struct EventMessage {
    pub membership_proof: Proof,
    pub event_proof: Proof,
    pub header: EventHeader,
    /// Unix seconds (fractional) at which the forwarding peer received it
    pub received_timestamp: f64,
    pub topic: String,
    /// Content bytes, when the sender ships them alongside the header
    pub payload: Option<Vec<u8>>,
}

/// Messages exchanged on a topic.
#[derive(Clone, Debug, PartialEq)]
pub enum PeerMessage {
    MembershipRenewal { membership_proof: Proof },
    Event(EventMessage),
}

impl PeerMessage {
    /// Wire tag of this message kind
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::MembershipRenewal { .. } => crate::wire::TYPE_MEMBERSHIP,
            PeerMessage::Event(_) => crate::wire::TYPE_EVENT,
        }
    }

    /// Membership proof carried by either variant
    pub fn membership_proof(&self) -> &Proof {
        match self {
            PeerMessage::MembershipRenewal { membership_proof } => membership_proof,
            PeerMessage::Event(event) => &event.membership_proof,
        }
    }
}

// =============================================================================
// STORAGE
// =============================================================================

/// An accepted event: header plus the event proof that authorised it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredEvent {
    pub header: EventHeader,
    pub proof: Proof,
}

impl StoredEvent {
    pub fn payload_hash(&self) -> PayloadHash {
        self.header.payload_hash
    }

    pub fn nullifier(&self) -> Nullifier {
        self.proof.nullifier
    }
}

impl From<&EventMessage> for StoredEvent {
    fn from(msg: &EventMessage) -> Self {
        Self {
            header: msg.header.clone(),
            proof: msg.event_proof.clone(),
        }
    }
}
