//! Binary wire codec for peer messages, stored events and proofs
//!
//! Wire format is postcard over private mirror structs in which every
//! required substructure is optional. Decoding then promotes the mirror into
//! the strongly typed domain value, so absence of a required part is a
//! [`DecodeError`] and never a panic. Bytes appended after a complete value
//! are ignored, which lets newer encoders add trailing fields.

use crate::canonical::{canonical_proof, normalize_f64};
use crate::types::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire tag for membership renewals
pub const TYPE_MEMBERSHIP: &str = "membership";
/// Wire tag for events
pub const TYPE_EVENT: &str = "event";

/// Decode failures. Every variant means "drop the message".
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(#[from] postcard::Error),
    #[error("unknown message type: {0:?}")]
    UnknownType(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field: {0}")]
    InvalidField(#[from] crate::error::Error),
}

// =============================================================================
// WIRE MIRRORS
// =============================================================================

#[derive(Serialize, Deserialize)]
struct WireSnarkProof {
    pi_a: Vec<String>,
    pi_b: Vec<Vec<String>>,
    pi_c: Vec<String>,
    protocol: String,
    curve: String,
}

#[derive(Serialize, Deserialize)]
struct WireProof {
    public_signals: Option<Vec<String>>,
    snark_proof: Option<WireSnarkProof>,
    external_nullifier: Bytes32,
    nullifier: Bytes32,
}

#[derive(Serialize, Deserialize)]
struct WireHeader {
    topic: String,
    payload_hash: Bytes32,
    timestamp: u64,
    claimed_sender: String,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: String,
    membership_proof: Option<WireProof>,
    event_proof: Option<WireProof>,
    header: Option<WireHeader>,
    received_timestamp: Option<f64>,
    topic: Option<String>,
    payload: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize)]
struct WireStoredEvent {
    header: Option<WireHeader>,
    proof: Option<WireProof>,
}

impl WireProof {
    fn from_proof(proof: &Proof) -> crate::Result<Self> {
        let proof = canonical_proof(proof)?;
        let snark = proof.snark_proof;
        Ok(Self {
            public_signals: Some(proof.public_signals),
            snark_proof: Some(WireSnarkProof {
                pi_a: snark.pi_a,
                pi_b: snark.pi_b,
                pi_c: snark.pi_c,
                protocol: snark.protocol,
                curve: snark.curve,
            }),
            external_nullifier: proof.external_nullifier.0,
            nullifier: proof.nullifier.0,
        })
    }

    fn into_proof(self) -> Result<Proof, DecodeError> {
        let public_signals = self
            .public_signals
            .ok_or(DecodeError::MissingField("publicSignals"))?;
        let snark = self
            .snark_proof
            .ok_or(DecodeError::MissingField("snarkProof"))?;

        let proof = Proof {
            public_signals,
            snark_proof: SnarkProof {
                pi_a: snark.pi_a,
                pi_b: snark.pi_b,
                pi_c: snark.pi_c,
                protocol: snark.protocol,
                curve: snark.curve,
            },
            external_nullifier: ExternalNullifier(self.external_nullifier),
            nullifier: Nullifier(self.nullifier),
        };
        Ok(canonical_proof(&proof)?)
    }
}

impl From<&EventHeader> for WireHeader {
    fn from(header: &EventHeader) -> Self {
        Self {
            topic: header.topic.clone(),
            payload_hash: header.payload_hash.0,
            timestamp: header.timestamp,
            claimed_sender: header.claimed_sender.clone(),
        }
    }
}

impl From<WireHeader> for EventHeader {
    fn from(header: WireHeader) -> Self {
        Self {
            topic: header.topic,
            payload_hash: PayloadHash(header.payload_hash),
            timestamp: header.timestamp,
            claimed_sender: header.claimed_sender,
        }
    }
}

// =============================================================================
// PEER MESSAGES
// =============================================================================

/// Encode a peer message canonically.
pub fn encode_message(message: &PeerMessage) -> crate::Result<Vec<u8>> {
    let wire = match message {
        PeerMessage::MembershipRenewal { membership_proof } => WireMessage {
            kind: TYPE_MEMBERSHIP.to_string(),
            membership_proof: Some(WireProof::from_proof(membership_proof)?),
            event_proof: None,
            header: None,
            received_timestamp: None,
            topic: None,
            payload: None,
        },
        PeerMessage::Event(event) => WireMessage {
            kind: TYPE_EVENT.to_string(),
            membership_proof: Some(WireProof::from_proof(&event.membership_proof)?),
            event_proof: Some(WireProof::from_proof(&event.event_proof)?),
            header: Some(WireHeader::from(&event.header)),
            received_timestamp: Some(normalize_f64(event.received_timestamp)?),
            topic: Some(event.topic.clone()),
            payload: event.payload.clone(),
        },
    };
    Ok(postcard::to_allocvec(&wire)?)
}

/// Decode a peer message, failing closed on anything incomplete.
pub fn decode_message(bytes: &[u8]) -> Result<PeerMessage, DecodeError> {
    let wire: WireMessage = postcard::from_bytes(bytes)?;

    match wire.kind.as_str() {
        TYPE_MEMBERSHIP => {
            let proof = wire
                .membership_proof
                .ok_or(DecodeError::MissingField("membershipProof"))?;
            Ok(PeerMessage::MembershipRenewal {
                membership_proof: proof.into_proof()?,
            })
        }
        TYPE_EVENT => {
            let membership_proof = wire
                .membership_proof
                .ok_or(DecodeError::MissingField("membershipProof"))?
                .into_proof()?;
            let event_proof = wire
                .event_proof
                .ok_or(DecodeError::MissingField("eventProof"))?
                .into_proof()?;
            let header: EventHeader = wire
                .header
                .ok_or(DecodeError::MissingField("header"))?
                .into();
            let received_timestamp = normalize_f64(wire.received_timestamp.unwrap_or(0.0))?;
            let topic = wire.topic.unwrap_or_else(|| header.topic.clone());

            Ok(PeerMessage::Event(EventMessage {
                membership_proof,
                event_proof,
                header,
                received_timestamp,
                topic,
                payload: wire.payload,
            }))
        }
        other => Err(DecodeError::UnknownType(other.to_string())),
    }
}

// =============================================================================
// STORED EVENTS AND PROOFS
// =============================================================================

/// Encode a stored event canonically.
pub fn encode_stored_event(event: &StoredEvent) -> crate::Result<Vec<u8>> {
    let wire = WireStoredEvent {
        header: Some(WireHeader::from(&event.header)),
        proof: Some(WireProof::from_proof(&event.proof)?),
    };
    Ok(postcard::to_allocvec(&wire)?)
}

/// Decode a stored event, failing closed on anything incomplete.
pub fn decode_stored_event(bytes: &[u8]) -> Result<StoredEvent, DecodeError> {
    let wire: WireStoredEvent = postcard::from_bytes(bytes)?;
    let header = wire.header.ok_or(DecodeError::MissingField("header"))?;
    let proof = wire.proof.ok_or(DecodeError::MissingField("proof"))?;
    Ok(StoredEvent {
        header: header.into(),
        proof: proof.into_proof()?,
    })
}

/// Encode a proof canonically.
pub fn encode_proof(proof: &Proof) -> crate::Result<Vec<u8>> {
    Ok(postcard::to_allocvec(&WireProof::from_proof(proof)?)?)
}

/// Decode a proof into canonical shape.
pub fn decode_proof(bytes: &[u8]) -> Result<Proof, DecodeError> {
    let wire: WireProof = postcard::from_bytes(bytes)?;
    wire.into_proof()
}
