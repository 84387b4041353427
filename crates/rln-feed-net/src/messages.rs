//! Session and replication messages carried in frames
//!
//! Peer messages (renewals and events) travel as raw wire bytes in
//! [`FrameType::Peer`] frames; the types here cover the session hello and
//! paged backfill.

use crate::crypto::{CryptoError, KeyPair};
use crate::framing::{Frame, FrameType};
use crate::peer::PeerId;
use rln_feed_core::PayloadHash;
use serde::{Deserialize, Serialize};

/// Domain prefix for hello signatures
const DOMAIN_HELLO: &[u8] = b"rln-feed/hello";

/// Signed session opener announcing a node's key and topics
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub public_key: [u8; 32],
    pub topics: Vec<String>,
    /// Unix seconds at signing
    pub timestamp: u64,
    pub signature: Vec<u8>,
}

impl Hello {
    /// Build and sign a hello
    pub fn new(keypair: &KeyPair, topics: Vec<String>, timestamp: u64) -> Self {
        let public_key = keypair.public_key();
        let signature = keypair
            .sign(&Self::signing_bytes(&public_key, &topics, timestamp))
            .to_vec();
        Self {
            public_key,
            topics,
            timestamp,
            signature,
        }
    }

    fn signing_bytes(public_key: &[u8; 32], topics: &[String], timestamp: u64) -> Vec<u8> {
        let mut bytes = DOMAIN_HELLO.to_vec();
        bytes.extend_from_slice(public_key);
        bytes.extend_from_slice(&timestamp.to_le_bytes());
        for topic in topics {
            bytes.extend_from_slice(&(topic.len() as u64).to_le_bytes());
            bytes.extend_from_slice(topic.as_bytes());
        }
        bytes
    }

    /// Check the signature against the announced key
    pub fn verify(&self) -> Result<(), CryptoError> {
        let message = Self::signing_bytes(&self.public_key, &self.topics, self.timestamp);
        KeyPair::verify(&self.public_key, &message, &self.signature)
    }

    /// Peer this hello identifies
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key)
    }

    pub fn to_frame(&self) -> Result<Frame, postcard::Error> {
        let payload = postcard::to_allocvec(self)?;
        Ok(Frame::new(FrameType::Hello, payload))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, postcard::Error> {
        postcard::from_bytes(&frame.payload)
    }
}

/// Request for stored events of a topic, oldest first
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillRequest {
    pub topic: String,
    /// Lowest timestamp wanted
    pub since: u64,
    /// Resume strictly after `(since, after)` when set
    pub after: Option<PayloadHash>,
    pub max_events: u32,
}

/// One stored event in a backfill batch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillItem {
    /// Wire-encoded `StoredEvent`
    pub event: Vec<u8>,
    /// Content bytes when the responder holds them
    pub payload: Option<Vec<u8>>,
}

/// Page of a backfill response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillBatch {
    pub topic: String,
    pub items: Vec<BackfillItem>,
    /// More events remain after the last item
    pub has_more: bool,
}

impl BackfillRequest {
    pub fn to_frame(&self) -> Result<Frame, postcard::Error> {
        let payload = postcard::to_allocvec(self)?;
        Ok(Frame::new(FrameType::BackfillRequest, payload))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, postcard::Error> {
        postcard::from_bytes(&frame.payload)
    }
}

impl BackfillBatch {
    pub fn to_frame(&self) -> Result<Frame, postcard::Error> {
        let payload = postcard::to_allocvec(self)?;
        Ok(Frame::new(FrameType::BackfillBatch, payload))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, postcard::Error> {
        postcard::from_bytes(&frame.payload)
    }
}
