//! Persistent storage using sled
//!
//! Trees:
//! - `events`: topic key ‖ payload hash → wire-encoded `StoredEvent`
//! - `by_time`: topic key ‖ timestamp (BE) ‖ payload hash → ()
//! - `nullifiers`: external nullifier ‖ nullifier → payload hash
//! - `payloads`: payload hash → content bytes
//! - `metadata`: node state and per-topic watermarks

use crate::config::NodeState;
use rln_feed_core::canonical::{decode_f64, encode_f64};
use rln_feed_core::crypto::topic_key;
use rln_feed_core::verify::NullifierLog;
use rln_feed_core::wire::{decode_stored_event, encode_stored_event};
use rln_feed_core::{Bytes32, DecodeError, ExternalNullifier, Nullifier, PayloadHash, StoredEvent};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::Db;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

const NODE_STATE_KEY: &str = "node_state";
const WATERMARK_PREFIX: &str = "watermark/";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("Encoding error: {0}")]
    Encoding(#[from] rln_feed_core::Error),
    #[error("Stored event undecodable: {0}")]
    Decode(#[from] DecodeError),
    #[error("Corrupt record in {0}")]
    Corrupt(&'static str),
}

/// Result of a transactional event insert
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Same topic and payload hash already present
    AlreadyStored,
    /// The rate-limit slot is held by another event
    NullifierTaken(PayloadHash),
}

/// A stored event with its content, if held
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackfillEntry {
    pub event: StoredEvent,
    pub payload: Option<Vec<u8>>,
}

/// Storage backend for feedd
pub struct Storage {
    db: Db,
    events: sled::Tree,
    by_time: sled::Tree,
    nullifiers: sled::Tree,
    payloads: sled::Tree,
    metadata: sled::Tree,
}

fn event_key(topic: &Bytes32, hash: &PayloadHash) -> [u8; 64] {
    let mut key = [0u8; 64];
    key[..32].copy_from_slice(topic);
    key[32..].copy_from_slice(&hash.0);
    key
}

fn time_key(topic: &Bytes32, timestamp: u64, hash: &PayloadHash) -> [u8; 72] {
    let mut key = [0u8; 72];
    key[..32].copy_from_slice(topic);
    key[32..40].copy_from_slice(&timestamp.to_be_bytes());
    key[40..].copy_from_slice(&hash.0);
    key
}

fn nullifier_key(external: &ExternalNullifier, nullifier: &Nullifier) -> [u8; 64] {
    let mut key = [0u8; 64];
    key[..32].copy_from_slice(&external.0);
    key[32..].copy_from_slice(&nullifier.0);
    key
}

fn to_hash(bytes: &[u8]) -> Option<PayloadHash> {
    bytes.try_into().ok().map(PayloadHash)
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let events = db.open_tree("events")?;
        let by_time = db.open_tree("by_time")?;
        let nullifiers = db.open_tree("nullifiers")?;
        let payloads = db.open_tree("payloads")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            events,
            by_time,
            nullifiers,
            payloads,
            metadata,
        })
    }

    /// Insert an accepted event, its nullifier, and optionally its content
    /// in one transaction.
    ///
    /// Content delivered for an event that is already stored is kept if
    /// none was held before.
    pub fn insert_event(
        &self,
        event: &StoredEvent,
        external: &ExternalNullifier,
        payload: Option<&[u8]>,
    ) -> Result<InsertOutcome, StorageError> {
        let topic = topic_key(&event.header.topic);
        let hash = event.payload_hash();
        let ekey = event_key(&topic, &hash);
        let tkey = time_key(&topic, event.header.timestamp, &hash);
        let nkey = nullifier_key(external, &event.nullifier());
        let encoded = encode_stored_event(event)?;

        let result = (&self.events, &self.by_time, &self.nullifiers, &self.payloads).transaction(
            |(events, by_time, nullifiers, payloads)| {
                if events.get(ekey)?.is_some() {
                    if let Some(content) = payload {
                        if payloads.get(hash.0)?.is_none() {
                            payloads.insert(&hash.0, content)?;
                        }
                    }
                    return Ok(InsertOutcome::AlreadyStored);
                }
                if let Some(owner) = nullifiers.get(nkey)? {
                    let owner = to_hash(&owner).ok_or(ConflictableTransactionError::Abort(
                        StorageError::Corrupt("nullifiers"),
                    ))?;
                    return Ok(InsertOutcome::NullifierTaken(owner));
                }

                events.insert(&ekey[..], encoded.as_slice())?;
                by_time.insert(&tkey[..], &b""[..])?;
                nullifiers.insert(&nkey[..], &hash.0[..])?;
                if let Some(content) = payload {
                    payloads.insert(&hash.0[..], content)?;
                }
                Ok(InsertOutcome::Inserted)
            },
        );

        result.map_err(|e| match e {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => StorageError::Sled(e),
        })
    }

    /// Get an event by topic and payload hash
    pub fn get_event(
        &self,
        topic: &str,
        hash: &PayloadHash,
    ) -> Result<Option<StoredEvent>, StorageError> {
        match self.events.get(event_key(&topic_key(topic), hash))? {
            Some(bytes) => Ok(Some(decode_stored_event(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Check if event exists
    pub fn has_event(&self, topic: &str, hash: &PayloadHash) -> Result<bool, StorageError> {
        Ok(self.events.contains_key(event_key(&topic_key(topic), hash))?)
    }

    /// Content bytes for a payload hash
    pub fn get_payload(&self, hash: &PayloadHash) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.payloads.get(hash.0)?.map(|v| v.to_vec()))
    }

    /// Keep `content` for a stored event that holds none yet; returns
    /// whether it was added. The caller checks it against the hash.
    pub fn attach_payload(
        &self,
        topic: &str,
        hash: &PayloadHash,
        content: &[u8],
    ) -> Result<bool, StorageError> {
        if !self.has_event(topic, hash)? {
            return Ok(false);
        }
        let swapped = self
            .payloads
            .compare_and_swap(hash.0, None::<&[u8]>, Some(content))?;
        Ok(swapped.is_ok())
    }

    /// Payload hash of the event holding a rate-limit slot
    pub fn nullifier_owner(
        &self,
        external: &ExternalNullifier,
        nullifier: &Nullifier,
    ) -> Result<Option<PayloadHash>, StorageError> {
        match self.nullifiers.get(nullifier_key(external, nullifier))? {
            Some(bytes) => to_hash(&bytes)
                .map(Some)
                .ok_or(StorageError::Corrupt("nullifiers")),
            None => Ok(None),
        }
    }

    /// Stored events of `topic` with timestamp ≥ `since`, oldest first.
    ///
    /// With `after` set, iteration resumes strictly after the cursor
    /// `(since, after)`. The sequence is read lazily from the time index.
    pub fn backfill(&self, topic: &str, since: u64, after: Option<PayloadHash>) -> Backfill<'_> {
        let prefix = topic_key(topic);
        let start = time_key(&prefix, since, &after.unwrap_or(PayloadHash([0; 32])));
        Backfill {
            storage: self,
            prefix,
            iter: self.by_time.range(start..),
            skip: after.map(|_| start),
            done: false,
        }
    }

    /// Count events
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Highest receive time recorded for a topic
    pub fn watermark(&self, topic: &str) -> Result<Option<f64>, StorageError> {
        let key = format!("{WATERMARK_PREFIX}{topic}");
        Ok(self.metadata.get(key)?.and_then(|v| decode_f64(&v)))
    }

    /// Raise the topic watermark to `received` if it is higher
    pub fn raise_watermark(&self, topic: &str, received: f64) -> Result<(), StorageError> {
        if !received.is_finite() {
            return Ok(());
        }
        let key = format!("{WATERMARK_PREFIX}{topic}");
        self.metadata.fetch_and_update(key, |old| {
            let current = old.and_then(decode_f64);
            match current {
                Some(current) if current >= received => old.map(|v| v.to_vec()),
                _ => Some(encode_f64(received).to_vec()),
            }
        })?;
        Ok(())
    }

    /// Load persisted node state
    pub fn load_node_state(&self) -> Result<Option<NodeState>, StorageError> {
        match self.metadata.get(NODE_STATE_KEY)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Persist node state
    pub fn save_node_state(&self, state: &NodeState) -> Result<(), StorageError> {
        let value = postcard::to_allocvec(state)?;
        self.metadata.insert(NODE_STATE_KEY, value)?;
        Ok(())
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn load_entry(&self, topic: &Bytes32, hash: &PayloadHash) -> Result<BackfillEntry, StorageError> {
        let bytes = self
            .events
            .get(event_key(topic, hash))?
            .ok_or(StorageError::Corrupt("by_time"))?;
        Ok(BackfillEntry {
            event: decode_stored_event(&bytes)?,
            payload: self.get_payload(hash)?,
        })
    }
}

impl NullifierLog for Storage {
    fn is_spent(&self, external: &ExternalNullifier, nullifier: &Nullifier) -> bool {
        match self.nullifiers.contains_key(nullifier_key(external, nullifier)) {
            Ok(spent) => spent,
            Err(e) => {
                // The insert transaction re-checks the slot
                warn!(error = %e, "nullifier lookup failed");
                false
            }
        }
    }
}

/// Lazy, restartable walk over a topic's time index
pub struct Backfill<'a> {
    storage: &'a Storage,
    prefix: Bytes32,
    iter: sled::Iter,
    skip: Option<[u8; 72]>,
    done: bool,
}

impl Iterator for Backfill<'_> {
    type Item = Result<BackfillEntry, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            let key = match self.iter.next()? {
                Ok((key, _)) => key,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };
            if !key.starts_with(&self.prefix) {
                self.done = true;
                return None;
            }
            if self.skip.as_ref().map(|s| &s[..]) == Some(&key[..]) {
                continue;
            }
            let Some(hash) = to_hash(&key[40..]) else {
                self.done = true;
                return Some(Err(StorageError::Corrupt("by_time")));
            };
            return Some(self.storage.load_entry(&self.prefix, &hash));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rln_feed_core::crypto::{create_event_header, event_external_nullifier};
    use rln_feed_core::{Proof, SnarkProof};
    use tempfile::tempdir;

    fn stored(topic: &str, content: &[u8], timestamp: u64, nullifier: u8) -> StoredEvent {
        StoredEvent {
            header: create_event_header(topic, content, timestamp, "anon"),
            proof: Proof {
                public_signals: vec!["1".into()],
                snark_proof: SnarkProof {
                    pi_a: vec!["1".into(), "2".into(), "1".into()],
                    pi_b: vec![
                        vec!["1".into(), "2".into()],
                        vec!["3".into(), "4".into()],
                        vec!["1".into(), "0".into()],
                    ],
                    pi_c: vec!["0".into(), "0".into(), "1".into()],
                    protocol: "groth16".into(),
                    curve: "bn128".into(),
                },
                external_nullifier: event_external_nullifier(topic, timestamp / 60),
                nullifier: Nullifier([nullifier; 32]),
            },
        }
    }

    fn insert(storage: &Storage, event: &StoredEvent, payload: Option<&[u8]>) -> InsertOutcome {
        storage
            .insert_event(event, &event.proof.external_nullifier, payload)
            .unwrap()
    }

    #[test]
    fn test_insert_is_idempotent() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let event = stored("general", b"hello", 6000, 1);

        assert_eq!(insert(&storage, &event, None), InsertOutcome::Inserted);
        assert_eq!(insert(&storage, &event, None), InsertOutcome::AlreadyStored);
        assert_eq!(storage.event_count(), 1);
        assert_eq!(
            storage.get_event("general", &event.payload_hash()).unwrap(),
            Some(event.clone())
        );
        assert!(!storage.has_event("other", &event.payload_hash()).unwrap());

        // Content arriving later is kept
        assert_eq!(storage.get_payload(&event.payload_hash()).unwrap(), None);
        insert(&storage, &event, Some(b"hello"));
        assert_eq!(
            storage.get_payload(&event.payload_hash()).unwrap(),
            Some(b"hello".to_vec())
        );
    }

    #[test]
    fn test_attach_payload_keeps_first_content() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let event = stored("general", b"hello", 6000, 1);
        let hash = event.payload_hash();

        assert!(!storage.attach_payload("general", &hash, b"hello").unwrap());
        assert_eq!(storage.get_payload(&hash).unwrap(), None);

        insert(&storage, &event, None);
        assert!(!storage.attach_payload("other", &hash, b"hello").unwrap());
        assert!(storage.attach_payload("general", &hash, b"hello").unwrap());
        assert!(!storage.attach_payload("general", &hash, b"hello").unwrap());
        assert_eq!(storage.get_payload(&hash).unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn test_nullifier_slot_is_taken_once() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let first = stored("general", b"one", 6000, 7);
        let second = stored("general", b"two", 6001, 7);
        let external = first.proof.external_nullifier;

        assert!(!storage.is_spent(&external, &first.nullifier()));
        assert_eq!(insert(&storage, &first, None), InsertOutcome::Inserted);
        assert!(storage.is_spent(&external, &first.nullifier()));

        assert_eq!(
            insert(&storage, &second, None),
            InsertOutcome::NullifierTaken(first.payload_hash())
        );
        assert!(!storage.has_event("general", &second.payload_hash()).unwrap());
        assert_eq!(
            storage.nullifier_owner(&external, &first.nullifier()).unwrap(),
            Some(first.payload_hash())
        );
    }

    #[test]
    fn test_backfill_order_and_cursor() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let events = [
            stored("general", b"c", 300, 3),
            stored("general", b"a", 100, 1),
            stored("general", b"b1", 200, 2),
            stored("general", b"b2", 200, 4),
            stored("other", b"x", 150, 5),
        ];
        for event in &events {
            insert(&storage, event, None);
        }

        let all: Vec<_> = storage
            .backfill("general", 0, None)
            .map(|e| e.unwrap().event)
            .collect();
        assert_eq!(all.len(), 4);
        let keys: Vec<_> = all
            .iter()
            .map(|e| (e.header.timestamp, e.payload_hash()))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert!(all.iter().all(|e| e.header.topic == "general"));

        let since: Vec<_> = storage
            .backfill("general", 200, None)
            .map(|e| e.unwrap().event.header.timestamp)
            .collect();
        assert_eq!(since, vec![200, 200, 300]);

        // Resume after the first event at 200
        let (ts, hash) = keys[1];
        let rest: Vec<_> = storage
            .backfill("general", ts, Some(hash))
            .map(|e| e.unwrap().event.payload_hash())
            .collect();
        assert_eq!(rest, vec![keys[2].1, keys[3].1]);
    }

    #[test]
    fn test_watermark_only_rises() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        assert_eq!(storage.watermark("general").unwrap(), None);
        storage.raise_watermark("general", 100.5).unwrap();
        storage.raise_watermark("general", 90.0).unwrap();
        assert_eq!(storage.watermark("general").unwrap(), Some(100.5));
        storage.raise_watermark("general", f64::NAN).unwrap();
        assert_eq!(storage.watermark("general").unwrap(), Some(100.5));
    }

    #[test]
    fn test_node_state_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        assert!(storage.load_node_state().unwrap().is_none());

        let state = NodeState {
            keypair_seed: [1; 32],
            identity_secret: [2; 32],
        };
        storage.save_node_state(&state).unwrap();
        let loaded = storage.load_node_state().unwrap().unwrap();
        assert_eq!(loaded.keypair_seed, [1; 32]);
        assert_eq!(loaded.identity_secret, [2; 32]);
    }
}
