//! Per-topic feed state

use crate::membership::{MemberTracker, MembershipStats};
use parking_lot::{Mutex, MutexGuard};
use rln_feed_core::ProtocolParams;
use rln_feed_net::PayloadCipher;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Observable processing phase of a topic
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedPhase {
    Idle,
    /// At least one message is being verified
    Verifying,
}

/// Shared secrets of sealed topics
#[derive(Clone, Debug, Default)]
pub struct TopicKeys {
    keys: HashMap<String, PayloadCipher>,
}

impl TopicKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seal `topic` with a key derived from `secret`
    pub fn insert(&mut self, topic: impl Into<String>, secret: &[u8]) {
        self.keys
            .insert(topic.into(), PayloadCipher::from_secret(secret));
    }

    /// Parse `topic=secret` entries
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a str>) -> anyhow::Result<Self> {
        let mut keys = Self::new();
        for entry in entries {
            let (topic, secret) = entry
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("topic key {entry:?} is not topic=secret"))?;
            if topic.is_empty() || secret.is_empty() {
                anyhow::bail!("topic key {entry:?} has an empty topic or secret");
            }
            keys.insert(topic, secret.as_bytes());
        }
        Ok(keys)
    }

    pub fn get(&self, topic: &str) -> Option<&PayloadCipher> {
        self.keys.get(topic)
    }
}

/// State owned by one topic.
///
/// The tracker mutex is the topic's single-writer lock: holders may also
/// insert into storage for this topic.
pub struct TopicFeed {
    topic: String,
    tracker: Mutex<MemberTracker>,
    in_flight: AtomicUsize,
    cipher: Option<PayloadCipher>,
    /// Event epoch of our last local publish
    last_published: Mutex<Option<u64>>,
}

impl TopicFeed {
    pub fn new(topic: impl Into<String>, params: ProtocolParams, cipher: Option<PayloadCipher>) -> Self {
        Self {
            topic: topic.into(),
            tracker: Mutex::new(MemberTracker::new(params)),
            in_flight: AtomicUsize::new(0),
            cipher,
            last_published: Mutex::new(None),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn cipher(&self) -> Option<&PayloadCipher> {
        self.cipher.as_ref()
    }

    /// Take the topic lock
    pub fn lock(&self) -> MutexGuard<'_, MemberTracker> {
        self.tracker.lock()
    }

    pub fn phase(&self) -> FeedPhase {
        if self.in_flight.load(Ordering::SeqCst) == 0 {
            FeedPhase::Idle
        } else {
            FeedPhase::Verifying
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Mark a verification in flight until the guard drops
    pub fn begin_verify(&self) -> VerifyGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        VerifyGuard { feed: self }
    }

    /// Claim the local publishing slot for `event_epoch`.
    ///
    /// Returns false when we already published in that epoch.
    pub fn claim_publish_slot(&self, event_epoch: u64) -> bool {
        let mut last = self.last_published.lock();
        if *last == Some(event_epoch) {
            return false;
        }
        *last = Some(event_epoch);
        true
    }

    /// Give back a slot claimed for a publish that failed
    pub fn release_publish_slot(&self, event_epoch: u64, previous: Option<u64>) {
        let mut last = self.last_published.lock();
        if *last == Some(event_epoch) {
            *last = previous;
        }
    }

    pub fn last_published(&self) -> Option<u64> {
        *self.last_published.lock()
    }

    pub fn stats(&self) -> MembershipStats {
        self.tracker.lock().stats()
    }
}

/// Keeps a topic in [`FeedPhase::Verifying`] while alive
pub struct VerifyGuard<'a> {
    feed: &'a TopicFeed,
}

impl Drop for VerifyGuard<'_> {
    fn drop(&mut self) {
        self.feed.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_follows_guards() {
        let feed = TopicFeed::new("general", ProtocolParams::default(), None);
        assert_eq!(feed.phase(), FeedPhase::Idle);

        let first = feed.begin_verify();
        let second = feed.begin_verify();
        assert_eq!(feed.phase(), FeedPhase::Verifying);
        assert_eq!(feed.in_flight(), 2);

        drop(first);
        assert_eq!(feed.phase(), FeedPhase::Verifying);
        drop(second);
        assert_eq!(feed.phase(), FeedPhase::Idle);
    }

    #[test]
    fn test_publish_slot() {
        let feed = TopicFeed::new("general", ProtocolParams::default(), None);
        assert!(feed.claim_publish_slot(10));
        assert!(!feed.claim_publish_slot(10));

        feed.release_publish_slot(10, None);
        assert_eq!(feed.last_published(), None);
        assert!(feed.claim_publish_slot(10));
        assert!(feed.claim_publish_slot(11));
    }

    #[test]
    fn test_topic_keys_parse() {
        let keys = TopicKeys::from_entries(["secret=hunter2", "ops=a=b"]).unwrap();
        assert!(keys.get("secret").is_some());
        assert!(keys.get("ops").is_some());
        assert!(keys.get("general").is_none());

        assert!(TopicKeys::from_entries(["nokey"]).is_err());
        assert!(TopicKeys::from_entries(["=x"]).is_err());
    }
}
