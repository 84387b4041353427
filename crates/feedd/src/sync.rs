//! Peer message processing and replication
//!
//! [`SyncProtocol`] decodes inbound peer messages, verifies them on a
//! bounded blocking pool, and applies accepted facts to storage and the
//! topic's member tracker. Every path is idempotent: replays, reorders and
//! duplicates converge to the same stored state.

use crate::feed::{FeedPhase, TopicFeed, TopicKeys};
use crate::storage::{Backfill, InsertOutcome, Storage, StorageError};
use rln_feed_core::crypto::{create_event_header, verify_payload_hash};
use rln_feed_core::epoch::{unix_now_f64, ProtocolParams};
use rln_feed_core::proof::{ProofError, ProofSystem};
use rln_feed_core::verify::{
    check_structure, verify_event, verify_event_message, verify_membership, Freshness,
    VerifyContext, VerifyError,
};
use rln_feed_core::wire::{decode_message, decode_stored_event, encode_message, encode_stored_event};
use rln_feed_core::{
    DecodeError, EventHeader, EventMessage, ExternalNullifier, GroupContext, IdentitySecret, MemberId,
    Nullifier, PayloadHash, PeerMessage, Proof, StoredEvent,
};
use rln_feed_net::framing::MAX_FRAME_SIZE;
use rln_feed_net::{BackfillBatch, BackfillItem, BackfillRequest, CryptoError, PeerId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Default number of concurrent proof verifications
pub const DEFAULT_VERIFY_WORKERS: usize = 4;
/// Default events per backfill batch
pub const DEFAULT_BACKFILL_BATCH: u32 = 256;
/// Soft cap on encoded bytes per backfill batch
const MAX_BATCH_BYTES: usize = 1024 * 1024;

/// Sync protocol errors.
///
/// Rejected peer input is never an error (see [`Outcome::Dropped`]); these
/// are failures of the node itself.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Encoding error: {0}")]
    Encoding(#[from] rln_feed_core::Error),
    #[error("Proving failed: {0}")]
    Proof(#[from] ProofError),
    #[error("Payload sealing failed: {0}")]
    Seal(#[from] CryptoError),
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),
    #[error("Already published on {topic} in event epoch {event_epoch}")]
    RateLimited { topic: String, event_epoch: u64 },
    #[error("Local event rejected: {0}")]
    Rejected(String),
    #[error("Verifier pool unavailable")]
    VerifierUnavailable,
}

/// Why an inbound message was dropped
#[derive(Debug, Error)]
pub enum DropReason {
    #[error("undecodable: {0}")]
    Decode(DecodeError),
    #[error("rejected: {0}")]
    Verify(VerifyError),
    #[error("unknown topic {0:?}")]
    UnknownTopic(String),
    #[error("session closed during verification")]
    SessionClosed,
}

/// Result of handling one inbound message
#[derive(Debug)]
pub enum Outcome {
    /// Valid membership renewal; `fresh` when it raised a stored epoch
    Renewed { epoch: u64, fresh: bool },
    /// New event stored; `forward` is its re-encoding for other peers
    Stored {
        topic: String,
        payload_hash: PayloadHash,
        forward: Vec<u8>,
    },
    /// Event already stored; nothing changed
    AlreadyKnown(PayloadHash),
    Dropped(DropReason),
}

/// A peer session as seen by the sync protocol
#[derive(Clone, Debug)]
pub struct Session {
    member: MemberId,
    peer: Option<PeerId>,
    topics: Vec<String>,
    open: Arc<AtomicBool>,
}

impl Session {
    /// Session bound to a connection's liveness flag
    pub fn new(member: MemberId, peer: Option<PeerId>, topics: Vec<String>, open: Arc<AtomicBool>) -> Self {
        Self {
            member,
            peer,
            topics,
            open,
        }
    }

    /// Session for messages originating on this node
    pub fn local(member: MemberId, topics: Vec<String>) -> Self {
        Self::new(member, None, topics, Arc::new(AtomicBool::new(true)))
    }

    /// Pseudonymous tag proofs from this session are booked under
    pub fn member(&self) -> MemberId {
        self.member
    }

    pub fn peer(&self) -> Option<PeerId> {
        self.peer
    }

    /// Topics shared with the remote side
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Two events that spent the same rate-limit slot
#[derive(Clone, Debug)]
pub struct SlashingEvidence {
    pub topic: String,
    pub external_nullifier: ExternalNullifier,
    pub nullifier: Nullifier,
    /// The event that holds the slot, if still stored
    pub first: Option<StoredEvent>,
    pub second: StoredEvent,
}

/// Receiver of abuse reports
pub trait AbuseHook: Send + Sync {
    fn invalid_proof(&self, topic: Option<&str>, sender: MemberId, error: &VerifyError);
    fn duplicate_nullifier(&self, sender: MemberId, evidence: SlashingEvidence);
}

/// Abuse hook that only logs
pub struct LogAbuseHook;

impl AbuseHook for LogAbuseHook {
    fn invalid_proof(&self, topic: Option<&str>, sender: MemberId, error: &VerifyError) {
        warn!(topic = topic.unwrap_or("-"), %sender, %error, "invalid proof");
    }

    fn duplicate_nullifier(&self, sender: MemberId, evidence: SlashingEvidence) {
        warn!(
            topic = %evidence.topic,
            %sender,
            nullifier = %evidence.nullifier,
            first = ?evidence.first.as_ref().map(|e| e.payload_hash().to_string()),
            second = %evidence.second.payload_hash(),
            "rate limit violated"
        );
    }
}

/// Tunables of the sync protocol
#[derive(Clone, Copy, Debug)]
pub struct SyncConfig {
    pub params: ProtocolParams,
    pub verify_workers: usize,
    pub backfill_batch: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            params: ProtocolParams::default(),
            verify_workers: DEFAULT_VERIFY_WORKERS,
            backfill_batch: DEFAULT_BACKFILL_BATCH,
        }
    }
}

/// A locally published event
#[derive(Clone, Debug)]
pub struct Published {
    pub payload_hash: PayloadHash,
    /// Wire bytes to broadcast
    pub bytes: Vec<u8>,
}

/// Result of applying one backfill batch
#[derive(Clone, Debug, Default)]
pub struct BackfillProgress {
    pub applied: usize,
    pub known: usize,
    pub dropped: usize,
    /// Request for the following page, when the responder has more
    pub next: Option<BackfillRequest>,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    renewals: AtomicU64,
    stored: AtomicU64,
    known: AtomicU64,
    duplicates: AtomicU64,
    dropped: AtomicU64,
    backfilled: AtomicU64,
}

/// Synchronization core of a node
pub struct SyncProtocol {
    params: ProtocolParams,
    group: GroupContext,
    proofs: Arc<dyn ProofSystem>,
    storage: Arc<Storage>,
    local_member: MemberId,
    feeds: HashMap<String, TopicFeed>,
    verifiers: Semaphore,
    backfill_batch: u32,
    abuse: Arc<dyn AbuseHook>,
    counters: Counters,
}

impl SyncProtocol {
    pub fn new(
        config: SyncConfig,
        group: GroupContext,
        proofs: Arc<dyn ProofSystem>,
        storage: Arc<Storage>,
        local_member: MemberId,
        topics: &[String],
        keys: &TopicKeys,
    ) -> Self {
        let feeds = topics
            .iter()
            .map(|topic| {
                let feed = TopicFeed::new(topic.clone(), config.params, keys.get(topic).cloned());
                (topic.clone(), feed)
            })
            .collect();

        Self {
            params: config.params,
            group,
            proofs,
            storage,
            local_member,
            feeds,
            verifiers: Semaphore::new(config.verify_workers.max(1)),
            backfill_batch: config.backfill_batch.max(1),
            abuse: Arc::new(LogAbuseHook),
            counters: Counters::default(),
        }
    }

    /// Replace the abuse hook
    pub fn with_abuse_hook(mut self, hook: Arc<dyn AbuseHook>) -> Self {
        self.abuse = hook;
        self
    }

    pub fn params(&self) -> &ProtocolParams {
        &self.params
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.feeds.keys().map(String::as_str)
    }

    pub fn feed(&self, topic: &str) -> Option<&TopicFeed> {
        self.feeds.get(topic)
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Tag our own proofs are booked under
    pub fn local_member(&self) -> MemberId {
        self.local_member
    }

    async fn verify_blocking<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .verifiers
            .acquire()
            .await
            .map_err(|_| SyncError::VerifierUnavailable)?;
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|_| SyncError::VerifierUnavailable)
    }

    fn drop_message(&self, reason: DropReason) -> Outcome {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        debug!(%reason, "dropped peer message");
        Outcome::Dropped(reason)
    }

    /// Handle raw message bytes received now
    pub async fn handle_message(&self, session: &Session, bytes: &[u8]) -> Result<Outcome, SyncError> {
        self.handle_message_at(session, bytes, unix_now_f64()).await
    }

    /// Handle raw message bytes received at `now` (unix seconds)
    pub async fn handle_message_at(
        &self,
        session: &Session,
        bytes: &[u8],
        now: f64,
    ) -> Result<Outcome, SyncError> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let message = match decode_message(bytes) {
            Ok(message) => message,
            Err(e) => return Ok(self.drop_message(DropReason::Decode(e))),
        };

        match message {
            PeerMessage::MembershipRenewal { membership_proof } => {
                self.handle_renewal(session, membership_proof, now).await
            }
            PeerMessage::Event(event) => self.handle_event(session, event, now).await,
        }
    }

    async fn handle_renewal(&self, session: &Session, proof: Proof, now: f64) -> Result<Outcome, SyncError> {
        if let Err(e) = check_structure(&proof) {
            return Ok(self.drop_message(DropReason::Verify(e)));
        }

        let proofs = self.proofs.clone();
        let params = self.params;
        let now_secs = now as u64;
        let verdict = self
            .verify_blocking(move || {
                let ctx = VerifyContext {
                    params: &params,
                    now: now_secs,
                    freshness: Freshness::Live,
                };
                verify_membership(&proof, &ctx, proofs.as_ref())
            })
            .await?;

        if !session.is_open() {
            return Ok(self.drop_message(DropReason::SessionClosed));
        }

        match verdict {
            Ok(epoch) => {
                let mut fresh = false;
                for topic in session.topics() {
                    if let Some(feed) = self.feeds.get(topic) {
                        fresh |= feed.lock().add(session.member(), epoch);
                    }
                }
                self.counters.renewals.fetch_add(1, Ordering::Relaxed);
                debug!(member = %session.member(), epoch, fresh, "membership renewal");
                Ok(Outcome::Renewed { epoch, fresh })
            }
            Err(e) => {
                if e.is_invalid_proof() {
                    self.abuse.invalid_proof(None, session.member(), &e);
                }
                Ok(self.drop_message(DropReason::Verify(e)))
            }
        }
    }

    async fn handle_event(
        &self,
        session: &Session,
        mut message: EventMessage,
        now: f64,
    ) -> Result<Outcome, SyncError> {
        let Some(feed) = self.feeds.get(&message.topic) else {
            return Ok(self.drop_message(DropReason::UnknownTopic(message.topic)));
        };

        let hash = message.header.payload_hash;
        if message.topic == message.header.topic && self.storage.has_event(&message.topic, &hash)? {
            if let Some(content) = message.payload.as_deref() {
                self.keep_late_payload(&message.topic, &message.header, content)?;
            }
            self.counters.known.fetch_add(1, Ordering::Relaxed);
            return Ok(Outcome::AlreadyKnown(hash));
        }

        let now_secs = now as u64;
        let verdict = {
            let _verifying = feed.begin_verify();
            let proofs = self.proofs.clone();
            let storage = self.storage.clone();
            let params = self.params;
            let candidate = message.clone();
            self.verify_blocking(move || {
                let ctx = VerifyContext {
                    params: &params,
                    now: now_secs,
                    freshness: Freshness::Live,
                };
                verify_event_message(&candidate, &ctx, proofs.as_ref(), storage.as_ref())
            })
            .await?
        };

        if !session.is_open() {
            return Ok(self.drop_message(DropReason::SessionClosed));
        }

        let stored = StoredEvent::from(&message);
        let verified = match verdict {
            Ok(verified) => verified,
            Err(VerifyError::DuplicateNullifier) => {
                let external = message.event_proof.external_nullifier();
                return self.rate_limit_violation(session, external, stored, None);
            }
            Err(e) => {
                if e.is_invalid_proof() {
                    self.abuse.invalid_proof(Some(&message.topic), session.member(), &e);
                }
                return Ok(self.drop_message(DropReason::Verify(e)));
            }
        };

        let external = verified.event.external_nullifier;
        let inserted = {
            let mut tracker = feed.lock();
            let inserted = self
                .storage
                .insert_event(&stored, &external, message.payload.as_deref())?;
            if inserted == InsertOutcome::Inserted {
                tracker.add(session.member(), verified.membership_epoch);
                tracker.receive_event_timestamp(session.member(), now_secs);
            }
            inserted
        };

        match inserted {
            InsertOutcome::Inserted => {
                self.storage.raise_watermark(&message.topic, now)?;
                debug!(topic = %message.topic, payload = %hash, member = %session.member(), "stored event");
                message.received_timestamp = now;
                let topic = message.topic.clone();
                let forward = encode_message(&PeerMessage::Event(message))?;
                self.counters.stored.fetch_add(1, Ordering::Relaxed);
                Ok(Outcome::Stored {
                    topic,
                    payload_hash: hash,
                    forward,
                })
            }
            InsertOutcome::AlreadyStored => {
                self.counters.known.fetch_add(1, Ordering::Relaxed);
                Ok(Outcome::AlreadyKnown(hash))
            }
            InsertOutcome::NullifierTaken(owner) => {
                self.rate_limit_violation(session, external, stored, Some(owner))
            }
        }
    }

    /// Store content that arrived after its event was stored without it
    fn keep_late_payload(&self, topic: &str, header: &EventHeader, content: &[u8]) -> Result<(), SyncError> {
        if verify_payload_hash(header, content).is_err() {
            return Ok(());
        }
        if self.storage.attach_payload(topic, &header.payload_hash, content)? {
            debug!(topic, payload = %header.payload_hash, "kept late content");
        }
        Ok(())
    }

    /// Report a spent slot, unless the slot holder is this very event.
    fn rate_limit_violation(
        &self,
        session: &Session,
        external: ExternalNullifier,
        second: StoredEvent,
        owner: Option<PayloadHash>,
    ) -> Result<Outcome, SyncError> {
        let topic = second.header.topic.clone();
        let nullifier = second.nullifier();
        let owner = match owner {
            Some(owner) => Some(owner),
            None => self.storage.nullifier_owner(&external, &nullifier)?,
        };

        // A concurrent delivery of the same event got there first
        if owner == Some(second.payload_hash()) {
            self.counters.known.fetch_add(1, Ordering::Relaxed);
            return Ok(Outcome::AlreadyKnown(second.payload_hash()));
        }

        let first = match owner {
            Some(owner) => self.storage.get_event(&topic, &owner)?,
            None => None,
        };
        self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
        self.abuse.duplicate_nullifier(
            session.member(),
            SlashingEvidence {
                topic,
                external_nullifier: external,
                nullifier,
                first,
                second,
            },
        );
        Ok(self.drop_message(DropReason::Verify(VerifyError::DuplicateNullifier)))
    }

    /// Wire bytes of a membership renewal for the epoch of `now`
    pub fn renewal(&self, identity: &IdentitySecret, now: u64) -> Result<Vec<u8>, SyncError> {
        let epoch = self.params.membership_epoch(now);
        let membership_proof = self.proofs.prove_membership(identity, &self.group, epoch)?;
        Ok(encode_message(&PeerMessage::MembershipRenewal { membership_proof })?)
    }

    /// Publish `content` on `topic` as a member holding `identity`.
    ///
    /// Content of sealed topics is encrypted before hashing. The event is
    /// applied locally and its wire bytes returned for broadcast. Events are
    /// content addressed: identical unsealed content can be posted once per
    /// topic.
    pub async fn publish(
        &self,
        topic: &str,
        content: &[u8],
        identity: &IdentitySecret,
        claimed_sender: &str,
        now: f64,
    ) -> Result<Published, SyncError> {
        let feed = self
            .feeds
            .get(topic)
            .ok_or_else(|| SyncError::UnknownTopic(topic.to_string()))?;
        let now_secs = now as u64;
        let event_epoch = self.params.event_epoch(now_secs);

        let previous = feed.last_published();
        if !feed.claim_publish_slot(event_epoch) {
            return Err(SyncError::RateLimited {
                topic: topic.to_string(),
                event_epoch,
            });
        }

        let result = self
            .publish_in_slot(feed, content, identity, claimed_sender, now, event_epoch)
            .await;
        match &result {
            Ok(published) => {
                info!(topic, payload = %published.payload_hash, event_epoch, "published event");
            }
            Err(SyncError::RateLimited { .. }) => {}
            Err(_) => feed.release_publish_slot(event_epoch, previous),
        }
        result
    }

    async fn publish_in_slot(
        &self,
        feed: &TopicFeed,
        content: &[u8],
        identity: &IdentitySecret,
        claimed_sender: &str,
        now: f64,
        event_epoch: u64,
    ) -> Result<Published, SyncError> {
        let topic = feed.topic().to_string();
        let now_secs = now as u64;
        let body = match feed.cipher() {
            Some(cipher) => cipher.seal(content)?,
            None => content.to_vec(),
        };

        let header = create_event_header(topic.clone(), &body, now_secs, claimed_sender);
        let membership_epoch = self.params.membership_epoch(now_secs);
        let membership_proof = self
            .proofs
            .prove_membership(identity, &self.group, membership_epoch)?;
        let event_proof = self
            .proofs
            .prove_event(identity, &self.group, &header, event_epoch)?;

        let payload_hash = header.payload_hash;
        let message = PeerMessage::Event(EventMessage {
            membership_proof,
            event_proof,
            header,
            received_timestamp: now,
            topic: topic.clone(),
            payload: Some(body),
        });
        let bytes = encode_message(&message)?;

        let session = Session::local(self.local_member, vec![topic.clone()]);
        match self.handle_message_at(&session, &bytes, now).await? {
            Outcome::Stored { forward, .. } => Ok(Published {
                payload_hash,
                bytes: forward,
            }),
            Outcome::Dropped(DropReason::Verify(VerifyError::DuplicateNullifier)) => {
                Err(SyncError::RateLimited { topic, event_epoch })
            }
            Outcome::AlreadyKnown(_) => Err(SyncError::Rejected(
                "identical content already published".into(),
            )),
            other => Err(SyncError::Rejected(format!("{other:?}"))),
        }
    }

    /// Stored content of an event, decrypted for sealed topics
    pub fn open_payload(&self, topic: &str, hash: &PayloadHash) -> Result<Option<Vec<u8>>, SyncError> {
        let feed = self
            .feeds
            .get(topic)
            .ok_or_else(|| SyncError::UnknownTopic(topic.to_string()))?;
        if !self.storage.has_event(topic, hash)? {
            return Ok(None);
        }
        let Some(body) = self.storage.get_payload(hash)? else {
            return Ok(None);
        };
        match feed.cipher() {
            Some(cipher) => Ok(Some(cipher.open(&body)?)),
            None => Ok(Some(body)),
        }
    }

    /// Stored events of `topic` from `since`, oldest first, resumable after
    /// a `(since, after)` cursor.
    pub fn backfill(&self, topic: &str, since: u64, after: Option<PayloadHash>) -> Backfill<'_> {
        self.storage.backfill(topic, since, after)
    }

    /// First backfill request for `topic`, starting a skew before the
    /// persisted watermark.
    pub fn backfill_request(&self, topic: &str) -> Result<BackfillRequest, SyncError> {
        let since = self
            .storage
            .watermark(topic)?
            .map(|mark| (mark as u64).saturating_sub(self.params.clock_skew_secs))
            .unwrap_or(0);
        Ok(BackfillRequest {
            topic: topic.to_string(),
            since,
            after: None,
            max_events: self.backfill_batch,
        })
    }

    /// Serve one page of stored events.
    ///
    /// A page always fits in one frame. The first item is always admitted,
    /// without its content if the content alone would overflow a frame;
    /// later items only while the page stays under the batch byte cap.
    pub fn handle_backfill_request(&self, request: &BackfillRequest) -> Result<BackfillBatch, SyncError> {
        let mut batch = BackfillBatch {
            topic: request.topic.clone(),
            items: Vec::new(),
            has_more: false,
        };
        if !self.feeds.contains_key(&request.topic) {
            return Ok(batch);
        }

        let limit = request.max_events.clamp(1, self.backfill_batch) as usize;
        let frame_budget = (MAX_FRAME_SIZE - 1).saturating_sub(batch_overhead(&request.topic));
        let page_budget = frame_budget.min(MAX_BATCH_BYTES);
        let mut bytes = 0;
        for entry in self.storage.backfill(&request.topic, request.since, request.after) {
            let entry = entry?;
            if batch.items.len() == limit {
                batch.has_more = true;
                break;
            }
            let event = encode_stored_event(&entry.event)?;
            let mut payload = entry.payload;
            let mut size = item_len(&event, payload.as_deref());
            if size > frame_budget {
                warn!(
                    topic = %request.topic,
                    payload = %entry.event.payload_hash(),
                    size,
                    "content too large for a backfill frame, serving event only"
                );
                payload = None;
                size = item_len(&event, None);
            }
            if !batch.items.is_empty() && bytes + size > page_budget {
                batch.has_more = true;
                break;
            }
            bytes += size;
            batch.items.push(BackfillItem { event, payload });
        }
        Ok(batch)
    }

    /// Serve one page of stored events to `session`; topics the session
    /// does not share get an empty page.
    pub fn handle_backfill_request_for(
        &self,
        session: &Session,
        request: &BackfillRequest,
    ) -> Result<BackfillBatch, SyncError> {
        if !session.topics().contains(&request.topic) {
            debug!(topic = %request.topic, peer = ?session.peer(), "backfill request for unshared topic");
            return Ok(BackfillBatch {
                topic: request.topic.clone(),
                items: Vec::new(),
                has_more: false,
            });
        }
        self.handle_backfill_request(request)
    }

    /// Verify and store a backfill page received from `session`.
    ///
    /// Backfilled events carry no membership proof and no sender, so they
    /// do not touch the member tracker.
    pub async fn apply_backfill(
        &self,
        session: &Session,
        batch: BackfillBatch,
        now: f64,
    ) -> Result<BackfillProgress, SyncError> {
        let mut progress = BackfillProgress::default();
        let Some(feed) = self.feeds.get(&batch.topic) else {
            progress.dropped = batch.items.len();
            return Ok(progress);
        };
        let topic = batch.topic;
        let has_more = batch.has_more;

        let mut candidates = Vec::with_capacity(batch.items.len());
        let mut cursor = None;
        for item in batch.items {
            let event = match decode_stored_event(&item.event) {
                Ok(event) if event.header.topic == topic => event,
                _ => {
                    progress.dropped += 1;
                    continue;
                }
            };
            cursor = Some((event.header.timestamp, event.payload_hash()));
            if self.storage.has_event(&topic, &event.payload_hash())? {
                if let Some(content) = item.payload.as_deref() {
                    self.keep_late_payload(&topic, &event.header, content)?;
                }
                progress.known += 1;
                continue;
            }
            candidates.push((event, item.payload));
        }

        let now_secs = now as u64;
        let (candidates, verdicts) = {
            let _verifying = feed.begin_verify();
            let proofs = self.proofs.clone();
            let storage = self.storage.clone();
            let params = self.params;
            self.verify_blocking(move || {
                let ctx = VerifyContext {
                    params: &params,
                    now: now_secs,
                    freshness: Freshness::Historical,
                };
                let verdicts: Vec<_> = candidates
                    .iter()
                    .map(|(event, payload)| {
                        verify_event(
                            &event.header,
                            &event.proof,
                            payload.as_deref(),
                            &ctx,
                            proofs.as_ref(),
                            storage.as_ref(),
                        )
                    })
                    .collect();
                (candidates, verdicts)
            })
            .await?
        };

        if !session.is_open() {
            progress.dropped += candidates.len();
            return Ok(progress);
        }

        let mut violations = Vec::new();
        {
            let _topic_lock = feed.lock();
            for ((event, payload), verdict) in candidates.into_iter().zip(verdicts) {
                let verified = match verdict {
                    Ok(verified) => verified,
                    Err(VerifyError::DuplicateNullifier) => {
                        violations.push((event.proof.external_nullifier(), event, None));
                        continue;
                    }
                    Err(e) => {
                        if e.is_invalid_proof() {
                            self.abuse.invalid_proof(Some(&topic), session.member(), &e);
                        }
                        progress.dropped += 1;
                        continue;
                    }
                };
                match self
                    .storage
                    .insert_event(&event, &verified.external_nullifier, payload.as_deref())?
                {
                    InsertOutcome::Inserted => {
                        progress.applied += 1;
                        self.storage
                            .raise_watermark(&topic, event.header.timestamp as f64)?;
                    }
                    InsertOutcome::AlreadyStored => progress.known += 1,
                    InsertOutcome::NullifierTaken(owner) => {
                        violations.push((verified.external_nullifier, event, Some(owner)));
                    }
                }
            }
        }

        for (external, event, owner) in violations {
            match self.rate_limit_violation(session, external, event, owner)? {
                Outcome::AlreadyKnown(_) => progress.known += 1,
                _ => progress.dropped += 1,
            }
        }

        self.counters
            .backfilled
            .fetch_add(progress.applied as u64, Ordering::Relaxed);
        if progress.applied > 0 {
            info!(%topic, applied = progress.applied, known = progress.known, dropped = progress.dropped, "applied backfill");
        }

        progress.next = match (has_more, cursor) {
            (true, Some((since, after))) => Some(BackfillRequest {
                topic,
                since,
                after: Some(after),
                max_events: self.backfill_batch,
            }),
            _ => None,
        };
        Ok(progress)
    }

    /// Periodic membership maintenance; returns members purged
    pub fn tick(&self, now: u64) -> usize {
        self.feeds
            .values()
            .map(|feed| feed.lock().update_member_list(now))
            .sum()
    }

    /// Get sync statistics
    pub fn stats(&self) -> SyncStats {
        let mut stats = SyncStats {
            topics: self.feeds.len(),
            events_stored: self.storage.event_count(),
            messages_received: self.counters.received.load(Ordering::Relaxed),
            renewals_accepted: self.counters.renewals.load(Ordering::Relaxed),
            events_accepted: self.counters.stored.load(Ordering::Relaxed),
            already_known: self.counters.known.load(Ordering::Relaxed),
            duplicate_nullifiers: self.counters.duplicates.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            backfilled: self.counters.backfilled.load(Ordering::Relaxed),
            ..SyncStats::default()
        };
        for feed in self.feeds.values() {
            let members = feed.stats();
            stats.members += members.tracked;
            stats.active_members += members.active;
            if feed.phase() == FeedPhase::Verifying {
                stats.verifying_topics += 1;
            }
        }
        stats
    }
}

/// Sync statistics
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub topics: usize,
    pub events_stored: usize,
    pub messages_received: u64,
    pub renewals_accepted: u64,
    pub events_accepted: u64,
    pub already_known: u64,
    pub duplicate_nullifiers: u64,
    pub dropped: u64,
    pub backfilled: u64,
    pub members: usize,
    pub active_members: usize,
    pub verifying_topics: usize,
}

/// Postcard size of a length-prefixed byte string
fn bytes_len(len: usize) -> usize {
    let mut prefix = 1;
    let mut rest = len >> 7;
    while rest > 0 {
        prefix += 1;
        rest >>= 7;
    }
    prefix + len
}

/// Postcard size of one backfill item
fn item_len(event: &[u8], payload: Option<&[u8]>) -> usize {
    bytes_len(event.len()) + 1 + payload.map_or(0, |p| bytes_len(p.len()))
}

/// Postcard size of a batch without its items: topic, worst-case item
/// count varint, `has_more`
fn batch_overhead(topic: &str) -> usize {
    bytes_len(topic.len()) + 10 + 1
}
