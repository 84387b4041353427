//! Event and membership verification
//!
//! Checks run in a fixed order and stop at the first failure:
//! structure, payload hash, clock skew, proof validity, nullifier
//! uniqueness. Nothing here mutates state; callers apply effects only after
//! an `Ok`.

use crate::crypto::verify_payload_hash;
use crate::epoch::ProtocolParams;
use crate::proof::{ProofContext, ProofSystem};
use crate::types::*;
use std::collections::HashSet;
use thiserror::Error;

/// Verification failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("proof structurally incomplete: {0}")]
    StructurallyIncomplete(&'static str),
    #[error("payload does not match header hash")]
    PayloadMismatch,
    #[error("message topic {message:?} does not match header topic {header:?}")]
    TopicMismatch { message: String, header: String },
    #[error("timestamp {timestamp} outside skew tolerance at {now}")]
    ClockSkew { timestamp: u64, now: u64 },
    #[error("proof bound to a different topic or epoch")]
    ExternalNullifierMismatch,
    #[error("proof failed verification")]
    ProofInvalid,
    #[error("nullifier already spent for this topic and epoch")]
    DuplicateNullifier,
}

impl VerifyError {
    /// True for failures that indicate a forged or broken proof
    pub fn is_invalid_proof(&self) -> bool {
        matches!(
            self,
            VerifyError::ProofInvalid | VerifyError::ExternalNullifierMismatch
        )
    }
}

/// How strictly to treat event timestamps
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
    /// Gossip in real time: timestamp within skew of now, both directions
    Live,
    /// Backfilled history: only timestamps from the future are rejected
    Historical,
}

/// Local conditions a message is verified under
#[derive(Clone, Copy, Debug)]
pub struct VerifyContext<'a> {
    pub params: &'a ProtocolParams,
    pub now: u64,
    pub freshness: Freshness,
}

/// Record of spent rate-limit slots
pub trait NullifierLog {
    fn is_spent(&self, external: &ExternalNullifier, nullifier: &Nullifier) -> bool;
}

impl NullifierLog for HashSet<(ExternalNullifier, Nullifier)> {
    fn is_spent(&self, external: &ExternalNullifier, nullifier: &Nullifier) -> bool {
        self.contains(&(*external, *nullifier))
    }
}

/// Facts established by a successful event verification
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerifiedEvent {
    pub payload_hash: PayloadHash,
    pub external_nullifier: ExternalNullifier,
    pub nullifier: Nullifier,
    pub event_epoch: u64,
}

/// Facts established by a successful event message verification
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerifiedEventMessage {
    pub event: VerifiedEvent,
    pub membership_epoch: u64,
}

/// Structural completeness of a (canonical) Groth16 proof.
pub fn check_structure(proof: &Proof) -> Result<(), VerifyError> {
    let snark = &proof.snark_proof;
    if proof.public_signals.is_empty() {
        return Err(VerifyError::StructurallyIncomplete("publicSignals"));
    }
    if snark.pi_a.len() != 3 {
        return Err(VerifyError::StructurallyIncomplete("piA"));
    }
    if snark.pi_b.len() != 3 || snark.pi_b.iter().any(|row| row.len() != 2) {
        return Err(VerifyError::StructurallyIncomplete("piB"));
    }
    if snark.pi_c.len() != 3 {
        return Err(VerifyError::StructurallyIncomplete("piC"));
    }
    if snark.protocol.is_empty() {
        return Err(VerifyError::StructurallyIncomplete("protocol"));
    }
    if snark.curve.is_empty() {
        return Err(VerifyError::StructurallyIncomplete("curve"));
    }
    Ok(())
}

/// Clock-skew check for a header timestamp.
pub fn check_clock(header: &EventHeader, ctx: &VerifyContext<'_>) -> Result<(), VerifyError> {
    let skew = ctx.params.clock_skew_secs;
    let too_new = header.timestamp > ctx.now.saturating_add(skew);
    let too_old = header.timestamp < ctx.now.saturating_sub(skew);
    let rejected = match ctx.freshness {
        Freshness::Live => too_new || too_old,
        Freshness::Historical => too_new,
    };
    if rejected {
        return Err(VerifyError::ClockSkew {
            timestamp: header.timestamp,
            now: ctx.now,
        });
    }
    Ok(())
}

/// Verify an event header and its proof.
pub fn verify_event(
    header: &EventHeader,
    proof: &Proof,
    payload: Option<&[u8]>,
    ctx: &VerifyContext<'_>,
    proofs: &dyn ProofSystem,
    spent: &dyn NullifierLog,
) -> Result<VerifiedEvent, VerifyError> {
    check_structure(proof)?;

    if let Some(content) = payload {
        verify_payload_hash(header, content).map_err(|_| VerifyError::PayloadMismatch)?;
    }

    check_clock(header, ctx)?;

    let event_epoch = ctx.params.event_epoch(header.timestamp);
    let statement =
        ProofContext::event(header, event_epoch).map_err(|_| VerifyError::ProofInvalid)?;
    if proof.external_nullifier() != statement.external_nullifier {
        return Err(VerifyError::ExternalNullifierMismatch);
    }
    if !proofs.verify(proof, &statement) {
        return Err(VerifyError::ProofInvalid);
    }

    if spent.is_spent(&statement.external_nullifier, &proof.nullifier()) {
        return Err(VerifyError::DuplicateNullifier);
    }

    Ok(VerifiedEvent {
        payload_hash: header.payload_hash,
        external_nullifier: statement.external_nullifier,
        nullifier: proof.nullifier(),
        event_epoch,
    })
}

/// Verify a membership proof and return the epoch it proves.
///
/// Identity is never checked: any prover valid for an acceptable epoch is a
/// member.
pub fn verify_membership(
    proof: &Proof,
    ctx: &VerifyContext<'_>,
    proofs: &dyn ProofSystem,
) -> Result<u64, VerifyError> {
    check_structure(proof)?;

    let epoch = ctx
        .params
        .acceptable_membership_epochs(ctx.now)
        .find(|epoch| ProofContext::membership(*epoch).external_nullifier == proof.external_nullifier())
        .ok_or(VerifyError::ExternalNullifierMismatch)?;

    if !proofs.verify(proof, &ProofContext::membership(epoch)) {
        return Err(VerifyError::ProofInvalid);
    }
    Ok(epoch)
}

/// Verify a complete event message: both proofs, header and payload.
///
/// Both proofs are checked for structure before anything else so that an
/// incomplete message never reaches the proof system.
pub fn verify_event_message(
    message: &EventMessage,
    ctx: &VerifyContext<'_>,
    proofs: &dyn ProofSystem,
    spent: &dyn NullifierLog,
) -> Result<VerifiedEventMessage, VerifyError> {
    check_structure(&message.membership_proof)?;
    check_structure(&message.event_proof)?;

    if message.topic != message.header.topic {
        return Err(VerifyError::TopicMismatch {
            message: message.topic.clone(),
            header: message.header.topic.clone(),
        });
    }

    let membership_epoch = verify_membership(&message.membership_proof, ctx, proofs)?;
    let event = verify_event(
        &message.header,
        &message.event_proof,
        message.payload.as_deref(),
        ctx,
        proofs,
        spent,
    )?;

    Ok(VerifiedEventMessage {
        event,
        membership_epoch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::create_event_header;
    use crate::proof::{GroupContext, HashProofSystem, IdentitySecret};

    const NOW: u64 = 1_700_000_000;

    struct Fixture {
        params: ProtocolParams,
        proofs: HashProofSystem,
        group: GroupContext,
        secret: IdentitySecret,
    }

    impl Fixture {
        fn new() -> Self {
            let group = GroupContext { root: [7; 32] };
            Self {
                params: ProtocolParams::default(),
                proofs: HashProofSystem::new(group),
                group,
                secret: IdentitySecret([3; 32]),
            }
        }

        fn ctx(&self, freshness: Freshness) -> VerifyContext<'_> {
            VerifyContext {
                params: &self.params,
                now: NOW,
                freshness,
            }
        }

        fn message(&self, content: &[u8], timestamp: u64) -> EventMessage {
            let header = create_event_header("general", content, timestamp, "anon");
            let event_proof = self
                .proofs
                .prove_event(
                    &self.secret,
                    &self.group,
                    &header,
                    self.params.event_epoch(timestamp),
                )
                .unwrap();
            let membership_proof = self
                .proofs
                .prove_membership(&self.secret, &self.group, self.params.membership_epoch(NOW))
                .unwrap();
            EventMessage {
                membership_proof,
                event_proof,
                header,
                received_timestamp: NOW as f64,
                topic: "general".into(),
                payload: Some(content.to_vec()),
            }
        }
    }

    fn no_spent() -> HashSet<(ExternalNullifier, Nullifier)> {
        HashSet::new()
    }

    #[test]
    fn test_valid_message() {
        let f = Fixture::new();
        let msg = f.message(b"hello", NOW);
        let verified =
            verify_event_message(&msg, &f.ctx(Freshness::Live), &f.proofs, &no_spent()).unwrap();
        assert_eq!(verified.membership_epoch, f.params.membership_epoch(NOW));
        assert_eq!(verified.event.nullifier, msg.event_proof.nullifier());
        assert_eq!(verified.event.event_epoch, f.params.event_epoch(NOW));
    }

    #[test]
    fn test_structure_checked_first() {
        let f = Fixture::new();
        let mut msg = f.message(b"hello", NOW);
        msg.membership_proof.snark_proof.pi_b.pop();
        // Also break the payload: structure must still be the reported failure
        msg.payload = Some(b"other".to_vec());
        assert_eq!(
            verify_event_message(&msg, &f.ctx(Freshness::Live), &f.proofs, &no_spent()),
            Err(VerifyError::StructurallyIncomplete("piB"))
        );

        let mut msg = f.message(b"hello", NOW);
        msg.event_proof.public_signals.clear();
        assert_eq!(
            verify_event_message(&msg, &f.ctx(Freshness::Live), &f.proofs, &no_spent()),
            Err(VerifyError::StructurallyIncomplete("publicSignals"))
        );
    }

    #[test]
    fn test_payload_mismatch() {
        let f = Fixture::new();
        let mut msg = f.message(b"hello", NOW);
        msg.payload = Some(b"tampered".to_vec());
        assert_eq!(
            verify_event_message(&msg, &f.ctx(Freshness::Live), &f.proofs, &no_spent()),
            Err(VerifyError::PayloadMismatch)
        );

        // Header alone is fine
        msg.payload = None;
        assert!(
            verify_event_message(&msg, &f.ctx(Freshness::Live), &f.proofs, &no_spent()).is_ok()
        );
    }

    #[test]
    fn test_clock_skew() {
        let f = Fixture::new();
        let skew = f.params.clock_skew_secs;

        let old = f.message(b"old", NOW - skew - 1);
        assert!(matches!(
            verify_event_message(&old, &f.ctx(Freshness::Live), &f.proofs, &no_spent()),
            Err(VerifyError::ClockSkew { .. })
        ));
        // History is allowed to be old
        assert!(verify_event(
            &old.header,
            &old.event_proof,
            None,
            &f.ctx(Freshness::Historical),
            &f.proofs,
            &no_spent()
        )
        .is_ok());

        let future = f.message(b"future", NOW + skew + 1);
        for freshness in [Freshness::Live, Freshness::Historical] {
            assert!(matches!(
                verify_event(
                    &future.header,
                    &future.event_proof,
                    None,
                    &f.ctx(freshness),
                    &f.proofs,
                    &no_spent()
                ),
                Err(VerifyError::ClockSkew { .. })
            ));
        }

        let edge = f.message(b"edge", NOW + skew);
        assert!(
            verify_event_message(&edge, &f.ctx(Freshness::Live), &f.proofs, &no_spent()).is_ok()
        );
    }

    #[test]
    fn test_forged_header_invalid() {
        let f = Fixture::new();
        let mut msg = f.message(b"hello", NOW);
        msg.header.claimed_sender = "admin".into();
        assert_eq!(
            verify_event_message(&msg, &f.ctx(Freshness::Live), &f.proofs, &no_spent()),
            Err(VerifyError::ProofInvalid)
        );
    }

    #[test]
    fn test_topic_binding() {
        let f = Fixture::new();
        let mut msg = f.message(b"hello", NOW);
        msg.topic = "elsewhere".into();
        assert!(matches!(
            verify_event_message(&msg, &f.ctx(Freshness::Live), &f.proofs, &no_spent()),
            Err(VerifyError::TopicMismatch { .. })
        ));

        let mut msg = f.message(b"hello", NOW);
        msg.header.topic = "elsewhere".into();
        msg.topic = "elsewhere".into();
        assert_eq!(
            verify_event_message(&msg, &f.ctx(Freshness::Live), &f.proofs, &no_spent()),
            Err(VerifyError::ExternalNullifierMismatch)
        );
    }

    #[test]
    fn test_duplicate_nullifier_distinct_from_invalid() {
        let f = Fixture::new();
        let first = f.message(b"first", NOW);
        let second = f.message(b"second", NOW);

        let mut spent = no_spent();
        let verified =
            verify_event_message(&first, &f.ctx(Freshness::Live), &f.proofs, &spent).unwrap();
        spent.insert((verified.event.external_nullifier, verified.event.nullifier));

        let err = verify_event_message(&second, &f.ctx(Freshness::Live), &f.proofs, &spent)
            .unwrap_err();
        assert_eq!(err, VerifyError::DuplicateNullifier);
        assert!(!err.is_invalid_proof());
    }

    #[test]
    fn test_membership_epoch_window() {
        let f = Fixture::new();
        let current = f.params.membership_epoch(NOW);
        let ctx = f.ctx(Freshness::Live);

        for epoch in [current - 1, current, current + 1] {
            let proof = f
                .proofs
                .prove_membership(&f.secret, &f.group, epoch)
                .unwrap();
            assert_eq!(verify_membership(&proof, &ctx, &f.proofs), Ok(epoch));
        }

        let stale = f
            .proofs
            .prove_membership(&f.secret, &f.group, current - 2)
            .unwrap();
        assert_eq!(
            verify_membership(&stale, &ctx, &f.proofs),
            Err(VerifyError::ExternalNullifierMismatch)
        );

        let previous = f
            .proofs
            .prove_membership(&f.secret, &f.group, current - 1)
            .unwrap();
        let after_grace = VerifyContext {
            now: f.params.membership_epoch_start(current) + f.params.purge_delay_secs(),
            ..ctx
        };
        assert_eq!(
            verify_membership(&previous, &after_grace, &f.proofs),
            Err(VerifyError::ExternalNullifierMismatch)
        );
    }

    #[test]
    fn test_outsider_membership_invalid() {
        let f = Fixture::new();
        let outsider = GroupContext { root: [8; 32] };
        let proof = HashProofSystem::new(outsider)
            .prove_membership(&f.secret, &outsider, f.params.membership_epoch(NOW))
            .unwrap();
        assert_eq!(
            verify_membership(&proof, &f.ctx(Freshness::Live), &f.proofs),
            Err(VerifyError::ProofInvalid)
        );
    }
}
