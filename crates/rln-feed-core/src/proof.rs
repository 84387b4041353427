//! Proof system seam
//!
//! The SNARK math is an external collaborator. Everything in the node talks
//! to it through [`ProofSystem`]; [`HashProofSystem`] is a keyed-hash stand-in
//! with the same public-value behaviour (deterministic nullifiers, binding to
//! external nullifier and signal) for tests and closed development networks.
//! It is NOT zero-knowledge: anyone holding the group root can forge proofs.

use crate::crypto::{event_external_nullifier, header_signal, membership_external_nullifier};
use crate::types::*;
use blake3::Hasher;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// Proving failures
#[derive(Debug, Error)]
pub enum ProofError {
    #[error("identity is not a member of the group")]
    NotAMember,
    #[error("failed to hash statement: {0}")]
    Statement(#[from] crate::error::Error),
}

/// Member identity secret (never leaves the node)
#[derive(Clone)]
pub struct IdentitySecret(pub Bytes32);

impl IdentitySecret {
    /// Generate a fresh random secret
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl std::fmt::Debug for IdentitySecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IdentitySecret(..)")
    }
}

/// Group the prover claims membership of
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupContext {
    pub root: Bytes32,
}

/// Public statement a proof is checked against
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProofContext {
    pub external_nullifier: ExternalNullifier,
    pub signal: Bytes32,
}

impl ProofContext {
    /// Statement of a membership renewal for `epoch`
    pub fn membership(epoch: u64) -> Self {
        Self {
            external_nullifier: membership_external_nullifier(epoch),
            signal: [0; 32],
        }
    }

    /// Statement of an event proof for `header` in its event epoch
    pub fn event(header: &EventHeader, event_epoch: u64) -> crate::Result<Self> {
        Ok(Self {
            external_nullifier: event_external_nullifier(&header.topic, event_epoch),
            signal: header_signal(header)?,
        })
    }
}

/// External proving and verification.
///
/// Implementations must be pure: the same inputs give the same answer, and
/// failure is a plain `false`, never a partial result.
pub trait ProofSystem: Send + Sync {
    fn prove_membership(
        &self,
        secret: &IdentitySecret,
        group: &GroupContext,
        epoch: u64,
    ) -> Result<Proof, ProofError>;

    fn prove_event(
        &self,
        secret: &IdentitySecret,
        group: &GroupContext,
        header: &EventHeader,
        event_epoch: u64,
    ) -> Result<Proof, ProofError>;

    fn verify(&self, proof: &Proof, context: &ProofContext) -> bool;
}

// =============================================================================
// HASH PROOF SYSTEM
// =============================================================================

const DOMAIN_DEV_PROOF: &[u8] = b"rln-feed/dev-proof";
const DOMAIN_DEV_NULLIFIER: &[u8] = b"rln-feed/dev-nullifier";

/// Keyed-hash proof system for tests and development networks.
pub struct HashProofSystem {
    group: GroupContext,
}

impl HashProofSystem {
    pub fn new(group: GroupContext) -> Self {
        Self { group }
    }

    fn nullifier(secret: &IdentitySecret, external: &ExternalNullifier) -> Nullifier {
        let mut hasher = Hasher::new();
        hasher.update(DOMAIN_DEV_NULLIFIER);
        hasher.update(&secret.0);
        hasher.update(&external.0);
        Nullifier(*hasher.finalize().as_bytes())
    }

    fn commitment(root: &Bytes32, context: &ProofContext, nullifier: &Nullifier) -> Bytes32 {
        let mut hasher = Hasher::new_keyed(root);
        hasher.update(DOMAIN_DEV_PROOF);
        hasher.update(&context.external_nullifier.0);
        hasher.update(&nullifier.0);
        hasher.update(&context.signal);
        *hasher.finalize().as_bytes()
    }

    fn prove(
        &self,
        secret: &IdentitySecret,
        group: &GroupContext,
        context: ProofContext,
    ) -> Result<Proof, ProofError> {
        if group.root != self.group.root {
            return Err(ProofError::NotAMember);
        }
        let nullifier = Self::nullifier(secret, &context.external_nullifier);
        let commitment = Self::commitment(&group.root, &context, &nullifier);
        let [c_hi, c_lo] = to_field_pair(&commitment);
        let [s_hi, s_lo] = to_field_pair(&context.signal);
        let [e_hi, e_lo] = to_field_pair(&context.external_nullifier.0);

        Ok(Proof {
            public_signals: vec![s_hi.clone(), s_lo.clone()],
            snark_proof: SnarkProof {
                pi_a: vec![c_hi, c_lo, "1".into()],
                pi_b: vec![
                    vec![e_hi, e_lo],
                    vec![s_hi, s_lo],
                    vec!["1".into(), "0".into()],
                ],
                pi_c: vec!["0".into(), "0".into(), "1".into()],
                protocol: "groth16".into(),
                curve: "bn128".into(),
            },
            external_nullifier: context.external_nullifier,
            nullifier,
        })
    }
}

impl ProofSystem for HashProofSystem {
    fn prove_membership(
        &self,
        secret: &IdentitySecret,
        group: &GroupContext,
        epoch: u64,
    ) -> Result<Proof, ProofError> {
        self.prove(secret, group, ProofContext::membership(epoch))
    }

    fn prove_event(
        &self,
        secret: &IdentitySecret,
        group: &GroupContext,
        header: &EventHeader,
        event_epoch: u64,
    ) -> Result<Proof, ProofError> {
        self.prove(secret, group, ProofContext::event(header, event_epoch)?)
    }

    fn verify(&self, proof: &Proof, context: &ProofContext) -> bool {
        if proof.external_nullifier != context.external_nullifier {
            return false;
        }
        let pi_a = &proof.snark_proof.pi_a;
        if pi_a.len() < 2 {
            return false;
        }
        match from_field_pair(&pi_a[0], &pi_a[1]) {
            Some(claimed) => {
                claimed == Self::commitment(&self.group.root, context, &proof.nullifier)
            }
            None => false,
        }
    }
}

/// Split 32 bytes into two decimal field elements (big-endian halves).
fn to_field_pair(bytes: &Bytes32) -> [String; 2] {
    let mut hi = [0u8; 16];
    let mut lo = [0u8; 16];
    hi.copy_from_slice(&bytes[..16]);
    lo.copy_from_slice(&bytes[16..]);
    [
        u128::from_be_bytes(hi).to_string(),
        u128::from_be_bytes(lo).to_string(),
    ]
}

fn from_field_pair(hi: &str, lo: &str) -> Option<Bytes32> {
    let hi: u128 = hi.parse().ok()?;
    let lo: u128 = lo.parse().ok()?;
    let mut out = [0u8; 32];
    out[..16].copy_from_slice(&hi.to_be_bytes());
    out[16..].copy_from_slice(&lo.to_be_bytes());
    Some(out)
}
