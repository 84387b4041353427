//! Canonical encoding for rln-feed
//!
//! All hashed and transmitted objects use postcard serialization with strict
//! constraints:
//! - Floats must be finite
//! - Field elements are decimal strings without sign or leading zeros
//! - Proof `protocol`/`curve` tags are lowercase
//! - Field order is Rust struct field order

use crate::error::{Error, Result};
use crate::types::*;
use serde::Serialize;

/// Serialize a value to canonical bytes using postcard.
///
/// This is the normative encoding for all hashing operations.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Normalize a float for canonical encoding.
/// - NaN and Inf are rejected
/// - -0.0 is converted to +0.0
pub fn normalize_f64(v: f64) -> Result<f64> {
    if v.is_nan() {
        return Err(Error::FloatNormalization("NaN not allowed".into()));
    }
    if v.is_infinite() {
        return Err(Error::FloatNormalization("Infinity not allowed".into()));
    }
    if v == 0.0 && v.is_sign_negative() {
        return Ok(0.0);
    }
    Ok(v)
}

/// Encode a double as 8 little-endian bytes.
pub fn encode_f64(v: f64) -> [u8; 8] {
    v.to_le_bytes()
}

/// Decode 8 little-endian bytes into a double.
///
/// Returns `None` unless `bytes` is exactly 8 bytes long.
pub fn decode_f64(bytes: &[u8]) -> Option<f64> {
    let raw: [u8; 8] = bytes.try_into().ok()?;
    Some(f64::from_le_bytes(raw))
}

/// Normalize a decimal field element: trim, reject non-digits, strip leading zeros.
pub fn normalize_field_element(field: &'static str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidFieldElement {
            field,
            value: value.to_string(),
        });
    }
    let stripped = trimmed.trim_start_matches('0');
    if stripped.is_empty() {
        Ok("0".to_string())
    } else {
        Ok(stripped.to_string())
    }
}

fn normalize_elements(field: &'static str, values: &[String]) -> Result<Vec<String>> {
    values
        .iter()
        .map(|v| normalize_field_element(field, v))
        .collect()
}

fn normalize_tag(tag: &str) -> String {
    tag.trim().to_ascii_lowercase()
}

/// Rebuild a proof in canonical shape (the "clone" pass).
///
/// Every field is copied out explicitly, so nothing the sender attached
/// beyond the known structure survives, and equal proofs always encode to
/// equal bytes.
pub fn canonical_proof(proof: &Proof) -> Result<Proof> {
    let snark = &proof.snark_proof;
    let pi_b = snark
        .pi_b
        .iter()
        .map(|row| normalize_elements("snarkProof.piB", row))
        .collect::<Result<Vec<_>>>()?;

    Ok(Proof {
        public_signals: normalize_elements("publicSignals", &proof.public_signals)?,
        snark_proof: SnarkProof {
            pi_a: normalize_elements("snarkProof.piA", &snark.pi_a)?,
            pi_b,
            pi_c: normalize_elements("snarkProof.piC", &snark.pi_c)?,
            protocol: normalize_tag(&snark.protocol),
            curve: normalize_tag(&snark.curve),
        },
        external_nullifier: proof.external_nullifier,
        nullifier: proof.nullifier,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_proof() -> Proof {
        Proof {
            public_signals: vec!["007".into(), "0".into()],
            snark_proof: SnarkProof {
                pi_a: vec!["01".into(), "2".into(), "1".into()],
                pi_b: vec![
                    vec!["3".into(), "0004".into()],
                    vec!["5".into(), "6".into()],
                    vec!["1".into(), "0".into()],
                ],
                pi_c: vec!["7".into(), "8".into(), "1".into()],
                protocol: " Groth16".into(),
                curve: "BN128".into(),
            },
            external_nullifier: ExternalNullifier([1; 32]),
            nullifier: Nullifier([2; 32]),
        }
    }

    #[test]
    fn test_float_normalization() {
        assert_eq!(normalize_f64(1.5).unwrap(), 1.5);
        assert_eq!(normalize_f64(-0.0).unwrap(), 0.0);
        assert!(normalize_f64(f64::NAN).is_err());
        assert!(normalize_f64(f64::INFINITY).is_err());
        assert!(normalize_f64(f64::NEG_INFINITY).is_err());
    }

    #[test]
    fn test_f64_helper() {
        let bytes = encode_f64(1_700_000_000.25);
        assert_eq!(bytes.len(), 8);
        assert_eq!(decode_f64(&bytes), Some(1_700_000_000.25));
        assert_eq!(encode_f64(1.0), [0, 0, 0, 0, 0, 0, 0xf0, 0x3f]);

        assert_eq!(decode_f64(&bytes[..7]), None);
        assert_eq!(decode_f64(&[0u8; 9]), None);
        assert_eq!(decode_f64(&[]), None);
    }

    #[test]
    fn test_field_element_normalization() {
        assert_eq!(normalize_field_element("x", "000123").unwrap(), "123");
        assert_eq!(normalize_field_element("x", " 42 ").unwrap(), "42");
        assert_eq!(normalize_field_element("x", "0000").unwrap(), "0");
        assert!(normalize_field_element("x", "").is_err());
        assert!(normalize_field_element("x", "-5").is_err());
        assert!(normalize_field_element("x", "0x1f").is_err());
    }

    #[test]
    fn test_canonical_proof() {
        let canonical = canonical_proof(&sample_proof()).unwrap();
        assert_eq!(canonical.public_signals, vec!["7", "0"]);
        assert_eq!(canonical.snark_proof.pi_a, vec!["1", "2", "1"]);
        assert_eq!(canonical.snark_proof.pi_b[0], vec!["3", "4"]);
        assert_eq!(canonical.snark_proof.protocol, "groth16");
        assert_eq!(canonical.snark_proof.curve, "bn128");

        // Idempotent
        assert_eq!(canonical_proof(&canonical).unwrap(), canonical);

        // Equal after canonicalization means equal bytes
        assert_eq!(
            canonical_bytes(&canonical).unwrap(),
            canonical_bytes(&canonical_proof(&sample_proof()).unwrap()).unwrap()
        );
    }

    #[test]
    fn test_canonical_proof_rejects_garbage() {
        let mut proof = sample_proof();
        proof.snark_proof.pi_c[1] = "not-a-number".into();
        assert!(matches!(
            canonical_proof(&proof),
            Err(Error::InvalidFieldElement { field: "snarkProof.piC", .. })
        ));
    }
}
