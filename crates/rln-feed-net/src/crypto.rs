//! Cryptographic primitives for the network layer
//!
//! Provides the node's ed25519 transport key and payload sealing for
//! topics that share a secret.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

/// Context string for the topic master key
const PAYLOAD_KEY_CONTEXT: &str = "rln-feed payload key v1";
/// HKDF info for per-message keys
const PAYLOAD_MESSAGE_INFO: &[u8] = b"rln-feed/payload-message";
/// Random IV prepended to every sealed payload
pub const SEAL_IV_LEN: usize = 16;
/// Poly1305 tag appended to the ciphertext
const SEAL_TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Signature verification failed")]
    SignatureVerificationFailed,
    #[error("Sealed payload too short: {0} bytes")]
    Truncated(usize),
    #[error("AEAD encryption failed")]
    EncryptionFailed,
    #[error("AEAD decryption failed")]
    DecryptionFailed,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
}

/// Ed25519 keypair identifying a node on the transport
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from seed bytes (persisted node state, deterministic tests)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Seed bytes for persistence
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature made by `public_key`
    pub fn verify(
        public_key: &[u8; 32],
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        let verifying_key = VerifyingKey::from_bytes(public_key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        let sig = Signature::from_slice(signature)
            .map_err(|_| CryptoError::SignatureVerificationFailed)?;
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair({})", hex::encode(&self.public_key()[..8]))
    }
}

/// Symmetric sealing for the payloads of one topic.
///
/// Sealed layout: `[16-byte random IV][ciphertext || tag]`. Each message
/// gets its own key, `HKDF-SHA256(salt = IV, ikm = master)`, so the AEAD
/// nonce can stay fixed.
#[derive(Clone)]
pub struct PayloadCipher {
    master: [u8; 32],
}

impl PayloadCipher {
    /// Derive the topic master key from a shared secret
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            master: blake3::derive_key(PAYLOAD_KEY_CONTEXT, secret),
        }
    }

    fn message_cipher(&self, iv: &[u8]) -> Result<ChaCha20Poly1305, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(iv), &self.master);
        let mut key = [0u8; 32];
        hkdf.expand(PAYLOAD_MESSAGE_INFO, &mut key)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::InvalidKeyLength)
    }

    /// Encrypt content under a fresh IV
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut iv = [0u8; SEAL_IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let cipher = self.message_cipher(&iv)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&[0u8; 12]), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut sealed = Vec::with_capacity(SEAL_IV_LEN + ciphertext.len());
        sealed.extend_from_slice(&iv);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a sealed payload
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < SEAL_IV_LEN + SEAL_TAG_LEN {
            return Err(CryptoError::Truncated(sealed.len()));
        }
        let (iv, ciphertext) = sealed.split_at(SEAL_IV_LEN);
        let cipher = self.message_cipher(iv)?;
        cipher
            .decrypt(Nonce::from_slice(&[0u8; 12]), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PayloadCipher(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_sign_verify() {
        let kp = KeyPair::generate();
        let msg = b"hello world";
        let sig = kp.sign(msg);

        assert!(KeyPair::verify(&kp.public_key(), msg, &sig).is_ok());
        assert!(KeyPair::verify(&kp.public_key(), b"hello there", &sig).is_err());
        assert!(KeyPair::verify(&kp.public_key(), msg, &sig[..63]).is_err());
    }

    #[test]
    fn test_keypair_seed_roundtrip() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_seed(&kp.seed());
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn test_seal_open() {
        let cipher = PayloadCipher::from_secret(b"shared topic secret");
        let sealed = cipher.seal(b"meet at noon").unwrap();

        assert_eq!(sealed.len(), SEAL_IV_LEN + 12 + SEAL_TAG_LEN);
        assert_eq!(cipher.open(&sealed).unwrap(), b"meet at noon");

        // Fresh IV every time
        let again = cipher.seal(b"meet at noon").unwrap();
        assert_ne!(sealed, again);
    }

    #[test]
    fn test_open_rejects_tampering_and_wrong_key() {
        let cipher = PayloadCipher::from_secret(b"k1");
        let mut sealed = cipher.seal(b"payload").unwrap();

        let wrong = PayloadCipher::from_secret(b"k2");
        assert!(matches!(wrong.open(&sealed), Err(CryptoError::DecryptionFailed)));

        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(matches!(cipher.open(&sealed), Err(CryptoError::DecryptionFailed)));

        assert!(matches!(cipher.open(&[0; 20]), Err(CryptoError::Truncated(20))));
    }
}
