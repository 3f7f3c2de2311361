//! Pluggable message signing.
//!
//! When slot 0 of a message is `PublicKeySignature`, the encoder signs everything it wrote
//! and appends the signature; the decoder checks it against the public key carried in
//! that slot. The key and signature formats come from a [`SignatureFactory`].

use bytes::Bytes;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use std::fmt;

use crate::error::{ProtocolError, Result};

pub trait SignatureFactory: Send + Sync + fmt::Debug {
    /// Size of a signature on the wire.
    fn signature_size(&self) -> usize;

    /// Rejects public keys this factory cannot verify with.
    fn check_public_key(&self, public_key: &[u8]) -> Result<()>;

    fn sign(&self, signing_key: &[u8], data: &[u8]) -> Result<Bytes>;

    /// `Ok(false)` for a well-formed signature that does not match.
    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> Result<bool>;
}

/// Ed25519 keys (32 bytes) and signatures (64 bytes).
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519SignatureFactory;

impl Ed25519SignatureFactory {
    /// Generates a `(public_key, signing_key)` pair.
    pub fn generate_key_pair() -> (Bytes, Bytes) {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        let signing = SigningKey::from_bytes(&seed);
        let public = signing.verifying_key().to_bytes();
        (
            Bytes::copy_from_slice(&public),
            Bytes::copy_from_slice(&seed),
        )
    }

    fn verifying_key(public_key: &[u8]) -> Result<VerifyingKey> {
        let raw: [u8; 32] = public_key
            .try_into()
            .map_err(|_| ProtocolError::Signature(format!("bad public key length {}", public_key.len())))?;
        VerifyingKey::from_bytes(&raw).map_err(|e| ProtocolError::Signature(e.to_string()))
    }
}

impl SignatureFactory for Ed25519SignatureFactory {
    fn signature_size(&self) -> usize {
        Signature::BYTE_SIZE
    }

    fn check_public_key(&self, public_key: &[u8]) -> Result<()> {
        Self::verifying_key(public_key).map(|_| ())
    }

    fn sign(&self, signing_key: &[u8], data: &[u8]) -> Result<Bytes> {
        let seed: [u8; 32] = signing_key
            .try_into()
            .map_err(|_| ProtocolError::Signature("bad signing key length".into()))?;
        let signature = SigningKey::from_bytes(&seed).sign(data);
        Ok(Bytes::copy_from_slice(&signature.to_bytes()))
    }

    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8]) -> Result<bool> {
        let key = Self::verifying_key(public_key)?;
        let signature =
            Signature::from_slice(signature).map_err(|e| ProtocolError::Signature(e.to_string()))?;
        Ok(key.verify(data, &signature).is_ok())
    }
}
