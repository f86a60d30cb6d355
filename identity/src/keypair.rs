// Copyright (c) 2024 Botho Foundation

//! `KeyPair`: an abstract signer/verifier with a derived [`PeerId`].
//!
//! Cryptographic primitives are an external collaborator per the core
//! specification's scope — this module defines the trait boundary the rest
//! of the crate programs against, plus a concrete Ed25519 implementation so
//! the envelope and signature round-trip tests in this crate (and the
//! signing paths in `bth-p2p-gossipsub`) have something real to exercise.

use crate::{error::IdentityError, peer_id::PeerId};
use ed25519_dalek::{Signature as DalekSignature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand_core::{CryptoRng, RngCore};

/// A signer/verifier whose public key derives a stable [`PeerId`].
pub trait KeyPair {
    /// The raw public key bytes (fed to [`PeerId::from_public_key`]).
    fn public_key(&self) -> Vec<u8>;

    /// Sign `message`, returning a detached signature.
    fn sign(&self, message: &[u8]) -> Vec<u8>;

    /// Verify a detached `signature` over `message` against this key.
    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), IdentityError>;

    /// The `PeerId` derived from this keypair's public key.
    fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key())
    }
}

/// An Ed25519 keypair, the default concrete `KeyPair` implementation.
#[derive(Clone)]
pub struct Ed25519KeyPair {
    signing_key: SigningKey,
}

impl Ed25519KeyPair {
    /// Generate a new random keypair.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            signing_key: SigningKey::generate(rng),
        }
    }

    /// Construct from raw 32-byte seed bytes.
    pub fn from_bytes(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// The verifying (public) key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl KeyPair for Ed25519KeyPair {
    fn public_key(&self) -> Vec<u8> {
        self.verifying_key().to_bytes().to_vec()
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), IdentityError> {
        verify_detached(&self.public_key(), message, signature)
    }
}

/// Verify a detached Ed25519 signature against a raw public key, without
/// needing a [`KeyPair`] instance (used when verifying a signed envelope or
/// a gossipsub message signed by a peer we only know by public key).
pub fn verify_detached(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), IdentityError> {
    let key_bytes: [u8; 32] = public_key
        .try_into()
        .map_err(|_| IdentityError::UnsupportedKeyType)?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| IdentityError::UnsupportedKeyType)?;
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| IdentityError::InvalidSignature)?;
    let signature = DalekSignature::from_bytes(&sig_bytes);
    verifying_key
        .verify(message, &signature)
        .map_err(|_| IdentityError::InvalidSignature)
}
