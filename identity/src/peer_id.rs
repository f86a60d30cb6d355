// Copyright (c) 2024 Botho Foundation

//! `PeerId`: an opaque multihash-derived identifier for a network endpoint.

use crate::{base58, error::IdentityError, varint};
use sha2::{Digest, Sha256};
use std::{cmp::Ordering, fmt};

/// Multihash code for the identity hash (no-op digest, used for short keys).
const MULTIHASH_IDENTITY: u64 = 0x00;
/// Multihash code for SHA-256.
const MULTIHASH_SHA256: u64 = 0x12;
/// Keys at or below this length are embedded verbatim under the identity
/// multihash rather than hashed, matching libp2p's peer-id derivation rule.
const IDENTITY_HASH_MAX_KEY_LEN: usize = 42;

/// A peer's identity, derived from its public key via multihash.
///
/// Two `PeerId`s are equal iff their byte representations match. Ordering is
/// the lexicographic ordering of those bytes, giving a strict total order
/// suitable for use as a map key or in sorted peer sets.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeerId(Vec<u8>);

impl PeerId {
    /// Derive a `PeerId` from a raw public key.
    ///
    /// Keys of at most 42 bytes (e.g. Ed25519 public keys) are embedded
    /// verbatim under the identity multihash; longer keys are hashed with
    /// SHA-256.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let (code, digest): (u64, Vec<u8>) = if public_key.len() <= IDENTITY_HASH_MAX_KEY_LEN {
            (MULTIHASH_IDENTITY, public_key.to_vec())
        } else {
            (MULTIHASH_SHA256, Sha256::digest(public_key).to_vec())
        };

        let mut bytes = Vec::with_capacity(digest.len() + 4);
        varint::encode(code, &mut bytes);
        varint::encode(digest.len() as u64, &mut bytes);
        bytes.extend_from_slice(&digest);
        PeerId(bytes)
    }

    /// Construct a `PeerId` from its exact multihash byte representation,
    /// without validating the multihash structure.
    pub fn from_bytes_unchecked(bytes: Vec<u8>) -> Self {
        PeerId(bytes)
    }

    /// The multihash byte representation.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume `self`, returning the multihash byte representation.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Parse a `PeerId` from its base58 text form.
    pub fn from_str_repr(s: &str) -> Result<Self, IdentityError> {
        base58::decode(s).map(PeerId)
    }

    /// Render the base58 text form.
    pub fn to_string_repr(&self) -> String {
        base58::encode(&self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_repr())
    }
}

impl std::str::FromStr for PeerId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_repr(s)
    }
}

impl Ord for PeerId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn byte_string_round_trip_is_identity() {
        let peer = PeerId::from_public_key(&[1, 2, 3, 4, 5]);
        let text = peer.to_string_repr();
        let parsed = PeerId::from_str(&text).unwrap();
        assert_eq!(parsed, peer);
        assert_eq!(parsed.as_bytes(), peer.as_bytes());
    }

    #[test]
    fn short_keys_use_identity_multihash() {
        let key = [7u8; 32]; // Ed25519-sized key
        let peer = PeerId::from_public_key(&key);
        // varint(0x00) == 0x00, varint(32) == 0x20
        assert_eq!(&peer.as_bytes()[0..2], &[0x00, 0x20]);
        assert_eq!(&peer.as_bytes()[2..], &key);
    }

    #[test]
    fn long_keys_are_sha256_hashed() {
        let key = vec![9u8; 100];
        let peer = PeerId::from_public_key(&key);
        assert_eq!(peer.as_bytes()[0], 0x12);
        let expected_digest = Sha256::digest(&key);
        assert_eq!(&peer.as_bytes()[2..], expected_digest.as_slice());
    }

    #[test]
    fn equality_is_byte_equality() {
        let a = PeerId::from_public_key(&[1, 2, 3]);
        let b = PeerId::from_public_key(&[1, 2, 3]);
        let c = PeerId::from_public_key(&[1, 2, 4]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn ordering_is_lexicographic_on_bytes() {
        let a = PeerId::from_bytes_unchecked(vec![0x00, 0x01]);
        let b = PeerId::from_bytes_unchecked(vec![0x00, 0x02]);
        assert!(a < b);
    }
}
