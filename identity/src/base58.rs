// Copyright (c) 2024 Botho Foundation

//! Base58 (Bitcoin alphabet) encode/decode, used for the text form of
//! [`crate::PeerId`] and other multihash-carrying values.

use crate::error::{IdentityError, IdentityResult};

/// Encode `bytes` as a base58 string using the Bitcoin alphabet.
///
/// Leading zero bytes each become a leading `1` character, matching the
/// big-endian integer conversion convention.
pub fn encode(bytes: &[u8]) -> String {
    bs58::encode(bytes).into_string()
}

/// Decode a base58 string back into bytes.
pub fn decode(s: &str) -> IdentityResult<Vec<u8>> {
    bs58::decode(s)
        .into_vec()
        .map_err(|_| IdentityError::InvalidBase58)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_bytes() {
        let bytes = b"the quick brown fox";
        let encoded = encode(bytes);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn leading_zero_bytes_become_leading_ones() {
        let bytes = [0u8, 0u8, 1u8, 2u8];
        let encoded = encode(&bytes);
        assert!(encoded.starts_with("11"));
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn empty_input_round_trips() {
        let encoded = encode(&[]);
        assert_eq!(encoded, "");
        assert_eq!(decode("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn rejects_invalid_characters() {
        // '0', 'O', 'I', 'l' are excluded from the Bitcoin alphabet.
        assert!(decode("0OIl").is_err());
    }
}
