// Copyright (c) 2024 Botho Foundation

//! Signed envelopes: a domain-separated signature wrapper used whenever one
//! peer needs to hand another a piece of data it can verify without an
//! active connection to the signer (e.g. a relay reservation voucher or an
//! identify record).

use crate::{
    error::IdentityError,
    keypair::{verify_detached, KeyPair},
    protobuf, varint,
};

/// Public keys larger than this are rejected outright while unmarshalling,
/// before any signature verification is attempted.
const MAX_PUBLIC_KEY_LEN: usize = 4096;

const FIELD_PUBLIC_KEY: u32 = 1;
const FIELD_PAYLOAD_TYPE: u32 = 2;
const FIELD_PAYLOAD: u32 = 3;
const FIELD_SIGNATURE: u32 = 5;

/// A signed, self-describing payload.
///
/// The signature covers `domain || varint(len(payload_type)) ||
/// payload_type || varint(len(payload)) || payload`, so a signature
/// produced for one domain (e.g. `"libp2p-relay-rsvp"`) cannot be replayed
/// as if it were produced for another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    public_key: Vec<u8>,
    payload_type: Vec<u8>,
    payload: Vec<u8>,
    signature: Vec<u8>,
}

impl Envelope {
    /// Seal `payload` under `payload_type`, signing for `domain`.
    pub fn seal(
        key: &impl KeyPair,
        domain: &str,
        payload_type: &[u8],
        payload: &[u8],
    ) -> Self {
        let signature = key.sign(&signable_bytes(domain, payload_type, payload));
        Envelope {
            public_key: key.public_key(),
            payload_type: payload_type.to_vec(),
            payload: payload.to_vec(),
            signature,
        }
    }

    /// The signer's raw public key.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// The payload's self-describing type tag.
    pub fn payload_type(&self) -> &[u8] {
        &self.payload_type
    }

    /// The enclosed payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Verify the envelope's signature was produced for `domain`.
    pub fn verify(&self, domain: &str) -> Result<(), IdentityError> {
        let signable = signable_bytes(domain, &self.payload_type, &self.payload);
        verify_detached(&self.public_key, &signable, &self.signature)
    }

    /// Serialize to the wire protobuf form.
    pub fn to_protobuf(&self) -> Vec<u8> {
        let mut out = Vec::new();
        protobuf::write_field(FIELD_PUBLIC_KEY, &self.public_key, &mut out);
        protobuf::write_field(FIELD_PAYLOAD_TYPE, &self.payload_type, &mut out);
        protobuf::write_field(FIELD_PAYLOAD, &self.payload, &mut out);
        protobuf::write_field(FIELD_SIGNATURE, &self.signature, &mut out);
        out
    }

    /// Parse from the wire protobuf form.
    ///
    /// Rejects a public-key field longer than 4096 bytes before any other
    /// validation is attempted.
    pub fn from_protobuf(input: &[u8]) -> Result<Self, IdentityError> {
        let fields = protobuf::parse_fields(input, MAX_PUBLIC_KEY_LEN.max(1 << 20))?;

        let public_key = protobuf::find_field(&fields, FIELD_PUBLIC_KEY)
            .ok_or(IdentityError::InsufficientData)?
            .to_vec();
        if public_key.len() > MAX_PUBLIC_KEY_LEN {
            return Err(IdentityError::PublicKeyTooLarge);
        }
        let payload_type = protobuf::find_field(&fields, FIELD_PAYLOAD_TYPE)
            .unwrap_or(&[])
            .to_vec();
        let payload = protobuf::find_field(&fields, FIELD_PAYLOAD)
            .ok_or(IdentityError::InsufficientData)?
            .to_vec();
        let signature = protobuf::find_field(&fields, FIELD_SIGNATURE)
            .ok_or(IdentityError::InsufficientData)?
            .to_vec();

        Ok(Envelope {
            public_key,
            payload_type,
            payload,
            signature,
        })
    }
}

fn signable_bytes(domain: &str, payload_type: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(domain.len() + payload_type.len() + payload.len() + 16);
    buf.extend_from_slice(domain.as_bytes());
    varint::encode(payload_type.len() as u64, &mut buf);
    buf.extend_from_slice(payload_type);
    varint::encode(payload.len() as u64, &mut buf);
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::Ed25519KeyPair;

    #[test]
    fn seal_then_verify_succeeds_for_matching_domain() {
        let key = Ed25519KeyPair::from_bytes(&[3u8; 32]);
        let env = Envelope::seal(&key, "test-domain", b"record-type", b"the payload");
        env.verify("test-domain").unwrap();
    }

    #[test]
    fn verify_rejects_wrong_domain() {
        let key = Ed25519KeyPair::from_bytes(&[3u8; 32]);
        let env = Envelope::seal(&key, "test-domain", b"record-type", b"the payload");
        assert!(env.verify("other-domain").is_err());
    }

    #[test]
    fn protobuf_round_trip_preserves_fields() {
        let key = Ed25519KeyPair::from_bytes(&[4u8; 32]);
        let env = Envelope::seal(&key, "dom", b"ty", b"payload-bytes");
        let wire = env.to_protobuf();
        let parsed = Envelope::from_protobuf(&wire).unwrap();
        assert_eq!(parsed, env);
        parsed.verify("dom").unwrap();
    }

    #[test]
    fn rejects_oversize_public_key_field() {
        let mut buf = Vec::new();
        protobuf::write_field(FIELD_PUBLIC_KEY, &vec![0u8; MAX_PUBLIC_KEY_LEN + 1], &mut buf);
        protobuf::write_field(FIELD_PAYLOAD, b"p", &mut buf);
        protobuf::write_field(FIELD_SIGNATURE, b"s", &mut buf);
        assert_eq!(
            Envelope::from_protobuf(&buf).unwrap_err(),
            IdentityError::PublicKeyTooLarge
        );
    }
}
