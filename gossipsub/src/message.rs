// Copyright (c) 2024 Botho Foundation

//! Application-level gossipsub messages: construction, the default
//! message-id function, and the publish/receive signature contract.

use crate::config::AuthenticityMode;
use crate::error::{GossipSubError, GossipSubResult};
use crate::wire::WireMessage;
use bth_p2p_identity::{verify_detached, Ed25519KeyPair, KeyPair, PeerId};

/// The domain string signatures are bound to, per §6.1.
pub const SIGNING_DOMAIN: &str = "libp2p-pubsub:";

/// A message id: the de-duplication key used by the seen cache, message
/// cache, and IHAVE/IWANT exchange. Opaque bytes, compared by equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub Vec<u8>);

impl MessageId {
    /// The default id function: `source || seqno`.
    pub fn default_for(message: &WireMessage) -> Self {
        let mut bytes = Vec::new();
        if let Some(from) = &message.from {
            bytes.extend_from_slice(from);
        }
        if let Some(seqno) = &message.seqno {
            bytes.extend_from_slice(seqno);
        }
        MessageId(bytes)
    }
}

/// A function computing a [`MessageId`] from a message, required by
/// `anonymous` authenticity and overridable otherwise.
pub type MessageIdFn = std::sync::Arc<dyn Fn(&WireMessage) -> MessageId + Send + Sync>;

/// A monotonically increasing sequence number source for outgoing
/// messages from this node, stored as 8 bytes big-endian per §4.4.
#[derive(Debug, Default)]
pub struct SeqnoCounter(std::sync::atomic::AtomicU64);

impl SeqnoCounter {
    /// Allocate the next sequence number.
    pub fn next(&self) -> [u8; 8] {
        let n = self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
        n.to_be_bytes()
    }
}

/// Build the outgoing wire message for `publish`, per §4.4 step 2: set
/// `source`/`seqno` for `signed`/`author`, sign for `signed`, and leave all
/// three unset for `anonymous`.
pub fn build_outgoing(
    topic: &str,
    data: Vec<u8>,
    authenticity: AuthenticityMode,
    local_peer: &PeerId,
    local_key: Option<&Ed25519KeyPair>,
    seqno: &SeqnoCounter,
) -> GossipSubResult<WireMessage> {
    let mut message = WireMessage {
        from: None,
        data,
        seqno: None,
        topic: topic.to_string(),
        signature: None,
        key: None,
    };

    match authenticity {
        AuthenticityMode::Anonymous => {}
        AuthenticityMode::Author | AuthenticityMode::Signed => {
            message.from = Some(local_peer.as_bytes().to_vec());
            message.seqno = Some(seqno.next().to_vec());
        }
    }

    if authenticity == AuthenticityMode::Signed {
        let key = local_key.ok_or_else(|| {
            GossipSubError::MalformedMessage("signed authenticity requires a local keypair".into())
        })?;
        let signable = signable_with_domain(&message);
        message.signature = Some(key.sign(&signable));
    }

    Ok(message)
}

fn signable_with_domain(message: &WireMessage) -> Vec<u8> {
    let mut out = SIGNING_DOMAIN.as_bytes().to_vec();
    out.extend_from_slice(&message.signable_bytes());
    out
}

/// Structural validation from §4.4 step 1: non-empty topic, size within
/// bound, and authenticity-mode-dictated field presence/absence.
pub fn validate_structure(
    message: &WireMessage,
    max_message_size: usize,
    authenticity: AuthenticityMode,
) -> GossipSubResult<()> {
    if message.topic.is_empty() {
        return Err(GossipSubError::MalformedMessage("empty topic".into()));
    }
    if message.data.len() > max_message_size {
        return Err(GossipSubError::MessageTooLarge);
    }
    match authenticity {
        AuthenticityMode::Signed => {
            if message.from.is_none() || message.seqno.is_none() || message.signature.is_none() {
                return Err(GossipSubError::MalformedMessage(
                    "signed authenticity requires from/seqno/signature".into(),
                ));
            }
        }
        AuthenticityMode::Author => {
            if message.from.is_none() || message.seqno.is_none() {
                return Err(GossipSubError::MalformedMessage(
                    "author authenticity requires from/seqno".into(),
                ));
            }
        }
        AuthenticityMode::Anonymous => {
            if message.from.is_some() || message.seqno.is_some() || message.signature.is_some() {
                return Err(GossipSubError::MalformedMessage(
                    "anonymous authenticity forbids from/seqno/signature".into(),
                ));
            }
        }
    }
    Ok(())
}

/// Verify a signed message's signature, deriving the public key from `key`
/// if present or from `from`'s identity-multihash otherwise.
///
/// Only meaningful when `authenticity == Signed`; callers gate the call on
/// that (and on `validate_signatures`/`strict_signature_verification`).
pub fn verify_signature(message: &WireMessage) -> GossipSubResult<()> {
    let signature = message
        .signature
        .as_ref()
        .ok_or(GossipSubError::MalformedMessage("missing signature".into()))?;
    let public_key = match &message.key {
        Some(key) => key.clone(),
        None => {
            let from = message
                .from
                .as_ref()
                .ok_or(GossipSubError::MalformedMessage("missing source".into()))?;
            derive_identity_key(from)?
        }
    };
    let signable = signable_with_domain(message);
    verify_detached(&public_key, &signable, signature)
        .map_err(|_| GossipSubError::MalformedMessage("invalid message signature".into()))
}

/// Extract the raw public key embedded in a `PeerId` produced under the
/// identity multihash (i.e. an un-hashed short key). Fails if the peer id
/// was derived via SHA-256, since the key cannot be recovered from it.
fn derive_identity_key(peer_bytes: &[u8]) -> GossipSubResult<Vec<u8>> {
    let (code, code_len) =
        bth_p2p_identity::varint::decode(peer_bytes).map_err(|_| GossipSubError::MalformedMessage("bad source peer id".into()))?;
    if code != 0x00 {
        return Err(GossipSubError::MalformedMessage(
            "source peer id is hash-derived; no public key carried in `key`".into(),
        ));
    }
    let (_len, len_len) = bth_p2p_identity::varint::decode(&peer_bytes[code_len..])
        .map_err(|_| GossipSubError::MalformedMessage("bad source peer id length".into()))?;
    Ok(peer_bytes[code_len + len_len..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn default_message_id_concatenates_source_and_seqno() {
        let message = WireMessage {
            from: Some(vec![1, 2]),
            seqno: Some(vec![0, 0, 0, 0, 0, 0, 0, 9]),
            ..Default::default()
        };
        assert_eq!(MessageId::default_for(&message).0, vec![1, 2, 0, 0, 0, 0, 0, 0, 0, 9]);
    }

    #[test]
    fn build_and_verify_signed_message_round_trips() {
        let key = Ed25519KeyPair::generate(&mut OsRng);
        let peer = key.peer_id();
        let seqno = SeqnoCounter::default();
        let message = build_outgoing(
            "t",
            b"payload".to_vec(),
            AuthenticityMode::Signed,
            &peer,
            Some(&key),
            &seqno,
        )
        .unwrap();
        assert!(message.from.is_some());
        assert!(message.signature.is_some());
        verify_signature(&message).unwrap();
    }

    #[test]
    fn tampered_signed_message_fails_verification() {
        let key = Ed25519KeyPair::generate(&mut OsRng);
        let peer = key.peer_id();
        let seqno = SeqnoCounter::default();
        let mut message = build_outgoing(
            "t",
            b"payload".to_vec(),
            AuthenticityMode::Signed,
            &peer,
            Some(&key),
            &seqno,
        )
        .unwrap();
        message.data = b"tampered".to_vec();
        assert!(verify_signature(&message).is_err());
    }

    #[test]
    fn anonymous_mode_omits_source_seqno_signature() {
        let seqno = SeqnoCounter::default();
        let key = Ed25519KeyPair::generate(&mut OsRng);
        let message = build_outgoing(
            "t",
            b"x".to_vec(),
            AuthenticityMode::Anonymous,
            &key.peer_id(),
            None,
            &seqno,
        )
        .unwrap();
        assert!(message.from.is_none());
        assert!(message.seqno.is_none());
        assert!(message.signature.is_none());
    }

    #[test]
    fn strict_mode_rejects_message_with_no_signature() {
        let message = WireMessage {
            from: Some(vec![1]),
            seqno: Some(vec![0; 8]),
            topic: "t".to_string(),
            data: vec![],
            signature: None,
            key: None,
        };
        assert_eq!(
            validate_structure(&message, 1 << 20, AuthenticityMode::Signed).unwrap_err(),
            GossipSubError::MalformedMessage(
                "signed authenticity requires from/seqno/signature".into()
            )
        );
    }

    #[test]
    fn oversize_message_fails_structural_validation() {
        let message = WireMessage {
            data: vec![0u8; 10],
            topic: "t".to_string(),
            ..Default::default()
        };
        assert_eq!(
            validate_structure(&message, 5, AuthenticityMode::Anonymous).unwrap_err(),
            GossipSubError::MessageTooLarge
        );
    }
}
