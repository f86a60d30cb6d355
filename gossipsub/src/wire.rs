// Copyright (c) 2024 Botho Foundation

//! The GossipSub RPC wire format: `RPC { subscriptions, publish, control }`
//! over `/meshsub/1.0.0` | `/meshsub/1.1.0` | `/meshsub/1.2.0` (and
//! `/floodsub/1.0.0` for subscribe/publish only), length-prefixed by an
//! unsigned varint.
//!
//! `bth-p2p-identity::protobuf` only understands length-delimited (wire
//! type 2) fields, which is enough for envelopes but not for the bare
//! `bool`/`uint64` scalars gossipsub's `SubOpts` and `ControlIHave` carry.
//! This module adds the varint (wire type 0) case locally rather than
//! widen that crate's contract beyond what it actually needs.

use crate::error::{GossipSubError, GossipSubResult};
use bth_p2p_identity::varint;

const WIRE_VARINT: u64 = 0;
const WIRE_LENGTH_DELIMITED: u64 = 2;

/// An RPC larger than this is rejected without being parsed.
pub const MAX_RPC_SIZE: usize = 4 << 20;
/// The reader coalesces partial reads into a rolling buffer no larger than
/// this before giving up and tearing down the connection.
pub const MAX_ROLLING_BUFFER: usize = 5 << 20;

#[derive(Debug, Clone)]
enum RawField {
    Varint(u64),
    Bytes(Vec<u8>),
}

fn write_varint_field(field_number: u32, value: u64, out: &mut Vec<u8>) {
    let tag = ((field_number as u64) << 3) | WIRE_VARINT;
    varint::encode(tag, out);
    varint::encode(value, out);
}

fn write_bytes_field(field_number: u32, bytes: &[u8], out: &mut Vec<u8>) {
    let tag = ((field_number as u64) << 3) | WIRE_LENGTH_DELIMITED;
    varint::encode(tag, out);
    varint::encode(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

fn parse_raw_fields(input: &[u8]) -> GossipSubResult<Vec<(u32, RawField)>> {
    let malformed = |msg: &str| GossipSubError::MalformedMessage(msg.to_string());
    let mut fields = Vec::new();
    let mut offset = 0;
    while offset < input.len() {
        let (tag, consumed) = varint::decode(&input[offset..]).map_err(|_| malformed("bad tag"))?;
        offset += consumed;
        let field_number = (tag >> 3) as u32;
        match tag & 0x7 {
            WIRE_VARINT => {
                let (value, consumed) =
                    varint::decode(&input[offset..]).map_err(|_| malformed("bad varint field"))?;
                offset += consumed;
                fields.push((field_number, RawField::Varint(value)));
            }
            WIRE_LENGTH_DELIMITED => {
                let (len, consumed) =
                    varint::decode(&input[offset..]).map_err(|_| malformed("bad length prefix"))?;
                offset += consumed;
                let len = len as usize;
                if input.len() < offset + len {
                    return Err(malformed("truncated length-delimited field"));
                }
                fields.push((field_number, RawField::Bytes(input[offset..offset + len].to_vec())));
                offset += len;
            }
            other => return Err(GossipSubError::MalformedMessage(format!("unsupported wire type {other}"))),
        }
    }
    Ok(fields)
}

fn find_bytes<'a>(fields: &'a [(u32, RawField)], number: u32) -> Option<&'a [u8]> {
    fields.iter().find_map(|(n, f)| match f {
        RawField::Bytes(b) if *n == number => Some(b.as_slice()),
        _ => None,
    })
}

fn find_all_bytes<'a>(fields: &'a [(u32, RawField)], number: u32) -> Vec<&'a [u8]> {
    fields
        .iter()
        .filter_map(|(n, f)| match f {
            RawField::Bytes(b) if *n == number => Some(b.as_slice()),
            _ => None,
        })
        .collect()
}

fn find_varint(fields: &[(u32, RawField)], number: u32) -> Option<u64> {
    fields.iter().find_map(|(n, f)| match f {
        RawField::Varint(v) if *n == number => Some(*v),
        _ => None,
    })
}

/// `SubOpts { optional bool subscribe = 1; optional string topic_id = 2; }`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubOpts {
    /// `true` to subscribe, `false` to unsubscribe.
    pub subscribe: bool,
    /// The topic this opt concerns.
    pub topic: String,
}

impl SubOpts {
    fn encode(&self, out: &mut Vec<u8>) {
        write_varint_field(1, self.subscribe as u64, out);
        write_bytes_field(2, self.topic.as_bytes(), out);
    }

    fn decode(bytes: &[u8]) -> GossipSubResult<Self> {
        let fields = parse_raw_fields(bytes)?;
        let subscribe = find_varint(&fields, 1).unwrap_or(0) != 0;
        let topic = find_bytes(&fields, 2)
            .ok_or_else(|| GossipSubError::MalformedMessage("SubOpts missing topic".into()))?;
        let topic = String::from_utf8(topic.to_vec())
            .map_err(|_| GossipSubError::MalformedMessage("SubOpts topic not utf8".into()))?;
        Ok(SubOpts { subscribe, topic })
    }
}

/// `Message { optional bytes from = 1; optional bytes data = 2; optional
/// bytes seqno = 3; required string topic = 4; optional bytes signature =
/// 5; optional bytes key = 6; }`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WireMessage {
    /// The publishing peer's id bytes, if the authenticity mode carries one.
    pub from: Option<Vec<u8>>,
    /// The message payload.
    pub data: Vec<u8>,
    /// An 8-byte big-endian sequence number, if the authenticity mode
    /// carries one.
    pub seqno: Option<Vec<u8>>,
    /// The topic this message was published to.
    pub topic: String,
    /// A detached signature over the pre-image described in §6.1, if
    /// `signed` authenticity is in effect.
    pub signature: Option<Vec<u8>>,
    /// The publisher's public key, present when it cannot be derived from
    /// `from` via the identity multihash.
    pub key: Option<Vec<u8>>,
}

impl WireMessage {
    fn encode(&self, out: &mut Vec<u8>) {
        if let Some(from) = &self.from {
            write_bytes_field(1, from, out);
        }
        write_bytes_field(2, &self.data, out);
        if let Some(seqno) = &self.seqno {
            write_bytes_field(3, seqno, out);
        }
        write_bytes_field(4, self.topic.as_bytes(), out);
        if let Some(sig) = &self.signature {
            write_bytes_field(5, sig, out);
        }
        if let Some(key) = &self.key {
            write_bytes_field(6, key, out);
        }
    }

    fn decode(bytes: &[u8]) -> GossipSubResult<Self> {
        let fields = parse_raw_fields(bytes)?;
        let topic = find_bytes(&fields, 4)
            .ok_or_else(|| GossipSubError::MalformedMessage("Message missing topic".into()))?;
        let topic = String::from_utf8(topic.to_vec())
            .map_err(|_| GossipSubError::MalformedMessage("Message topic not utf8".into()))?;
        Ok(WireMessage {
            from: find_bytes(&fields, 1).map(|b| b.to_vec()),
            data: find_bytes(&fields, 2).unwrap_or(&[]).to_vec(),
            seqno: find_bytes(&fields, 3).map(|b| b.to_vec()),
            topic,
            signature: find_bytes(&fields, 5).map(|b| b.to_vec()),
            key: find_bytes(&fields, 6).map(|b| b.to_vec()),
        })
    }

    /// Encode the pre-image signed over publish: the message with
    /// `signature` and `key` omitted, per §6.1.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let unsigned = WireMessage {
            from: self.from.clone(),
            data: self.data.clone(),
            seqno: self.seqno.clone(),
            topic: self.topic.clone(),
            signature: None,
            key: None,
        };
        let mut out = Vec::new();
        unsigned.encode(&mut out);
        out
    }
}

/// `ControlIHave { optional string topic_id = 1; repeated bytes message_ids = 2; }`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControlIHave {
    /// The topic the advertised ids belong to.
    pub topic: String,
    /// Ids of messages the sender has and can supply on IWANT.
    pub message_ids: Vec<Vec<u8>>,
}

/// `ControlIWant { repeated bytes message_ids = 1; }`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControlIWant {
    /// Ids of messages being requested.
    pub message_ids: Vec<Vec<u8>>,
}

/// `ControlGraft { optional string topic_id = 1; }`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControlGraft {
    /// The topic to add the sender to the mesh for.
    pub topic: String,
}

/// `ControlPrune { optional string topic_id = 1; repeated PeerInfo peers =
/// 2; optional uint64 backoff = 3; }`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControlPrune {
    /// The topic to remove the sender from the mesh for.
    pub topic: String,
    /// Peer-exchange suggestions, honored only when the recipient's score
    /// for the sender clears `accept_px_threshold`.
    pub peers: Vec<Vec<u8>>,
    /// Seconds the recipient should withhold GRAFTs for this topic.
    pub backoff: Option<u64>,
}

/// `ControlIDontWant { repeated bytes message_ids = 1; }` (v1.2)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControlIDontWant {
    /// Ids the sender has already received and will not forward.
    pub message_ids: Vec<Vec<u8>>,
}

/// `ControlMessage { repeated ControlIHave ihave = 1; repeated ControlIWant
/// iwant = 2; repeated ControlGraft graft = 3; repeated ControlPrune prune
/// = 4; repeated ControlIDontWant idontwant = 5; }`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControlMessage {
    /// IHAVE entries.
    pub ihave: Vec<ControlIHave>,
    /// IWANT entries.
    pub iwant: Vec<ControlIWant>,
    /// GRAFT entries.
    pub graft: Vec<ControlGraft>,
    /// PRUNE entries.
    pub prune: Vec<ControlPrune>,
    /// IDONTWANT entries.
    pub idontwant: Vec<ControlIDontWant>,
}

impl ControlMessage {
    /// Whether this control message carries nothing at all.
    pub fn is_empty(&self) -> bool {
        self.ihave.is_empty()
            && self.iwant.is_empty()
            && self.graft.is_empty()
            && self.prune.is_empty()
            && self.idontwant.is_empty()
    }
}

/// `RPC { repeated SubOpts subscriptions = 1; repeated Message publish = 2;
/// optional ControlMessage control = 3; }`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Rpc {
    /// Subscription state changes.
    pub subscriptions: Vec<SubOpts>,
    /// Messages being published/forwarded.
    pub publish: Vec<WireMessage>,
    /// Mesh-maintenance and gossip control, if any.
    pub control: Option<ControlMessage>,
}

impl Rpc {
    /// Encode to the wire protobuf form (without the outer varint length
    /// prefix — see [`encode_framed`]).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for sub in &self.subscriptions {
            let mut buf = Vec::new();
            sub.encode(&mut buf);
            write_bytes_field(1, &buf, &mut out);
        }
        for msg in &self.publish {
            let mut buf = Vec::new();
            msg.encode(&mut buf);
            write_bytes_field(2, &buf, &mut out);
        }
        if let Some(control) = &self.control {
            let mut buf = Vec::new();
            encode_control(control, &mut buf);
            write_bytes_field(3, &buf, &mut out);
        }
        out
    }

    /// Decode an `Rpc` from its unframed protobuf bytes.
    pub fn decode(bytes: &[u8]) -> GossipSubResult<Self> {
        let fields = parse_raw_fields(bytes)?;
        let mut subscriptions = Vec::new();
        for bytes in find_all_bytes(&fields, 1) {
            subscriptions.push(SubOpts::decode(bytes)?);
        }
        let mut publish = Vec::new();
        for bytes in find_all_bytes(&fields, 2) {
            publish.push(WireMessage::decode(bytes)?);
        }
        let control = match find_bytes(&fields, 3) {
            Some(bytes) => Some(decode_control(bytes)?),
            None => None,
        };
        Ok(Rpc {
            subscriptions,
            publish,
            control,
        })
    }

    /// Encode with the outer unsigned-varint length prefix used to frame
    /// RPCs on the wire.
    pub fn encode_framed(&self) -> Vec<u8> {
        let body = self.encode();
        let mut out = Vec::with_capacity(body.len() + 5);
        varint::encode(body.len() as u64, &mut out);
        out.extend_from_slice(&body);
        out
    }
}

fn encode_control(control: &ControlMessage, out: &mut Vec<u8>) {
    for ihave in &control.ihave {
        let mut buf = Vec::new();
        write_bytes_field(1, ihave.topic.as_bytes(), &mut buf);
        for id in &ihave.message_ids {
            write_bytes_field(2, id, &mut buf);
        }
        write_bytes_field(1, &buf, out);
    }
    for iwant in &control.iwant {
        let mut buf = Vec::new();
        for id in &iwant.message_ids {
            write_bytes_field(1, id, &mut buf);
        }
        write_bytes_field(2, &buf, out);
    }
    for graft in &control.graft {
        let mut buf = Vec::new();
        write_bytes_field(1, graft.topic.as_bytes(), &mut buf);
        write_bytes_field(3, &buf, out);
    }
    for prune in &control.prune {
        let mut buf = Vec::new();
        write_bytes_field(1, prune.topic.as_bytes(), &mut buf);
        for peer in &prune.peers {
            write_bytes_field(2, peer, &mut buf);
        }
        if let Some(backoff) = prune.backoff {
            write_varint_field(3, backoff, &mut buf);
        }
        write_bytes_field(4, &buf, out);
    }
    for idontwant in &control.idontwant {
        let mut buf = Vec::new();
        for id in &idontwant.message_ids {
            write_bytes_field(1, id, &mut buf);
        }
        write_bytes_field(5, &buf, out);
    }
}

fn decode_control(bytes: &[u8]) -> GossipSubResult<ControlMessage> {
    let fields = parse_raw_fields(bytes)?;
    let mut control = ControlMessage::default();
    for bytes in find_all_bytes(&fields, 1) {
        let sub = parse_raw_fields(bytes)?;
        let topic = find_bytes(&sub, 1).unwrap_or(&[]);
        let topic = String::from_utf8_lossy(topic).into_owned();
        let message_ids = find_all_bytes(&sub, 2).into_iter().map(|b| b.to_vec()).collect();
        control.ihave.push(ControlIHave { topic, message_ids });
    }
    for bytes in find_all_bytes(&fields, 2) {
        let sub = parse_raw_fields(bytes)?;
        let message_ids = find_all_bytes(&sub, 1).into_iter().map(|b| b.to_vec()).collect();
        control.iwant.push(ControlIWant { message_ids });
    }
    for bytes in find_all_bytes(&fields, 3) {
        let sub = parse_raw_fields(bytes)?;
        let topic = find_bytes(&sub, 1).unwrap_or(&[]);
        let topic = String::from_utf8_lossy(topic).into_owned();
        control.graft.push(ControlGraft { topic });
    }
    for bytes in find_all_bytes(&fields, 4) {
        let sub = parse_raw_fields(bytes)?;
        let topic = find_bytes(&sub, 1).unwrap_or(&[]);
        let topic = String::from_utf8_lossy(topic).into_owned();
        let peers = find_all_bytes(&sub, 2).into_iter().map(|b| b.to_vec()).collect();
        let backoff = find_varint(&sub, 3);
        control.prune.push(ControlPrune { topic, peers, backoff });
    }
    for bytes in find_all_bytes(&fields, 5) {
        let sub = parse_raw_fields(bytes)?;
        let message_ids = find_all_bytes(&sub, 1).into_iter().map(|b| b.to_vec()).collect();
        control.idontwant.push(ControlIDontWant { message_ids });
    }
    Ok(control)
}

/// Attempt to split one length-prefixed RPC off the front of `rolling`.
///
/// Returns `Ok(None)` if `rolling` doesn't yet hold a complete RPC.
/// Rejects a declared length over [`MAX_RPC_SIZE`] immediately, without
/// waiting for the bytes to arrive.
pub fn try_split_framed(rolling: &[u8]) -> GossipSubResult<Option<(Vec<u8>, usize)>> {
    let (len, consumed) = match varint::decode(rolling) {
        Ok(pair) => pair,
        Err(bth_p2p_identity::IdentityError::InsufficientData) => return Ok(None),
        Err(_) => return Err(GossipSubError::MalformedMessage("bad RPC length prefix".into())),
    };
    let len = len as usize;
    if len > MAX_RPC_SIZE {
        return Err(GossipSubError::RpcTooLarge);
    }
    if rolling.len() < consumed + len {
        return Ok(None);
    }
    Ok(Some((rolling[consumed..consumed + len].to_vec(), consumed + len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_round_trips_subscriptions_and_publish() {
        let rpc = Rpc {
            subscriptions: vec![SubOpts {
                subscribe: true,
                topic: "blocks".to_string(),
            }],
            publish: vec![WireMessage {
                from: Some(vec![1, 2, 3]),
                data: b"hello".to_vec(),
                seqno: Some(vec![0, 0, 0, 0, 0, 0, 0, 1]),
                topic: "blocks".to_string(),
                signature: Some(vec![9; 64]),
                key: None,
            }],
            control: None,
        };
        let bytes = rpc.encode();
        let decoded = Rpc::decode(&bytes).unwrap();
        assert_eq!(decoded, rpc);
    }

    #[test]
    fn rpc_round_trips_full_control_message() {
        let control = ControlMessage {
            ihave: vec![ControlIHave {
                topic: "t".to_string(),
                message_ids: vec![vec![1], vec![2]],
            }],
            iwant: vec![ControlIWant {
                message_ids: vec![vec![3]],
            }],
            graft: vec![ControlGraft { topic: "t".to_string() }],
            prune: vec![ControlPrune {
                topic: "t".to_string(),
                peers: vec![vec![9, 9]],
                backoff: Some(60),
            }],
            idontwant: vec![ControlIDontWant {
                message_ids: vec![vec![4]],
            }],
        };
        let rpc = Rpc {
            subscriptions: vec![],
            publish: vec![],
            control: Some(control.clone()),
        };
        let decoded = Rpc::decode(&rpc.encode()).unwrap();
        assert_eq!(decoded.control.unwrap(), control);
    }

    #[test]
    fn signable_bytes_omit_signature_and_key() {
        let with_sig = WireMessage {
            from: Some(vec![1]),
            data: b"x".to_vec(),
            seqno: Some(vec![0; 8]),
            topic: "t".to_string(),
            signature: Some(vec![7; 64]),
            key: Some(vec![8; 32]),
        };
        let without_sig = WireMessage {
            signature: None,
            key: None,
            ..with_sig.clone()
        };
        assert_eq!(with_sig.signable_bytes(), without_sig.signable_bytes());
    }

    #[test]
    fn framed_round_trip_recovers_exact_body() {
        let rpc = Rpc {
            subscriptions: vec![SubOpts {
                subscribe: false,
                topic: "t".to_string(),
            }],
            publish: vec![],
            control: None,
        };
        let framed = rpc.encode_framed();
        let (body, consumed) = try_split_framed(&framed).unwrap().unwrap();
        assert_eq!(consumed, framed.len());
        assert_eq!(Rpc::decode(&body).unwrap(), rpc);
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let rpc = Rpc::default();
        let framed = Rpc {
            subscriptions: vec![SubOpts {
                subscribe: true,
                topic: "t".to_string(),
            }],
            ..rpc
        }
        .encode_framed();
        assert!(try_split_framed(&framed[..framed.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn oversize_declared_length_is_rejected() {
        let mut buf = Vec::new();
        varint::encode((MAX_RPC_SIZE + 1) as u64, &mut buf);
        assert_eq!(try_split_framed(&buf).unwrap_err(), GossipSubError::RpcTooLarge);
    }
}
