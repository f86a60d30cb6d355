// Copyright (c) 2024 Botho Foundation

//! The Hop (`/libp2p/circuit/relay/0.2.0/hop`) and Stop
//! (`/libp2p/circuit/relay/0.2.0/stop`) wire messages, length-prefixed by an
//! unsigned varint under a 4096-byte cap.
//!
//! Like `bth-p2p-gossipsub::wire`, `bth-p2p-identity::protobuf` only
//! understands length-delimited fields, which covers `peer`/nested messages
//! but not the `type`/`status` enum scalars these messages carry. This
//! module adds the varint (wire type 0) case locally rather than widen that
//! crate's contract beyond what its own callers need.

use crate::error::{RelayError, RelayResult};
use bth_p2p_identity::varint;

const WIRE_VARINT: u64 = 0;
const WIRE_LENGTH_DELIMITED: u64 = 2;

/// A Hop or Stop message larger than this is rejected without being parsed.
pub const MAX_MESSAGE_SIZE: usize = 4096;

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

fn parse_raw_fields(input: &[u8]) -> RelayResult<Vec<(u32, RawField)>> {
    let malformed = |msg: &str| RelayError::MalformedMessage(msg.to_string());
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
            other => return Err(RelayError::MalformedMessage(format!("unsupported wire type {other}"))),
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

/// The outcome of a Hop or Stop request, carried in the `STATUS` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The request succeeded.
    Ok,
    /// The relay declined to make a reservation.
    ReservationRefused,
    /// The relay or target has no spare resource budget for this circuit.
    ResourceLimitExceeded,
    /// The relay refused the request on policy grounds.
    PermissionDenied,
    /// The relay could not reach the requested target.
    ConnectionFailed,
    /// The target has no active reservation with this relay.
    NoReservation,
    /// The message could not be parsed.
    MalformedMessage,
    /// The message type was not valid in this context.
    UnexpectedMessage,
}

impl Status {
    fn to_wire(self) -> u64 {
        match self {
            Status::Ok => 100,
            Status::ReservationRefused => 200,
            Status::ResourceLimitExceeded => 201,
            Status::PermissionDenied => 202,
            Status::ConnectionFailed => 203,
            Status::NoReservation => 204,
            Status::MalformedMessage => 400,
            Status::UnexpectedMessage => 401,
        }
    }

    fn from_wire(value: u64) -> RelayResult<Self> {
        Ok(match value {
            100 => Status::Ok,
            200 => Status::ReservationRefused,
            201 => Status::ResourceLimitExceeded,
            202 => Status::PermissionDenied,
            203 => Status::ConnectionFailed,
            204 => Status::NoReservation,
            400 => Status::MalformedMessage,
            401 => Status::UnexpectedMessage,
            other => return Err(RelayError::MalformedMessage(format!("unknown status code {other}"))),
        })
    }

    /// Map a non-OK status to the [`RelayError`] a caller should see.
    pub fn into_error(self) -> RelayError {
        match self {
            Status::Ok => unreachable!("callers check for Ok before calling into_error"),
            Status::ResourceLimitExceeded => RelayError::ResourceLimitExceeded,
            Status::NoReservation => RelayError::NoReservation,
            other => RelayError::Rejected(format!("{other:?}")),
        }
    }
}

/// `Limit { optional uint32 duration = 1; optional uint64 data = 2; }`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Limit {
    /// Maximum circuit lifetime in seconds, if the relay imposes one.
    pub duration_secs: Option<u32>,
    /// Maximum bytes relayed over the circuit, if the relay imposes one.
    pub data_bytes: Option<u64>,
}

impl Limit {
    fn encode(&self, out: &mut Vec<u8>) {
        if let Some(duration) = self.duration_secs {
            write_varint_field(1, duration as u64, out);
        }
        if let Some(data) = self.data_bytes {
            write_varint_field(2, data, out);
        }
    }

    fn decode(bytes: &[u8]) -> RelayResult<Self> {
        let fields = parse_raw_fields(bytes)?;
        Ok(Limit {
            duration_secs: find_varint(&fields, 1).map(|v| v as u32),
            data_bytes: find_varint(&fields, 2),
        })
    }
}

/// `Reservation { uint64 expire = 1; repeated bytes addrs = 2; }`
///
/// `addrs` holds each advertisable multiaddr in its binary encoding.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reservation {
    /// Unix timestamp, seconds, at which the reservation expires.
    pub expire_unix_secs: u64,
    /// Binary-encoded multiaddrs the relay will advertise on our behalf.
    pub addrs: Vec<Vec<u8>>,
}

impl Reservation {
    fn encode(&self, out: &mut Vec<u8>) {
        write_varint_field(1, self.expire_unix_secs, out);
        for addr in &self.addrs {
            write_bytes_field(2, addr, out);
        }
    }

    fn decode(bytes: &[u8]) -> RelayResult<Self> {
        let fields = parse_raw_fields(bytes)?;
        let expire_unix_secs = find_varint(&fields, 1)
            .ok_or_else(|| RelayError::MalformedMessage("Reservation missing expire".into()))?;
        let addrs = find_all_bytes(&fields, 2).into_iter().map(|b| b.to_vec()).collect();
        Ok(Reservation { expire_unix_secs, addrs })
    }
}

/// The three request kinds carried on a Hop stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopType {
    /// Ask the relay for a reservation.
    Reserve,
    /// Ask the relay to open a circuit to a target peer.
    Connect,
    /// A response to either of the above.
    Status,
}

impl HopType {
    fn to_wire(self) -> u64 {
        match self {
            HopType::Reserve => 0,
            HopType::Connect => 1,
            HopType::Status => 2,
        }
    }

    fn from_wire(value: u64) -> RelayResult<Self> {
        Ok(match value {
            0 => HopType::Reserve,
            1 => HopType::Connect,
            2 => HopType::Status,
            other => return Err(RelayError::MalformedMessage(format!("unknown hop type {other}"))),
        })
    }
}

/// `HopMessage { HopType type = 1; optional bytes peer = 2; optional
/// Reservation reservation = 3; optional Limit limit = 4; optional Status
/// status = 5; }`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HopMessage {
    /// Which request or response this is.
    pub typ: Option<HopType>,
    /// The target peer id, for `CONNECT`.
    pub peer: Option<Vec<u8>>,
    /// The granted reservation, on a successful `RESERVE` response.
    pub reservation: Option<Reservation>,
    /// Resource limits the relay imposes on the circuit, if any.
    pub limit: Option<Limit>,
    /// The outcome, on a `STATUS` response.
    pub status: Option<Status>,
}

impl Default for HopType {
    fn default() -> Self {
        HopType::Status
    }
}

impl HopMessage {
    /// Build a bare `RESERVE` request.
    pub fn reserve() -> Self {
        HopMessage {
            typ: Some(HopType::Reserve),
            ..Default::default()
        }
    }

    /// Build a `CONNECT` request for `target`.
    pub fn connect(target: &[u8]) -> Self {
        HopMessage {
            typ: Some(HopType::Connect),
            peer: Some(target.to_vec()),
            ..Default::default()
        }
    }

    /// Encode to unframed bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(typ) = self.typ {
            write_varint_field(1, typ.to_wire(), &mut out);
        }
        if let Some(peer) = &self.peer {
            write_bytes_field(2, peer, &mut out);
        }
        if let Some(reservation) = &self.reservation {
            let mut buf = Vec::new();
            reservation.encode(&mut buf);
            write_bytes_field(3, &buf, &mut out);
        }
        if let Some(limit) = &self.limit {
            let mut buf = Vec::new();
            limit.encode(&mut buf);
            write_bytes_field(4, &buf, &mut out);
        }
        if let Some(status) = self.status {
            write_varint_field(5, status.to_wire(), &mut out);
        }
        out
    }

    /// Decode from unframed bytes.
    pub fn decode(bytes: &[u8]) -> RelayResult<Self> {
        let fields = parse_raw_fields(bytes)?;
        let typ = match find_varint(&fields, 1) {
            Some(v) => Some(HopType::from_wire(v)?),
            None => None,
        };
        let reservation = match find_bytes(&fields, 3) {
            Some(b) => Some(Reservation::decode(b)?),
            None => None,
        };
        let limit = match find_bytes(&fields, 4) {
            Some(b) => Some(Limit::decode(b)?),
            None => None,
        };
        let status = match find_varint(&fields, 5) {
            Some(v) => Some(Status::from_wire(v)?),
            None => None,
        };
        Ok(HopMessage {
            typ,
            peer: find_bytes(&fields, 2).map(|b| b.to_vec()),
            reservation,
            limit,
            status,
        })
    }

    /// Encode with the outer unsigned-varint length prefix used to frame
    /// Hop/Stop messages on the wire.
    pub fn encode_framed(&self) -> Vec<u8> {
        encode_framed(&self.encode())
    }
}

/// The two request kinds carried on a Stop stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopType {
    /// The relay is forwarding an inbound circuit for us.
    Connect,
    /// A response to the above.
    Status,
}

impl Default for StopType {
    fn default() -> Self {
        StopType::Status
    }
}

impl StopType {
    fn to_wire(self) -> u64 {
        match self {
            StopType::Connect => 0,
            StopType::Status => 1,
        }
    }

    fn from_wire(value: u64) -> RelayResult<Self> {
        Ok(match value {
            0 => StopType::Connect,
            1 => StopType::Status,
            other => return Err(RelayError::MalformedMessage(format!("unknown stop type {other}"))),
        })
    }
}

/// `StopMessage { StopType type = 1; optional bytes peer = 2; optional
/// Limit limit = 3; optional Status status = 4; }`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StopMessage {
    /// Which request or response this is.
    pub typ: Option<StopType>,
    /// The source peer id, on a `CONNECT` request.
    pub peer: Option<Vec<u8>>,
    /// Resource limits the relay imposes on the circuit, if any.
    pub limit: Option<Limit>,
    /// The outcome, on a `STATUS` response.
    pub status: Option<Status>,
}

impl StopMessage {
    /// Build a `STATUS` response.
    pub fn status(status: Status) -> Self {
        StopMessage {
            typ: Some(StopType::Status),
            status: Some(status),
            ..Default::default()
        }
    }

    /// Encode to unframed bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(typ) = self.typ {
            write_varint_field(1, typ.to_wire(), &mut out);
        }
        if let Some(peer) = &self.peer {
            write_bytes_field(2, peer, &mut out);
        }
        if let Some(limit) = &self.limit {
            let mut buf = Vec::new();
            limit.encode(&mut buf);
            write_bytes_field(3, &buf, &mut out);
        }
        if let Some(status) = self.status {
            write_varint_field(4, status.to_wire(), &mut out);
        }
        out
    }

    /// Decode from unframed bytes.
    pub fn decode(bytes: &[u8]) -> RelayResult<Self> {
        let fields = parse_raw_fields(bytes)?;
        let typ = match find_varint(&fields, 1) {
            Some(v) => Some(StopType::from_wire(v)?),
            None => None,
        };
        let limit = match find_bytes(&fields, 3) {
            Some(b) => Some(Limit::decode(b)?),
            None => None,
        };
        let status = match find_varint(&fields, 4) {
            Some(v) => Some(Status::from_wire(v)?),
            None => None,
        };
        Ok(StopMessage {
            typ,
            peer: find_bytes(&fields, 2).map(|b| b.to_vec()),
            limit,
            status,
        })
    }

    /// Encode with the outer unsigned-varint length prefix.
    pub fn encode_framed(&self) -> Vec<u8> {
        encode_framed(&self.encode())
    }
}

fn encode_framed(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    varint::encode(body.len() as u64, &mut out);
    out.extend_from_slice(body);
    out
}

/// Attempt to split one length-prefixed Hop/Stop message off the front of
/// `rolling`. Returns `Ok(None)` if `rolling` doesn't yet hold a complete
/// message; rejects a declared length over [`MAX_MESSAGE_SIZE`] immediately.
pub fn try_split_framed(rolling: &[u8]) -> RelayResult<Option<(Vec<u8>, usize)>> {
    let (len, consumed) = match varint::decode(rolling) {
        Ok(pair) => pair,
        Err(bth_p2p_identity::IdentityError::InsufficientData) => return Ok(None),
        Err(_) => return Err(RelayError::MalformedMessage("bad length prefix".into())),
    };
    let len = len as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(RelayError::MessageTooLarge);
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
    fn hop_reserve_request_round_trips() {
        let message = HopMessage::reserve();
        let decoded = HopMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn hop_connect_request_round_trips() {
        let message = HopMessage::connect(&[1, 2, 3]);
        let decoded = HopMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.peer, Some(vec![1, 2, 3]));
    }

    #[test]
    fn hop_status_response_with_reservation_round_trips() {
        let message = HopMessage {
            typ: Some(HopType::Status),
            status: Some(Status::Ok),
            reservation: Some(Reservation {
                expire_unix_secs: 1_700_000_000,
                addrs: vec![vec![4, 127, 0, 0, 1, 6, 0x0f, 0xa1]],
            }),
            limit: Some(Limit {
                duration_secs: Some(120),
                data_bytes: Some(131_072),
            }),
            ..Default::default()
        };
        let decoded = HopMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn stop_connect_round_trips() {
        let message = StopMessage {
            typ: Some(StopType::Connect),
            peer: Some(vec![9, 9]),
            ..Default::default()
        };
        let decoded = StopMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn stop_status_round_trips() {
        let message = StopMessage::status(Status::ResourceLimitExceeded);
        let decoded = StopMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded.status, Some(Status::ResourceLimitExceeded));
    }

    #[test]
    fn framed_round_trip_recovers_exact_body() {
        let message = HopMessage::reserve();
        let framed = message.encode_framed();
        let (body, consumed) = try_split_framed(&framed).unwrap().unwrap();
        assert_eq!(consumed, framed.len());
        assert_eq!(HopMessage::decode(&body).unwrap(), message);
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let framed = HopMessage::reserve().encode_framed();
        assert!(try_split_framed(&framed[..framed.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn oversize_declared_length_is_rejected() {
        let mut buf = Vec::new();
        varint::encode((MAX_MESSAGE_SIZE + 1) as u64, &mut buf);
        assert_eq!(try_split_framed(&buf).unwrap_err(), RelayError::MessageTooLarge);
    }

    #[test]
    fn unknown_status_code_is_rejected() {
        let mut buf = Vec::new();
        write_varint_field(1, HopType::Status.to_wire(), &mut buf);
        write_varint_field(5, 9999, &mut buf);
        assert!(HopMessage::decode(&buf).is_err());
    }
}
