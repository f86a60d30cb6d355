// Copyright (c) 2024 Botho Foundation

//! Multiaddr: an ordered sequence of protocol components describing a
//! network address, e.g. `/ip4/1.2.3.4/tcp/4001`.

use crate::{base58, error::IdentityError, peer_id::PeerId, varint};
use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

/// Maximum accepted size, in bytes, of either the text or binary form of a
/// multiaddr.
pub const MAX_MULTIADDR_SIZE: usize = 1024;
/// Maximum number of protocol components a multiaddr may carry.
pub const MAX_COMPONENTS: usize = 20;

const CODE_IP4: u64 = 4;
const CODE_TCP: u64 = 6;
const CODE_UDP: u64 = 273;
const CODE_IP6: u64 = 41;
const CODE_P2P_CIRCUIT: u64 = 290;
const CODE_P2P: u64 = 421;
const CODE_QUIC_V1: u64 = 461;
const CODE_WEBTRANSPORT: u64 = 465;
const CODE_CERTHASH: u64 = 466;

/// A single protocol component of a multiaddr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    /// `/ip4/<addr>`
    Ip4(Ipv4Addr),
    /// `/ip6/<addr>`
    Ip6(Ipv6Addr),
    /// `/tcp/<port>`
    Tcp(u16),
    /// `/udp/<port>`
    Udp(u16),
    /// `/quic-v1`
    QuicV1,
    /// `/webtransport`
    Webtransport,
    /// `/p2p-circuit`
    P2pCircuit,
    /// `/p2p/<peer-id>`
    P2p(PeerId),
    /// `/certhash/<multihash>`
    Certhash(Vec<u8>),
}

impl Protocol {
    fn code(&self) -> u64 {
        match self {
            Protocol::Ip4(_) => CODE_IP4,
            Protocol::Ip6(_) => CODE_IP6,
            Protocol::Tcp(_) => CODE_TCP,
            Protocol::Udp(_) => CODE_UDP,
            Protocol::QuicV1 => CODE_QUIC_V1,
            Protocol::Webtransport => CODE_WEBTRANSPORT,
            Protocol::P2pCircuit => CODE_P2P_CIRCUIT,
            Protocol::P2p(_) => CODE_P2P,
            Protocol::Certhash(_) => CODE_CERTHASH,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Protocol::Ip4(_) => "ip4",
            Protocol::Ip6(_) => "ip6",
            Protocol::Tcp(_) => "tcp",
            Protocol::Udp(_) => "udp",
            Protocol::QuicV1 => "quic-v1",
            Protocol::Webtransport => "webtransport",
            Protocol::P2pCircuit => "p2p-circuit",
            Protocol::P2p(_) => "p2p",
            Protocol::Certhash(_) => "certhash",
        }
    }

    fn has_text_value(&self) -> bool {
        !matches!(self, Protocol::QuicV1 | Protocol::Webtransport | Protocol::P2pCircuit)
    }

    fn write_text_value(&self, out: &mut String) {
        match self {
            Protocol::Ip4(addr) => out.push_str(&addr.to_string()),
            Protocol::Ip6(addr) => out.push_str(&addr.to_string()),
            Protocol::Tcp(port) | Protocol::Udp(port) => out.push_str(&port.to_string()),
            Protocol::P2p(peer) => out.push_str(&peer.to_string_repr()),
            Protocol::Certhash(bytes) => out.push_str(&base58::encode(bytes)),
            Protocol::QuicV1 | Protocol::Webtransport | Protocol::P2pCircuit => {}
        }
    }

    /// Whether a component with this protocol name carries a value segment
    /// in the text and binary forms.
    fn takes_value(name: &str) -> bool {
        !matches!(name, "quic-v1" | "webtransport" | "p2p-circuit")
    }

    fn from_name_and_value(name: &str, value: Option<&str>) -> Result<Self, IdentityError> {
        let malformed = |msg: &str| IdentityError::MalformedComponent(msg.to_string());
        match name {
            "ip4" => {
                let v = value.ok_or_else(|| malformed("ip4 requires a value"))?;
                Ok(Protocol::Ip4(
                    Ipv4Addr::from_str(v).map_err(|_| malformed("invalid ip4 address"))?,
                ))
            }
            "ip6" => {
                let v = value.ok_or_else(|| malformed("ip6 requires a value"))?;
                Ok(Protocol::Ip6(
                    Ipv6Addr::from_str(v).map_err(|_| malformed("invalid ip6 address"))?,
                ))
            }
            "tcp" => {
                let v = value.ok_or_else(|| malformed("tcp requires a value"))?;
                Ok(Protocol::Tcp(
                    v.parse().map_err(|_| malformed("invalid tcp port"))?,
                ))
            }
            "udp" => {
                let v = value.ok_or_else(|| malformed("udp requires a value"))?;
                Ok(Protocol::Udp(
                    v.parse().map_err(|_| malformed("invalid udp port"))?,
                ))
            }
            "quic-v1" => Ok(Protocol::QuicV1),
            "webtransport" => Ok(Protocol::Webtransport),
            "p2p-circuit" => Ok(Protocol::P2pCircuit),
            "p2p" => {
                let v = value.ok_or_else(|| malformed("p2p requires a value"))?;
                Ok(Protocol::P2p(
                    PeerId::from_str_repr(v).map_err(|_| malformed("invalid p2p peer id"))?,
                ))
            }
            "certhash" => {
                let v = value.ok_or_else(|| malformed("certhash requires a value"))?;
                Ok(Protocol::Certhash(
                    base58::decode(v).map_err(|_| malformed("invalid certhash value"))?,
                ))
            }
            other => Err(IdentityError::UnknownProtocol(other.to_string())),
        }
    }

    fn write_binary_value(&self, out: &mut Vec<u8>) {
        match self {
            Protocol::Ip4(addr) => out.extend_from_slice(&addr.octets()),
            Protocol::Ip6(addr) => out.extend_from_slice(&addr.octets()),
            Protocol::Tcp(port) | Protocol::Udp(port) => out.extend_from_slice(&port.to_be_bytes()),
            Protocol::QuicV1 | Protocol::Webtransport | Protocol::P2pCircuit => {}
            Protocol::P2p(peer) => {
                varint::encode(peer.as_bytes().len() as u64, out);
                out.extend_from_slice(peer.as_bytes());
            }
            Protocol::Certhash(bytes) => {
                varint::encode(bytes.len() as u64, out);
                out.extend_from_slice(bytes);
            }
        }
    }

    /// Decode one component from the front of `input`, per-protocol size
    /// rules (fixed-size for ip4/ip6/tcp/udp, varint-length-prefixed for
    /// p2p/certhash, empty for quic-v1/webtransport/p2p-circuit).
    fn read_binary(code: u64, input: &[u8]) -> Result<(Self, usize), IdentityError> {
        let malformed = |msg: &str| IdentityError::MalformedComponent(msg.to_string());
        match code {
            CODE_IP4 => {
                if input.len() < 4 {
                    return Err(malformed("truncated ip4 value"));
                }
                let octets: [u8; 4] = input[0..4].try_into().unwrap();
                Ok((Protocol::Ip4(Ipv4Addr::from(octets)), 4))
            }
            CODE_IP6 => {
                if input.len() < 16 {
                    return Err(malformed("truncated ip6 value"));
                }
                let octets: [u8; 16] = input[0..16].try_into().unwrap();
                Ok((Protocol::Ip6(Ipv6Addr::from(octets)), 16))
            }
            CODE_TCP => {
                if input.len() < 2 {
                    return Err(malformed("truncated tcp port"));
                }
                Ok((Protocol::Tcp(u16::from_be_bytes([input[0], input[1]])), 2))
            }
            CODE_UDP => {
                if input.len() < 2 {
                    return Err(malformed("truncated udp port"));
                }
                Ok((Protocol::Udp(u16::from_be_bytes([input[0], input[1]])), 2))
            }
            CODE_QUIC_V1 => Ok((Protocol::QuicV1, 0)),
            CODE_WEBTRANSPORT => Ok((Protocol::Webtransport, 0)),
            CODE_P2P_CIRCUIT => Ok((Protocol::P2pCircuit, 0)),
            CODE_P2P => {
                let (len, len_size) = varint::decode(input)?;
                let len = len as usize;
                if input.len() < len_size + len {
                    return Err(malformed("truncated p2p value"));
                }
                let bytes = input[len_size..len_size + len].to_vec();
                Ok((Protocol::P2p(PeerId::from_bytes_unchecked(bytes)), len_size + len))
            }
            CODE_CERTHASH => {
                let (len, len_size) = varint::decode(input)?;
                let len = len as usize;
                if input.len() < len_size + len {
                    return Err(malformed("truncated certhash value"));
                }
                let bytes = input[len_size..len_size + len].to_vec();
                Ok((Protocol::Certhash(bytes), len_size + len))
            }
            other => Err(IdentityError::UnknownProtocol(other.to_string())),
        }
    }
}

/// An ordered sequence of protocol components, e.g. `/ip4/1.2.3.4/tcp/4001`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Multiaddr {
    components: Vec<Protocol>,
}

impl Multiaddr {
    /// An empty multiaddr.
    pub fn empty() -> Self {
        Self { components: Vec::new() }
    }

    /// Construct from an explicit list of components, enforcing the
    /// component-count limit.
    pub fn from_components(components: Vec<Protocol>) -> Result<Self, IdentityError> {
        if components.len() > MAX_COMPONENTS {
            return Err(IdentityError::TooManyComponents);
        }
        Ok(Self { components })
    }

    /// Append a component, consuming and returning `self`.
    pub fn with(mut self, protocol: Protocol) -> Result<Self, IdentityError> {
        if self.components.len() + 1 > MAX_COMPONENTS {
            return Err(IdentityError::TooManyComponents);
        }
        self.components.push(protocol);
        Ok(self)
    }

    /// The ordered protocol components.
    pub fn components(&self) -> &[Protocol] {
        &self.components
    }

    /// Parse the canonical text form `/proto/value/proto/value/...`.
    pub fn parse_text(input: &str) -> Result<Self, IdentityError> {
        if input.len() > MAX_MULTIADDR_SIZE {
            return Err(IdentityError::MultiaddrTooLarge);
        }
        let mut parts = input.split('/');
        // A valid multiaddr text form starts with '/', so the first split
        // segment is empty; an empty multiaddr is the empty string itself.
        if input.is_empty() {
            return Ok(Self::empty());
        }
        match parts.next() {
            Some("") => {}
            _ => {
                return Err(IdentityError::MalformedComponent(
                    "multiaddr must start with '/'".to_string(),
                ))
            }
        }

        let mut components = Vec::new();
        let mut rest: Vec<&str> = parts.collect();
        rest.reverse();
        while let Some(name) = rest.pop() {
            if name.is_empty() {
                continue;
            }
            let value = if Protocol::takes_value(name) { rest.pop() } else { None };
            let protocol = Protocol::from_name_and_value(name, value)?;
            if components.len() + 1 > MAX_COMPONENTS {
                return Err(IdentityError::TooManyComponents);
            }
            components.push(protocol);
        }
        Ok(Self { components })
    }

    /// Render the canonical text form.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for component in &self.components {
            out.push('/');
            out.push_str(component.name());
            if component.has_text_value() {
                out.push('/');
                component.write_text_value(&mut out);
            }
        }
        out
    }

    /// Encode the binary form: `(varint code, value)*`.
    pub fn to_binary(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for component in &self.components {
            varint::encode(component.code(), &mut out);
            component.write_binary_value(&mut out);
        }
        out
    }

    /// Decode the binary form, enforcing the size and component-count limits.
    pub fn parse_binary(input: &[u8]) -> Result<Self, IdentityError> {
        if input.len() > MAX_MULTIADDR_SIZE {
            return Err(IdentityError::MultiaddrTooLarge);
        }
        let mut components = Vec::new();
        let mut offset = 0;
        while offset < input.len() {
            let (code, code_size) = varint::decode(&input[offset..])?;
            offset += code_size;
            let (protocol, value_size) = Protocol::read_binary(code, &input[offset..])?;
            offset += value_size;
            if components.len() + 1 > MAX_COMPONENTS {
                return Err(IdentityError::TooManyComponents);
            }
            components.push(protocol);
        }
        Ok(Self { components })
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_text())
    }
}

impl FromStr for Multiaddr {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_text(s)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Multiaddr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_text())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Multiaddr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Multiaddr::parse_text(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_binary_round_trip_matches_seed() {
        let addr = Multiaddr::parse_text("/ip4/127.0.0.1/tcp/4001").unwrap();
        let binary = addr.to_binary();
        assert_eq!(binary, vec![0x04, 0x7F, 0x00, 0x00, 0x01, 0x06, 0x0F, 0xA1]);
        let decoded = Multiaddr::parse_binary(&binary).unwrap();
        assert_eq!(decoded.to_text(), "/ip4/127.0.0.1/tcp/4001");
    }

    #[test]
    fn full_round_trip_is_identity() {
        for text in [
            "/ip4/1.2.3.4/tcp/4001",
            "/ip6/::1/udp/5000",
            "/p2p-circuit",
        ] {
            let parsed = Multiaddr::parse_text(text).unwrap();
            let binary = parsed.to_binary();
            let from_binary = Multiaddr::parse_binary(&binary).unwrap();
            assert_eq!(from_binary.to_binary(), binary);
            assert_eq!(Multiaddr::parse_text(&parsed.to_text()).unwrap(), parsed);
        }
    }

    #[test]
    fn p2p_circuit_with_peer_ids_round_trips() {
        let relay = crate::peer_id::PeerId::from_public_key(&[1u8; 32]);
        let target = crate::peer_id::PeerId::from_public_key(&[2u8; 32]);
        let text = format!(
            "/ip4/1.2.3.4/tcp/4001/p2p/{relay}/p2p-circuit/p2p/{target}",
            relay = relay.to_string_repr(),
            target = target.to_string_repr()
        );
        let parsed = Multiaddr::parse_text(&text).unwrap();
        assert_eq!(parsed.components().len(), 5);
        assert_eq!(parsed.to_text(), text);
    }

    #[test]
    fn rejects_oversize_input() {
        let huge = "/ip4/1.2.3.4".repeat(200);
        assert_eq!(
            Multiaddr::parse_text(&huge).unwrap_err(),
            IdentityError::MultiaddrTooLarge
        );
    }

    #[test]
    fn rejects_too_many_components() {
        let mut text = String::new();
        for _ in 0..25 {
            text.push_str("/quic-v1");
        }
        assert_eq!(
            Multiaddr::parse_text(&text).unwrap_err(),
            IdentityError::TooManyComponents
        );
    }

    #[test]
    fn rejects_unknown_protocol() {
        assert_eq!(
            Multiaddr::parse_text("/sctp/1234").unwrap_err(),
            IdentityError::UnknownProtocol("sctp".to_string())
        );
    }

    #[test]
    fn quic_v1_webtransport_certhash_chain() {
        let text = "/ip4/1.2.3.4/udp/4433/quic-v1/webtransport";
        let parsed = Multiaddr::parse_text(text).unwrap();
        assert_eq!(parsed.to_text(), text);
    }
}
