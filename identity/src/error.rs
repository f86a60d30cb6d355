// Copyright (c) 2024 Botho Foundation

//! Error types for peer identities, multiaddrs, and wire primitives.

use displaydoc::Display;
use thiserror::Error;

/// Errors raised while encoding or decoding identity and addressing primitives.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// varint decode ran out of input
    InsufficientData,
    /// varint continued past the tenth byte
    VarintOverflow,
    /// decoded value exceeds the host's signed integer range
    ValueExceedsIntMax,
    /// multiaddr text or binary input exceeded 1024 bytes
    MultiaddrTooLarge,
    /// multiaddr has more than 20 components
    TooManyComponents,
    /// unrecognized multiaddr protocol: {0}
    UnknownProtocol(String),
    /// malformed multiaddr component: {0}
    MalformedComponent(String),
    /// protobuf field used a wire type other than length-delimited
    InvalidWireType,
    /// protobuf message was truncated
    ProtobufTruncated,
    /// protobuf field exceeded the caller-supplied maximum size
    FieldTooLarge,
    /// public key field exceeded 4096 bytes
    PublicKeyTooLarge,
    /// signature verification failed
    InvalidSignature,
    /// unsupported key type
    UnsupportedKeyType,
    /// invalid base58 input
    InvalidBase58,
}

/// Result type for this crate's fallible operations.
pub type IdentityResult<T> = Result<T, IdentityError>;
