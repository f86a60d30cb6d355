// Copyright (c) 2024 Botho Foundation

//! Error types for the mplex-family stream multiplexer.

use bth_p2p_identity::IdentityError;
use displaydoc::Display;
use thiserror::Error;

/// Errors raised by the multiplexer and its streams.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum MuxError {
    /// stream was reset
    StreamReset,
    /// stream is closed
    StreamClosed,
    /// peer reused an already-registered inbound stream id
    DuplicateStreamId,
    /// connection has reached its maximum stream count
    MaxStreamsExceeded,
    /// frame payload exceeded the configured maximum size
    FrameTooLarge,
    /// frame carried an unrecognized flag
    UnknownFlag(u8),
    /// frame header or length prefix was malformed
    InvalidFrameHeader,
    /// connection is closed
    ConnectionClosed,
    /// operation was cancelled
    Cancelled,
}

impl From<IdentityError> for MuxError {
    fn from(_: IdentityError) -> Self {
        MuxError::InvalidFrameHeader
    }
}

/// Result type for this crate's fallible operations.
pub type MuxResult<T> = Result<T, MuxError>;
