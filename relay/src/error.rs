// Copyright (c) 2024 Botho Foundation

//! Error types for the Circuit Relay v2 client and listener.

use bth_p2p_identity::IdentityError;
use bth_p2p_mux::MuxError;
use displaydoc::Display;
use thiserror::Error;

/// Errors raised by the relay client and listener's public operations.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// no active reservation with this relay
    NoReservation,
    /// the reservation has expired
    ReservationExpired,
    /// relay rejected the request: resource limit exceeded
    ResourceLimitExceeded,
    /// the listener has been closed
    ListenerClosed,
    /// address cannot be used as a relay target
    UnsupportedAddress,
    /// relay rejected the request: {0}
    Rejected(String),
    /// malformed hop/stop message: {0}
    MalformedMessage(String),
    /// message exceeded the maximum wire size
    MessageTooLarge,
    /// connection is closed
    ConnectionClosed,
    /// operation timed out
    Timeout,
    /// operation was cancelled
    Cancelled,
}

impl From<IdentityError> for RelayError {
    fn from(err: IdentityError) -> Self {
        RelayError::MalformedMessage(err.to_string())
    }
}

impl From<MuxError> for RelayError {
    fn from(_: MuxError) -> Self {
        RelayError::ConnectionClosed
    }
}

/// Result type for this crate's fallible operations.
pub type RelayResult<T> = Result<T, RelayError>;
