// Copyright (c) 2024 Botho Foundation

//! Error types for the gossipsub router.

use bth_p2p_identity::IdentityError;
use bth_p2p_mux::MuxError;
use displaydoc::Display;
use thiserror::Error;

/// Errors raised by the gossipsub router's public operations.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum GossipSubError {
    /// already subscribed to this topic
    AlreadySubscribed,
    /// subscription limit reached
    SubscriptionLimitReached,
    /// not subscribed to this topic
    NotSubscribed,
    /// message exceeds the configured maximum size
    MessageTooLarge,
    /// duplicate message (already in the seen cache)
    DuplicateMessage,
    /// peer's backoff for this topic has not elapsed
    BackoffNotElapsed,
    /// mesh for this topic is already at its high watermark
    MeshFull,
    /// unknown topic
    UnknownTopic,
    /// malformed RPC or message: {0}
    MalformedMessage(String),
    /// RPC exceeded the maximum wire size
    RpcTooLarge,
    /// connection is closed
    ConnectionClosed,
    /// operation timed out
    Timeout,
    /// operation was cancelled
    Cancelled,
}

impl From<IdentityError> for GossipSubError {
    fn from(err: IdentityError) -> Self {
        GossipSubError::MalformedMessage(err.to_string())
    }
}

impl From<MuxError> for GossipSubError {
    fn from(_: MuxError) -> Self {
        GossipSubError::ConnectionClosed
    }
}

/// Result type for this crate's fallible operations.
pub type GossipSubResult<T> = Result<T, GossipSubError>;
