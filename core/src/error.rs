// Copyright (c) 2024 Botho Foundation

//! Error types shared by the secured-connection contract and event bus.

use displaydoc::Display;
use thiserror::Error;

/// Errors raised by the connection contracts in this crate.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// connection closed
    ConnectionClosed,
    /// operation timed out
    Timeout,
    /// operation was cancelled
    Cancelled,
}

/// Result type for this crate's fallible operations.
pub type CoreResult<T> = Result<T, CoreError>;
