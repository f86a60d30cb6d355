// Copyright (c) 2024 Botho Foundation

//! An mplex-family stream multiplexer: one secured connection split into
//! many independent byte streams, each with its own half-close state
//! machine.
//!
//! - [`MplexConnection`]: stream-id allocation, the background frame
//!   reader, and the inbound accept queue.
//! - [`MplexStream`]: per-stream read/write/close/reset operations.
//! - [`Frame`] / [`Flag`]: the wire format in §4.2 of the design.

#![warn(missing_docs)]

pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod stream;

pub use config::{MplexConfig, MplexConfigBuilder};
pub use connection::MplexConnection;
pub use error::{MuxError, MuxResult};
pub use frame::{Flag, Frame};
pub use stream::MplexStream;
