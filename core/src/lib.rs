// Copyright (c) 2024 Botho Foundation

//! The secured-connection contract and cross-subsystem event bus shared by
//! every transport- and protocol-level crate in this workspace.
//!
//! - [`RawConnection`] / [`SecuredConnection`]: the trait boundary the
//!   stream multiplexer and everything above it programs against, so a
//!   direct QUIC connection and a relayed circuit are interchangeable.
//! - [`EventBus`]: a broadcast channel for connection/stream/reservation
//!   lifecycle events.

#![warn(missing_docs)]

pub mod connection;
pub mod error;
pub mod event_bus;

pub use connection::{RawConnection, SecuredConnection};
pub use error::{CoreError, CoreResult};
pub use event_bus::EventBus;
