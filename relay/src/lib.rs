// Copyright (c) 2024 Botho Foundation

//! Circuit Relay v2: NAT-traversal byte relaying through a third party
//! when a direct connection to a peer can't be established.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                         RelayClient                            │
//! ├───────────────────────┬────────────────────────────────────────┤
//! │  reservations / tasks │  listeners: PeerId -> Arc<RelayListener>│
//! └───────────────────────┴────────────────────────────────────────┘
//!                                    │ enqueue(RelayedConnection)
//!                                    ▼
//!                            RelayListener
//!                    (bounded FIFO + single accept waiter)
//! ```
//!
//! [`RelayClient::reserve`] asks a relay to hold inbound circuits for us,
//! renewing automatically before expiration. [`RelayClient::connect_through`]
//! dials a peer by way of a relay it holds a reservation with.
//! [`RelayClient::handle_inbound_stop`] is the other direction: a relay
//! forwarding a circuit dialed to us, dispatched to whichever
//! [`RelayListener`] matches the relay it arrived through. Both directions
//! hand off a [`RelayedConnection`], which satisfies
//! [`bth_p2p_core::RawConnection`] like any direct transport.
//!
//! Opening the underlying Hop/Stop streams themselves is left to a
//! [`HopDialer`] supplied by the caller — this crate owns reservation and
//! circuit protocol state, not connection management.

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod listener;
pub mod reservation;
pub mod wire;

pub use client::{HopDialer, RelayClient};
pub use config::{RelayConfig, RelayConfigBuilder};
pub use connection::RelayedConnection;
pub use error::{RelayError, RelayResult};
pub use events::RelayEvent;
pub use listener::RelayListener;
pub use reservation::Reservation;
pub use wire::{HopMessage, HopType, Limit, Status, StopMessage, StopType};
