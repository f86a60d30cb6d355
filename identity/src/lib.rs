// Copyright (c) 2024 Botho Foundation

//! Peer identity, addressing, and wire-format primitives shared by the rest
//! of the peer-to-peer networking workspace.
//!
//! This crate has no networking or async dependencies of its own — it is
//! the leaf of the dependency graph. It provides:
//!
//! - [`PeerId`]: a multihash-derived identifier for a network endpoint
//! - [`Multiaddr`] / [`Protocol`]: composable, self-describing network
//!   addresses
//! - [`varint`]: the unsigned LEB128 codec used by multiaddrs, mplex frame
//!   headers, and the lightweight protobuf reader
//! - [`base58`]: the Bitcoin-alphabet text encoding used for `PeerId`
//! - [`KeyPair`] / [`Ed25519KeyPair`]: signing and verification
//! - [`Envelope`]: domain-separated signed payloads
//! - [`protobuf`]: a length-delimited-only protobuf reader/writer

#![warn(missing_docs)]

pub mod base58;
pub mod envelope;
pub mod error;
pub mod keypair;
pub mod multiaddr;
pub mod peer_id;
pub mod protobuf;
pub mod varint;

pub use envelope::Envelope;
pub use error::{IdentityError, IdentityResult};
pub use keypair::{verify_detached, Ed25519KeyPair, KeyPair};
pub use multiaddr::{Multiaddr, Protocol};
pub use peer_id::PeerId;
