// Copyright (c) 2024 Botho Foundation

//! GossipSub v1.1/v1.2: a mesh-overlay publish/subscribe router for one
//! peer-to-peer node.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      GossipSubRouter                          │
//! ├───────────────┬───────────────┬───────────────┬──────────────┤
//! │   MeshState   │  PeerScorer   │ MessageCache  │ SeenCache    │
//! │ (mesh/fanout) │  (P1-P4, IP,  │ (IWANT/IHAVE  │ (dedup)      │
//! │               │   broken prom)│  history)     │              │
//! ├───────────────┴───────────────┴───────────────┴──────────────┤
//! │  per-peer PeerState + Arc<dyn PeerSink>  (one per connection) │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! A `PeerSink` is the boundary to the transport: [`transport::StreamPeerSink`]
//! backs one with an `bth_p2p_mux::MplexStream`, draining a bounded outbound
//! queue so concurrent callers never interleave writes on the same stream.
//! Callers own reading inbound bytes off that stream and decoding them with
//! [`wire::try_split_framed`]/[`wire::Rpc::decode`] before handing the result
//! to [`router::GossipSubRouter::handle_rpc`] — this crate owns the protocol
//! state machine, not the connection's read loop.
//!
//! # Usage
//!
//! ```ignore
//! use bth_p2p_gossipsub::{GossipSubConfig, GossipSubRouter};
//!
//! let router = GossipSubRouter::new(local_peer, Some(local_key), GossipSubConfig::default());
//! let mut subscription = router.subscribe("blocks").await?;
//! router.add_peer(peer, sink, protocol_version, direction, false);
//! router.publish("blocks", payload).await?;
//! while let Some(message) = subscription.recv().await {
//!     // ...
//! }
//! ```

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod mesh;
pub mod message;
pub mod peer;
pub mod promises;
pub mod router;
pub mod scorer;
pub mod transport;
pub mod wire;

pub use config::{AuthenticityMode, GossipSubConfig, GossipSubConfigBuilder};
pub use error::{GossipSubError, GossipSubResult};
pub use events::{DeliveredMessage, GossipEvent, Subscription};
pub use message::{MessageId, MessageIdFn, SeqnoCounter};
pub use peer::{Direction, ProtocolVersion};
pub use router::{GossipSubRouter, MessageValidator, ValidationResult};
pub use scorer::{ScoreParams, TopicScoreParams};
pub use transport::{PeerSink, StreamPeerSink};
pub use wire::{
    ControlGraft, ControlIDontWant, ControlIHave, ControlIWant, ControlMessage, ControlPrune, Rpc, SubOpts, WireMessage,
};
