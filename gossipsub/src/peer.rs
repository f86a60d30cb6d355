// Copyright (c) 2024 Botho Foundation

//! Per-peer bookkeeping: negotiated protocol version, connection
//! direction, subscribed topics, GRAFT backoff deadlines, and the
//! IDONTWANT table.

use crate::cache::LruMap;
use crate::message::MessageId;
use std::collections::{HashMap, HashSet};
use std::time::Instant;

/// Maximum number of IDONTWANT entries retained per peer before the
/// oldest are pruned, per §3.4.
pub const MAX_IDONTWANT_ENTRIES: usize = 10_000;

/// The negotiated gossipsub protocol version for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    /// `/floodsub/1.0.0` — accepted for subscribe/publish only.
    FloodsubV1,
    /// `/meshsub/1.0.0`
    V1_0,
    /// `/meshsub/1.1.0`
    V1_1,
    /// `/meshsub/1.2.0`
    V1_2,
}

impl ProtocolVersion {
    /// Whether this peer speaks a `/meshsub/*` version and can therefore
    /// participate in mesh/gossip control traffic (floodsub cannot).
    pub fn supports_mesh(&self) -> bool {
        !matches!(self, ProtocolVersion::FloodsubV1)
    }

    /// Whether this peer speaks v1.2 and should receive proactive
    /// IDONTWANT for large messages.
    pub fn supports_idontwant(&self) -> bool {
        matches!(self, ProtocolVersion::V1_2)
    }
}

/// Which side dialed the connection this peer is reachable over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialed the peer.
    Outbound,
    /// The peer dialed us.
    Inbound,
}

/// Per-peer record the router keeps behind its `peer_state` lock.
#[derive(Debug)]
pub struct PeerState {
    /// Negotiated protocol version.
    pub protocol_version: ProtocolVersion,
    /// Connection direction.
    pub direction: Direction,
    /// Topics this peer has told us it is subscribed to.
    pub subscribed_topics: HashSet<String>,
    /// Per-topic timestamp before which we ignore this peer's GRAFT.
    pub backoff_until: HashMap<String, Instant>,
    /// Message ids this peer has told us (via IDONTWANT) it already has.
    pub idontwant: LruMap<MessageId, Instant>,
    /// Whether this is a configured direct peer, bypassing scoring and
    /// always treated as if meshed for every topic it subscribes to.
    pub is_direct: bool,
}

impl PeerState {
    /// A fresh record for a newly connected peer.
    pub fn new(protocol_version: ProtocolVersion, direction: Direction, is_direct: bool) -> Self {
        Self {
            protocol_version,
            direction,
            subscribed_topics: HashSet::new(),
            backoff_until: HashMap::new(),
            idontwant: LruMap::new(),
            is_direct,
        }
    }

    /// Whether `topic`'s backoff has not yet elapsed as of `now`.
    pub fn is_backed_off(&self, topic: &str, now: Instant) -> bool {
        self.backoff_until.get(topic).is_some_and(|until| *until > now)
    }

    /// Set (or extend) the backoff for `topic` to `now + duration`, never
    /// shortening an existing longer backoff.
    pub fn set_backoff(&mut self, topic: &str, until: Instant) {
        let entry = self.backoff_until.entry(topic.to_string()).or_insert(until);
        if until > *entry {
            *entry = until;
        }
    }

    /// Record that this peer already has `id`, pruning the oldest entry
    /// first if this would exceed [`MAX_IDONTWANT_ENTRIES`].
    pub fn record_idontwant(&mut self, id: MessageId, now: Instant) {
        self.idontwant.insert_bounded(id, now, MAX_IDONTWANT_ENTRIES);
    }

    /// Whether this peer has already told us it has `id`.
    pub fn has_idontwant(&self, id: &MessageId) -> bool {
        self.idontwant.contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_honors_the_longer_of_two_sets() {
        let mut peer = PeerState::new(ProtocolVersion::V1_1, Direction::Outbound, false);
        let now = Instant::now();
        peer.set_backoff("t", now + std::time::Duration::from_secs(10));
        peer.set_backoff("t", now + std::time::Duration::from_secs(5));
        assert!(peer.is_backed_off("t", now + std::time::Duration::from_secs(9)));
    }

    #[test]
    fn idontwant_prunes_oldest_past_capacity() {
        let mut peer = PeerState::new(ProtocolVersion::V1_2, Direction::Inbound, false);
        let now = Instant::now();
        for i in 0..(MAX_IDONTWANT_ENTRIES + 1) as u32 {
            peer.record_idontwant(MessageId(i.to_be_bytes().to_vec()), now);
        }
        assert_eq!(peer.idontwant.len(), MAX_IDONTWANT_ENTRIES);
        assert!(!peer.has_idontwant(&MessageId(0u32.to_be_bytes().to_vec())));
    }

    #[test]
    fn floodsub_does_not_support_mesh() {
        assert!(!ProtocolVersion::FloodsubV1.supports_mesh());
        assert!(ProtocolVersion::V1_0.supports_mesh());
    }
}
