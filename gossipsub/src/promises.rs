// Copyright (c) 2024 Botho Foundation

//! `GossipPromises`: tracks IWANT followups so unfulfilled requests turn
//! into a broken-promise penalty at expiration.

use crate::message::MessageId;
use bth_p2p_identity::PeerId;
use std::collections::HashMap;
use std::time::Instant;

/// `message_id -> (peer_id -> expiration_instant)`.
#[derive(Debug, Default)]
pub struct GossipPromises {
    promises: HashMap<MessageId, HashMap<PeerId, Instant>>,
}

impl GossipPromises {
    /// An empty promise table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that we expect `peer` to deliver `id` by `expires_at`,
    /// unless a promise for this `(id, peer)` pair is already outstanding.
    pub fn add(&mut self, id: MessageId, peer: PeerId, expires_at: Instant) {
        self.promises.entry(id).or_default().entry(peer).or_insert(expires_at);
    }

    /// Resolve every outstanding promise for `id` (a message with that id
    /// arrived, from any peer).
    pub fn resolve(&mut self, id: &MessageId) {
        self.promises.remove(id);
    }

    /// Sweep expired promises as of `now`, returning how many expired per
    /// peer, and removing them from the table.
    pub fn take_broken(&mut self, now: Instant) -> HashMap<PeerId, u64> {
        let mut broken: HashMap<PeerId, u64> = HashMap::new();
        self.promises.retain(|_, by_peer| {
            by_peer.retain(|peer, expires_at| {
                if *expires_at <= now {
                    *broken.entry(peer.clone()).or_insert(0) += 1;
                    false
                } else {
                    true
                }
            });
            !by_peer.is_empty()
        });
        broken
    }

    /// Number of messages with at least one outstanding promise.
    pub fn len(&self) -> usize {
        self.promises.len()
    }

    /// Whether the table holds no outstanding promises.
    pub fn is_empty(&self) -> bool {
        self.promises.is_empty()
    }
}
