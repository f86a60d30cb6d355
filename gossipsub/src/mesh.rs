// Copyright (c) 2024 Botho Foundation

//! `MeshState`: per-topic mesh membership, fanout candidates, and the set
//! of topics this node is locally subscribed to.

use bth_p2p_identity::PeerId;
use std::collections::{HashMap, HashSet};
use std::time::Instant;

/// Per-topic mesh and fanout membership.
#[derive(Debug, Default)]
pub struct MeshState {
    /// `mesh[topic]` — peers we forward every message on `topic` to.
    mesh: HashMap<String, HashSet<PeerId>>,
    /// `fanout[topic][peer]` — peers used to publish to a topic we are not
    /// meshed on, with the last time we used the entry.
    fanout: HashMap<String, HashMap<PeerId, Instant>>,
    /// Topics this node has locally subscribed to.
    subscribed: HashSet<String>,
}

impl MeshState {
    /// A fresh, empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `topic` as locally subscribed.
    pub fn subscribe(&mut self, topic: &str) {
        self.subscribed.insert(topic.to_string());
        self.mesh.entry(topic.to_string()).or_default();
    }

    /// Mark `topic` as no longer locally subscribed, dropping its mesh.
    pub fn unsubscribe(&mut self, topic: &str) -> HashSet<PeerId> {
        self.subscribed.remove(topic);
        self.mesh.remove(topic).unwrap_or_default()
    }

    /// Whether `topic` is locally subscribed.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscribed.contains(topic)
    }

    /// All locally subscribed topics.
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subscribed.iter().cloned().collect()
    }

    /// The mesh peer set for `topic` (empty if none).
    pub fn mesh_peers(&self, topic: &str) -> HashSet<PeerId> {
        self.mesh.get(topic).cloned().unwrap_or_default()
    }

    /// Number of mesh peers for `topic`.
    pub fn mesh_len(&self, topic: &str) -> usize {
        self.mesh.get(topic).map(HashSet::len).unwrap_or(0)
    }

    /// Whether `peer` is in `topic`'s mesh.
    pub fn is_mesh_peer(&self, topic: &str, peer: &PeerId) -> bool {
        self.mesh.get(topic).is_some_and(|set| set.contains(peer))
    }

    /// Add `peer` to `topic`'s mesh. Also removes it from fanout for the
    /// same topic, since a peer is in at most one of {mesh, fanout} per
    /// topic.
    pub fn graft(&mut self, topic: &str, peer: PeerId) {
        self.mesh.entry(topic.to_string()).or_default().insert(peer.clone());
        if let Some(fanout) = self.fanout.get_mut(topic) {
            fanout.remove(&peer);
        }
    }

    /// Remove `peer` from `topic`'s mesh.
    pub fn prune(&mut self, topic: &str, peer: &PeerId) {
        if let Some(set) = self.mesh.get_mut(topic) {
            set.remove(peer);
        }
    }

    /// Replace `topic`'s mesh with exactly `peers`.
    pub fn set_mesh(&mut self, topic: &str, peers: HashSet<PeerId>) {
        self.mesh.insert(topic.to_string(), peers);
    }

    /// The fanout peer set for `topic`.
    pub fn fanout_peers(&self, topic: &str) -> HashSet<PeerId> {
        self.fanout
            .get(topic)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Record `peer` as a fanout target for `topic`, refreshing its
    /// last-used timestamp. No-op if `peer` is already meshed for `topic`.
    pub fn use_fanout(&mut self, topic: &str, peer: PeerId, now: Instant) {
        if self.is_mesh_peer(topic, &peer) {
            return;
        }
        self.fanout.entry(topic.to_string()).or_default().insert(peer, now);
    }

    /// Drop fanout entries for `topic` older than `ttl` as of `now`.
    pub fn age_out_fanout(&mut self, topic: &str, ttl: std::time::Duration, now: Instant) {
        if let Some(entries) = self.fanout.get_mut(topic) {
            entries.retain(|_, last_used| now.duration_since(*last_used) <= ttl);
        }
    }

    /// Every topic currently carrying at least one fanout entry.
    pub fn fanout_topics(&self) -> Vec<String> {
        self.fanout.keys().cloned().collect()
    }

    /// Remove `peer` from every mesh and fanout entry (peer disconnect).
    pub fn remove_peer_everywhere(&mut self, peer: &PeerId) {
        for set in self.mesh.values_mut() {
            set.remove(peer);
        }
        for entries in self.fanout.values_mut() {
            entries.remove(peer);
        }
    }
}
