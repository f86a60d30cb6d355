// Copyright (c) 2024 Botho Foundation

//! `PeerScorer`: per-peer, per-topic delivery counters (P1–P4), global
//! penalties (IP co-location, broken promises), and the graylist
//! threshold.
//!
//! Direct peers bypass scoring entirely per §4.4 — callers simply never
//! look a direct peer up here, or treat a missing entry as score `0.0`
//! (never graylisted).

use bth_p2p_identity::PeerId;
use std::collections::HashMap;
use std::net::IpAddr;

/// Per-(peer, topic) delivery counters, P1 through P3b.
#[derive(Debug, Clone, Default)]
struct TopicCounters {
    /// P1: time spent in the mesh, in heartbeat ticks (capped).
    time_in_mesh_ticks: f64,
    /// P2: first-message-delivery count.
    first_message_deliveries: f64,
    /// P3: mesh-message-delivery count (deliveries while meshed, after the
    /// first deliverer).
    mesh_message_deliveries: f64,
    /// P3b: mesh-delivery-failure count (PRUNE while under threshold).
    mesh_failures: f64,
    /// P4: invalid-message count.
    invalid_messages: f64,
    in_mesh: bool,
}

/// Weights applied to each counter, per topic.
#[derive(Debug, Clone)]
pub struct TopicScoreParams {
    /// Overall weight this topic's score contributes.
    pub topic_weight: f64,
    /// P1 weight (time in mesh).
    pub time_in_mesh_weight: f64,
    /// Cap on P1's contribution, in ticks.
    pub time_in_mesh_cap: f64,
    /// P2 weight (first-delivery bonus).
    pub first_message_deliveries_weight: f64,
    /// Decay applied to P2 each tick.
    pub first_message_deliveries_decay: f64,
    /// P3 weight (mesh-delivery count, applied negatively when under the
    /// expected rate — modeled here as a flat positive per-delivery credit
    /// for simplicity, consistent with "increment mesh-delivery count"
    /// in §4.4).
    pub mesh_message_deliveries_weight: f64,
    /// Decay applied to P3 each tick.
    pub mesh_message_deliveries_decay: f64,
    /// P3b weight (mesh-failure penalty).
    pub mesh_failure_penalty_weight: f64,
    /// Decay applied to P3b each tick.
    pub mesh_failure_penalty_decay: f64,
    /// P4 weight (invalid-message penalty).
    pub invalid_message_deliveries_weight: f64,
    /// Decay applied to P4 each tick.
    pub invalid_message_deliveries_decay: f64,
}

impl Default for TopicScoreParams {
    fn default() -> Self {
        Self {
            topic_weight: 1.0,
            time_in_mesh_weight: 0.01,
            time_in_mesh_cap: 3600.0,
            first_message_deliveries_weight: 1.0,
            first_message_deliveries_decay: 0.9,
            mesh_message_deliveries_weight: 1.0,
            mesh_message_deliveries_decay: 0.9,
            mesh_failure_penalty_weight: 1.0,
            mesh_failure_penalty_decay: 0.9,
            invalid_message_deliveries_weight: 10.0,
            invalid_message_deliveries_decay: 0.9,
        }
    }
}

/// Global, non-topic-scoped score parameters.
#[derive(Debug, Clone)]
pub struct ScoreParams {
    /// Per-topic weights; topics not listed use [`TopicScoreParams::default`].
    pub topics: HashMap<String, TopicScoreParams>,
    /// Weight applied to the IP co-location penalty.
    pub ip_colocation_weight: f64,
    /// Peers sharing an IP beyond this count are penalized.
    pub ip_colocation_threshold: usize,
    /// Weight applied to the broken-promise penalty.
    pub behaviour_penalty_weight: f64,
    /// Decay applied to the broken-promise penalty each tick.
    pub behaviour_penalty_decay: f64,
    /// Below this score a peer is graylisted.
    pub graylist_threshold: f64,
}

impl Default for ScoreParams {
    fn default() -> Self {
        Self {
            topics: HashMap::new(),
            ip_colocation_weight: -5.0,
            ip_colocation_threshold: 1,
            behaviour_penalty_weight: -10.0,
            behaviour_penalty_decay: 0.9,
            graylist_threshold: -80.0,
        }
    }
}

#[derive(Debug, Default)]
struct PeerRecord {
    topics: HashMap<String, TopicCounters>,
    broken_promises: f64,
    ip: Option<IpAddr>,
}

/// Tracks per-peer score state and computes real-valued scores on demand.
#[derive(Debug)]
pub struct PeerScorer {
    params: ScoreParams,
    peers: HashMap<PeerId, PeerRecord>,
}

impl PeerScorer {
    /// Create a scorer with the given parameters.
    pub fn new(params: ScoreParams) -> Self {
        Self {
            params,
            peers: HashMap::new(),
        }
    }

    fn topic_params(&self, topic: &str) -> TopicScoreParams {
        self.params.topics.get(topic).cloned().unwrap_or_default()
    }

    fn record_mut(&mut self, peer: &PeerId) -> &mut PeerRecord {
        self.peers.entry(peer.clone()).or_default()
    }

    fn topic_counters_mut(&mut self, peer: &PeerId, topic: &str) -> &mut TopicCounters {
        self.record_mut(peer).topics.entry(topic.to_string()).or_default()
    }

    /// Record the remote address family so IP co-location can be detected.
    pub fn set_peer_ip(&mut self, peer: &PeerId, ip: IpAddr) {
        self.record_mut(peer).ip = Some(ip);
    }

    /// Mark `peer` as having entered `topic`'s mesh.
    pub fn peer_grafted(&mut self, peer: &PeerId, topic: &str) {
        self.topic_counters_mut(peer, topic).in_mesh = true;
    }

    /// Mark `peer` as having left `topic`'s mesh.
    pub fn peer_pruned(&mut self, peer: &PeerId, topic: &str) {
        self.topic_counters_mut(peer, topic).in_mesh = false;
    }

    /// P2: `peer` was the first to deliver a message on `topic`.
    pub fn first_message_delivery(&mut self, peer: &PeerId, topic: &str) {
        self.topic_counters_mut(peer, topic).first_message_deliveries += 1.0;
    }

    /// P3: `peer` delivered a message on `topic` after another peer
    /// already had.
    pub fn mesh_message_delivery(&mut self, peer: &PeerId, topic: &str) {
        self.topic_counters_mut(peer, topic).mesh_message_deliveries += 1.0;
    }

    /// P3b: `peer` pruned from `topic` while under-delivering.
    pub fn mesh_failure(&mut self, peer: &PeerId, topic: &str) {
        self.topic_counters_mut(peer, topic).mesh_failures += 1.0;
    }

    /// P4: `peer` sent an invalid message on `topic`.
    pub fn invalid_message(&mut self, peer: &PeerId, topic: &str) {
        self.topic_counters_mut(peer, topic).invalid_messages += 1.0;
    }

    /// Record one expired IWANT promise against `peer`.
    pub fn broken_promise(&mut self, peer: &PeerId, count: u64) {
        self.record_mut(peer).broken_promises += count as f64;
    }

    /// The current real-valued score for `peer`. Peers never seen before
    /// score `0.0`.
    pub fn score(&self, peer: &PeerId) -> f64 {
        let Some(record) = self.peers.get(peer) else {
            return 0.0;
        };
        let mut score = 0.0;
        for (topic, counters) in &record.topics {
            let params = self.topic_params(topic);
            let p1 = counters.time_in_mesh_ticks.min(params.time_in_mesh_cap);
            let topic_score = p1 * params.time_in_mesh_weight
                + counters.first_message_deliveries * params.first_message_deliveries_weight
                + counters.mesh_message_deliveries * params.mesh_message_deliveries_weight
                - counters.mesh_failures * params.mesh_failure_penalty_weight
                - counters.invalid_messages * params.invalid_message_deliveries_weight;
            score += params.topic_weight * topic_score;
        }
        score += record.broken_promises * self.params.behaviour_penalty_weight;
        score += self.ip_colocation_penalty(peer) * self.params.ip_colocation_weight;
        score
    }

    fn ip_colocation_penalty(&self, peer: &PeerId) -> f64 {
        let Some(ip) = self.peers.get(peer).and_then(|r| r.ip) else {
            return 0.0;
        };
        let sharing = self
            .peers
            .iter()
            .filter(|(other, record)| *other != peer && record.ip == Some(ip))
            .count();
        if sharing > self.params.ip_colocation_threshold {
            let excess = (sharing - self.params.ip_colocation_threshold) as f64;
            excess * excess
        } else {
            0.0
        }
    }

    /// Whether `peer`'s score is below the graylist threshold.
    pub fn is_graylisted(&self, peer: &PeerId) -> bool {
        self.score(peer) < self.params.graylist_threshold
    }

    /// Advance one heartbeat: bump P1 for meshed peers, decay P2–P4 and
    /// the broken-promise penalty.
    pub fn decay_tick(&mut self) {
        for record in self.peers.values_mut() {
            record.broken_promises *= self.params.behaviour_penalty_decay;
            for (topic, counters) in record.topics.iter_mut() {
                let params_for = |topics: &HashMap<String, TopicScoreParams>| topics.get(topic).cloned().unwrap_or_default();
                let params = params_for(&self.params.topics);
                if counters.in_mesh {
                    counters.time_in_mesh_ticks += 1.0;
                }
                counters.first_message_deliveries *= params.first_message_deliveries_decay;
                counters.mesh_message_deliveries *= params.mesh_message_deliveries_decay;
                counters.mesh_failures *= params.mesh_failure_penalty_decay;
                counters.invalid_messages *= params.invalid_message_deliveries_decay;
            }
        }
    }

    /// Remove all state for a disconnected peer.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
    }
}
