// Copyright (c) 2024 Botho Foundation

//! Configuration for the gossipsub router.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which authenticity mode outgoing and incoming messages must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuthenticityMode {
    /// Messages carry `source`, `seqno`, and `signature`; the signature is
    /// verified on receipt. The default and only mode this router honors
    /// for strict validation.
    #[default]
    Signed,
    /// Messages carry `source` and `seqno` but no `signature`.
    Author,
    /// Messages carry none of `source`/`seqno`/`signature`; the topic must
    /// supply a `message_id_function`.
    Anonymous,
}

/// Tunables for a [`crate::router::GossipSubRouter`].
///
/// Defaults match the reference GossipSub v1.1/v1.2 parameters.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GossipSubConfig {
    /// Target mesh degree `D`.
    pub mesh_degree: usize,
    /// Low watermark `D_low`; below this the mesh is topped up.
    pub mesh_degree_low: usize,
    /// High watermark `D_high`; above this the mesh is trimmed.
    pub mesh_degree_high: usize,
    /// Number of peers gossiped to outside the mesh, `D_lazy`.
    pub gossip_degree: usize,
    /// Minimum outbound mesh peers to maintain, `D_out`.
    pub mesh_outbound_min: usize,
    /// How often the heartbeat runs.
    pub heartbeat_interval: Duration,
    /// How long an unused fanout entry is kept.
    pub fanout_ttl: Duration,
    /// How long a message id is kept in the seen cache.
    pub seen_ttl: Duration,
    /// Default GRAFT backoff applied on PRUNE.
    pub prune_backoff: Duration,
    /// Number of heartbeats of history kept in the message cache.
    pub mcache_len: usize,
    /// Number of recent heartbeats gossiped via IHAVE.
    pub mcache_gossip: usize,
    /// Maximum entries kept in the seen cache.
    pub seen_cache_size: usize,
    /// Maximum serialized message payload size.
    pub max_message_size: usize,
    /// Whether inbound message signatures are verified.
    pub validate_signatures: bool,
    /// Whether outbound messages are signed.
    pub sign_messages: bool,
    /// Authenticity contract for publish and inbound validation.
    pub authenticity: AuthenticityMode,
    /// When true, an inbound message missing a signature is rejected
    /// outright rather than merely unauthenticated. The secure default.
    pub strict_signature_verification: bool,
    /// Maximum number of topics this node may subscribe to.
    pub max_subscriptions: usize,
    /// Maximum number of peers tracked per topic.
    pub max_peers_per_topic: usize,
    /// Maximum number of message ids processed from one IHAVE.
    pub max_ihave_messages: usize,
    /// Maximum number of message ids requested in one IWANT.
    pub max_iwant_messages: usize,
    /// How long an IDONTWANT entry is honored.
    pub idontwant_ttl: Duration,
    /// Minimum message size that triggers proactive IDONTWANT to v1.2 peers.
    pub idontwant_threshold: usize,
    /// Heartbeats between opportunistic-grafting passes.
    pub opportunistic_graft_ticks: u64,
    /// Peers opportunistically grafted per pass.
    pub opportunistic_graft_peers: usize,
    /// Median mesh score below which opportunistic grafting triggers.
    pub opportunistic_graft_threshold: f64,
    /// Whether PRUNE may carry peer-exchange suggestions.
    pub enable_peer_exchange: bool,
    /// Number of peers suggested in a peer-exchange PRUNE.
    pub prune_peers: usize,
    /// Minimum score a peer must have for its PX suggestions to be used.
    pub accept_px_threshold: f64,
    /// How long an IWANT promise is given to resolve before counting as
    /// broken.
    pub iwant_followup_time: Duration,
    /// Whether publish additionally floods to extra topic subscribers.
    pub flood_publish: bool,
    /// Maximum extra peers flood-published to.
    pub flood_publish_max_peers: usize,
}

impl Default for GossipSubConfig {
    fn default() -> Self {
        Self {
            mesh_degree: 6,
            mesh_degree_low: 4,
            mesh_degree_high: 12,
            gossip_degree: 6,
            mesh_outbound_min: 2,
            heartbeat_interval: Duration::from_secs(1),
            fanout_ttl: Duration::from_secs(60),
            seen_ttl: Duration::from_secs(120),
            prune_backoff: Duration::from_secs(60),
            mcache_len: 5,
            mcache_gossip: 3,
            seen_cache_size: 10_000,
            max_message_size: 1 << 20,
            validate_signatures: true,
            sign_messages: true,
            authenticity: AuthenticityMode::Signed,
            strict_signature_verification: true,
            max_subscriptions: 100,
            max_peers_per_topic: 1000,
            max_ihave_messages: 5000,
            max_iwant_messages: 5000,
            idontwant_ttl: Duration::from_secs(3),
            idontwant_threshold: 1024,
            opportunistic_graft_ticks: 60,
            opportunistic_graft_peers: 2,
            opportunistic_graft_threshold: 1.0,
            enable_peer_exchange: false,
            prune_peers: 0,
            accept_px_threshold: 10.0,
            iwant_followup_time: Duration::from_secs(3),
            flood_publish: true,
            flood_publish_max_peers: 25,
        }
    }
}

impl GossipSubConfig {
    /// Start building a config from defaults.
    pub fn builder() -> GossipSubConfigBuilder {
        GossipSubConfigBuilder::default()
    }
}

/// Fluent builder for [`GossipSubConfig`]. Unset fields fall back to the
/// documented defaults.
#[derive(Debug, Default)]
pub struct GossipSubConfigBuilder {
    config: GossipSubConfig,
}

macro_rules! builder_setter {
    ($name:ident, $field:ident, $ty:ty) => {
        /// Override this config field.
        pub fn $name(mut self, value: $ty) -> Self {
            self.config.$field = value;
            self
        }
    };
}

impl GossipSubConfigBuilder {
    /// Create a new builder seeded with the documented defaults.
    pub fn new() -> Self {
        Self {
            config: GossipSubConfig::default(),
        }
    }

    builder_setter!(with_mesh_degree, mesh_degree, usize);
    builder_setter!(with_mesh_degree_low, mesh_degree_low, usize);
    builder_setter!(with_mesh_degree_high, mesh_degree_high, usize);
    builder_setter!(with_gossip_degree, gossip_degree, usize);
    builder_setter!(with_mesh_outbound_min, mesh_outbound_min, usize);
    builder_setter!(with_heartbeat_interval, heartbeat_interval, Duration);
    builder_setter!(with_fanout_ttl, fanout_ttl, Duration);
    builder_setter!(with_seen_ttl, seen_ttl, Duration);
    builder_setter!(with_prune_backoff, prune_backoff, Duration);
    builder_setter!(with_mcache_len, mcache_len, usize);
    builder_setter!(with_mcache_gossip, mcache_gossip, usize);
    builder_setter!(with_seen_cache_size, seen_cache_size, usize);
    builder_setter!(with_max_message_size, max_message_size, usize);
    builder_setter!(with_validate_signatures, validate_signatures, bool);
    builder_setter!(with_sign_messages, sign_messages, bool);
    builder_setter!(with_authenticity, authenticity, AuthenticityMode);
    builder_setter!(
        with_strict_signature_verification,
        strict_signature_verification,
        bool
    );
    builder_setter!(with_max_subscriptions, max_subscriptions, usize);
    builder_setter!(with_max_peers_per_topic, max_peers_per_topic, usize);
    builder_setter!(with_max_ihave_messages, max_ihave_messages, usize);
    builder_setter!(with_max_iwant_messages, max_iwant_messages, usize);
    builder_setter!(with_idontwant_ttl, idontwant_ttl, Duration);
    builder_setter!(with_idontwant_threshold, idontwant_threshold, usize);
    builder_setter!(
        with_opportunistic_graft_ticks,
        opportunistic_graft_ticks,
        u64
    );
    builder_setter!(
        with_opportunistic_graft_peers,
        opportunistic_graft_peers,
        usize
    );
    builder_setter!(
        with_opportunistic_graft_threshold,
        opportunistic_graft_threshold,
        f64
    );
    builder_setter!(with_enable_peer_exchange, enable_peer_exchange, bool);
    builder_setter!(with_prune_peers, prune_peers, usize);
    builder_setter!(with_accept_px_threshold, accept_px_threshold, f64);
    builder_setter!(with_iwant_followup_time, iwant_followup_time, Duration);
    builder_setter!(with_flood_publish, flood_publish, bool);
    builder_setter!(with_flood_publish_max_peers, flood_publish_max_peers, usize);

    /// Build the config.
    pub fn build(self) -> GossipSubConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = GossipSubConfig::default();
        assert_eq!(config.mesh_degree, 6);
        assert_eq!(config.mesh_degree_low, 4);
        assert_eq!(config.mesh_degree_high, 12);
        assert_eq!(config.mesh_outbound_min, 2);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.max_message_size, 1 << 20);
        assert!(config.strict_signature_verification);
        assert!(!config.enable_peer_exchange);
    }

    #[test]
    fn degree_family_invariants_hold_for_defaults() {
        let config = GossipSubConfig::default();
        assert!(config.mesh_degree_low <= config.mesh_degree);
        assert!(config.mesh_degree <= config.mesh_degree_high);
        assert!(config.mesh_outbound_min <= config.mesh_degree_low);
        assert!(config.mesh_outbound_min <= config.mesh_degree / 2);
        assert!(config.mcache_gossip <= config.mcache_len);
    }

    #[test]
    fn builder_overrides_only_given_fields() {
        let config = GossipSubConfigBuilder::new()
            .with_mesh_degree(8)
            .with_heartbeat_interval(Duration::from_millis(500))
            .build();
        assert_eq!(config.mesh_degree, 8);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(config.mesh_degree_low, 4);
    }
}
