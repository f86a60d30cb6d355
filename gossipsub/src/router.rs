// Copyright (c) 2024 Botho Foundation

//! `GossipSubRouter`: the mesh/fanout/gossip state machine tying together
//! every other module in this crate — subscription lifecycle, publish,
//! inbound RPC handling, and the heartbeat.
//!
//! Locking follows §5: each substate (`mesh`, `peers`, `message_cache`,
//! `seen_cache`, `scorer`, `promises`) has its own lock, and no method
//! holds two of them at once — snapshot under one, release, then take the
//! next.

use crate::cache::{MessageCache, SeenCache};
use crate::config::GossipSubConfig;
use crate::error::{GossipSubError, GossipSubResult};
use crate::events::{DeliveredMessage, GossipEvent, Subscription};
use crate::mesh::MeshState;
use crate::message::{self, MessageId, MessageIdFn, SeqnoCounter};
use crate::peer::{Direction, PeerState, ProtocolVersion};
use crate::promises::GossipPromises;
use crate::scorer::{PeerScorer, ScoreParams};
use crate::transport::PeerSink;
use crate::wire::{
    ControlGraft, ControlIDontWant, ControlIHave, ControlIWant, ControlMessage, ControlPrune, Rpc, SubOpts, WireMessage,
};
use bth_p2p_identity::{Ed25519KeyPair, KeyPair, PeerId};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::warn;

/// Outcome of an application-level `MessageValidator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    /// Continue normal processing.
    Accept,
    /// Drop the message and apply the invalid-message penalty.
    Reject,
    /// Drop the message silently.
    Ignore,
}

/// A per-topic application-level gate a caller can install with
/// [`GossipSubRouter::set_message_validator`].
pub type MessageValidator = Arc<dyn Fn(&DeliveredMessage) -> ValidationResult + Send + Sync>;

/// Queue depth for a topic subscription's delivery channel.
const SUBSCRIPTION_QUEUE_CAPACITY: usize = 256;

struct PeerEntry {
    state: PeerState,
    sink: Arc<dyn PeerSink>,
}

/// The gossipsub mesh/gossip state machine for one local node.
pub struct GossipSubRouter {
    config: GossipSubConfig,
    local_peer: PeerId,
    local_key: Option<Ed25519KeyPair>,
    id_fn: MessageIdFn,
    mesh: Mutex<MeshState>,
    peers: Mutex<HashMap<PeerId, PeerEntry>>,
    message_cache: Mutex<MessageCache>,
    seen_cache: Mutex<SeenCache>,
    scorer: Mutex<PeerScorer>,
    promises: Mutex<GossipPromises>,
    seqno: SeqnoCounter,
    subscriptions: Mutex<HashMap<String, mpsc::Sender<DeliveredMessage>>>,
    validators: Mutex<HashMap<String, MessageValidator>>,
    events: bth_p2p_core::EventBus<GossipEvent>,
    heartbeat_tick: AtomicU64,
    closed: AtomicBool,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl GossipSubRouter {
    /// Build a router using the default `source || seqno` message-id
    /// function, and spawn its heartbeat task.
    pub fn new(local_peer: PeerId, local_key: Option<Ed25519KeyPair>, config: GossipSubConfig) -> Arc<Self> {
        Self::with_message_id_fn(local_peer, local_key, config, Arc::new(MessageId::default_for))
    }

    /// Build a router with a custom message-id function, required when
    /// `authenticity` is `anonymous` and useful for content-addressed ids
    /// otherwise.
    pub fn with_message_id_fn(
        local_peer: PeerId,
        local_key: Option<Ed25519KeyPair>,
        config: GossipSubConfig,
        id_fn: MessageIdFn,
    ) -> Arc<Self> {
        let heartbeat_interval = config.heartbeat_interval;
        let this = Arc::new(Self {
            mesh: Mutex::new(MeshState::new()),
            peers: Mutex::new(HashMap::new()),
            message_cache: Mutex::new(MessageCache::new(config.mcache_len)),
            seen_cache: Mutex::new(SeenCache::new(config.seen_ttl, config.seen_cache_size)),
            scorer: Mutex::new(PeerScorer::new(ScoreParams::default())),
            promises: Mutex::new(GossipPromises::new()),
            seqno: SeqnoCounter::default(),
            id_fn,
            subscriptions: Mutex::new(HashMap::new()),
            validators: Mutex::new(HashMap::new()),
            events: bth_p2p_core::EventBus::new(),
            heartbeat_tick: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            heartbeat_task: Mutex::new(None),
            config,
            local_peer,
            local_key,
        });

        let weak = Arc::downgrade(&this);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(router) => router.heartbeat().await,
                    None => return,
                }
            }
        });
        *this.heartbeat_task.lock() = Some(handle);
        this
    }

    /// This node's own identity.
    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    /// Subscribe to lifecycle and diagnostic events.
    pub fn events(&self) -> broadcast::Receiver<GossipEvent> {
        self.events.subscribe()
    }

    /// Install (or replace) an application-level validator for `topic`.
    pub fn set_message_validator(&self, topic: impl Into<String>, validator: MessageValidator) {
        self.validators.lock().insert(topic.into(), validator);
    }

    /// Register a connected peer with the router.
    pub fn add_peer(
        &self,
        peer: PeerId,
        sink: Arc<dyn PeerSink>,
        protocol_version: ProtocolVersion,
        direction: Direction,
        is_direct: bool,
    ) {
        let state = PeerState::new(protocol_version, direction, is_direct);
        self.peers.lock().insert(peer, PeerEntry { state, sink });
    }

    /// Record a peer's observed address, for IP co-location scoring.
    pub fn set_peer_address(&self, peer: &PeerId, ip: IpAddr) {
        self.scorer.lock().set_peer_ip(peer, ip);
    }

    /// Tear down all router state for a disconnected peer.
    pub fn remove_peer(&self, peer: &PeerId) {
        self.peers.lock().remove(peer);
        self.mesh.lock().remove_peer_everywhere(peer);
        self.scorer.lock().remove_peer(peer);
    }

    /// Stop the heartbeat task and end every live subscription and event
    /// stream. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.heartbeat_task.lock().take() {
            handle.abort();
        }
        self.subscriptions.lock().clear();
        self.events.shutdown();
    }

    // ---- subscription lifecycle ----------------------------------------

    /// Subscribe to `topic`, broadcasting the change to every connected
    /// peer and returning a handle that yields delivered messages.
    pub async fn subscribe(&self, topic: &str) -> GossipSubResult<Subscription> {
        {
            let mesh = self.mesh.lock();
            if mesh.is_subscribed(topic) {
                return Err(GossipSubError::AlreadySubscribed);
            }
            if mesh.subscribed_topics().len() >= self.config.max_subscriptions {
                return Err(GossipSubError::SubscriptionLimitReached);
            }
        }
        self.mesh.lock().subscribe(topic);
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE_CAPACITY);
        self.subscriptions.lock().insert(topic.to_string(), tx);
        self.broadcast_subscription(topic, true).await;
        Ok(Subscription::new(topic.to_string(), rx))
    }

    /// Unsubscribe from `topic`, pruning every mesh peer on it with a
    /// fresh backoff and broadcasting the change.
    pub async fn unsubscribe(&self, topic: &str) -> GossipSubResult<()> {
        if !self.mesh.lock().is_subscribed(topic) {
            return Err(GossipSubError::NotSubscribed);
        }
        let former_mesh = self.mesh.lock().unsubscribe(topic);
        self.subscriptions.lock().remove(topic);
        let now = Instant::now();
        for peer in &former_mesh {
            {
                let mut peers = self.peers.lock();
                if let Some(entry) = peers.get_mut(peer) {
                    entry.state.set_backoff(topic, now + self.config.prune_backoff);
                }
            }
            self.scorer.lock().peer_pruned(peer, topic);
            self.send_prune(peer, topic, None).await;
        }
        self.broadcast_subscription(topic, false).await;
        Ok(())
    }

    async fn broadcast_subscription(&self, topic: &str, subscribe: bool) {
        let rpc = Rpc {
            subscriptions: vec![SubOpts {
                subscribe,
                topic: topic.to_string(),
            }],
            ..Default::default()
        };
        let targets: Vec<(PeerId, Arc<dyn PeerSink>)> =
            self.peers.lock().iter().map(|(p, e)| (p.clone(), e.sink.clone())).collect();
        for (peer, sink) in targets {
            if sink.send(rpc.clone()).await.is_err() {
                self.remove_peer(&peer);
            }
        }
    }

    // ---- publish ---------------------------------------------------------

    /// Publish `data` to `topic`, returning the id assigned to it.
    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> GossipSubResult<MessageId> {
        if data.len() > self.config.max_message_size {
            return Err(GossipSubError::MessageTooLarge);
        }
        let message = message::build_outgoing(
            topic,
            data,
            self.config.authenticity,
            &self.local_peer,
            self.local_key.as_ref(),
            &self.seqno,
        )?;
        let id = (self.id_fn)(&message);
        let now = Instant::now();
        self.seen_cache.lock().insert(id.clone(), now);
        self.message_cache.lock().insert(id.clone(), message.clone(), None);

        let mesh_peers = self.mesh.lock().mesh_peers(topic);
        let mut targets: HashSet<PeerId> = mesh_peers.clone();
        targets.extend(self.direct_peer_ids());

        if mesh_peers.is_empty() {
            let mut candidates: Vec<PeerId> = self
                .subscribers_of(topic)
                .into_iter()
                .filter(|p| !targets.contains(p))
                .collect();
            candidates.shuffle(&mut rand::thread_rng());
            candidates.truncate(self.config.mesh_degree);
            {
                let mut mesh = self.mesh.lock();
                for c in &candidates {
                    mesh.use_fanout(topic, c.clone(), now);
                }
            }
            targets.extend(candidates);
        }

        if self.config.flood_publish {
            let mut extra: Vec<PeerId> = self
                .subscribers_of(topic)
                .into_iter()
                .filter(|p| !targets.contains(p))
                .collect();
            extra.shuffle(&mut rand::thread_rng());
            extra.truncate(self.config.flood_publish_max_peers);
            targets.extend(extra);
        }

        let rpc = Rpc {
            publish: vec![message],
            ..Default::default()
        };
        let send_targets: Vec<(PeerId, Arc<dyn PeerSink>)> = {
            let peers = self.peers.lock();
            targets
                .iter()
                .filter_map(|p| peers.get(p).map(|e| (p.clone(), e.sink.clone())))
                .collect()
        };
        for (peer, sink) in send_targets {
            if sink.send(rpc.clone()).await.is_err() {
                self.remove_peer(&peer);
            }
        }
        Ok(id)
    }

    fn subscribers_of(&self, topic: &str) -> Vec<PeerId> {
        self.peers
            .lock()
            .iter()
            .filter(|(_, e)| e.state.subscribed_topics.contains(topic))
            .map(|(p, _)| p.clone())
            .collect()
    }

    fn direct_peer_ids(&self) -> HashSet<PeerId> {
        self.peers.lock().iter().filter(|(_, e)| e.state.is_direct).map(|(p, _)| p.clone()).collect()
    }

    // ---- inbound RPC handling --------------------------------------------

    /// Process one inbound RPC from `peer`.
    pub async fn handle_rpc(&self, peer: &PeerId, rpc: Rpc) -> GossipSubResult<()> {
        for sub in &rpc.subscriptions {
            self.handle_subscription_change(peer, sub);
        }
        for message in rpc.publish {
            self.handle_message(peer, message).await;
        }
        if let Some(control) = rpc.control {
            self.handle_control(peer, control).await;
        }
        Ok(())
    }

    fn handle_subscription_change(&self, peer: &PeerId, sub: &SubOpts) {
        if sub.subscribe {
            let is_new = {
                let mut peers = self.peers.lock();
                match peers.get_mut(peer) {
                    Some(entry) => entry.state.subscribed_topics.insert(sub.topic.clone()),
                    None => return,
                }
            };
            if is_new {
                self.events.publish(GossipEvent::PeerSubscribed {
                    peer: peer.clone(),
                    topic: sub.topic.clone(),
                });
            }
        } else {
            {
                let mut peers = self.peers.lock();
                if let Some(entry) = peers.get_mut(peer) {
                    entry.state.subscribed_topics.remove(&sub.topic);
                }
            }
            self.mesh.lock().prune(&sub.topic, peer);
            self.events.publish(GossipEvent::PeerUnsubscribed {
                peer: peer.clone(),
                topic: sub.topic.clone(),
            });
        }
    }

    async fn handle_message(&self, peer: &PeerId, message: WireMessage) {
        let authenticity = self.config.authenticity;
        if let Err(err) = message::validate_structure(&message, self.config.max_message_size, authenticity) {
            self.reject_message(peer, &message.topic, err.to_string());
            return;
        }
        if self.config.validate_signatures
            && authenticity == crate::config::AuthenticityMode::Signed
            && message::verify_signature(&message).is_err()
        {
            self.reject_message(peer, &message.topic, "invalid signature".to_string());
            return;
        }

        let id = (self.id_fn)(&message);
        self.promises.lock().resolve(&id);

        let already_seen = self.seen_cache.lock().contains(&id);
        if already_seen {
            self.scorer.lock().mesh_message_delivery(peer, &message.topic);
            return;
        }

        if let Some(validator) = self.validators.lock().get(&message.topic).cloned() {
            let delivered = DeliveredMessage {
                topic: message.topic.clone(),
                source: message.from.clone().map(PeerId::from_bytes_unchecked),
                data: message.data.clone(),
            };
            match validator(&delivered) {
                ValidationResult::Reject => {
                    self.reject_message(peer, &message.topic, "rejected by application validator".to_string());
                    return;
                }
                ValidationResult::Ignore => return,
                ValidationResult::Accept => {}
            }
        }

        let now = Instant::now();
        self.seen_cache.lock().insert(id.clone(), now);
        self.message_cache.lock().insert(id.clone(), message.clone(), Some(peer.clone()));
        self.scorer.lock().first_message_delivery(peer, &message.topic);

        if let Some(tx) = self.subscriptions.lock().get(&message.topic).cloned() {
            let delivered = DeliveredMessage {
                topic: message.topic.clone(),
                source: message.from.clone().map(PeerId::from_bytes_unchecked),
                data: message.data.clone(),
            };
            let _ = tx.try_send(delivered);
        }

        self.forward_message(peer, &message, &id).await;
    }

    fn reject_message(&self, peer: &PeerId, topic: &str, reason: String) {
        self.scorer.lock().invalid_message(peer, topic);
        self.events.publish(GossipEvent::MessageRejected {
            peer: peer.clone(),
            reason,
        });
    }

    async fn forward_message(&self, from: &PeerId, message: &WireMessage, id: &MessageId) {
        let topic = &message.topic;
        let original_source = message.from.clone().map(PeerId::from_bytes_unchecked);

        let mut targets: HashSet<PeerId> = self.mesh.lock().mesh_peers(topic);
        targets.extend(self.direct_peer_ids());
        targets.remove(from);
        if let Some(source) = &original_source {
            targets.remove(source);
        }

        let send_targets: Vec<(PeerId, Arc<dyn PeerSink>, ProtocolVersion)> = {
            let peers = self.peers.lock();
            targets
                .iter()
                .filter_map(|p| {
                    let entry = peers.get(p)?;
                    if entry.state.has_idontwant(id) {
                        return None;
                    }
                    Some((p.clone(), entry.sink.clone(), entry.state.protocol_version))
                })
                .collect()
        };

        if message.data.len() >= self.config.idontwant_threshold {
            let idontwant = ControlIDontWant { message_ids: vec![id.0.clone()] };
            let rpc = Rpc {
                control: Some(ControlMessage {
                    idontwant: vec![idontwant],
                    ..Default::default()
                }),
                ..Default::default()
            };
            for (_, sink, protocol_version) in &send_targets {
                if protocol_version.supports_idontwant() {
                    let _ = sink.send(rpc.clone()).await;
                }
            }
        }

        let rpc = Rpc {
            publish: vec![message.clone()],
            ..Default::default()
        };
        for (peer, sink, _) in send_targets {
            if sink.send(rpc.clone()).await.is_err() {
                self.remove_peer(&peer);
            }
        }
    }

    async fn handle_control(&self, peer: &PeerId, control: ControlMessage) {
        for graft in &control.graft {
            self.handle_graft(peer, &graft.topic).await;
        }
        for prune in &control.prune {
            self.handle_prune(peer, prune).await;
        }
        for ihave in &control.ihave {
            self.handle_ihave(peer, ihave).await;
        }
        for iwant in &control.iwant {
            self.handle_iwant(peer, iwant).await;
        }
        for idontwant in &control.idontwant {
            self.handle_idontwant(peer, idontwant);
        }
    }

    async fn handle_graft(&self, peer: &PeerId, topic: &str) {
        let now = Instant::now();
        let subscribed = self.mesh.lock().is_subscribed(topic);
        let graylisted = self.scorer.lock().is_graylisted(peer);
        let backed_off = self.peers.lock().get(peer).map(|e| e.state.is_backed_off(topic, now)).unwrap_or(true);
        let mesh_full = self.mesh.lock().mesh_len(topic) >= self.config.mesh_degree_high;

        if !subscribed || graylisted || backed_off || mesh_full {
            self.send_prune(peer, topic, None).await;
            return;
        }

        self.mesh.lock().graft(topic, peer.clone());
        {
            let mut peers = self.peers.lock();
            if let Some(entry) = peers.get_mut(peer) {
                entry.state.backoff_until.remove(topic);
            }
        }
        self.scorer.lock().peer_grafted(peer, topic);
        self.events.publish(GossipEvent::Grafted {
            peer: peer.clone(),
            topic: topic.to_string(),
        });
        self.events.publish(GossipEvent::PeerJoinedMesh {
            peer: peer.clone(),
            topic: topic.to_string(),
        });
    }

    async fn handle_prune(&self, peer: &PeerId, prune: &ControlPrune) {
        let topic = &prune.topic;
        self.mesh.lock().prune(topic, peer);
        self.scorer.lock().peer_pruned(peer, topic);
        self.scorer.lock().mesh_failure(peer, topic);

        let now = Instant::now();
        let backoff = prune.backoff.map(std::time::Duration::from_secs).unwrap_or(self.config.prune_backoff).max(self.config.prune_backoff);
        {
            let mut peers = self.peers.lock();
            if let Some(entry) = peers.get_mut(peer) {
                entry.state.set_backoff(topic, now + backoff);
            }
        }
        self.events.publish(GossipEvent::Pruned {
            peer: peer.clone(),
            topic: topic.to_string(),
        });

        if self.config.enable_peer_exchange && !prune.peers.is_empty() {
            let score = self.scorer.lock().score(peer);
            if score >= self.config.accept_px_threshold {
                self.events.publish(GossipEvent::PeerExchangeSuggestions {
                    from: peer.clone(),
                    suggestions: prune.peers.clone(),
                });
            }
        }
    }

    async fn handle_ihave(&self, peer: &PeerId, ihave: &ControlIHave) {
        if self.scorer.lock().is_graylisted(peer) {
            return;
        }
        let mut want_ids = Vec::new();
        {
            let seen = self.seen_cache.lock();
            for raw in ihave.message_ids.iter().take(self.config.max_ihave_messages) {
                let id = MessageId(raw.clone());
                if !seen.contains(&id) {
                    want_ids.push(id);
                }
            }
        }
        want_ids.truncate(self.config.max_iwant_messages);
        if want_ids.is_empty() {
            return;
        }

        let now = Instant::now();
        {
            let mut promises = self.promises.lock();
            for id in &want_ids {
                promises.add(id.clone(), peer.clone(), now + self.config.iwant_followup_time);
            }
        }

        let rpc = Rpc {
            control: Some(ControlMessage {
                iwant: vec![ControlIWant {
                    message_ids: want_ids.into_iter().map(|id| id.0).collect(),
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        self.send_to(peer, rpc).await;
    }

    async fn handle_iwant(&self, peer: &PeerId, iwant: &ControlIWant) {
        let mut messages = Vec::new();
        {
            let cache = self.message_cache.lock();
            for raw in iwant.message_ids.iter().take(self.config.max_iwant_messages) {
                if let Some(cached) = cache.get(&MessageId(raw.clone())) {
                    messages.push(cached.message.clone());
                }
            }
        }
        if messages.is_empty() {
            return;
        }
        let rpc = Rpc {
            publish: messages,
            ..Default::default()
        };
        self.send_to(peer, rpc).await;
    }

    fn handle_idontwant(&self, peer: &PeerId, idontwant: &ControlIDontWant) {
        let now = Instant::now();
        let mut peers = self.peers.lock();
        if let Some(entry) = peers.get_mut(peer) {
            for raw in &idontwant.message_ids {
                entry.state.record_idontwant(MessageId(raw.clone()), now);
            }
        }
    }

    async fn send_prune(&self, peer: &PeerId, topic: &str, backoff_secs: Option<u64>) {
        let backoff = backoff_secs.unwrap_or_else(|| self.config.prune_backoff.as_secs());
        let rpc = Rpc {
            control: Some(ControlMessage {
                prune: vec![ControlPrune {
                    topic: topic.to_string(),
                    peers: Vec::new(),
                    backoff: Some(backoff),
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        self.send_to(peer, rpc).await;
    }

    async fn send_graft(&self, peer: &PeerId, topic: &str) {
        let rpc = Rpc {
            control: Some(ControlMessage {
                graft: vec![ControlGraft { topic: topic.to_string() }],
                ..Default::default()
            }),
            ..Default::default()
        };
        self.send_to(peer, rpc).await;
    }

    async fn send_to(&self, peer: &PeerId, rpc: Rpc) {
        let sink = self.peers.lock().get(peer).map(|e| e.sink.clone());
        let Some(sink) = sink else {
            return;
        };
        if sink.send(rpc).await.is_err() {
            warn!(?peer, "gossipsub send failed, dropping peer");
            self.remove_peer(peer);
        }
    }

    // ---- heartbeat ---------------------------------------------------------

    /// Run one heartbeat tick: score decay, broken-promise harvest, mesh and
    /// fanout maintenance, opportunistic grafting, gossip emission, and
    /// cache aging, in that order (§4.4).
    pub async fn heartbeat(&self) {
        let now = Instant::now();
        self.scorer.lock().decay_tick();

        let broken = self.promises.lock().take_broken(now);
        if !broken.is_empty() {
            let mut scorer = self.scorer.lock();
            for (peer, count) in &broken {
                scorer.broken_promise(peer, *count);
            }
        }

        let topics = self.mesh.lock().subscribed_topics();
        for topic in &topics {
            self.maintain_mesh(topic, now).await;
        }

        self.maintain_fanout(now);

        let tick = self.heartbeat_tick.fetch_add(1, Ordering::Relaxed) + 1;
        if self.config.opportunistic_graft_ticks > 0 && tick % self.config.opportunistic_graft_ticks == 0 {
            for topic in &topics {
                self.opportunistic_graft(topic, now).await;
            }
        }

        for topic in &topics {
            self.emit_gossip(topic).await;
        }

        self.message_cache.lock().shift();
        self.seen_cache.lock().age_out(now);
    }

    async fn maintain_mesh(&self, topic: &str, now: Instant) {
        let current = self.mesh.lock().mesh_peers(topic);
        let mut to_remove = Vec::new();
        {
            let scorer = self.scorer.lock();
            for p in &current {
                if scorer.score(p) < 0.0 || scorer.is_graylisted(p) {
                    to_remove.push(p.clone());
                }
            }
        }
        for p in &to_remove {
            self.mesh.lock().prune(topic, p);
            self.scorer.lock().peer_pruned(p, topic);
            self.send_prune(p, topic, None).await;
            self.events.publish(GossipEvent::Pruned {
                peer: p.clone(),
                topic: topic.to_string(),
            });
        }

        let mesh_len = self.mesh.lock().mesh_len(topic);
        if mesh_len < self.config.mesh_degree_low {
            let need = self.config.mesh_degree.saturating_sub(mesh_len);
            let candidates = self.pick_graft_candidates(topic, need, now);
            for c in &candidates {
                self.graft_peer(c, topic).await;
            }
        } else if mesh_len > self.config.mesh_degree_high {
            self.trim_mesh(topic, now).await;
        }

        self.ensure_outbound_min(topic, now).await;
    }

    async fn graft_peer(&self, peer: &PeerId, topic: &str) {
        self.mesh.lock().graft(topic, peer.clone());
        self.scorer.lock().peer_grafted(peer, topic);
        self.send_graft(peer, topic).await;
        self.events.publish(GossipEvent::Grafted {
            peer: peer.clone(),
            topic: topic.to_string(),
        });
    }

    fn pick_graft_candidates(&self, topic: &str, need: usize, now: Instant) -> Vec<PeerId> {
        if need == 0 {
            return Vec::new();
        }
        let mesh_peers = self.mesh.lock().mesh_peers(topic);
        let fanout_peers = self.mesh.lock().fanout_peers(topic);
        let mut candidates: Vec<PeerId> = {
            let peers = self.peers.lock();
            let scorer = self.scorer.lock();
            peers
                .iter()
                .filter(|(p, e)| {
                    !e.state.is_direct
                        && e.state.protocol_version.supports_mesh()
                        && e.state.subscribed_topics.contains(topic)
                        && !mesh_peers.contains(*p)
                        && !fanout_peers.contains(*p)
                        && !e.state.is_backed_off(topic, now)
                        && !scorer.is_graylisted(p)
                })
                .map(|(p, _)| p.clone())
                .collect()
        };
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(need);
        candidates
    }

    async fn trim_mesh(&self, topic: &str, now: Instant) {
        let current: Vec<PeerId> = self.mesh.lock().mesh_peers(topic).into_iter().collect();
        let mut scored: Vec<(PeerId, f64, Direction)> = {
            let peers = self.peers.lock();
            let scorer = self.scorer.lock();
            current
                .iter()
                .map(|p| {
                    let direction = peers.get(p).map(|e| e.state.direction).unwrap_or(Direction::Inbound);
                    (p.clone(), scorer.score(p), direction)
                })
                .collect()
        };
        scored.shuffle(&mut rand::thread_rng());
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let target = self.config.mesh_degree;
        let mut kept: HashSet<PeerId> = scored.iter().take(target).map(|(p, _, _)| p.clone()).collect();

        let outbound_kept = scored.iter().take(target).filter(|(_, _, d)| *d == Direction::Outbound).count();
        if outbound_kept < self.config.mesh_outbound_min {
            let mut extra_needed = self.config.mesh_outbound_min - outbound_kept;
            for (p, _, d) in scored.iter().skip(target) {
                if extra_needed == 0 {
                    break;
                }
                if *d == Direction::Outbound {
                    kept.insert(p.clone());
                    extra_needed -= 1;
                }
            }
        }

        for (p, _, _) in &scored {
            if kept.contains(p) {
                continue;
            }
            self.mesh.lock().prune(topic, p);
            self.scorer.lock().peer_pruned(p, topic);
            let backoff_secs = self.config.prune_backoff.as_secs();
            {
                let mut peers = self.peers.lock();
                if let Some(entry) = peers.get_mut(p) {
                    entry.state.set_backoff(topic, now + self.config.prune_backoff);
                }
            }
            self.send_prune(p, topic, Some(backoff_secs)).await;
            self.events.publish(GossipEvent::Pruned {
                peer: p.clone(),
                topic: topic.to_string(),
            });
        }
    }

    async fn ensure_outbound_min(&self, topic: &str, now: Instant) {
        let mesh_peers = self.mesh.lock().mesh_peers(topic);
        let outbound_count = {
            let peers = self.peers.lock();
            mesh_peers
                .iter()
                .filter(|p| peers.get(*p).map(|e| e.state.direction == Direction::Outbound).unwrap_or(false))
                .count()
        };
        if outbound_count >= self.config.mesh_outbound_min {
            return;
        }
        let need = self.config.mesh_outbound_min - outbound_count;
        let candidates: Vec<PeerId> = {
            let mut v: Vec<PeerId> = {
                let peers = self.peers.lock();
                let scorer = self.scorer.lock();
                peers
                    .iter()
                    .filter(|(p, e)| {
                        e.state.direction == Direction::Outbound
                            && !e.state.is_direct
                            && e.state.protocol_version.supports_mesh()
                            && e.state.subscribed_topics.contains(topic)
                            && !mesh_peers.contains(*p)
                            && !e.state.is_backed_off(topic, now)
                            && !scorer.is_graylisted(p)
                    })
                    .map(|(p, _)| p.clone())
                    .collect()
            };
            v.shuffle(&mut rand::thread_rng());
            v.truncate(need);
            v
        };
        for c in &candidates {
            self.graft_peer(c, topic).await;
        }
    }

    fn maintain_fanout(&self, now: Instant) {
        let topics = self.mesh.lock().fanout_topics();
        for topic in topics {
            self.mesh.lock().age_out_fanout(&topic, self.config.fanout_ttl, now);
            let existing = self.mesh.lock().fanout_peers(&topic);
            if existing.is_empty() {
                continue;
            }
            if existing.len() >= self.config.mesh_degree {
                continue;
            }
            let mesh_peers = self.mesh.lock().mesh_peers(&topic);
            let mut candidates: Vec<PeerId> = self
                .subscribers_of(&topic)
                .into_iter()
                .filter(|p| !existing.contains(p) && !mesh_peers.contains(p))
                .collect();
            candidates.shuffle(&mut rand::thread_rng());
            candidates.truncate(self.config.mesh_degree - existing.len());
            let mut mesh = self.mesh.lock();
            for c in candidates {
                mesh.use_fanout(&topic, c, now);
            }
        }
    }

    async fn opportunistic_graft(&self, topic: &str, now: Instant) {
        let mesh_peers: Vec<PeerId> = self.mesh.lock().mesh_peers(topic).into_iter().collect();
        if mesh_peers.is_empty() {
            return;
        }
        let mut scores: Vec<f64> = {
            let scorer = self.scorer.lock();
            mesh_peers.iter().map(|p| scorer.score(p)).collect()
        };
        scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = scores[scores.len() / 2];
        if median >= self.config.opportunistic_graft_threshold {
            return;
        }
        let candidates = self.pick_graft_candidates(topic, self.config.opportunistic_graft_peers, now);
        for c in &candidates {
            self.graft_peer(c, topic).await;
        }
    }

    async fn emit_gossip(&self, topic: &str) {
        let ids = self.message_cache.lock().gossip_ids(topic, self.config.mcache_gossip);
        if ids.is_empty() {
            return;
        }
        let mesh_peers = self.mesh.lock().mesh_peers(topic);
        let fanout_peers = self.mesh.lock().fanout_peers(topic);
        let mut candidates: Vec<PeerId> = {
            let peers = self.peers.lock();
            let scorer = self.scorer.lock();
            peers
                .iter()
                .filter(|(p, e)| {
                    !mesh_peers.contains(*p)
                        && !fanout_peers.contains(*p)
                        && !e.state.is_direct
                        && e.state.protocol_version.supports_mesh()
                        && !scorer.is_graylisted(p)
                })
                .map(|(p, _)| p.clone())
                .collect()
        };
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(self.config.gossip_degree);

        let rpc = Rpc {
            control: Some(ControlMessage {
                ihave: vec![ControlIHave {
                    topic: topic.to_string(),
                    message_ids: ids.into_iter().map(|id| id.0).collect(),
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        for p in candidates {
            self.send_to(&p, rpc.clone()).await;
        }
    }
}

impl Drop for GossipSubRouter {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat_task.lock().take() {
            handle.abort();
        }
    }
}
