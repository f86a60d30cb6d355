// Copyright (c) 2024 Botho Foundation

//! Router lifecycle events and the per-topic message subscription handle.

use bth_p2p_identity::PeerId;
use tokio::sync::mpsc;

/// A message delivered to a local topic subscriber.
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    /// The topic it was published to.
    pub topic: String,
    /// The publisher, if the authenticity mode carries one.
    pub source: Option<PeerId>,
    /// The application payload.
    pub data: Vec<u8>,
}

/// A lazy, finite sequence of messages delivered to a single
/// `subscribe()` call. Ends (further `recv` calls return `None`) when the
/// router unsubscribes this topic or shuts down.
pub struct Subscription {
    topic: String,
    receiver: mpsc::Receiver<DeliveredMessage>,
}

impl Subscription {
    pub(crate) fn new(topic: String, receiver: mpsc::Receiver<DeliveredMessage>) -> Self {
        Self { topic, receiver }
    }

    /// The topic this subscription was created for.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Await the next delivered message, or `None` once the subscription
    /// has ended.
    pub async fn recv(&mut self) -> Option<DeliveredMessage> {
        self.receiver.recv().await
    }
}

/// Lifecycle and diagnostic events emitted by the router, independent of
/// any single topic subscription.
#[derive(Debug, Clone)]
pub enum GossipEvent {
    /// `peer` announced a new subscription to `topic`.
    PeerSubscribed {
        /// The announcing peer.
        peer: PeerId,
        /// The topic.
        topic: String,
    },
    /// `peer` announced it unsubscribed from `topic`.
    PeerUnsubscribed {
        /// The peer.
        peer: PeerId,
        /// The topic.
        topic: String,
    },
    /// `peer` was added to `topic`'s mesh (our GRAFT was sent or accepted).
    Grafted {
        /// The peer.
        peer: PeerId,
        /// The topic.
        topic: String,
    },
    /// `peer` was removed from `topic`'s mesh.
    Pruned {
        /// The peer.
        peer: PeerId,
        /// The topic.
        topic: String,
    },
    /// `peer` joined `topic`'s mesh (emitted alongside `Grafted` on the
    /// accepting side, matching §4.4's "grafted + peerJoinedMesh").
    PeerJoinedMesh {
        /// The peer.
        peer: PeerId,
        /// The topic.
        topic: String,
    },
    /// A message from `peer` was dropped by validation, with the reason.
    MessageRejected {
        /// The sending peer.
        peer: PeerId,
        /// Why the message was rejected.
        reason: String,
    },
    /// `peer`'s score crossed below the graylist threshold.
    PeerGraylisted {
        /// The peer.
        peer: PeerId,
    },
    /// Peer-exchange suggestions were surfaced from a PRUNE.
    PeerExchangeSuggestions {
        /// The peer that sent the PRUNE.
        from: PeerId,
        /// Suggested peer-id bytes.
        suggestions: Vec<Vec<u8>>,
    },
}
