// Copyright (c) 2024 Botho Foundation

//! `RelayClient`: reservation lifecycle, outbound circuits, and the
//! inbound listener registry for Circuit Relay v2 (§4.5).
//!
//! Opening the Hop stream itself is outside this crate's remit — a
//! [`HopDialer`] supplies one on demand, leaving connection management
//! (which peers we're already connected to, how to dial new ones) to
//! whatever owns the rest of the networking stack.

use crate::config::RelayConfig;
use crate::connection::RelayedConnection;
use crate::error::{RelayError, RelayResult};
use crate::events::RelayEvent;
use crate::listener::{ListenerRegistry, RelayListener};
use crate::reservation::Reservation;
use crate::wire::{self, HopMessage, HopType, Status, StopMessage, StopType};
use async_trait::async_trait;
use bth_p2p_core::EventBus;
use bth_p2p_identity::PeerId;
use bth_p2p_mux::MplexStream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Something that can open a fresh Hop stream to a relay.
///
/// Implemented by whatever owns dialing and per-peer connections; the
/// relay client itself never looks up or establishes a transport
/// connection.
#[async_trait]
pub trait HopDialer: Send + Sync {
    /// Open a new stream to `relay` for the Hop protocol.
    async fn open_hop_stream(&self, relay: &PeerId) -> RelayResult<Arc<MplexStream>>;
}

struct ClientState {
    reservations: HashMap<PeerId, Reservation>,
    listeners: HashMap<PeerId, Arc<RelayListener>>,
    renewal_tasks: HashMap<PeerId, JoinHandle<()>>,
}

/// Circuit Relay v2 client: `reserve` and its auto-renewal, outbound
/// `connect_through`, and inbound dispatch via `handle_inbound_stop`.
pub struct RelayClient {
    local_peer: PeerId,
    config: RelayConfig,
    dialer: Arc<dyn HopDialer>,
    events: EventBus<RelayEvent>,
    state: Mutex<ClientState>,
}

impl RelayClient {
    /// Build a client around `dialer`.
    pub fn new(local_peer: PeerId, config: RelayConfig, dialer: Arc<dyn HopDialer>) -> Arc<Self> {
        Arc::new(Self {
            local_peer,
            config,
            dialer,
            events: EventBus::new(),
            state: Mutex::new(ClientState {
                reservations: HashMap::new(),
                listeners: HashMap::new(),
                renewal_tasks: HashMap::new(),
            }),
        })
    }

    /// This node's own identity.
    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// The reservation currently held with `relay`, if any.
    pub fn reservation(&self, relay: &PeerId) -> Option<Reservation> {
        self.state.lock().reservations.get(relay).cloned()
    }

    /// The listener registered against `relay`'s reservation, if any.
    pub fn listener(&self, relay: &PeerId) -> Option<Arc<RelayListener>> {
        self.state.lock().listeners.get(relay).cloned()
    }

    /// Request a reservation with `relay`, returning the listener that
    /// will receive circuits relayed to us through it.
    ///
    /// If [`RelayConfig::auto_renew_reservations`] is set, a background
    /// task repeats `RESERVE` at `expiration - renewal_lead_time` for as
    /// long as the listener stays open, retrying on failure until the
    /// reservation's own expiration passes.
    pub async fn reserve(self: &Arc<Self>, relay: PeerId) -> RelayResult<Arc<RelayListener>> {
        let reservation = self.request_reservation(&relay).await?;

        let listener = {
            let mut state = self.state.lock();
            match state.listeners.get(&relay) {
                Some(existing) => {
                    existing.update_reservation(reservation.clone());
                    existing.clone()
                }
                None => {
                    let registry: std::sync::Weak<dyn ListenerRegistry> = Arc::downgrade(self);
                    let local_address = reservation
                        .advertised_addrs
                        .first()
                        .cloned()
                        .unwrap_or_else(bth_p2p_identity::Multiaddr::empty);
                    let listener = RelayListener::new(
                        relay.clone(),
                        local_address,
                        reservation.clone(),
                        registry,
                        self.config.listener_queue_cap,
                    );
                    state.listeners.insert(relay.clone(), listener.clone());
                    listener
                }
            }
        };
        self.state.lock().reservations.insert(relay.clone(), reservation);
        self.events.publish(RelayEvent::ReservationObtained { relay: relay.clone() });

        if self.config.auto_renew_reservations {
            self.spawn_renewal_task(relay);
        }

        Ok(listener)
    }

    fn spawn_renewal_task(self: &Arc<Self>, relay: PeerId) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                let (sleep_for, still_registered) = match weak.upgrade() {
                    Some(this) => {
                        let reservation = this.state.lock().reservations.get(&relay).cloned();
                        match reservation {
                            Some(r) if !r.is_expired() => {
                                let lead = this.config.renewal_lead_time;
                                (r.remaining().saturating_sub(lead), true)
                            }
                            _ => (std::time::Duration::ZERO, false),
                        }
                    }
                    None => return,
                };
                if !still_registered {
                    return;
                }
                tokio::time::sleep(sleep_for).await;

                let Some(this) = weak.upgrade() else { return };
                if this.state.lock().listeners.get(&relay).is_none() {
                    return;
                }
                match this.request_reservation(&relay).await {
                    Ok(reservation) => {
                        if let Some(listener) = this.state.lock().listeners.get(&relay).cloned() {
                            listener.update_reservation(reservation.clone());
                        }
                        this.state.lock().reservations.insert(relay.clone(), reservation);
                        this.events.publish(RelayEvent::ReservationRenewed { relay: relay.clone() });
                        debug!(%relay, "renewed relay reservation");
                    }
                    Err(err) => {
                        this.events.publish(RelayEvent::ReservationRenewalFailed {
                            relay: relay.clone(),
                            reason: err.to_string(),
                        });
                        warn!(%relay, %err, "reservation renewal failed, will retry");
                        // Retry again before giving up; once the reservation
                        // itself expires the next loop iteration's
                        // `is_expired` check ends the task.
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    }
                }
            }
        });
        if let Some(old) = self.state.lock().renewal_tasks.insert(relay, handle) {
            old.abort();
        }
    }

    async fn request_reservation(&self, relay: &PeerId) -> RelayResult<Reservation> {
        let stream = self.dialer.open_hop_stream(relay).await?;
        let response = timeout(
            self.config.reservation_request_timeout,
            self.hop_round_trip(&stream, HopMessage::reserve()),
        )
        .await
        .map_err(|_| RelayError::Timeout)??;
        let _ = stream.close().await;

        match response.status {
            Some(Status::Ok) => {
                let wire_reservation = response
                    .reservation
                    .ok_or_else(|| RelayError::MalformedMessage("STATUS(OK) missing reservation".into()))?;
                Reservation::from_wire(relay.clone(), &wire_reservation, response.limit)
            }
            Some(status) => Err(status.into_error()),
            None => Err(RelayError::MalformedMessage("STATUS response missing status".into())),
        }
    }

    /// Open a circuit to `target` through `relay`.
    ///
    /// On a successful `STATUS(OK)` response the same Hop stream becomes
    /// the data channel for the circuit.
    pub async fn connect_through(&self, relay: PeerId, target: PeerId) -> RelayResult<RelayedConnection> {
        let stream = self.dialer.open_hop_stream(&relay).await?;
        let response = timeout(
            self.config.reservation_request_timeout,
            self.hop_round_trip(&stream, HopMessage::connect(target.as_bytes())),
        )
        .await
        .map_err(|_| RelayError::Timeout)??;

        match response.status {
            Some(Status::Ok) => Ok(RelayedConnection::new(
                stream,
                relay,
                &self.local_peer,
                target,
                response.limit,
            )),
            Some(status) => {
                let _ = stream.close().await;
                Err(status.into_error())
            }
            None => {
                let _ = stream.close().await;
                Err(RelayError::MalformedMessage("STATUS response missing status".into()))
            }
        }
    }

    async fn hop_round_trip(&self, stream: &MplexStream, request: HopMessage) -> RelayResult<HopMessage> {
        stream
            .write(&request.encode_framed())
            .await
            .map_err(|_| RelayError::ConnectionClosed)?;
        let body = read_framed_message(stream).await?;
        let response = HopMessage::decode(&body)?;
        if response.typ != Some(HopType::Status) {
            return Err(RelayError::MalformedMessage("expected STATUS response".into()));
        }
        Ok(response)
    }

    /// Handle a Stop stream the relay opened to forward an inbound
    /// circuit.
    ///
    /// `relay` is the peer the underlying connection carrying `stream`
    /// authenticated as — the Stop protocol only ever runs between a
    /// client and its own relay, so whatever dispatches streams by
    /// protocol id already knows which peer this is; it is not carried in
    /// the message itself.
    pub async fn handle_inbound_stop(self: &Arc<Self>, relay: PeerId, stream: Arc<MplexStream>) -> RelayResult<()> {
        let body = read_framed_message(&stream).await?;
        let request = StopMessage::decode(&body)?;
        if request.typ != Some(StopType::Connect) {
            let _ = stream
                .write(&StopMessage::status(Status::MalformedMessage).encode_framed())
                .await;
            let _ = stream.close().await;
            return Err(RelayError::MalformedMessage("expected CONNECT request".into()));
        }
        let source = PeerId::from_bytes_unchecked(
            request
                .peer
                .ok_or_else(|| RelayError::MalformedMessage("CONNECT missing peer".into()))?,
        );

        let listener = self.state.lock().listeners.get(&relay).cloned();
        let Some(listener) = listener else {
            let _ = stream
                .write(&StopMessage::status(Status::ResourceLimitExceeded).encode_framed())
                .await;
            let _ = stream.close().await;
            self.events.publish(RelayEvent::CircuitRejectedNoListener { relay });
            return Err(RelayError::NoReservation);
        };

        stream
            .write(&StopMessage::status(Status::Ok).encode_framed())
            .await
            .map_err(|_| RelayError::ConnectionClosed)?;

        let conn = RelayedConnection::new(stream, relay.clone(), &self.local_peer, source.clone(), request.limit);
        listener.enqueue(conn).await;
        self.events.publish(RelayEvent::CircuitAccepted { relay, source });
        Ok(())
    }

    /// Release the reservation and close the listener for `relay`, if one
    /// is open. Idempotent.
    pub async fn release(&self, relay: &PeerId) {
        let (listener, renewal_task) = {
            let mut state = self.state.lock();
            state.reservations.remove(relay);
            (state.listeners.remove(relay), state.renewal_tasks.remove(relay))
        };
        if let Some(task) = renewal_task {
            task.abort();
        }
        if let Some(listener) = listener {
            listener.close().await;
        }
    }
}

impl ListenerRegistry for RelayClient {
    fn unregister_listener(&self, relay: &PeerId) {
        let mut state = self.state.lock();
        state.listeners.remove(relay);
        if let Some(task) = state.renewal_tasks.remove(relay) {
            task.abort();
        }
        drop(state);
        self.events.publish(RelayEvent::ListenerClosed { relay: relay.clone() });
    }
}

/// Accumulate bytes off `stream` until one complete length-prefixed
/// message is available, then return its decoded body.
async fn read_framed_message(stream: &MplexStream) -> RelayResult<Vec<u8>> {
    let mut rolling = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        if let Some((body, _consumed)) = wire::try_split_framed(&rolling)? {
            return Ok(body);
        }
        let n = stream.read(&mut buf).await.map_err(|_| RelayError::ConnectionClosed)?;
        if n == 0 {
            return Err(RelayError::ConnectionClosed);
        }
        rolling.extend_from_slice(&buf[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bth_p2p_identity::{Ed25519KeyPair, KeyPair, Multiaddr};
    use bth_p2p_mux::{MplexConfig, MplexConnection};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A loopback secured connection: writes to one end arrive as reads on
    /// the paired end, same shape as the paired fixtures in the mux tests.
    struct PairedConnection {
        local_peer: PeerId,
        remote_peer: PeerId,
        inbound: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
        outbound: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
        leftover: Vec<u8>,
    }

    #[async_trait]
    impl bth_p2p_core::SecuredConnection for PairedConnection {
        fn local_peer(&self) -> &PeerId {
            &self.local_peer
        }
        fn remote_peer(&self) -> &PeerId {
            &self.remote_peer
        }
        fn local_address(&self) -> &Multiaddr {
            static EMPTY: std::sync::OnceLock<Multiaddr> = std::sync::OnceLock::new();
            EMPTY.get_or_init(Multiaddr::empty)
        }
        fn remote_address(&self) -> &Multiaddr {
            self.local_address()
        }
        async fn read(&mut self, buf: &mut [u8]) -> bth_p2p_core::CoreResult<usize> {
            if self.leftover.is_empty() {
                match self.inbound.recv().await {
                    Some(chunk) => self.leftover = chunk,
                    None => return Ok(0),
                }
            }
            let n = buf.len().min(self.leftover.len());
            buf[..n].copy_from_slice(&self.leftover[..n]);
            self.leftover.drain(..n);
            Ok(n)
        }
        async fn write(&mut self, buf: &[u8]) -> bth_p2p_core::CoreResult<()> {
            self.outbound.send(buf.to_vec()).map_err(|_| bth_p2p_core::CoreError::ConnectionClosed)
        }
        async fn close(&mut self) -> bth_p2p_core::CoreResult<()> {
            Ok(())
        }
    }

    fn paired_mplex(local: PeerId, remote: PeerId) -> (Arc<MplexConnection>, Arc<MplexConnection>) {
        let (a_to_b_tx, a_to_b_rx) = tokio::sync::mpsc::unbounded_channel();
        let (b_to_a_tx, b_to_a_rx) = tokio::sync::mpsc::unbounded_channel();

        let client_side = Box::new(PairedConnection {
            local_peer: local.clone(),
            remote_peer: remote.clone(),
            inbound: b_to_a_rx,
            outbound: a_to_b_tx,
            leftover: Vec::new(),
        });
        let relay_side = Box::new(PairedConnection {
            local_peer: remote,
            remote_peer: local,
            inbound: a_to_b_rx,
            outbound: b_to_a_tx,
            leftover: Vec::new(),
        });

        (
            MplexConnection::new(client_side, true, MplexConfig::default()),
            MplexConnection::new(relay_side, false, MplexConfig::default()),
        )
    }

    fn peer(tag: u8) -> PeerId {
        Ed25519KeyPair::from_bytes(&[tag; 32]).peer_id()
    }

    struct DirectDialer {
        relay_side: Arc<MplexConnection>,
        hops: AtomicUsize,
    }

    #[async_trait]
    impl HopDialer for DirectDialer {
        async fn open_hop_stream(&self, _relay: &PeerId) -> RelayResult<Arc<MplexStream>> {
            self.hops.fetch_add(1, Ordering::SeqCst);
            Ok(self.relay_side.new_stream().await?)
        }
    }

    /// A minimal relay-side Hop responder: accepts exactly one stream,
    /// replies `STATUS(OK)` with a short-lived reservation.
    async fn respond_reserve_ok(relay_side: Arc<MplexConnection>, lifetime_secs: u64) {
        let stream = relay_side.accept_stream().await.unwrap();
        let body = read_framed_message(&stream).await.unwrap();
        let request = HopMessage::decode(&body).unwrap();
        assert_eq!(request.typ, Some(HopType::Reserve));

        let response = HopMessage {
            typ: Some(HopType::Status),
            status: Some(Status::Ok),
            reservation: Some(wire::Reservation {
                expire_unix_secs: now_unix() + lifetime_secs,
                addrs: vec![],
            }),
            ..Default::default()
        };
        stream.write(&response.encode_framed()).await.unwrap();
    }

    fn now_unix() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    #[tokio::test]
    async fn reserve_stores_reservation_and_registers_listener() {
        let client_peer = peer(1);
        let relay_peer = peer(2);
        let (client_side, relay_side) = paired_mplex(client_peer.clone(), relay_peer.clone());

        let dialer = Arc::new(DirectDialer {
            relay_side: client_side,
            hops: AtomicUsize::new(0),
        });
        let client = RelayClient::new(
            client_peer,
            RelayConfig::builder().with_auto_renew_reservations(false).build(),
            dialer,
        );

        let responder = tokio::spawn(respond_reserve_ok(relay_side, 3600));
        let listener = client.reserve(relay_peer.clone()).await.unwrap();
        responder.await.unwrap();

        assert!(client.reservation(&relay_peer).is_some());
        assert_eq!(listener.relay_peer(), &relay_peer);
    }

    #[tokio::test]
    async fn connect_through_wraps_stream_on_status_ok() {
        let client_peer = peer(1);
        let relay_peer = peer(2);
        let target_peer = peer(3);
        let (client_side, relay_side) = paired_mplex(client_peer.clone(), relay_peer.clone());

        let dialer = Arc::new(DirectDialer {
            relay_side: client_side,
            hops: AtomicUsize::new(0),
        });
        let client = RelayClient::new(client_peer, RelayConfig::default(), dialer);

        let responder = tokio::spawn(async move {
            let stream = relay_side.accept_stream().await.unwrap();
            let body = read_framed_message(&stream).await.unwrap();
            let request = HopMessage::decode(&body).unwrap();
            assert_eq!(request.typ, Some(HopType::Connect));
            let response = HopMessage {
                typ: Some(HopType::Status),
                status: Some(Status::Ok),
                ..Default::default()
            };
            stream.write(&response.encode_framed()).await.unwrap();
        });

        let conn = client.connect_through(relay_peer.clone(), target_peer.clone()).await.unwrap();
        responder.await.unwrap();
        assert_eq!(conn.relay_peer(), &relay_peer);
        assert_eq!(conn.remote_peer(), &target_peer);
    }

    #[tokio::test]
    async fn connect_through_surfaces_rejection_status() {
        let client_peer = peer(1);
        let relay_peer = peer(2);
        let target_peer = peer(3);
        let (client_side, relay_side) = paired_mplex(client_peer.clone(), relay_peer.clone());

        let dialer = Arc::new(DirectDialer {
            relay_side: client_side,
            hops: AtomicUsize::new(0),
        });
        let client = RelayClient::new(client_peer, RelayConfig::default(), dialer);

        let responder = tokio::spawn(async move {
            let stream = relay_side.accept_stream().await.unwrap();
            let _ = read_framed_message(&stream).await.unwrap();
            let response = HopMessage {
                typ: Some(HopType::Status),
                status: Some(Status::ResourceLimitExceeded),
                ..Default::default()
            };
            stream.write(&response.encode_framed()).await.unwrap();
        });

        let err = client.connect_through(relay_peer, target_peer).await.unwrap_err();
        responder.await.unwrap();
        assert_eq!(err, RelayError::ResourceLimitExceeded);
    }

    #[tokio::test]
    async fn handle_inbound_stop_enqueues_on_matching_listener() {
        let client_peer = peer(1);
        let relay_peer = peer(2);
        let source_peer = peer(3);
        let (client_side, relay_side) = paired_mplex(client_peer.clone(), relay_peer.clone());

        let dialer = Arc::new(DirectDialer {
            relay_side: client_side.clone(),
            hops: AtomicUsize::new(0),
        });
        let client = RelayClient::new(
            client_peer,
            RelayConfig::builder().with_auto_renew_reservations(false).build(),
            dialer,
        );

        let responder = tokio::spawn(respond_reserve_ok(relay_side.clone(), 3600));
        let listener = client.reserve(relay_peer.clone()).await.unwrap();
        responder.await.unwrap();

        let inbound_stream = relay_side.new_stream().await.unwrap();
        let request = StopMessage {
            typ: Some(StopType::Connect),
            peer: Some(source_peer.as_bytes().to_vec()),
            ..Default::default()
        };
        inbound_stream.write(&request.encode_framed()).await.unwrap();

        let client_stream = client_side.accept_stream().await.unwrap();
        client.handle_inbound_stop(relay_peer.clone(), client_stream).await.unwrap();

        let accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.remote_peer(), &source_peer);

        let body = read_framed_message(&inbound_stream).await.unwrap();
        let response = StopMessage::decode(&body).unwrap();
        assert_eq!(response.status, Some(Status::Ok));
    }

    #[tokio::test]
    async fn handle_inbound_stop_rejects_when_no_listener_registered() {
        let client_peer = peer(1);
        let relay_peer = peer(2);
        let source_peer = peer(3);
        let (client_side, relay_side) = paired_mplex(client_peer.clone(), relay_peer.clone());

        let dialer = Arc::new(DirectDialer {
            relay_side: client_side.clone(),
            hops: AtomicUsize::new(0),
        });
        let client = RelayClient::new(client_peer, RelayConfig::default(), dialer);

        let inbound_stream = relay_side.new_stream().await.unwrap();
        let request = StopMessage {
            typ: Some(StopType::Connect),
            peer: Some(source_peer.as_bytes().to_vec()),
            ..Default::default()
        };
        inbound_stream.write(&request.encode_framed()).await.unwrap();

        let client_stream = client_side.accept_stream().await.unwrap();
        let err = client.handle_inbound_stop(relay_peer, client_stream).await.unwrap_err();
        assert_eq!(err, RelayError::NoReservation);

        let body = read_framed_message(&inbound_stream).await.unwrap();
        let response = StopMessage::decode(&body).unwrap();
        assert_eq!(response.status, Some(Status::ResourceLimitExceeded));
    }

    #[tokio::test]
    async fn release_closes_listener_and_forgets_reservation() {
        let client_peer = peer(1);
        let relay_peer = peer(2);
        let (client_side, relay_side) = paired_mplex(client_peer.clone(), relay_peer.clone());

        let dialer = Arc::new(DirectDialer {
            relay_side: client_side,
            hops: AtomicUsize::new(0),
        });
        let client = RelayClient::new(
            client_peer,
            RelayConfig::builder().with_auto_renew_reservations(false).build(),
            dialer,
        );

        let responder = tokio::spawn(respond_reserve_ok(relay_side, 3600));
        let listener = client.reserve(relay_peer.clone()).await.unwrap();
        responder.await.unwrap();

        client.release(&relay_peer).await;
        assert!(client.reservation(&relay_peer).is_none());
        assert!(client.listener(&relay_peer).is_none());
        assert_eq!(listener.accept().await.unwrap_err(), RelayError::ListenerClosed);
    }
}
