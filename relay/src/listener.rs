// Copyright (c) 2024 Botho Foundation

//! `RelayListener`: the accept-queue half of the listener registry
//! (§4.5). Inbound Stop streams are pushed in by
//! [`crate::client::RelayClient::handle_inbound_stop`]; application code
//! pulls them out with [`RelayListener::accept`].
//!
//! The registry pattern — rather than polling `client.accept_connection`
//! in a loop — lets an arbitrary number of listeners on different relays
//! each get O(1) delivery with no wakeup beyond the one they need.

use crate::connection::RelayedConnection;
use crate::error::{RelayError, RelayResult};
use crate::reservation::Reservation;
use bth_p2p_identity::{Multiaddr, PeerId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::debug;

/// Something a [`RelayListener`] unregisters itself from on close. The
/// listener holds this weakly; [`crate::client::RelayClient`] is the
/// strong owner of the listener, so a strong back-edge here would be a
/// reference cycle.
pub(crate) trait ListenerRegistry: Send + Sync {
    fn unregister_listener(&self, relay: &PeerId);
}

struct ListenerState {
    reservation: Reservation,
    closed: bool,
    queue: VecDeque<RelayedConnection>,
    waiter: Option<oneshot::Sender<RelayedConnection>>,
}

/// The accept-queue side of one relay's listener: every inbound circuit
/// dispatched to this relay is enqueued here until `accept()` drains it.
pub struct RelayListener {
    relay_peer: PeerId,
    local_address: Multiaddr,
    registry: Weak<dyn ListenerRegistry>,
    queue_cap: usize,
    state: Mutex<ListenerState>,
    accept_serialize: AsyncMutex<()>,
    expiration_task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayListener {
    pub(crate) fn new(
        relay_peer: PeerId,
        local_address: Multiaddr,
        reservation: Reservation,
        registry: Weak<dyn ListenerRegistry>,
        queue_cap: usize,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            relay_peer,
            local_address,
            registry,
            queue_cap: queue_cap.max(1),
            state: Mutex::new(ListenerState {
                reservation: reservation.clone(),
                closed: false,
                queue: VecDeque::new(),
                waiter: None,
            }),
            accept_serialize: AsyncMutex::new(()),
            expiration_task: Mutex::new(None),
        });
        this.spawn_expiration_task(&reservation);
        this
    }

    /// The relay this listener is registered with.
    pub fn relay_peer(&self) -> &PeerId {
        &self.relay_peer
    }

    /// The base address the relay advertises on our behalf (without the
    /// trailing `/p2p/<self>`).
    pub fn local_address(&self) -> &Multiaddr {
        &self.local_address
    }

    /// The reservation currently backing this listener.
    pub fn reservation(&self) -> Reservation {
        self.state.lock().reservation.clone()
    }

    /// Whether this listener has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn spawn_expiration_task(self: &Arc<Self>, reservation: &Reservation) {
        let weak = Arc::downgrade(self);
        let sleep_for = reservation.remaining();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(sleep_for).await;
            if let Some(this) = weak.upgrade() {
                if !this.is_closed() {
                    debug!(relay = %this.relay_peer, "reservation expired without renewal, closing listener");
                    this.close().await;
                }
            }
        });
        if let Some(old) = self.expiration_task.lock().replace(handle) {
            old.abort();
        }
    }

    /// Record a freshly renewed reservation and reschedule the expiration
    /// monitor against its new deadline.
    pub(crate) fn update_reservation(self: &Arc<Self>, reservation: Reservation) {
        self.state.lock().reservation = reservation.clone();
        self.spawn_expiration_task(&reservation);
    }

    /// Push an inbound circuit onto this listener: hand it directly to a
    /// waiting `accept()` if one exists, otherwise append to the bounded
    /// FIFO, dropping (and closing) the oldest entry if it was already at
    /// capacity. If the listener is closed, `conn` is closed immediately
    /// instead.
    pub(crate) async fn enqueue(&self, conn: RelayedConnection) {
        enum Outcome {
            Dropped(RelayedConnection),
            HandedOff,
            Queued(Option<RelayedConnection>),
        }

        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                Outcome::Dropped(conn)
            } else if let Some(waiter) = state.waiter.take() {
                match waiter.send(conn) {
                    Ok(()) => Outcome::HandedOff,
                    Err(conn) => {
                        // The accepter cancelled between registering the
                        // waiter and us sending to it; fall through to the
                        // queue instead of losing the connection.
                        state.queue.push_back(conn);
                        let dropped = if state.queue.len() > self.queue_cap {
                            state.queue.pop_front()
                        } else {
                            None
                        };
                        Outcome::Queued(dropped)
                    }
                }
            } else {
                state.queue.push_back(conn);
                let dropped = if state.queue.len() > self.queue_cap {
                    state.queue.pop_front()
                } else {
                    None
                };
                Outcome::Queued(dropped)
            }
        };

        match outcome {
            Outcome::Dropped(conn) => {
                let _ = conn.close().await;
            }
            Outcome::HandedOff => {}
            Outcome::Queued(Some(dropped)) => {
                let _ = dropped.close().await;
            }
            Outcome::Queued(None) => {}
        }
    }

    /// Wait for the next inbound circuit. Only one `accept()` call is
    /// serviced at a time — concurrent callers queue behind an internal
    /// lock rather than racing for the single waiter slot.
    pub async fn accept(&self) -> RelayResult<RelayedConnection> {
        let _serialize = self.accept_serialize.lock().await;
        loop {
            enum Next {
                Ready(RelayResult<RelayedConnection>),
                Wait(oneshot::Receiver<RelayedConnection>),
            }

            let next = {
                let mut state = self.state.lock();
                if state.closed {
                    Next::Ready(Err(RelayError::ListenerClosed))
                } else if let Some(conn) = state.queue.pop_front() {
                    Next::Ready(Ok(conn))
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.waiter = Some(tx);
                    Next::Wait(rx)
                }
            };

            match next {
                Next::Ready(result) => return result,
                Next::Wait(rx) => {
                    // If this future is dropped (cancelled) while awaiting
                    // `rx`, the guard below clears the stale waiter slot so
                    // a later `enqueue` doesn't hand a connection to a
                    // vanished accepter.
                    let guard = WaiterGuard {
                        state: &self.state,
                        armed: true,
                    };
                    match rx.await {
                        Ok(conn) => {
                            std::mem::forget(guard);
                            return Ok(conn);
                        }
                        Err(_) => {
                            std::mem::forget(guard);
                            // Sender dropped without sending: either the
                            // listener closed concurrently, or enqueue's
                            // race fallback used the queue instead. Either
                            // way, loop and re-check.
                            continue;
                        }
                    }
                }
            }
        }
    }

    /// Tear the listener down: unregister from the client, cancel the
    /// expiration monitor, resume any waiting accepter with
    /// `ListenerClosed`, and close every queued connection. Idempotent.
    pub async fn close(&self) {
        let (already_closed, waiter, queued) = {
            let mut state = self.state.lock();
            if state.closed {
                (true, None, Vec::new())
            } else {
                state.closed = true;
                (false, state.waiter.take(), state.queue.drain(..).collect::<Vec<_>>())
            }
        };
        if already_closed {
            return;
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.unregister_listener(&self.relay_peer);
        }
        if let Some(handle) = self.expiration_task.lock().take() {
            handle.abort();
        }
        drop(waiter);

        for conn in queued {
            let _ = conn.close().await;
        }
    }
}

/// Clears this listener's waiter slot if still set, unless disarmed by
/// `std::mem::forget` (the paths where the waiter was already consumed by
/// `rx.await` resolving).
struct WaiterGuard<'a> {
    state: &'a Mutex<ListenerState>,
    armed: bool,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().waiter = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bth_p2p_identity::{Ed25519KeyPair, KeyPair};
    use bth_p2p_mux::{MplexConfig, MplexConnection};
    use std::collections::VecDeque as StdVecDeque;
    use std::time::Duration;
    use tokio::sync::Mutex as TokioMutex;

    struct NoopRegistry;
    impl ListenerRegistry for NoopRegistry {
        fn unregister_listener(&self, _relay: &PeerId) {}
    }

    struct NullConnection {
        local_peer: PeerId,
        remote_peer: PeerId,
        address: Multiaddr,
        inbound: Arc<TokioMutex<StdVecDeque<u8>>>,
    }

    #[async_trait::async_trait]
    impl bth_p2p_core::SecuredConnection for NullConnection {
        fn local_peer(&self) -> &PeerId {
            &self.local_peer
        }
        fn remote_peer(&self) -> &PeerId {
            &self.remote_peer
        }
        fn local_address(&self) -> &Multiaddr {
            &self.address
        }
        fn remote_address(&self) -> &Multiaddr {
            &self.address
        }
        async fn read(&mut self, _buf: &mut [u8]) -> bth_p2p_core::CoreResult<usize> {
            std::future::pending().await
        }
        async fn write(&mut self, buf: &[u8]) -> bth_p2p_core::CoreResult<()> {
            self.inbound.lock().await.extend(buf.iter().copied());
            Ok(())
        }
        async fn close(&mut self) -> bth_p2p_core::CoreResult<()> {
            Ok(())
        }
    }

    async fn test_conn(tag: u8) -> RelayedConnection {
        let relay = Ed25519KeyPair::from_bytes(&[10u8; 32]).peer_id();
        let local = Ed25519KeyPair::from_bytes(&[11u8; 32]).peer_id();
        let remote = Ed25519KeyPair::from_bytes(&[tag; 32]).peer_id();
        let secured: Box<dyn bth_p2p_core::SecuredConnection> = Box::new(NullConnection {
            local_peer: local.clone(),
            remote_peer: remote.clone(),
            address: Multiaddr::empty(),
            inbound: Arc::new(TokioMutex::new(StdVecDeque::new())),
        });
        let mplex = MplexConnection::new(secured, true, MplexConfig::default());
        let stream = mplex.new_stream().await.unwrap();
        RelayedConnection::new(stream, relay, &local, remote, None)
    }

    fn long_lived_reservation() -> Reservation {
        Reservation {
            relay_peer: Ed25519KeyPair::from_bytes(&[10u8; 32]).peer_id(),
            expires_at: std::time::Instant::now() + Duration::from_secs(3600),
            data_limit_bytes: None,
            duration_limit: None,
            advertised_addrs: vec![],
        }
    }

    fn test_listener() -> Arc<RelayListener> {
        let relay = Ed25519KeyPair::from_bytes(&[10u8; 32]).peer_id();
        let registry: Arc<dyn ListenerRegistry> = Arc::new(NoopRegistry);
        RelayListener::new(
            relay,
            Multiaddr::empty(),
            long_lived_reservation(),
            Arc::downgrade(&registry),
            64,
        )
    }

    #[tokio::test]
    async fn enqueue_then_accept_returns_the_same_connection() {
        let listener = test_listener();
        let conn = test_conn(1).await;
        let remote = conn.remote_peer().clone();
        listener.enqueue(conn).await;
        let accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.remote_peer(), &remote);
    }

    #[tokio::test]
    async fn waiting_accepter_is_handed_off_directly() {
        let listener = test_listener();
        let accept_task = tokio::spawn({
            let listener = listener.clone();
            async move { listener.accept().await }
        });
        tokio::task::yield_now().await;
        let conn = test_conn(2).await;
        let remote = conn.remote_peer().clone();
        listener.enqueue(conn).await;
        let accepted = accept_task.await.unwrap().unwrap();
        assert_eq!(accepted.remote_peer(), &remote);
    }

    #[tokio::test]
    async fn full_queue_drops_exactly_the_oldest() {
        let relay = Ed25519KeyPair::from_bytes(&[10u8; 32]).peer_id();
        let registry: Arc<dyn ListenerRegistry> = Arc::new(NoopRegistry);
        let listener = RelayListener::new(
            relay,
            Multiaddr::empty(),
            long_lived_reservation(),
            Arc::downgrade(&registry),
            2,
        );
        listener.enqueue(test_conn(1).await).await;
        listener.enqueue(test_conn(2).await).await;
        listener.enqueue(test_conn(3).await).await;

        let first = listener.accept().await.unwrap();
        let second = listener.accept().await.unwrap();
        assert_eq!(first.remote_peer(), &Ed25519KeyPair::from_bytes(&[2u8; 32]).peer_id());
        assert_eq!(second.remote_peer(), &Ed25519KeyPair::from_bytes(&[3u8; 32]).peer_id());
    }

    #[tokio::test]
    async fn close_resumes_waiting_accepter_with_listener_closed() {
        let listener = test_listener();
        let accept_task = tokio::spawn({
            let listener = listener.clone();
            async move { listener.accept().await }
        });
        tokio::task::yield_now().await;
        listener.close().await;
        assert_eq!(accept_task.await.unwrap().unwrap_err(), RelayError::ListenerClosed);
    }

    #[tokio::test]
    async fn close_drains_and_closes_queued_connections() {
        let listener = test_listener();
        listener.enqueue(test_conn(1).await).await;
        listener.enqueue(test_conn(2).await).await;
        listener.close().await;
        assert_eq!(listener.accept().await.unwrap_err(), RelayError::ListenerClosed);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let listener = test_listener();
        listener.close().await;
        listener.close().await;
    }
}
