// Copyright (c) 2024 Botho Foundation

//! `MplexConnection`: stream-id allocation, the background frame reader,
//! and the inbound-stream accept queue over one secured connection.

use crate::config::MplexConfig;
use crate::error::{MuxError, MuxResult};
use crate::frame::{Flag, Frame};
use crate::stream::{MplexStream, SharedConnection};
use bth_p2p_core::SecuredConnection;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A stream's true key: mplex allocates ids independently per side, so the
/// same numeric id can simultaneously name one stream we opened and one
/// the peer opened.
type StreamKey = (u64, bool);

/// Owns one secured connection, multiplexing it into many streams.
pub struct MplexConnection {
    connection: SharedConnection,
    is_initiator: bool,
    config: MplexConfig,
    next_id: Mutex<u64>,
    streams: Mutex<HashMap<StreamKey, Arc<MplexStream>>>,
    inbound_tx: Mutex<Option<mpsc::Sender<Arc<MplexStream>>>>,
    inbound_rx: AsyncMutex<mpsc::Receiver<Arc<MplexStream>>>,
    closed: AtomicBool,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl MplexConnection {
    /// Wrap `connection`, spawning the single background reader task.
    ///
    /// `is_initiator` reflects which side dialed the underlying connection;
    /// it has no bearing on per-stream id allocation, which each side does
    /// independently regardless of who dialed.
    pub fn new(
        connection: Box<dyn SecuredConnection>,
        is_initiator: bool,
        config: MplexConfig,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.max_pending_inbound_streams);
        let this = Arc::new(Self {
            connection: Arc::new(AsyncMutex::new(connection)),
            is_initiator,
            config,
            next_id: Mutex::new(0),
            streams: Mutex::new(HashMap::new()),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx: AsyncMutex::new(inbound_rx),
            closed: AtomicBool::new(false),
            reader_task: Mutex::new(None),
        });

        let weak = Arc::downgrade(&this);
        let handle = tokio::spawn(Self::run_reader(weak));
        *this.reader_task.lock() = Some(handle);
        this
    }

    /// Whether this side dialed the underlying connection.
    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    /// Open a new outbound stream, allocating the next id on our side.
    pub async fn new_stream(&self) -> MuxResult<Arc<MplexStream>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MuxError::ConnectionClosed);
        }

        let id = {
            let mut next_id = self.next_id.lock();
            let id = *next_id;
            *next_id += 1;
            id
        };
        let stream = MplexStream::new(id, true, self.connection.clone(), self.config.max_frame_size);
        {
            let mut streams = self.streams.lock();
            streams.insert((id, true), stream.clone());
        }

        let frame = Frame {
            stream_id: id,
            flag: Flag::NewStream,
            payload: Vec::new(),
        };
        let write_result = {
            let mut conn = self.connection.lock().await;
            conn.write(&frame.encode()).await
        };
        if write_result.is_err() {
            self.streams.lock().remove(&(id, true));
            return Err(MuxError::ConnectionClosed);
        }

        Ok(stream)
    }

    /// Accept the oldest queued inbound stream, waiting if none is queued.
    pub async fn accept_stream(&self) -> MuxResult<Arc<MplexStream>> {
        let mut rx = self.inbound_rx.lock().await;
        match rx.recv().await {
            Some(stream) => Ok(stream),
            None => Err(MuxError::ConnectionClosed),
        }
    }

    /// Tear down the connection: cancel the reader, close the underlying
    /// connection, and resume every stream and accept waiter with
    /// `ConnectionClosed`. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(handle) = self.reader_task.lock().take() {
            handle.abort();
        }
        *self.inbound_tx.lock() = None;

        {
            let mut conn = self.connection.lock().await;
            let _ = conn.close().await;
        }

        let streams: Vec<_> = self.streams.lock().drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.receive_connection_closed();
        }
    }

    async fn dispatch(self: &Arc<Self>, frame: Frame) -> MuxResult<()> {
        match frame.flag {
            Flag::NewStream => self.handle_new_stream(frame.stream_id).await,
            Flag::MessageInitiator => self.deliver_to((frame.stream_id, false), frame.payload).await,
            Flag::MessageReceiver => self.deliver_to((frame.stream_id, true), frame.payload).await,
            Flag::CloseInitiator => {
                self.with_stream((frame.stream_id, false), MplexStream::receive_close);
                Ok(())
            }
            Flag::CloseReceiver => {
                self.with_stream((frame.stream_id, true), MplexStream::receive_close);
                Ok(())
            }
            Flag::ResetInitiator => {
                self.with_stream((frame.stream_id, false), MplexStream::receive_reset);
                self.streams.lock().remove(&(frame.stream_id, false));
                Ok(())
            }
            Flag::ResetReceiver => {
                self.with_stream((frame.stream_id, true), MplexStream::receive_reset);
                self.streams.lock().remove(&(frame.stream_id, true));
                Ok(())
            }
        }
    }

    async fn handle_new_stream(self: &Arc<Self>, id: u64) -> MuxResult<()> {
        let key = (id, false);
        if self.streams.lock().contains_key(&key) {
            debug!(stream_id = id, "duplicate inbound stream id, resetting");
            let frame = Frame {
                stream_id: id,
                flag: Flag::ResetReceiver,
                payload: Vec::new(),
            };
            let mut conn = self.connection.lock().await;
            let _ = conn.write(&frame.encode()).await;
            return Ok(());
        }

        let stream = MplexStream::new(id, false, self.connection.clone(), self.config.max_frame_size);
        self.streams.lock().insert(key, stream.clone());

        let tx = self.inbound_tx.lock().clone();
        let Some(tx) = tx else {
            self.streams.lock().remove(&key);
            return Ok(());
        };
        if tx.try_send(stream).is_err() {
            warn!(stream_id = id, "inbound accept queue full, resetting stream");
            self.streams.lock().remove(&key);
            let frame = Frame {
                stream_id: id,
                flag: Flag::ResetReceiver,
                payload: Vec::new(),
            };
            let mut conn = self.connection.lock().await;
            let _ = conn.write(&frame.encode()).await;
        }
        Ok(())
    }

    async fn deliver_to(self: &Arc<Self>, key: StreamKey, payload: Vec<u8>) -> MuxResult<()> {
        let stream = self.streams.lock().get(&key).cloned();
        if let Some(stream) = stream {
            if stream
                .receive_data(&payload, self.config.max_buffered_per_stream)
                .await
                .is_err()
            {
                self.streams.lock().remove(&key);
            }
        }
        Ok(())
    }

    fn with_stream(&self, key: StreamKey, f: impl FnOnce(&MplexStream)) {
        if let Some(stream) = self.streams.lock().get(&key) {
            f(stream);
        }
    }

    async fn run_reader(weak: Weak<Self>) {
        let mut rolling: Vec<u8> = Vec::new();
        let mut read_buf = vec![0u8; 64 * 1024];

        loop {
            let Some(this) = weak.upgrade() else { return };
            if this.closed.load(Ordering::Acquire) {
                return;
            }

            let read_result = {
                let mut conn = this.connection.lock().await;
                conn.read(&mut read_buf).await
            };
            let n = match read_result {
                Ok(0) => {
                    this.close().await;
                    return;
                }
                Ok(n) => n,
                Err(_) => {
                    this.close().await;
                    return;
                }
            };
            rolling.extend_from_slice(&read_buf[..n]);

            loop {
                match Frame::try_decode(&rolling, this.config.max_frame_size) {
                    Ok(Some((frame, consumed))) => {
                        rolling.drain(..consumed);
                        if this.dispatch(frame).await.is_err() {
                            this.close().await;
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(?err, "mplex framing error, tearing down connection");
                        this.close().await;
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Flag;
    use bth_p2p_identity::{Ed25519KeyPair, KeyPair, Multiaddr};
    use std::collections::VecDeque;
    use tokio::sync::Mutex as TokioMutex;

    /// A secured connection backed by two in-memory byte queues, so two
    /// `MplexConnection`s can talk to each other inside a test.
    struct PairedConnection {
        local_peer: bth_p2p_identity::PeerId,
        remote_peer: bth_p2p_identity::PeerId,
        address: Multiaddr,
        inbound: Arc<TokioMutex<VecDeque<u8>>>,
        outbound: Arc<TokioMutex<VecDeque<u8>>>,
    }

    fn paired() -> (Box<dyn SecuredConnection>, Box<dyn SecuredConnection>) {
        let a_key = Ed25519KeyPair::from_bytes(&[1u8; 32]);
        let b_key = Ed25519KeyPair::from_bytes(&[2u8; 32]);
        let a_to_b = Arc::new(TokioMutex::new(VecDeque::new()));
        let b_to_a = Arc::new(TokioMutex::new(VecDeque::new()));

        let a = PairedConnection {
            local_peer: a_key.peer_id(),
            remote_peer: b_key.peer_id(),
            address: Multiaddr::empty(),
            inbound: b_to_a.clone(),
            outbound: a_to_b.clone(),
        };
        let b = PairedConnection {
            local_peer: b_key.peer_id(),
            remote_peer: a_key.peer_id(),
            address: Multiaddr::empty(),
            inbound: a_to_b,
            outbound: b_to_a,
        };
        (Box::new(a), Box::new(b))
    }

    #[async_trait::async_trait]
    impl SecuredConnection for PairedConnection {
        fn local_peer(&self) -> &bth_p2p_identity::PeerId {
            &self.local_peer
        }
        fn remote_peer(&self) -> &bth_p2p_identity::PeerId {
            &self.remote_peer
        }
        fn local_address(&self) -> &Multiaddr {
            &self.address
        }
        fn remote_address(&self) -> &Multiaddr {
            &self.address
        }
        async fn read(&mut self, buf: &mut [u8]) -> bth_p2p_core::CoreResult<usize> {
            loop {
                {
                    let mut inbound = self.inbound.lock().await;
                    if !inbound.is_empty() {
                        let n = inbound.len().min(buf.len());
                        for slot in buf.iter_mut().take(n) {
                            *slot = inbound.pop_front().expect("checked non-empty");
                        }
                        return Ok(n);
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
        }
        async fn write(&mut self, buf: &[u8]) -> bth_p2p_core::CoreResult<()> {
            self.outbound.lock().await.extend(buf.iter().copied());
            Ok(())
        }
        async fn close(&mut self) -> bth_p2p_core::CoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn sequential_new_stream_ids_have_no_gaps() {
        let (a, _b) = paired();
        let conn = MplexConnection::new(a, true, MplexConfig::default());
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(conn.new_stream().await.unwrap().id());
        }
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn peer_new_stream_is_accepted_and_exchanges_data() {
        let (a, b) = paired();
        let conn_a = MplexConnection::new(a, true, MplexConfig::default());
        let conn_b = MplexConnection::new(b, false, MplexConfig::default());

        let stream_a = conn_a.new_stream().await.unwrap();
        let stream_b = conn_b.accept_stream().await.unwrap();
        assert_eq!(stream_a.id(), stream_b.id());

        stream_a.write(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        let n = stream_b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn duplicate_inbound_stream_id_is_reset_not_overwritten() {
        let (a, _b) = paired();
        let conn = MplexConnection::new(a, false, MplexConfig::default());

        // Simulate the peer opening stream 0 twice in a row.
        conn.handle_new_stream(0).await.unwrap();
        let first = conn.streams.lock().get(&(0, false)).cloned();
        conn.handle_new_stream(0).await.unwrap();
        let second = conn.streams.lock().get(&(0, false)).cloned();

        assert!(first.is_some());
        assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
        let _ = Flag::NewStream;
    }

    #[tokio::test]
    async fn close_resumes_accept_waiter_with_connection_closed() {
        let (a, _b) = paired();
        let conn = MplexConnection::new(a, true, MplexConfig::default());
        conn.close().await;
        assert_eq!(
            conn.accept_stream().await.unwrap_err(),
            MuxError::ConnectionClosed
        );
    }

    #[tokio::test]
    async fn new_stream_fails_after_close() {
        let (a, _b) = paired();
        let conn = MplexConnection::new(a, true, MplexConfig::default());
        conn.close().await;
        assert_eq!(conn.new_stream().await.unwrap_err(), MuxError::ConnectionClosed);
    }
}
