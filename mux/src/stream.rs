// Copyright (c) 2024 Botho Foundation

//! A single multiplexed stream: a half-close state machine over frames
//! carried by the owning [`crate::connection::MplexConnection`].

use crate::error::{MuxError, MuxResult};
use crate::frame::{Flag, Frame};
use bth_p2p_core::SecuredConnection;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, Notify};

/// The underlying secured connection, shared by every stream so that
/// writes from concurrent streams never interleave mid-frame.
pub(crate) type SharedConnection = Arc<AsyncMutex<Box<dyn SecuredConnection>>>;

struct StreamState {
    local_write_closed: bool,
    remote_write_closed: bool,
    reset: bool,
    torn_down: bool,
    buffer: VecDeque<u8>,
}

/// One multiplexed stream.
///
/// `id` is only unique among streams opened by the same side — mplex
/// allocates ids independently per side, so `(id, is_initiator)` is the
/// true key a [`crate::connection::MplexConnection`] uses to route frames.
pub struct MplexStream {
    id: u64,
    is_initiator: bool,
    protocol_id: Mutex<Option<String>>,
    state: Mutex<StreamState>,
    notify: Notify,
    connection: SharedConnection,
    max_frame_size: usize,
}

impl MplexStream {
    pub(crate) fn new(
        id: u64,
        is_initiator: bool,
        connection: SharedConnection,
        max_frame_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            is_initiator,
            protocol_id: Mutex::new(None),
            state: Mutex::new(StreamState {
                local_write_closed: false,
                remote_write_closed: false,
                reset: false,
                torn_down: false,
                buffer: VecDeque::new(),
            }),
            notify: Notify::new(),
            connection,
            max_frame_size: max_frame_size.max(1),
        })
    }

    /// This stream's id, unique among streams opened by the same side.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether this side opened the stream (`true`) or the peer did.
    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    /// The negotiated application protocol id, if one has been set.
    pub fn protocol_id(&self) -> Option<String> {
        self.protocol_id.lock().clone()
    }

    /// Record the negotiated application protocol id for this stream.
    pub fn set_protocol_id(&self, protocol_id: String) {
        *self.protocol_id.lock() = Some(protocol_id);
    }

    fn message_flag(&self) -> Flag {
        if self.is_initiator {
            Flag::MessageInitiator
        } else {
            Flag::MessageReceiver
        }
    }

    fn close_flag(&self) -> Flag {
        if self.is_initiator {
            Flag::CloseInitiator
        } else {
            Flag::CloseReceiver
        }
    }

    fn reset_flag(&self) -> Flag {
        if self.is_initiator {
            Flag::ResetInitiator
        } else {
            Flag::ResetReceiver
        }
    }

    async fn send_frame(&self, flag: Flag, payload: Vec<u8>) -> MuxResult<()> {
        let frame = Frame {
            stream_id: self.id,
            flag,
            payload,
        };
        let bytes = frame.encode();
        let mut conn = self.connection.lock().await;
        conn.write(&bytes).await.map_err(|_| MuxError::ConnectionClosed)
    }

    /// Write `data`, splitting it into frames no larger than the
    /// connection's configured max frame size.
    pub async fn write(&self, data: &[u8]) -> MuxResult<()> {
        {
            let state = self.state.lock();
            if state.torn_down {
                return Err(MuxError::ConnectionClosed);
            }
            if state.reset {
                return Err(MuxError::StreamReset);
            }
            if state.local_write_closed {
                return Err(MuxError::StreamClosed);
            }
        }
        if data.is_empty() {
            return self.send_frame(self.message_flag(), Vec::new()).await;
        }
        for chunk in data.chunks(self.max_frame_size) {
            self.send_frame(self.message_flag(), chunk.to_vec()).await?;
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes already delivered to this stream,
    /// waiting for more if none are buffered yet.
    pub async fn read(&self, buf: &mut [u8]) -> MuxResult<usize> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.torn_down {
                    return Err(MuxError::ConnectionClosed);
                }
                if state.reset {
                    return Err(MuxError::StreamReset);
                }
                if !state.buffer.is_empty() {
                    let n = state.buffer.len().min(buf.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = state.buffer.pop_front().expect("checked non-empty");
                    }
                    return Ok(n);
                }
                if state.remote_write_closed {
                    return Err(MuxError::StreamClosed);
                }
            }

            notified.await;
        }
    }

    /// Half-close the write side. Idempotent.
    pub async fn close_write(&self) -> MuxResult<()> {
        let already_closed = {
            let mut state = self.state.lock();
            if state.local_write_closed || state.torn_down {
                true
            } else {
                state.local_write_closed = true;
                false
            }
        };
        if already_closed {
            return Ok(());
        }
        self.send_frame(self.close_flag(), Vec::new()).await
    }

    /// Half-close the read side locally. Sends no frame.
    pub fn close_read(&self) {
        let mut state = self.state.lock();
        state.remote_write_closed = true;
        state.buffer.clear();
        drop(state);
        self.notify.notify_waiters();
    }

    /// Close both directions.
    pub async fn close(&self) -> MuxResult<()> {
        self.close_write().await?;
        self.close_read();
        Ok(())
    }

    /// Reset the stream: both directions fail immediately for every
    /// current and future caller. Idempotent.
    pub async fn reset(&self) -> MuxResult<()> {
        let already_reset = {
            let mut state = self.state.lock();
            if state.reset || state.torn_down {
                true
            } else {
                state.reset = true;
                false
            }
        };
        self.notify.notify_waiters();
        if already_reset {
            return Ok(());
        }
        self.send_frame(self.reset_flag(), Vec::new()).await
    }

    /// Deliver inbound data, or reset the stream if this would exceed
    /// `max_buffered`. Returns an error if the stream was reset as a
    /// result — the caller should then drop its reference to the stream.
    pub(crate) async fn receive_data(&self, data: &[u8], max_buffered: usize) -> MuxResult<()> {
        let overflow = {
            let state = self.state.lock();
            state.buffer.len() + data.len() > max_buffered
        };
        if overflow {
            self.reset().await?;
            return Err(MuxError::StreamReset);
        }
        let mut state = self.state.lock();
        if state.reset || state.torn_down {
            return Ok(());
        }
        state.buffer.extend(data.iter().copied());
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    /// The peer half-closed its write side for this stream.
    pub(crate) fn receive_close(&self) {
        let mut state = self.state.lock();
        state.remote_write_closed = true;
        drop(state);
        self.notify.notify_waiters();
    }

    /// The peer reset this stream.
    pub(crate) fn receive_reset(&self) {
        let mut state = self.state.lock();
        state.reset = true;
        drop(state);
        self.notify.notify_waiters();
    }

    /// The owning connection tore down; every waiter resumes with
    /// `ConnectionClosed` rather than `StreamReset`.
    pub(crate) fn receive_connection_closed(&self) {
        let mut state = self.state.lock();
        state.torn_down = true;
        drop(state);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bth_p2p_identity::{Ed25519KeyPair, KeyPair, Multiaddr};
    use std::collections::VecDeque as StdVecDeque;

    struct NullConnection {
        local_peer: bth_p2p_identity::PeerId,
        remote_peer: bth_p2p_identity::PeerId,
        address: Multiaddr,
        outbound: StdVecDeque<u8>,
    }

    impl NullConnection {
        fn new() -> Self {
            let key = Ed25519KeyPair::from_bytes(&[9u8; 32]);
            Self {
                local_peer: key.peer_id(),
                remote_peer: key.peer_id(),
                address: Multiaddr::empty(),
                outbound: StdVecDeque::new(),
            }
        }
    }

    #[async_trait::async_trait]
    impl SecuredConnection for NullConnection {
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
        async fn read(&mut self, _buf: &mut [u8]) -> bth_p2p_core::CoreResult<usize> {
            Ok(0)
        }
        async fn write(&mut self, buf: &[u8]) -> bth_p2p_core::CoreResult<()> {
            self.outbound.extend(buf.iter().copied());
            Ok(())
        }
        async fn close(&mut self) -> bth_p2p_core::CoreResult<()> {
            Ok(())
        }
    }

    fn test_stream(is_initiator: bool) -> Arc<MplexStream> {
        let conn: SharedConnection = Arc::new(AsyncMutex::new(Box::new(NullConnection::new())));
        MplexStream::new(0, is_initiator, conn, 1 << 20)
    }

    #[tokio::test]
    async fn write_fails_after_local_close() {
        let stream = test_stream(true);
        stream.close_write().await.unwrap();
        assert_eq!(stream.write(b"x").await.unwrap_err(), MuxError::StreamClosed);
    }

    #[tokio::test]
    async fn read_returns_buffered_data_immediately() {
        let stream = test_stream(true);
        stream.receive_data(b"hello", 1 << 20).await.unwrap();
        let mut buf = [0u8; 5];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn read_reports_eof_after_remote_close_and_drained_buffer() {
        let stream = test_stream(true);
        stream.receive_data(b"hi", 1 << 20).await.unwrap();
        stream.receive_close();
        let mut buf = [0u8; 2];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 2);
        assert_eq!(
            stream.read(&mut buf).await.unwrap_err(),
            MuxError::StreamClosed
        );
    }

    #[tokio::test]
    async fn write_continues_after_remote_close() {
        let stream = test_stream(true);
        stream.receive_close();
        stream.write(b"still going").await.unwrap();
    }

    #[tokio::test]
    async fn reset_fails_pending_read_and_future_write() {
        let stream = test_stream(true);
        let reader = {
            let stream = stream.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 1];
                stream.read(&mut buf).await
            })
        };
        tokio::task::yield_now().await;
        stream.reset().await.unwrap();
        let result = reader.await.unwrap();
        assert_eq!(result.unwrap_err(), MuxError::StreamReset);
        assert_eq!(stream.write(b"x").await.unwrap_err(), MuxError::StreamReset);
    }

    #[tokio::test]
    async fn oversize_buffered_data_triggers_reset() {
        let stream = test_stream(false);
        let result = stream.receive_data(&[0u8; 10], 4).await;
        assert_eq!(result.unwrap_err(), MuxError::StreamReset);
        assert_eq!(stream.write(b"x").await.unwrap_err(), MuxError::StreamReset);
    }
}
