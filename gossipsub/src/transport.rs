// Copyright (c) 2024 Botho Foundation

//! The boundary between the router's pure protocol logic and the bytes on
//! the wire: a `PeerSink` per connected peer, backed by a send queue so
//! concurrent callers never interleave writes on the same stream (§5).

use crate::error::{GossipSubError, GossipSubResult};
use crate::wire::Rpc;
use async_trait::async_trait;
use bth_p2p_mux::MplexStream;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Something the router can hand an RPC to for delivery to one peer.
#[async_trait]
pub trait PeerSink: Send + Sync {
    /// Enqueue `rpc` for delivery. Returns an error only if the peer's
    /// outbound path is already gone (closed stream, dropped queue).
    async fn send(&self, rpc: Rpc) -> GossipSubResult<()>;
}

/// A `PeerSink` backed by one mplex stream, with a bounded send queue
/// drained by a single writer task so writes from concurrent callers
/// never interleave mid-frame.
pub struct StreamPeerSink {
    queue: mpsc::Sender<Rpc>,
}

/// Default outbound queue depth before `send` back-pressures the caller.
const SEND_QUEUE_CAPACITY: usize = 256;

impl StreamPeerSink {
    /// Spawn the writer task and return a sink that feeds it.
    pub fn spawn(stream: Arc<MplexStream>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<Rpc>(SEND_QUEUE_CAPACITY);
        tokio::spawn(async move {
            while let Some(rpc) = rx.recv().await {
                let bytes = rpc.encode_framed();
                if let Err(err) = stream.write(&bytes).await {
                    warn!(?err, "gossipsub peer write failed, closing stream");
                    let _ = stream.reset().await;
                    return;
                }
            }
        });
        Arc::new(Self { queue: tx })
    }
}

#[async_trait]
impl PeerSink for StreamPeerSink {
    async fn send(&self, rpc: Rpc) -> GossipSubResult<()> {
        self.queue.send(rpc).await.map_err(|_| GossipSubError::ConnectionClosed)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// A `PeerSink` that records every RPC it receives, for assertions.
    #[derive(Default)]
    pub struct RecordingSink {
        pub sent: Mutex<Vec<Rpc>>,
    }

    #[async_trait]
    impl PeerSink for RecordingSink {
        async fn send(&self, rpc: Rpc) -> GossipSubResult<()> {
            self.sent.lock().push(rpc);
            Ok(())
        }
    }
}
