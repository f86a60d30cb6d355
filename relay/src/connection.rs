// Copyright (c) 2024 Botho Foundation

//! `RelayedConnection`: a byte stream carried over a single Hop/Stop mplex
//! stream, exposed through the same [`RawConnection`] contract as a direct
//! transport so the security-upgrade layer above cannot tell the
//! difference.

use crate::error::RelayResult;
use crate::wire;
use async_trait::async_trait;
use bth_p2p_core::{CoreError, CoreResult, RawConnection};
use bth_p2p_identity::{Multiaddr, PeerId, Protocol};
use bth_p2p_mux::{MplexStream, MuxError};
use std::sync::Arc;

fn circuit_address(relay: &PeerId, endpoint: &PeerId) -> Multiaddr {
    Multiaddr::empty()
        .with(Protocol::P2p(relay.clone()))
        .and_then(|m| m.with(Protocol::P2pCircuit))
        .and_then(|m| m.with(Protocol::P2p(endpoint.clone())))
        .unwrap_or_else(|_| Multiaddr::empty())
}

/// One end of a circuit: bytes written here travel to `remote_peer`
/// through `relay_peer`'s Hop/Stop forwarding, carried on a single mplex
/// stream.
pub struct RelayedConnection {
    stream: Arc<MplexStream>,
    relay_peer: PeerId,
    remote_peer: PeerId,
    local_address: Multiaddr,
    remote_address: Multiaddr,
    limit: Option<wire::Limit>,
}

impl RelayedConnection {
    pub(crate) fn new(
        stream: Arc<MplexStream>,
        relay_peer: PeerId,
        local_peer: &PeerId,
        remote_peer: PeerId,
        limit: Option<wire::Limit>,
    ) -> Self {
        let local_address = circuit_address(&relay_peer, local_peer);
        let remote_address = circuit_address(&relay_peer, &remote_peer);
        Self {
            stream,
            relay_peer,
            remote_peer,
            local_address,
            remote_address,
            limit,
        }
    }

    /// The relay this circuit is carried through.
    pub fn relay_peer(&self) -> &PeerId {
        &self.relay_peer
    }

    /// The peer on the other end of the circuit.
    pub fn remote_peer(&self) -> &PeerId {
        &self.remote_peer
    }

    /// The resource limits the relay imposed on this circuit, if any.
    pub fn limit(&self) -> Option<wire::Limit> {
        self.limit
    }

    /// Close the underlying stream. Idempotent.
    pub async fn close(&self) -> RelayResult<()> {
        self.stream.close().await.map_err(Into::into)
    }
}

#[async_trait]
impl RawConnection for RelayedConnection {
    async fn read(&mut self, buf: &mut [u8]) -> CoreResult<usize> {
        // A mplex stream reports a drained, remote-half-closed buffer as
        // `StreamClosed`, but `RawConnection::read` reports the same
        // condition as `Ok(0)` — translate here rather than push this
        // mismatch onto every caller.
        match self.stream.read(buf).await {
            Ok(n) => Ok(n),
            Err(MuxError::StreamClosed) => Ok(0),
            Err(_) => Err(CoreError::ConnectionClosed),
        }
    }

    async fn write(&mut self, buf: &[u8]) -> CoreResult<()> {
        self.stream.write(buf).await.map_err(|_| CoreError::ConnectionClosed)
    }

    async fn close(&mut self) -> CoreResult<()> {
        self.stream.close().await.map_err(|_| CoreError::ConnectionClosed)
    }

    fn local_address(&self) -> &Multiaddr {
        &self.local_address
    }

    fn remote_address(&self) -> &Multiaddr {
        &self.remote_address
    }
}
