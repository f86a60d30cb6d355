// Copyright (c) 2024 Botho Foundation

//! The secured-connection contract: the boundary every transport
//! (TCP+Noise, QUIC, a relayed circuit) must satisfy before the stream
//! multiplexer or any protocol above it can use it.

use crate::error::CoreResult;
use async_trait::async_trait;
use bth_p2p_identity::{Multiaddr, PeerId};

/// A raw, unauthenticated byte stream between two endpoints.
///
/// This is the contract a bare transport (a TCP socket, a QUIC stream)
/// satisfies before any handshake has run. Implementations are not
/// required to be `Clone`; callers that need to share one should wrap it
/// themselves.
#[async_trait]
pub trait RawConnection: Send + Sync {
    /// Read up to `buf.len()` bytes, returning the number read. A return of
    /// `0` means the peer has closed its write half.
    async fn read(&mut self, buf: &mut [u8]) -> CoreResult<usize>;

    /// Write the entirety of `buf`.
    async fn write(&mut self, buf: &[u8]) -> CoreResult<()>;

    /// Close both halves of the connection.
    async fn close(&mut self) -> CoreResult<()>;

    /// The local socket address, in multiaddr form.
    fn local_address(&self) -> &Multiaddr;

    /// The remote socket address, in multiaddr form.
    fn remote_address(&self) -> &Multiaddr;
}

/// A connection that has completed identity authentication (and, usually,
/// encryption) with its remote endpoint.
///
/// Everything above this layer — the stream multiplexer, gossipsub,
/// circuit relay — programs against `SecuredConnection`, never against a
/// concrete transport. A relayed circuit and a direct QUIC connection both
/// satisfy this trait identically.
#[async_trait]
pub trait SecuredConnection: Send + Sync {
    /// This node's own identity, as authenticated during the handshake.
    fn local_peer(&self) -> &PeerId;

    /// The remote endpoint's authenticated identity.
    fn remote_peer(&self) -> &PeerId;

    /// The local socket address, in multiaddr form.
    fn local_address(&self) -> &Multiaddr;

    /// The remote socket address, in multiaddr form.
    fn remote_address(&self) -> &Multiaddr;

    /// Read up to `buf.len()` plaintext bytes.
    async fn read(&mut self, buf: &mut [u8]) -> CoreResult<usize>;

    /// Write the entirety of `buf` as plaintext, to be secured on the wire.
    async fn write(&mut self, buf: &[u8]) -> CoreResult<()>;

    /// Close the connection.
    async fn close(&mut self) -> CoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bth_p2p_identity::Ed25519KeyPair;
    use std::collections::VecDeque;

    /// An in-memory `SecuredConnection` used only to exercise the trait
    /// contract in tests elsewhere in the workspace.
    pub struct LoopbackConnection {
        local_peer: PeerId,
        remote_peer: PeerId,
        local_address: Multiaddr,
        remote_address: Multiaddr,
        inbound: VecDeque<u8>,
        closed: bool,
    }

    impl LoopbackConnection {
        pub fn new() -> Self {
            let local = Ed25519KeyPair::from_bytes(&[1u8; 32]);
            let remote = Ed25519KeyPair::from_bytes(&[2u8; 32]);
            Self {
                local_peer: local.peer_id(),
                remote_peer: remote.peer_id(),
                local_address: Multiaddr::empty(),
                remote_address: Multiaddr::empty(),
                inbound: VecDeque::new(),
                closed: false,
            }
        }
    }

    #[async_trait]
    impl SecuredConnection for LoopbackConnection {
        fn local_peer(&self) -> &PeerId {
            &self.local_peer
        }

        fn remote_peer(&self) -> &PeerId {
            &self.remote_peer
        }

        fn local_address(&self) -> &Multiaddr {
            &self.local_address
        }

        fn remote_address(&self) -> &Multiaddr {
            &self.remote_address
        }

        async fn read(&mut self, buf: &mut [u8]) -> CoreResult<usize> {
            if self.closed {
                return Err(crate::error::CoreError::ConnectionClosed);
            }
            let mut n = 0;
            while n < buf.len() {
                match self.inbound.pop_front() {
                    Some(byte) => {
                        buf[n] = byte;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }

        async fn write(&mut self, buf: &[u8]) -> CoreResult<()> {
            if self.closed {
                return Err(crate::error::CoreError::ConnectionClosed);
            }
            self.inbound.extend(buf.iter().copied());
            Ok(())
        }

        async fn close(&mut self) -> CoreResult<()> {
            self.closed = true;
            Ok(())
        }
    }

    #[tokio::test]
    async fn loopback_write_then_read_round_trips() {
        let mut conn = LoopbackConnection::new();
        conn.write(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn closed_connection_rejects_io() {
        let mut conn = LoopbackConnection::new();
        conn.close().await.unwrap();
        assert!(conn.write(b"x").await.is_err());
    }
}
