// Copyright (c) 2024 Botho Foundation

//! Lifecycle events emitted by the relay client and its listeners.

use bth_p2p_identity::PeerId;

/// Lifecycle and diagnostic events emitted by [`crate::client::RelayClient`]
/// and the [`crate::listener::RelayListener`]s it creates.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// A reservation with `relay` was obtained or renewed.
    ReservationObtained {
        /// The relay holding the reservation.
        relay: PeerId,
    },
    /// A reservation renewal succeeded.
    ReservationRenewed {
        /// The relay holding the reservation.
        relay: PeerId,
    },
    /// A reservation renewal attempt failed; renewal keeps retrying until
    /// the reservation actually expires.
    ReservationRenewalFailed {
        /// The relay the renewal was attempted against.
        relay: PeerId,
        /// Why the attempt failed.
        reason: String,
    },
    /// The listener for `relay` closed, either because its reservation
    /// expired without renewal or because it was closed explicitly.
    ListenerClosed {
        /// The relay the listener was registered with.
        relay: PeerId,
    },
    /// An inbound circuit from `source`, relayed through `relay`, was
    /// accepted and queued on the matching listener.
    CircuitAccepted {
        /// The relay that forwarded the circuit.
        relay: PeerId,
        /// The peer that dialed us through the relay.
        source: PeerId,
    },
    /// An inbound Stop request named a relay with no registered listener.
    CircuitRejectedNoListener {
        /// The relay the Stop stream arrived on.
        relay: PeerId,
    },
}
