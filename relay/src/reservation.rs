// Copyright (c) 2024 Botho Foundation

//! The client-side view of a relay reservation: the resource limits it
//! carries and the advertisable circuit addresses it grants.

use crate::error::{RelayError, RelayResult};
use crate::wire;
use bth_p2p_identity::{Multiaddr, PeerId};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A live reservation with a relay, translated from the wire form into
/// host-local types: a monotonic expiration instant rather than the
/// relay's unix timestamp, and parsed [`Multiaddr`]s rather than raw
/// bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    /// The relay holding this reservation for us.
    pub relay_peer: PeerId,
    /// When the reservation expires, on our local monotonic clock.
    pub expires_at: Instant,
    /// Maximum bytes the relay will carry over one circuit under this
    /// reservation, if it imposes one.
    pub data_limit_bytes: Option<u64>,
    /// Maximum lifetime of one circuit under this reservation, if the
    /// relay imposes one.
    pub duration_limit: Option<Duration>,
    /// The full `/…/p2p-circuit/p2p/<self>` addresses the relay will
    /// advertise on our behalf.
    pub advertised_addrs: Vec<Multiaddr>,
}

impl Reservation {
    /// Translate a Hop `STATUS(OK)` response into a `Reservation`.
    ///
    /// The relay's `expire` field is a unix timestamp; we have no shared
    /// wall clock with it, so the expiration is re-based onto our own
    /// monotonic clock at the moment the response arrives.
    pub(crate) fn from_wire(
        relay_peer: PeerId,
        wire_reservation: &wire::Reservation,
        limit: Option<wire::Limit>,
    ) -> RelayResult<Self> {
        let now_unix = unix_now_secs();
        let remaining = wire_reservation.expire_unix_secs.saturating_sub(now_unix);
        let expires_at = Instant::now() + Duration::from_secs(remaining);

        let mut advertised_addrs = Vec::with_capacity(wire_reservation.addrs.len());
        for bytes in &wire_reservation.addrs {
            advertised_addrs.push(
                Multiaddr::parse_binary(bytes)
                    .map_err(|err| RelayError::MalformedMessage(err.to_string()))?,
            );
        }

        Ok(Self {
            relay_peer,
            expires_at,
            data_limit_bytes: limit.as_ref().and_then(|l| l.data_bytes),
            duration_limit: limit
                .as_ref()
                .and_then(|l| l.duration_secs)
                .map(|secs| Duration::from_secs(secs as u64)),
            advertised_addrs,
        })
    }

    /// Whether this reservation has passed its expiration instant.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Time remaining until expiration, or `Duration::ZERO` if already
    /// past.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bth_p2p_identity::{Ed25519KeyPair, KeyPair};

    fn relay_peer() -> PeerId {
        Ed25519KeyPair::from_bytes(&[3u8; 32]).peer_id()
    }

    #[test]
    fn future_expiration_translates_to_a_not_yet_expired_instant() {
        let wire_reservation = wire::Reservation {
            expire_unix_secs: unix_now_secs() + 3600,
            addrs: vec![],
        };
        let reservation = Reservation::from_wire(relay_peer(), &wire_reservation, None).unwrap();
        assert!(!reservation.is_expired());
        assert!(reservation.remaining() > Duration::from_secs(3500));
    }

    #[test]
    fn past_expiration_translates_to_an_already_expired_instant() {
        let wire_reservation = wire::Reservation {
            expire_unix_secs: 0,
            addrs: vec![],
        };
        let reservation = Reservation::from_wire(relay_peer(), &wire_reservation, None).unwrap();
        assert!(reservation.is_expired());
        assert_eq!(reservation.remaining(), Duration::ZERO);
    }

    #[test]
    fn limit_fields_are_carried_through() {
        let wire_reservation = wire::Reservation {
            expire_unix_secs: unix_now_secs() + 60,
            addrs: vec![],
        };
        let limit = wire::Limit {
            duration_secs: Some(120),
            data_bytes: Some(131_072),
        };
        let reservation = Reservation::from_wire(relay_peer(), &wire_reservation, Some(limit)).unwrap();
        assert_eq!(reservation.data_limit_bytes, Some(131_072));
        assert_eq!(reservation.duration_limit, Some(Duration::from_secs(120)));
    }

    #[test]
    fn malformed_address_bytes_are_rejected() {
        let wire_reservation = wire::Reservation {
            expire_unix_secs: unix_now_secs() + 60,
            addrs: vec![vec![0xff, 0xff, 0xff, 0xff, 0xff]],
        };
        assert!(Reservation::from_wire(relay_peer(), &wire_reservation, None).is_err());
    }
}
