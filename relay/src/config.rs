// Copyright (c) 2024 Botho Foundation

//! Tunables for the Circuit Relay v2 client and its listeners.

use std::time::Duration;

/// Configuration for a [`crate::client::RelayClient`] and the listeners it
/// creates.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum number of simultaneous reservations this client tracks
    /// across all relays.
    pub max_reservations: usize,
    /// Maximum number of concurrent circuits a single remote peer may hold
    /// through one of our reservations.
    pub max_circuits_per_peer: usize,
    /// Requested reservation lifetime.
    pub reservation_lifetime: Duration,
    /// Requested data budget per circuit.
    pub data_limit_per_circuit: u64,
    /// Requested duration budget per circuit.
    pub duration_limit_per_circuit: Duration,
    /// Whether reservations are renewed automatically before they expire.
    pub auto_renew_reservations: bool,
    /// How long before expiration the renewal timer fires.
    pub renewal_lead_time: Duration,
    /// Maximum number of accepted-but-unaccepted inbound circuits a
    /// listener queues before dropping the oldest.
    pub listener_queue_cap: usize,
    /// How long a Hop `RESERVE`/`CONNECT` round trip may take before it is
    /// treated as a timeout.
    pub reservation_request_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_reservations: 128,
            max_circuits_per_peer: 16,
            reservation_lifetime: Duration::from_secs(60 * 60),
            data_limit_per_circuit: 128 * 1024,
            duration_limit_per_circuit: Duration::from_secs(2 * 60),
            auto_renew_reservations: true,
            renewal_lead_time: Duration::from_secs(60),
            listener_queue_cap: 64,
            reservation_request_timeout: Duration::from_secs(30),
        }
    }
}

impl RelayConfig {
    /// Start building a config from defaults.
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::default()
    }
}

/// Fluent builder for [`RelayConfig`]. Unset fields fall back to the
/// documented defaults.
#[derive(Debug, Default)]
pub struct RelayConfigBuilder {
    config: RelayConfig,
}

macro_rules! builder_setter {
    ($name:ident, $field:ident, $ty:ty) => {
        /// Override this config field.
        pub fn $name(mut self, value: $ty) -> Self {
            self.config.$field = value;
            self
        }
    };
}

impl RelayConfigBuilder {
    /// Create a new builder seeded with the documented defaults.
    pub fn new() -> Self {
        Self {
            config: RelayConfig::default(),
        }
    }

    builder_setter!(with_max_reservations, max_reservations, usize);
    builder_setter!(with_max_circuits_per_peer, max_circuits_per_peer, usize);
    builder_setter!(with_reservation_lifetime, reservation_lifetime, Duration);
    builder_setter!(with_data_limit_per_circuit, data_limit_per_circuit, u64);
    builder_setter!(
        with_duration_limit_per_circuit,
        duration_limit_per_circuit,
        Duration
    );
    builder_setter!(
        with_auto_renew_reservations,
        auto_renew_reservations,
        bool
    );
    builder_setter!(with_renewal_lead_time, renewal_lead_time, Duration);
    builder_setter!(with_listener_queue_cap, listener_queue_cap, usize);
    builder_setter!(
        with_reservation_request_timeout,
        reservation_request_timeout,
        Duration
    );

    /// Build the config.
    pub fn build(self) -> RelayConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = RelayConfig::default();
        assert_eq!(config.max_reservations, 128);
        assert_eq!(config.max_circuits_per_peer, 16);
        assert_eq!(config.reservation_lifetime, Duration::from_secs(3600));
        assert_eq!(config.data_limit_per_circuit, 128 * 1024);
        assert_eq!(config.duration_limit_per_circuit, Duration::from_secs(120));
        assert!(config.auto_renew_reservations);
        assert_eq!(config.renewal_lead_time, Duration::from_secs(60));
        assert_eq!(config.listener_queue_cap, 64);
    }

    #[test]
    fn builder_overrides_only_given_fields() {
        let config = RelayConfigBuilder::new()
            .with_listener_queue_cap(8)
            .with_auto_renew_reservations(false)
            .build();
        assert_eq!(config.listener_queue_cap, 8);
        assert!(!config.auto_renew_reservations);
        assert_eq!(config.max_reservations, 128);
    }
}
