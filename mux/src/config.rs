// Copyright (c) 2024 Botho Foundation

//! Tunables for [`crate::connection::MplexConnection`].

/// Configuration for an [`crate::connection::MplexConnection`].
#[derive(Debug, Clone)]
pub struct MplexConfig {
    /// Maximum payload size of a single frame. Larger declared payloads
    /// cause the connection to be torn down.
    pub max_frame_size: usize,
    /// Maximum number of unread bytes buffered per stream before further
    /// inbound frames cause that stream to be reset.
    pub max_buffered_per_stream: usize,
    /// Maximum number of inbound streams queued awaiting `accept_stream`
    /// before new `NewStream` frames are rejected with a reset.
    pub max_pending_inbound_streams: usize,
}

impl Default for MplexConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 1 << 20,
            max_buffered_per_stream: 1 << 20,
            max_pending_inbound_streams: 1024,
        }
    }
}

impl MplexConfig {
    /// Start building a config from defaults.
    pub fn builder() -> MplexConfigBuilder {
        MplexConfigBuilder::default()
    }
}

/// Fluent builder for [`MplexConfig`].
#[derive(Debug, Default)]
pub struct MplexConfigBuilder {
    config: MplexConfigInner,
}

#[derive(Debug, Default)]
struct MplexConfigInner {
    max_frame_size: Option<usize>,
    max_buffered_per_stream: Option<usize>,
    max_pending_inbound_streams: Option<usize>,
}

impl MplexConfigBuilder {
    /// Set the maximum frame payload size.
    pub fn with_max_frame_size(mut self, value: usize) -> Self {
        self.config.max_frame_size = Some(value);
        self
    }

    /// Set the per-stream inbound buffer cap.
    pub fn with_max_buffered_per_stream(mut self, value: usize) -> Self {
        self.config.max_buffered_per_stream = Some(value);
        self
    }

    /// Set the inbound-stream accept-queue cap.
    pub fn with_max_pending_inbound_streams(mut self, value: usize) -> Self {
        self.config.max_pending_inbound_streams = Some(value);
        self
    }

    /// Build the config, falling back to defaults for unset fields.
    pub fn build(self) -> MplexConfig {
        let defaults = MplexConfig::default();
        MplexConfig {
            max_frame_size: self.config.max_frame_size.unwrap_or(defaults.max_frame_size),
            max_buffered_per_stream: self
                .config
                .max_buffered_per_stream
                .unwrap_or(defaults.max_buffered_per_stream),
            max_pending_inbound_streams: self
                .config
                .max_pending_inbound_streams
                .unwrap_or(defaults.max_pending_inbound_streams),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = MplexConfig::default();
        assert_eq!(config.max_frame_size, 1 << 20);
        assert_eq!(config.max_buffered_per_stream, 1 << 20);
    }

    #[test]
    fn builder_overrides_only_given_fields() {
        let config = MplexConfig::builder().with_max_frame_size(4096).build();
        assert_eq!(config.max_frame_size, 4096);
        assert_eq!(config.max_buffered_per_stream, 1 << 20);
    }
}
