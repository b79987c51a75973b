//! Test data builders for creating test objects

use lsl_coord::config::{ElectionConfig, PollingConfig, SessionConfig};
use lsl_coord::types::{ChannelFormat, StreamDescriptor};

/// Builder for session configs with test-friendly timing
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn new(session: &str, node: &str) -> Self {
        let mut config = SessionConfig::new(session, format!("Node {}", node)).with_node_id(node);
        config.coordination.discovery_wait_ms = 300;
        config.coordination.settle_delay_max_ms = 0;
        config.coordination.announce_interval_ms = 50;
        config.coordination.resolve_interval_ms = 20;
        config.coordination.heartbeat_interval_ms = 100;
        config.coordination.node_timeout_ms = 2_000;
        config.coordination.connection_test_timeout_ms = 500;
        config.coordination.connection_test_backoff_ms = 20;
        config.coordination.join_timeout_ms = 3_000;
        config.coordination.worker_stop_grace_ms = 200;
        config.coordination_polling = PollingConfig::timer(1000.0);
        config.data_polling = PollingConfig::timer(500.0);
        Self { config }
    }

    pub fn discovery_wait_ms(mut self, ms: u64) -> Self {
        self.config.coordination.discovery_wait_ms = ms;
        self
    }

    pub fn max_nodes(mut self, max_nodes: usize) -> Self {
        self.config.coordination.max_nodes = max_nodes;
        self
    }

    pub fn node_timeout_ms(mut self, ms: u64) -> Self {
        self.config.coordination.node_timeout_ms = ms;
        self
    }

    pub fn election(mut self, election: ElectionConfig) -> Self {
        self.config.election = election;
        self
    }

    pub fn metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.config = self.config.with_metadata(key, value);
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}

/// Single float channel data stream template
pub fn data_stream(id: &str) -> StreamDescriptor {
    StreamDescriptor::new(id, id.to_uppercase(), "").with_channels(1, ChannelFormat::Float32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_builder() {
        let config = SessionConfigBuilder::new("lab", "n1").max_nodes(2).build();

        assert_eq!(config.session_id, "lab");
        assert_eq!(config.node_id, "n1");
        assert_eq!(config.coordination.max_nodes, 2);
        assert!(config.validate().is_ok());
    }
}
