//! Tunable settings for polling workers, coordination timing and election
//!
//! These settings are plain serde structs embedded in
//! [`SessionConfig`](super::SessionConfig). Durations are stored as integer
//! milliseconds/microseconds and exposed through `Duration` accessors.
//!
//! # Main Types
//!
//! - [`PollingConfig`] - Scheduling and buffering of one polling worker
//! - [`CoordinationConfig`] - Discovery, join, heartbeat and eviction timing
//! - [`ElectionConfig`] - Which leader election strategy to run

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default polling interval (1 kHz)
pub const DEFAULT_TARGET_INTERVAL_MICROS: u64 = 1_000;

/// Below this remaining time the busy-wait scheduler spins instead of sleeping
pub const DEFAULT_BUSY_WAIT_THRESHOLD_MICROS: u64 = 500;

/// Upper bound of a single inlet pull
pub const MAX_PULL_TIMEOUT_SECS: f64 = 3_600.0;

/// Default metrics emission window
pub const DEFAULT_METRICS_INTERVAL_MS: u64 = 1_000;

/// Default outbound buffer between a worker and its controller
pub const DEFAULT_WORKER_BUFFER_SIZE: usize = 10_000;

/// Polling worker configuration
///
/// Immutable once a worker starts; changing it requires restarting the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Busy-wait (precise, CPU heavy) vs timer (fixed delay) scheduling
    pub use_busy_wait: bool,

    /// Target interval between poll passes in microseconds
    pub target_interval_micros: u64,

    /// Maximum time a single inlet pull may block, in seconds
    pub pull_timeout_secs: f64,

    /// Capacity of the worker → controller message buffer
    pub buffer_size: usize,

    /// Remaining time below which the scheduler spins rather than sleeps
    pub busy_wait_threshold_micros: u64,

    /// Wall-clock window between Metrics messages in milliseconds
    pub metrics_interval_ms: u64,

    /// Skip endpoints whose source id starts with this prefix (self filtering)
    pub exclude_source_prefix: Option<String>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            use_busy_wait: true,
            target_interval_micros: DEFAULT_TARGET_INTERVAL_MICROS,
            pull_timeout_secs: 0.0,
            buffer_size: DEFAULT_WORKER_BUFFER_SIZE,
            busy_wait_threshold_micros: DEFAULT_BUSY_WAIT_THRESHOLD_MICROS,
            metrics_interval_ms: DEFAULT_METRICS_INTERVAL_MS,
            exclude_source_prefix: None,
        }
    }
}

impl PollingConfig {
    /// Timer-mode configuration at the given rate, suited to control traffic
    pub fn timer(rate_hz: f64) -> Self {
        Self {
            use_busy_wait: false,
            ..Self::default()
        }
        .with_rate_hz(rate_hz)
    }

    /// Set the target interval from a frequency in Hz
    pub fn with_rate_hz(mut self, rate_hz: f64) -> Self {
        if rate_hz > 0.0 {
            self.target_interval_micros = ((1_000_000.0 / rate_hz).round() as u64).max(1);
        }
        self
    }

    /// Set the self-filtering source prefix
    pub fn excluding_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.exclude_source_prefix = Some(prefix.into());
        self
    }

    /// Target interval between poll passes
    pub fn target_interval(&self) -> Duration {
        Duration::from_micros(self.target_interval_micros.max(1))
    }

    /// Target poll frequency in Hz
    pub fn target_frequency(&self) -> f64 {
        1_000_000.0 / self.target_interval_micros.max(1) as f64
    }

    /// Maximum blocking time of one inlet pull
    pub fn pull_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.pull_timeout_secs.clamp(0.0, MAX_PULL_TIMEOUT_SECS))
            .unwrap_or(Duration::ZERO)
    }

    /// Spin threshold of the busy-wait scheduler
    pub fn busy_wait_threshold(&self) -> Duration {
        Duration::from_micros(self.busy_wait_threshold_micros)
    }

    /// Metrics window
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms.max(1))
    }

    /// Check for values that would stall or misconfigure a worker
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.target_interval_micros == 0 {
            return Err("target_interval_micros must be greater than zero".to_string());
        }
        if self.buffer_size == 0 {
            return Err("buffer_size must be greater than zero".to_string());
        }
        if !self.pull_timeout_secs.is_finite() || self.pull_timeout_secs < 0.0 {
            return Err("pull_timeout_secs must be a non-negative number".to_string());
        }
        if self.pull_timeout_secs > MAX_PULL_TIMEOUT_SECS {
            return Err(format!(
                "pull_timeout_secs must not exceed {} seconds",
                MAX_PULL_TIMEOUT_SECS
            ));
        }
        Ok(())
    }
}

/// Discovery, join, heartbeat and eviction timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// How long a starting node looks for an existing session
    pub discovery_wait_ms: u64,

    /// Upper bound of the randomized delay before discovery starts
    pub settle_delay_max_ms: u64,

    /// Interval between Discovery hellos while looking for a coordinator
    pub announce_interval_ms: u64,

    /// Cadence of continuous coordination stream discovery
    pub resolve_interval_ms: u64,

    /// Maximum time to wait for JoinAccept/JoinReject
    pub join_timeout_ms: u64,

    /// Interval between heartbeats
    pub heartbeat_interval_ms: u64,

    /// Silence after which a node is evicted (coordinator) or the
    /// coordinator is considered lost (participant)
    pub node_timeout_ms: u64,

    /// Maximum topology size including the coordinator
    pub max_nodes: usize,

    /// Whether the coordinator admits new nodes
    pub accepting_new_nodes: bool,

    /// Timeout of a single connection test round trip
    pub connection_test_timeout_ms: u64,

    /// Connection test attempts before the join fails
    pub connection_test_retries: u32,

    /// Fixed delay between connection test attempts
    pub connection_test_backoff_ms: u64,

    /// Bound on the duplicate message cache
    pub dedup_capacity: usize,

    /// Time a worker has to complete its ready handshake
    pub worker_startup_timeout_ms: u64,

    /// Grace period between Stop and force-termination of a worker
    pub worker_stop_grace_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            discovery_wait_ms: 2_000,
            settle_delay_max_ms: 250,
            announce_interval_ms: 250,
            resolve_interval_ms: 250,
            join_timeout_ms: 5_000,
            heartbeat_interval_ms: 1_000,
            node_timeout_ms: 5_000,
            max_nodes: 32,
            accepting_new_nodes: true,
            connection_test_timeout_ms: 1_000,
            connection_test_retries: 3,
            connection_test_backoff_ms: 250,
            dedup_capacity: 1_024,
            worker_startup_timeout_ms: 5_000,
            worker_stop_grace_ms: 500,
        }
    }
}

impl CoordinationConfig {
    pub fn discovery_wait(&self) -> Duration {
        Duration::from_millis(self.discovery_wait_ms)
    }

    pub fn settle_delay_max(&self) -> Duration {
        Duration::from_millis(self.settle_delay_max_ms)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms.max(1))
    }

    pub fn resolve_interval(&self) -> Duration {
        Duration::from_millis(self.resolve_interval_ms.max(1))
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn connection_test_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_test_timeout_ms)
    }

    pub fn connection_test_backoff(&self) -> Duration {
        Duration::from_millis(self.connection_test_backoff_ms)
    }

    pub fn worker_startup_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_startup_timeout_ms)
    }

    pub fn worker_stop_grace(&self) -> Duration {
        Duration::from_millis(self.worker_stop_grace_ms)
    }
}

/// Leader election strategy selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ElectionConfig {
    /// Lexicographically smallest node id wins
    #[default]
    FirstNode,
    /// Best value of a numeric metadata field wins
    Capability {
        /// Metadata field to compare
        field: String,
        /// Prefer the highest value (otherwise the lowest)
        #[serde(default = "default_prefer_highest")]
        prefer_highest: bool,
    },
}

fn default_prefer_highest() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polling_defaults() {
        let config = PollingConfig::default();
        assert!(config.use_busy_wait);
        assert_eq!(config.target_frequency(), 1000.0);
        assert_eq!(config.pull_timeout(), Duration::ZERO);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_polling_rate_conversion() {
        let config = PollingConfig::timer(250.0);
        assert!(!config.use_busy_wait);
        assert_eq!(config.target_interval_micros, 4_000);
        assert_eq!(config.target_interval(), Duration::from_millis(4));
    }

    #[test]
    fn test_polling_validation() {
        let config = PollingConfig {
            target_interval_micros: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PollingConfig {
            pull_timeout_secs: -1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PollingConfig {
            pull_timeout_secs: 1e30,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(config.pull_timeout(), Duration::from_secs(3_600));
    }

    #[test]
    fn test_default_busy_wait_sleeps_part_of_each_interval() {
        let config = PollingConfig::default();
        assert!(config.busy_wait_threshold() < config.target_interval());
    }

    #[test]
    fn test_election_config_serialization() {
        let config = ElectionConfig::Capability {
            field: "battery".to_string(),
            prefer_highest: false,
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"strategy\":\"capability\""));
        let parsed: ElectionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);

        let parsed: ElectionConfig =
            serde_json::from_str(r#"{"strategy":"capability","field":"cpu"}"#).unwrap();
        assert_eq!(
            parsed,
            ElectionConfig::Capability {
                field: "cpu".to_string(),
                prefer_highest: true
            }
        );
    }
}
