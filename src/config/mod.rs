//! Configuration module for lsl-coord
//!
//! This module handles session configuration:
//! - Identity of the local node (id, name, metadata advertised to peers)
//! - Coordination timing (discovery, join, heartbeat, eviction)
//! - Polling worker settings for coordination and data traffic
//! - Leader election strategy
//!
//! # Config Location
//!
//! Session files are TOML and may live anywhere. The default location is the
//! platform configuration directory:
//! - **Linux**: `~/.config/lsl-coord/session.toml`
//! - **macOS**: `~/Library/Application Support/lsl-coord/session.toml`
//! - **Windows**: `%APPDATA%\lsl-coord\session.toml`
//!
//! # Example
//!
//! ```ignore
//! use lsl_coord::config::SessionConfig;
//!
//! let mut config = SessionConfig::load_or_default(SessionConfig::default_path().unwrap());
//! config.session_id = "lab-a".to_string();
//! config.validate()?;
//! config.save("session.toml")?;
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{CoordError, Result, ResultExt};
use crate::types::Metadata;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application identifier for config directories
pub const APP_ID: &str = "lsl-coord";

/// Default session config filename
pub const SESSION_CONFIG_FILE: &str = "session.toml";

/// Session joined when none is configured
pub const DEFAULT_SESSION_ID: &str = "default";

/// Get the default session config path
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID).join(SESSION_CONFIG_FILE))
}

/// Complete configuration of one node in one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session identifier; nodes only talk to nodes with the same id
    #[serde(default = "default_session_id")]
    pub session_id: String,

    /// Human readable node name
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Node id; a random UUID is generated when empty
    #[serde(default)]
    pub node_id: String,

    /// Metadata advertised in join requests (capabilities for election)
    #[serde(default)]
    pub metadata: Metadata,

    /// Coordination timing
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Polling of inbound coordination messages
    #[serde(default = "default_coordination_polling")]
    pub coordination_polling: PollingConfig,

    /// Default polling for data layers
    #[serde(default)]
    pub data_polling: PollingConfig,

    /// Leader election strategy
    #[serde(default)]
    pub election: ElectionConfig,
}

fn default_session_id() -> String {
    DEFAULT_SESSION_ID.to_string()
}

fn default_node_name() -> String {
    "node".to_string()
}

/// Coordination traffic is light; a 200 Hz timer keeps heartbeats responsive
/// without spinning a core.
fn default_coordination_polling() -> PollingConfig {
    PollingConfig::timer(200.0)
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: default_session_id(),
            node_name: default_node_name(),
            node_id: String::new(),
            metadata: Metadata::new(),
            coordination: CoordinationConfig::default(),
            coordination_polling: default_coordination_polling(),
            data_polling: PollingConfig::default(),
            election: ElectionConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Create a configuration for the given session and node name
    pub fn new(session_id: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            node_name: node_name.into(),
            ..Self::default()
        }
    }

    /// Set an explicit node id
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Add an advertised metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        default_config_path()
    }

    /// Fill in a random node id if none is configured
    pub fn ensure_node_id(&mut self) -> &str {
        if self.node_id.is_empty() {
            self.node_id = uuid::Uuid::new_v4().to_string();
        }
        &self.node_id
    }

    /// Check the configuration for values that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.session_id.trim().is_empty() {
            return Err(CoordError::Config("session_id must not be empty".to_string()));
        }
        if self.node_id.contains(':') {
            return Err(CoordError::Config(format!(
                "node_id '{}' must not contain ':'",
                self.node_id
            )));
        }
        if self.coordination.max_nodes == 0 {
            return Err(CoordError::Config("max_nodes must be at least 1".to_string()));
        }
        if self.coordination.connection_test_retries == 0 {
            return Err(CoordError::Config(
                "connection_test_retries must be at least 1".to_string(),
            ));
        }
        if self.coordination.dedup_capacity == 0 {
            return Err(CoordError::Config("dedup_capacity must be at least 1".to_string()));
        }
        self.coordination_polling
            .validate()
            .map_err(|e| CoordError::Config(format!("coordination_polling: {}", e)))?;
        self.data_polling
            .validate()
            .map_err(|e| CoordError::Config(format!("data_polling: {}", e)))?;
        if let ElectionConfig::Capability { field, .. } = &self.election {
            if field.is_empty() {
                return Err(CoordError::Config(
                    "capability election requires a metadata field".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Load a session config from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoordError::Config(format!("Failed to read session config {:?}: {}", path, e))
        })?;

        toml::from_str(&content).with_context(|| format!("Failed to parse session config {:?}", path))
    }

    /// Load a session config, returning defaults if any error occurs
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Using default session config: {}", e);
                Self::default()
            }
        }
    }

    /// Save the session config as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CoordError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| CoordError::Config(format!("Failed to serialize session config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            CoordError::Config(format!("Failed to write session config {:?}: {}", path, e))
        })
    }
}
