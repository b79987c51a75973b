//! Core data types for lsl-coord
//!
//! This module contains the value types shared by the transport, polling and
//! coordination layers.
//!
//! # Main Types
//!
//! - [`NetworkNode`] - A participating device/process as seen by this node
//! - [`NodeRole`] - Role of a node in the session topology
//! - [`StreamDescriptor`] - Everything needed to materialize a stream endpoint
//! - [`Sample`] / [`SampleData`] - One timestamped multi-channel sample
//!
//! `NetworkNode` is an immutable value: updates go through the copy-with-changes
//! builders (`with_role`, `touched`, ...) and replace the stored value wholesale.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Free-form metadata attached to nodes and streams
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Role of a node in the session topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Not yet part of a topology
    #[default]
    Discovering,
    /// Joined member that is not the coordinator
    Participant,
    /// Owner of join admission and topology broadcast
    Coordinator,
    /// Left the session or was evicted
    Disconnected,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Discovering => write!(f, "discovering"),
            NodeRole::Participant => write!(f, "participant"),
            NodeRole::Coordinator => write!(f, "coordinator"),
            NodeRole::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// A participating device/process in a coordination session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkNode {
    /// Unique node identifier
    pub id: String,
    /// Human readable name
    pub name: String,
    /// Current role
    pub role: NodeRole,
    /// Last time this node was observed (join, heartbeat or discovery)
    pub last_seen: DateTime<Utc>,
    /// Capabilities and other free-form attributes
    #[serde(default)]
    pub metadata: Metadata,
}

impl NetworkNode {
    /// Create a node observed right now in the discovering role
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: NodeRole::Discovering,
            last_seen: Utc::now(),
            metadata: Metadata::new(),
        }
    }

    /// Copy with a different role
    pub fn with_role(&self, role: NodeRole) -> Self {
        Self {
            role,
            ..self.clone()
        }
    }

    /// Copy with `last_seen` refreshed to now
    pub fn touched(&self) -> Self {
        self.seen_at(Utc::now())
    }

    /// Copy with an explicit `last_seen`
    pub fn seen_at(&self, at: DateTime<Utc>) -> Self {
        Self {
            last_seen: at,
            ..self.clone()
        }
    }

    /// Copy with an additional metadata entry
    pub fn with_metadata(&self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        let mut metadata = self.metadata.clone();
        metadata.insert(key.into(), value.into());
        Self {
            metadata,
            ..self.clone()
        }
    }

    /// Numeric metadata lookup used by capability-based election
    pub fn metric(&self, field: &str) -> Option<f64> {
        self.metadata.get(field).and_then(|v| v.as_f64())
    }

    /// Whether this node is the session coordinator
    pub fn is_coordinator(&self) -> bool {
        self.role == NodeRole::Coordinator
    }

    /// Equality ignoring `last_seen`, used to decide whether a topology entry changed
    pub fn same_identity(&self, other: &NetworkNode) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.role == other.role
            && self.metadata == other.metadata
    }
}

/// Numeric format of a stream's channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelFormat {
    /// 32-bit float
    #[default]
    Float32,
    /// 64-bit float
    Double64,
    /// 32-bit signed integer
    Int32,
    /// 16-bit signed integer
    Int16,
    /// 8-bit signed integer
    Int8,
    /// Variable-length UTF-8 strings
    String,
}

impl ChannelFormat {
    /// Whether `data` carries values of this format
    pub fn accepts(&self, data: &SampleData) -> bool {
        matches!(
            (self, data),
            (ChannelFormat::Float32, SampleData::Float32(_))
                | (ChannelFormat::Double64, SampleData::Float64(_))
                | (ChannelFormat::Int32, SampleData::Int32(_))
                | (ChannelFormat::Int16, SampleData::Int16(_))
                | (ChannelFormat::Int8, SampleData::Int8(_))
                | (ChannelFormat::String, SampleData::Text(_))
        )
    }
}

impl fmt::Display for ChannelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelFormat::Float32 => write!(f, "float32"),
            ChannelFormat::Double64 => write!(f, "double64"),
            ChannelFormat::Int32 => write!(f, "int32"),
            ChannelFormat::Int16 => write!(f, "int16"),
            ChannelFormat::Int8 => write!(f, "int8"),
            ChannelFormat::String => write!(f, "string"),
        }
    }
}

/// Whether this node produces, consumes or relays a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolRole {
    #[default]
    Producer,
    Consumer,
    Relay,
}

/// Description of a named data or control stream
///
/// Created when a layer or the coordination channel declares a stream and
/// consumed by the transport channel abstraction to open endpoints. Endpoints
/// opened from a descriptor are owned by the descriptor's owner and must be
/// destroyed before the descriptor is discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Logical stream identifier (layer id, "coordination", ...)
    pub id: String,
    /// Transport-level stream name used for discovery
    pub name: String,
    /// Content type (e.g. "EEG", "Markers", "Coordination")
    #[serde(default)]
    pub stream_type: String,
    /// Unique source identifier, following the `naming` conventions
    pub source_id: String,
    /// Number of channels per sample
    pub channel_count: u32,
    /// Channel value format
    #[serde(default)]
    pub channel_format: ChannelFormat,
    /// Nominal maximum sample rate in Hz (0 = irregular)
    #[serde(default)]
    pub max_sample_rate: f64,
    /// Rate at which consumers should poll this stream
    #[serde(default)]
    pub polling_frequency_hz: f64,
    /// Producer/consumer/relay role of the declaring node
    #[serde(default)]
    pub protocol_role: ProtocolRole,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: Metadata,
}

impl StreamDescriptor {
    /// Create a descriptor with a single float channel and irregular rate
    pub fn new(id: impl Into<String>, name: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            stream_type: String::new(),
            source_id: source_id.into(),
            channel_count: 1,
            channel_format: ChannelFormat::Float32,
            max_sample_rate: 0.0,
            polling_frequency_hz: 0.0,
            protocol_role: ProtocolRole::Producer,
            metadata: Metadata::new(),
        }
    }

    /// Set the stream content type
    pub fn with_type(mut self, stream_type: impl Into<String>) -> Self {
        self.stream_type = stream_type.into();
        self
    }

    /// Set channel count and format
    pub fn with_channels(mut self, count: u32, format: ChannelFormat) -> Self {
        self.channel_count = count;
        self.channel_format = format;
        self
    }

    /// Set the nominal sample rate
    pub fn with_sample_rate(mut self, hz: f64) -> Self {
        self.max_sample_rate = hz;
        self
    }

    /// Set the preferred polling frequency
    pub fn with_polling_frequency(mut self, hz: f64) -> Self {
        self.polling_frequency_hz = hz;
        self
    }

    /// Set the protocol role
    pub fn with_protocol_role(mut self, role: ProtocolRole) -> Self {
        self.protocol_role = role;
        self
    }

    /// Copy with a different source id (same stream declared by another node)
    pub fn for_source(&self, source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            ..self.clone()
        }
    }

    /// Identifier of endpoints opened from this descriptor
    pub fn endpoint_id(&self) -> String {
        format!("{}@{}", self.name, self.source_id)
    }
}

/// Values of one sample, one entry per channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", content = "values", rename_all = "snake_case")]
pub enum SampleData {
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Int32(Vec<i32>),
    Int16(Vec<i16>),
    Int8(Vec<i8>),
    Text(Vec<String>),
}

impl SampleData {
    /// Number of channels in this sample
    pub fn channel_count(&self) -> usize {
        match self {
            SampleData::Float32(v) => v.len(),
            SampleData::Float64(v) => v.len(),
            SampleData::Int32(v) => v.len(),
            SampleData::Int16(v) => v.len(),
            SampleData::Int8(v) => v.len(),
            SampleData::Text(v) => v.len(),
        }
    }

    /// Single-channel string sample (coordination wire format)
    pub fn text(value: impl Into<String>) -> Self {
        SampleData::Text(vec![value.into()])
    }

    /// First channel as a string, if this is a string sample
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SampleData::Text(values) => values.first().map(String::as_str),
            _ => None,
        }
    }
}

/// One sample pulled from an inlet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Channel values
    pub data: SampleData,
    /// Capture timestamp on the producer's transport clock (seconds)
    pub timestamp: f64,
}

impl Sample {
    /// Create a new sample
    pub fn new(data: SampleData, timestamp: f64) -> Self {
        Self { data, timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_copy_with_changes() {
        let node = NetworkNode::new("n1", "Node 1");
        let coordinator = node.with_role(NodeRole::Coordinator);

        assert_eq!(node.role, NodeRole::Discovering);
        assert!(coordinator.is_coordinator());
        assert_eq!(coordinator.id, "n1");
    }

    #[test]
    fn test_node_metric() {
        let node = NetworkNode::new("n1", "Node 1")
            .with_metadata("battery", 87.5)
            .with_metadata("label", "lab-a");
        assert_eq!(node.metric("battery"), Some(87.5));
        assert_eq!(node.metric("label"), None);
        assert_eq!(node.metric("missing"), None);
    }

    #[test]
    fn test_same_identity_ignores_last_seen() {
        let node = NetworkNode::new("n1", "Node 1");
        let later = node.seen_at(node.last_seen + chrono::Duration::seconds(5));
        assert!(node.same_identity(&later));
        assert!(!node.same_identity(&later.with_role(NodeRole::Participant)));
    }

    #[test]
    fn test_channel_format_accepts() {
        assert!(ChannelFormat::Float32.accepts(&SampleData::Float32(vec![1.0])));
        assert!(ChannelFormat::String.accepts(&SampleData::text("x")));
        assert!(!ChannelFormat::Int8.accepts(&SampleData::Int32(vec![1])));
    }

    #[test]
    fn test_descriptor_endpoint_id() {
        let desc = StreamDescriptor::new("eeg", "EEG", "data:n1:eeg");
        assert_eq!(desc.endpoint_id(), "EEG@data:n1:eeg");
        let other = desc.for_source("data:n2:eeg");
        assert_eq!(other.id, "eeg");
        assert_ne!(desc.endpoint_id(), other.endpoint_id());
    }

    #[test]
    fn test_sample_data_serialization() {
        let data = SampleData::Float32(vec![1.0, 2.0]);
        let json = serde_json::to_string(&data).unwrap();
        assert!(json.contains("\"format\":\"float32\""));
        let parsed: SampleData = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, data);
    }
}
