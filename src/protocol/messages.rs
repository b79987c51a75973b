//! Coordination message catalog
//!
//! Every message has a common header (id, session, sender, timestamp,
//! optional targets and reply reference) and one [`MessagePayload`] variant.
//! Dispatch is an exhaustive `match`; unknown wire types are handled in
//! [`wire`](super::wire) before a payload is ever built.

use crate::types::{NetworkNode, NodeRole, StreamDescriptor};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies a stream in lifecycle commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamControl {
    pub stream_id: String,
}

impl StreamControl {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }
}

/// Message-specific content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum MessagePayload {
    /// Hello from a node looking for a session, or a coordinator announcement
    Discovery {
        node: NetworkNode,
        coordinator_id: Option<String>,
    },
    JoinRequest {
        node: NetworkNode,
    },
    /// Coordinator inviting a discovered non-member to join
    JoinOffer {
        coordinator: NetworkNode,
    },
    JoinAccept {
        node_id: String,
        coordinator_id: String,
        topology: Vec<NetworkNode>,
    },
    JoinReject {
        node_id: String,
        reason: String,
    },
    Heartbeat {
        role: NodeRole,
    },
    TopologyUpdate {
        coordinator_id: String,
        nodes: Vec<NetworkNode>,
    },
    NodeLeaving {
        node_id: String,
        reason: Option<String>,
    },
    ConnectionTest {
        test_id: String,
    },
    ConnectionTestResponse {
        test_id: String,
    },
    CreateStream {
        stream: StreamDescriptor,
    },
    StartStream(StreamControl),
    StopStream(StreamControl),
    PauseStream(StreamControl),
    ResumeStream(StreamControl),
    FlushStream(StreamControl),
    DestroyStream(StreamControl),
    /// A node's outlet for a stream is up
    StreamReady {
        stream_id: String,
        source_id: String,
    },
    UserMessage {
        topic: String,
        data: serde_json::Value,
    },
    ConfigUpdate {
        config: serde_json::Value,
    },
}

impl MessagePayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessagePayload::Discovery { .. } => MessageType::Discovery,
            MessagePayload::JoinRequest { .. } => MessageType::JoinRequest,
            MessagePayload::JoinOffer { .. } => MessageType::JoinOffer,
            MessagePayload::JoinAccept { .. } => MessageType::JoinAccept,
            MessagePayload::JoinReject { .. } => MessageType::JoinReject,
            MessagePayload::Heartbeat { .. } => MessageType::Heartbeat,
            MessagePayload::TopologyUpdate { .. } => MessageType::TopologyUpdate,
            MessagePayload::NodeLeaving { .. } => MessageType::NodeLeaving,
            MessagePayload::ConnectionTest { .. } => MessageType::ConnectionTest,
            MessagePayload::ConnectionTestResponse { .. } => MessageType::ConnectionTestResponse,
            MessagePayload::CreateStream { .. } => MessageType::CreateStream,
            MessagePayload::StartStream(_) => MessageType::StartStream,
            MessagePayload::StopStream(_) => MessageType::StopStream,
            MessagePayload::PauseStream(_) => MessageType::PauseStream,
            MessagePayload::ResumeStream(_) => MessageType::ResumeStream,
            MessagePayload::FlushStream(_) => MessageType::FlushStream,
            MessagePayload::DestroyStream(_) => MessageType::DestroyStream,
            MessagePayload::StreamReady { .. } => MessageType::StreamReady,
            MessagePayload::UserMessage { .. } => MessageType::UserMessage,
            MessagePayload::ConfigUpdate { .. } => MessageType::ConfigUpdate,
        }
    }
}

/// Wire name of every known message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Discovery,
    JoinRequest,
    JoinOffer,
    JoinAccept,
    JoinReject,
    Heartbeat,
    TopologyUpdate,
    NodeLeaving,
    ConnectionTest,
    ConnectionTestResponse,
    CreateStream,
    StartStream,
    StopStream,
    PauseStream,
    ResumeStream,
    FlushStream,
    DestroyStream,
    StreamReady,
    UserMessage,
    ConfigUpdate,
}

impl MessageType {
    pub const ALL: [MessageType; 20] = [
        MessageType::Discovery,
        MessageType::JoinRequest,
        MessageType::JoinOffer,
        MessageType::JoinAccept,
        MessageType::JoinReject,
        MessageType::Heartbeat,
        MessageType::TopologyUpdate,
        MessageType::NodeLeaving,
        MessageType::ConnectionTest,
        MessageType::ConnectionTestResponse,
        MessageType::CreateStream,
        MessageType::StartStream,
        MessageType::StopStream,
        MessageType::PauseStream,
        MessageType::ResumeStream,
        MessageType::FlushStream,
        MessageType::DestroyStream,
        MessageType::StreamReady,
        MessageType::UserMessage,
        MessageType::ConfigUpdate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Discovery => "discovery",
            MessageType::JoinRequest => "joinRequest",
            MessageType::JoinOffer => "joinOffer",
            MessageType::JoinAccept => "joinAccept",
            MessageType::JoinReject => "joinReject",
            MessageType::Heartbeat => "heartbeat",
            MessageType::TopologyUpdate => "topologyUpdate",
            MessageType::NodeLeaving => "nodeLeaving",
            MessageType::ConnectionTest => "connectionTest",
            MessageType::ConnectionTestResponse => "connectionTestResponse",
            MessageType::CreateStream => "createStream",
            MessageType::StartStream => "startStream",
            MessageType::StopStream => "stopStream",
            MessageType::PauseStream => "pauseStream",
            MessageType::ResumeStream => "resumeStream",
            MessageType::FlushStream => "flushStream",
            MessageType::DestroyStream => "destroyStream",
            MessageType::StreamReady => "streamReady",
            MessageType::UserMessage => "userMessage",
            MessageType::ConfigUpdate => "configUpdate",
        }
    }

    /// Messages a participant handles in every phase
    pub fn is_connection_management(&self) -> bool {
        matches!(
            self,
            MessageType::JoinAccept
                | MessageType::JoinReject
                | MessageType::JoinOffer
                | MessageType::ConnectionTestResponse
                | MessageType::Heartbeat
                | MessageType::TopologyUpdate
        )
    }

    /// Create/start/stop/pause/resume/flush/destroy
    pub fn is_stream_lifecycle(&self) -> bool {
        matches!(
            self,
            MessageType::CreateStream
                | MessageType::StartStream
                | MessageType::StopStream
                | MessageType::PauseStream
                | MessageType::ResumeStream
                | MessageType::FlushStream
                | MessageType::DestroyStream
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown message type '{}'", s))
    }
}

/// One coordination message
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinationMessage {
    /// UUID v4, unique per sender
    pub message_id: String,
    pub session_id: String,
    pub from_node_id: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Intended recipients; `None` means everyone
    pub target_nodes: Option<Vec<String>>,
    pub reply_to_message_id: Option<String>,
    pub payload: MessagePayload,
}

impl CoordinationMessage {
    pub fn new(session_id: impl Into<String>, from_node_id: impl Into<String>, payload: MessagePayload) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            from_node_id: from_node_id.into(),
            timestamp: Utc::now().timestamp_millis(),
            target_nodes: None,
            reply_to_message_id: None,
            payload,
        }
    }

    /// Address to specific nodes; receivers filter on this
    pub fn targeted(mut self, nodes: Vec<String>) -> Self {
        self.target_nodes = Some(nodes);
        self
    }

    /// Reference the message this one answers
    pub fn reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to_message_id = Some(message_id.into());
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// Broadcasts are addressed to everyone
    pub fn is_addressed_to(&self, node_id: &str) -> bool {
        self.target_nodes
            .as_ref()
            .map_or(true, |targets| targets.iter().any(|t| t == node_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_names_round_trip() {
        for t in MessageType::ALL {
            assert_eq!(t.as_str().parse::<MessageType>().unwrap(), t);
        }
        assert!("selfDestruct".parse::<MessageType>().is_err());
    }

    #[test]
    fn test_serde_tag_matches_type_name() {
        let payload = MessagePayload::JoinReject {
            node_id: "n2".to_string(),
            reason: "Maximum nodes reached".to_string(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], payload.message_type().as_str());
        assert_eq!(value["payload"]["nodeId"], "n2");

        let value = serde_json::to_value(MessagePayload::StartStream(StreamControl::new("eeg"))).unwrap();
        assert_eq!(value["type"], "startStream");
        assert_eq!(value["payload"]["streamId"], "eeg");
    }

    #[test]
    fn test_addressing() {
        let msg = CoordinationMessage::new("lab", "n1", MessagePayload::Heartbeat {
            role: NodeRole::Coordinator,
        });
        assert!(msg.is_addressed_to("anyone"));

        let msg = msg.targeted(vec!["n2".to_string()]);
        assert!(msg.is_addressed_to("n2"));
        assert!(!msg.is_addressed_to("n3"));
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = CoordinationMessage::new("lab", "n1", MessagePayload::Heartbeat {
            role: NodeRole::Participant,
        });
        let b = CoordinationMessage::new("lab", "n1", a.payload.clone());
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn test_message_classes() {
        assert!(MessageType::TopologyUpdate.is_connection_management());
        assert!(!MessageType::StartStream.is_connection_management());
        assert!(MessageType::StartStream.is_stream_lifecycle());
        assert!(!MessageType::UserMessage.is_stream_lifecycle());
    }
}
