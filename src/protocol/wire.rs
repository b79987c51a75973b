//! Wire encoding of coordination messages
//!
//! Each message travels as one single-channel string sample holding a JSON
//! record:
//!
//! ```text
//! { "messageId": "...", "type": "joinRequest", "payload": { ... },
//!   "timestamp": 1700000000000, "sessionId": "lab", "fromNodeId": "n2",
//!   "targetNodes": ["n1"], "replyToMessageId": "..." }
//! ```
//!
//! `targetNodes` and `replyToMessageId` are omitted when absent. A record
//! whose `type` this build does not know decodes to
//! [`Decoded::UnknownType`] so newer peers never crash older ones.

use super::messages::{CoordinationMessage, MessagePayload, MessageType};
use crate::error::{CoordError, Result};
use crate::types::SampleData;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON record carried in a coordination sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
    pub message_id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: i64,
    pub session_id: String,
    pub from_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_nodes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
}

/// Result of decoding one record
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(CoordinationMessage),
    /// Well-formed envelope with a type this build does not know
    UnknownType(WireEnvelope),
}

impl WireEnvelope {
    /// Envelope of a known message
    pub fn from_message(message: &CoordinationMessage) -> Result<Self> {
        let mut tagged = serde_json::to_value(&message.payload)?;
        let payload = tagged
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok(Self {
            message_id: message.message_id.clone(),
            message_type: message.message_type().as_str().to_string(),
            payload,
            timestamp: message.timestamp,
            session_id: message.session_id.clone(),
            from_node_id: message.from_node_id.clone(),
            target_nodes: message.target_nodes.clone(),
            reply_to_message_id: message.reply_to_message_id.clone(),
        })
    }

    /// Build the typed message, if the type is known
    pub fn into_decoded(self) -> Result<Decoded> {
        if self.message_type.parse::<MessageType>().is_err() {
            return Ok(Decoded::UnknownType(self));
        }

        let tagged = serde_json::json!({
            "type": self.message_type,
            "payload": self.payload,
        });
        let payload: MessagePayload = serde_json::from_value(tagged).map_err(|e| {
            CoordError::protocol(format!(
                "malformed {} payload in {}: {}",
                self.message_type, self.message_id, e
            ))
        })?;

        Ok(Decoded::Message(CoordinationMessage {
            message_id: self.message_id,
            session_id: self.session_id,
            from_node_id: self.from_node_id,
            timestamp: self.timestamp,
            target_nodes: self.target_nodes,
            reply_to_message_id: self.reply_to_message_id,
            payload,
        }))
    }
}

/// Encode a message as a JSON string
pub fn encode(message: &CoordinationMessage) -> Result<String> {
    Ok(serde_json::to_string(&WireEnvelope::from_message(message)?)?)
}

/// Decode a JSON string; malformed records are protocol errors
pub fn decode(raw: &str) -> Result<Decoded> {
    let envelope: WireEnvelope = serde_json::from_str(raw)
        .map_err(|e| CoordError::protocol(format!("malformed coordination record: {}", e)))?;
    envelope.into_decoded()
}

/// Encode a message as a coordination sample
pub fn encode_sample(message: &CoordinationMessage) -> Result<SampleData> {
    Ok(SampleData::text(encode(message)?))
}

/// Decode a coordination sample
pub fn decode_sample(data: &SampleData) -> Result<Decoded> {
    let raw = data
        .as_text()
        .ok_or_else(|| CoordError::protocol("coordination sample is not a string sample"))?;
    decode(raw)
}
