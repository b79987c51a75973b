//! Stream name and source id conventions
//!
//! The transport has no directory service, so streams are found by predicate.
//! Source ids carry a coordination-vs-data discriminator and the owning node
//! id, separated by `:`:
//!
//! - coordination: `coord:{node_id}:{session_id}`
//! - data: `data:{node_id}:{stream_id}`
//!
//! Node ids therefore must not contain `:` (enforced by config validation).

use crate::transport::StreamPredicate;
use crate::types::{ChannelFormat, ProtocolRole, StreamDescriptor};

/// Discriminator of coordination streams
pub const COORDINATION_PREFIX: &str = "coord";

/// Discriminator of data streams
pub const DATA_PREFIX: &str = "data";

/// Content type of coordination streams
pub const COORDINATION_STREAM_TYPE: &str = "Coordination";

const SEPARATOR: char = ':';

/// Stream name of the coordination channel of `session_id`
pub fn coordination_stream_name(session_id: &str) -> String {
    format!("{}_coordination", session_id)
}

/// Source id of `node_id`'s coordination outlet
pub fn coordination_source_id(node_id: &str, session_id: &str) -> String {
    format!("{}{}{}{}{}", COORDINATION_PREFIX, SEPARATOR, node_id, SEPARATOR, session_id)
}

/// Source id of `node_id`'s outlet for data stream `stream_id`
pub fn data_source_id(node_id: &str, stream_id: &str) -> String {
    format!("{}{}{}{}{}", DATA_PREFIX, SEPARATOR, node_id, SEPARATOR, stream_id)
}

/// Prefix shared by every coordination source id
pub fn coordination_prefix() -> String {
    format!("{}{}", COORDINATION_PREFIX, SEPARATOR)
}

/// Prefix of all coordination streams owned by `node_id`
pub fn own_coordination_prefix(node_id: &str) -> String {
    format!("{}{}{}{}", COORDINATION_PREFIX, SEPARATOR, node_id, SEPARATOR)
}

/// Prefix of all data streams owned by `node_id`
pub fn own_data_prefix(node_id: &str) -> String {
    format!("{}{}{}{}", DATA_PREFIX, SEPARATOR, node_id, SEPARATOR)
}

/// Node id encoded in a source id following these conventions
pub fn owner_node_id(source_id: &str) -> Option<&str> {
    let mut parts = source_id.splitn(3, SEPARATOR);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(kind), Some(node), Some(_)) if (kind == COORDINATION_PREFIX || kind == DATA_PREFIX) && !node.is_empty() => {
            Some(node)
        }
        _ => None,
    }
}

/// Descriptor of `node_id`'s coordination outlet for `session_id`
pub fn coordination_descriptor(session_id: &str, node_id: &str) -> StreamDescriptor {
    StreamDescriptor::new(
        "coordination",
        coordination_stream_name(session_id),
        coordination_source_id(node_id, session_id),
    )
    .with_type(COORDINATION_STREAM_TYPE)
    .with_channels(1, ChannelFormat::String)
    .with_protocol_role(ProtocolRole::Relay)
}

/// Predicate discovering every coordination stream of `session_id`
pub fn coordination_predicate(session_id: &str) -> StreamPredicate {
    StreamPredicate::by_name(coordination_stream_name(session_id)).with_source_prefix(coordination_prefix())
}

/// Predicate discovering every node's instance of a data stream
pub fn data_predicate(stream_name: &str) -> StreamPredicate {
    StreamPredicate::by_name(stream_name).with_source_prefix(format!("{}{}", DATA_PREFIX, SEPARATOR))
}
