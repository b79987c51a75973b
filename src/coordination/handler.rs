//! Role-specific message handling
//!
//! A [`MessageHandler`] is installed once the local role is fixed. Handlers
//! never touch the transport: they mutate [`CoordinationState`] and record
//! their effects (outbound messages, session events, the join outcome) in a
//! [`HandlerContext`] that the session driver applies afterwards.

use super::state::{CoordinationState, Phase};
use crate::protocol::{CoordinationMessage, MessagePayload, StreamControl};
use crate::types::{NetworkNode, NodeRole, StreamDescriptor};
use chrono::{DateTime, Utc};

/// Stream lifecycle instruction issued by the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum StreamCommand {
    Create(StreamDescriptor),
    Start(String),
    Stop(String),
    Pause(String),
    Resume(String),
    Flush(String),
    Destroy(String),
}

impl StreamCommand {
    pub fn stream_id(&self) -> &str {
        match self {
            StreamCommand::Create(stream) => &stream.id,
            StreamCommand::Start(id)
            | StreamCommand::Stop(id)
            | StreamCommand::Pause(id)
            | StreamCommand::Resume(id)
            | StreamCommand::Flush(id)
            | StreamCommand::Destroy(id) => id,
        }
    }

    /// The lifecycle command carried by `payload`, if any
    pub fn from_payload(payload: &MessagePayload) -> Option<Self> {
        let command = match payload {
            MessagePayload::CreateStream { stream } => StreamCommand::Create(stream.clone()),
            MessagePayload::StartStream(c) => StreamCommand::Start(c.stream_id.clone()),
            MessagePayload::StopStream(c) => StreamCommand::Stop(c.stream_id.clone()),
            MessagePayload::PauseStream(c) => StreamCommand::Pause(c.stream_id.clone()),
            MessagePayload::ResumeStream(c) => StreamCommand::Resume(c.stream_id.clone()),
            MessagePayload::FlushStream(c) => StreamCommand::Flush(c.stream_id.clone()),
            MessagePayload::DestroyStream(c) => StreamCommand::Destroy(c.stream_id.clone()),
            _ => return None,
        };
        Some(command)
    }

    pub fn to_payload(&self) -> MessagePayload {
        match self {
            StreamCommand::Create(stream) => MessagePayload::CreateStream {
                stream: stream.clone(),
            },
            StreamCommand::Start(id) => MessagePayload::StartStream(StreamControl::new(id.clone())),
            StreamCommand::Stop(id) => MessagePayload::StopStream(StreamControl::new(id.clone())),
            StreamCommand::Pause(id) => MessagePayload::PauseStream(StreamControl::new(id.clone())),
            StreamCommand::Resume(id) => MessagePayload::ResumeStream(StreamControl::new(id.clone())),
            StreamCommand::Flush(id) => MessagePayload::FlushStream(StreamControl::new(id.clone())),
            StreamCommand::Destroy(id) => MessagePayload::DestroyStream(StreamControl::new(id.clone())),
        }
    }
}

/// Why a node disappeared from the topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveReason {
    /// The node announced it was leaving
    Announced(Option<String>),
    /// No heartbeat within the node timeout
    Timeout,
    /// Dropped from a coordinator's topology update
    Removed,
}

/// Something the application may want to react to
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    RoleAssigned(NodeRole),
    PhaseChanged {
        from: Phase,
        to: Phase,
    },
    NodeJoined(NetworkNode),
    NodeLeft {
        node_id: String,
        reason: LeaveReason,
    },
    /// Membership after any change, in id order
    TopologyChanged {
        node_ids: Vec<String>,
    },
    JoinRejected {
        reason: String,
    },
    /// The coordinator left or went silent; no re-election is attempted
    CoordinatorLost {
        coordinator_id: String,
    },
    /// Another node claims to coordinate the same session
    CoordinatorConflict {
        other_coordinator_id: String,
    },
    /// Heartbeat from a node that is not a member
    PossibleRejoin {
        node_id: String,
    },
    StreamCommand {
        from: String,
        command: StreamCommand,
    },
    StreamReady {
        node_id: String,
        stream_id: String,
        source_id: String,
    },
    UserMessage {
        from: String,
        topic: String,
        data: serde_json::Value,
    },
    ConfigUpdate {
        from: String,
        config: serde_json::Value,
    },
}

/// Final answer to a join request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Accepted { coordinator_id: String },
    Rejected { reason: String },
}

/// A message a handler wants sent
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub payload: MessagePayload,
    /// `None` broadcasts
    pub targets: Option<Vec<String>>,
    pub reply_to: Option<String>,
}

/// Effects collected while handling one message or tick
#[derive(Debug, Default)]
pub struct HandlerContext {
    outbound: Vec<Outbound>,
    events: Vec<SessionEvent>,
    join_outcome: Option<JoinOutcome>,
}

impl HandlerContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broadcast(&mut self, payload: MessagePayload) {
        self.outbound.push(Outbound {
            payload,
            targets: None,
            reply_to: None,
        });
    }

    pub fn send_to(&mut self, payload: MessagePayload, targets: Vec<String>) {
        self.outbound.push(Outbound {
            payload,
            targets: Some(targets),
            reply_to: None,
        });
    }

    /// Answer `request`, addressed to its sender only
    pub fn reply(&mut self, payload: MessagePayload, request: &CoordinationMessage) {
        self.outbound.push(Outbound {
            payload,
            targets: Some(vec![request.from_node_id.clone()]),
            reply_to: Some(request.message_id.clone()),
        });
    }

    pub fn emit(&mut self, event: SessionEvent) {
        self.events.push(event);
    }

    pub fn set_join_outcome(&mut self, outcome: JoinOutcome) {
        self.join_outcome = Some(outcome);
    }

    pub fn outbound(&self) -> &[Outbound] {
        &self.outbound
    }

    pub fn events(&self) -> &[SessionEvent] {
        &self.events
    }

    pub fn join_outcome(&self) -> Option<&JoinOutcome> {
        self.join_outcome.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.events.is_empty() && self.join_outcome.is_none()
    }

    /// Split into outbound messages, events and join outcome
    pub fn into_parts(self) -> (Vec<Outbound>, Vec<SessionEvent>, Option<JoinOutcome>) {
        (self.outbound, self.events, self.join_outcome)
    }
}

/// Change phase and record the transition as an event
///
/// Illegal transitions are logged and ignored.
pub fn change_phase(state: &mut CoordinationState, ctx: &mut HandlerContext, to: Phase) {
    match state.transition(to) {
        Ok(from) if from != to => ctx.emit(SessionEvent::PhaseChanged { from, to }),
        Ok(_) => {}
        Err(e) => tracing::warn!("{}", e),
    }
}

/// Role-specific reaction to inbound messages and the heartbeat tick
pub trait MessageHandler: Send {
    fn role(&self) -> NodeRole;

    /// React to one accepted inbound message
    fn handle(&mut self, message: &CoordinationMessage, state: &mut CoordinationState, ctx: &mut HandlerContext);

    /// Periodic work, called every heartbeat interval
    fn on_tick(&mut self, now: DateTime<Utc>, state: &mut CoordinationState, ctx: &mut HandlerContext);

    /// Coordinator-only operations
    fn as_coordinator(&mut self) -> Option<&mut super::coordinator::CoordinatorHandler> {
        None
    }
}
