//! Coordinator role
//!
//! Owns join admission and the authoritative topology. Every membership change
//! is followed by a full `TopologyUpdate` broadcast.

use super::handler::{HandlerContext, LeaveReason, MessageHandler, SessionEvent, StreamCommand};
use super::state::CoordinationState;
use crate::config::CoordinationConfig;
use crate::protocol::{CoordinationMessage, MessagePayload};
use crate::types::{NetworkNode, NodeRole};
use chrono::{DateTime, Utc};

pub const REJECT_MAX_NODES: &str = "Maximum nodes reached";
pub const REJECT_NOT_ACCEPTING: &str = "Not accepting new nodes";

pub struct CoordinatorHandler {
    local: NetworkNode,
    config: CoordinationConfig,
}

impl CoordinatorHandler {
    pub fn new(local: NetworkNode, config: CoordinationConfig) -> Self {
        Self {
            local: local.with_role(NodeRole::Coordinator),
            config,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.local.id
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    /// Stop or resume admitting new nodes
    pub fn set_accepting(&mut self, accepting: bool) {
        self.config.accepting_new_nodes = accepting;
    }

    /// Take over as coordinator of a fresh topology
    pub fn assume_role(&self, state: &mut CoordinationState, ctx: &mut HandlerContext) {
        state.role = Some(NodeRole::Coordinator);
        state.coordinator_id = Some(self.local.id.clone());
        state.topology.upsert(self.local.touched());
        ctx.emit(SessionEvent::RoleAssigned(NodeRole::Coordinator));
        self.announce(ctx);
        self.broadcast_topology(state, ctx);
    }

    /// Advertise this node as the session coordinator
    pub fn announce(&self, ctx: &mut HandlerContext) {
        ctx.broadcast(MessagePayload::Discovery {
            node: self.local.clone(),
            coordinator_id: Some(self.local.id.clone()),
        });
    }

    pub fn broadcast_topology(&self, state: &CoordinationState, ctx: &mut HandlerContext) {
        ctx.broadcast(MessagePayload::TopologyUpdate {
            coordinator_id: self.local.id.clone(),
            nodes: state.topology.snapshot(),
        });
        ctx.emit(SessionEvent::TopologyChanged {
            node_ids: state.topology.node_ids(),
        });
    }

    pub fn broadcast_stream_command(&self, command: &StreamCommand, ctx: &mut HandlerContext) {
        ctx.broadcast(command.to_payload());
    }

    pub fn broadcast_config_update(&self, config: serde_json::Value, ctx: &mut HandlerContext) {
        ctx.broadcast(MessagePayload::ConfigUpdate { config });
    }

    /// Why `node` may not join, if it may not
    fn admission_refusal(&self, state: &CoordinationState) -> Option<&'static str> {
        if !self.config.accepting_new_nodes {
            return Some(REJECT_NOT_ACCEPTING);
        }
        if state.topology.len() >= self.config.max_nodes {
            return Some(REJECT_MAX_NODES);
        }
        None
    }

    fn handle_join_request(
        &self,
        message: &CoordinationMessage,
        node: &NetworkNode,
        state: &mut CoordinationState,
        ctx: &mut HandlerContext,
    ) {
        if node.id != message.from_node_id {
            tracing::warn!(
                "Ignoring join request for {} sent by {}",
                node.id,
                message.from_node_id
            );
            return;
        }

        // A member retrying after a lost accept gets the accept again
        if !state.topology.contains(&node.id) {
            if let Some(reason) = self.admission_refusal(state) {
                tracing::info!("Rejecting join of {} ({}): {}", node.id, node.name, reason);
                ctx.reply(
                    MessagePayload::JoinReject {
                        node_id: node.id.clone(),
                        reason: reason.to_string(),
                    },
                    message,
                );
                return;
            }

            let member = node.with_role(NodeRole::Participant).touched();
            state.topology.upsert(member.clone());
            tracing::info!(
                "Node {} ({}) joined, {} member(s)",
                member.id,
                member.name,
                state.topology.len()
            );
            ctx.emit(SessionEvent::NodeJoined(member));
        }

        ctx.reply(
            MessagePayload::JoinAccept {
                node_id: node.id.clone(),
                coordinator_id: self.local.id.clone(),
                topology: state.topology.snapshot(),
            },
            message,
        );
        self.broadcast_topology(state, ctx);
    }

    fn remove_member(
        &self,
        node_id: &str,
        reason: LeaveReason,
        state: &mut CoordinationState,
        ctx: &mut HandlerContext,
    ) -> bool {
        if node_id == self.local.id || state.topology.remove(node_id).is_none() {
            return false;
        }
        tracing::info!("Node {} left ({:?})", node_id, reason);
        ctx.emit(SessionEvent::NodeLeft {
            node_id: node_id.to_string(),
            reason,
        });
        true
    }
}

impl MessageHandler for CoordinatorHandler {
    fn role(&self) -> NodeRole {
        NodeRole::Coordinator
    }

    fn handle(&mut self, message: &CoordinationMessage, state: &mut CoordinationState, ctx: &mut HandlerContext) {
        let from = message.from_node_id.as_str();
        match &message.payload {
            MessagePayload::JoinRequest { node } => {
                self.handle_join_request(message, node, state, ctx);
            }
            MessagePayload::Heartbeat { role } => {
                if *role == NodeRole::Coordinator {
                    tracing::warn!("Heartbeat from second coordinator {}", from);
                    ctx.emit(SessionEvent::CoordinatorConflict {
                        other_coordinator_id: from.to_string(),
                    });
                } else if !state.topology.touch(from, Utc::now()) {
                    tracing::warn!("Heartbeat from non-member {} (possible rejoin)", from);
                    ctx.emit(SessionEvent::PossibleRejoin {
                        node_id: from.to_string(),
                    });
                }
            }
            MessagePayload::NodeLeaving { node_id, reason } => {
                if node_id != from {
                    tracing::warn!("{} announced the departure of {}; ignored", from, node_id);
                    return;
                }
                if self.remove_member(node_id, LeaveReason::Announced(reason.clone()), state, ctx) {
                    self.broadcast_topology(state, ctx);
                }
            }
            MessagePayload::Discovery { coordinator_id, .. } => {
                match coordinator_id.as_deref() {
                    Some(other) if other != self.local.id => {
                        tracing::warn!("Node {} reports coordinator {}", from, other);
                        ctx.emit(SessionEvent::CoordinatorConflict {
                            other_coordinator_id: other.to_string(),
                        });
                    }
                    _ => {}
                }
                if state.topology.touch(from, Utc::now()) {
                    return;
                }
                if coordinator_id.is_none() {
                    tracing::debug!("Offering membership to {}", from);
                    ctx.send_to(
                        MessagePayload::JoinOffer {
                            coordinator: self.local.clone(),
                        },
                        vec![from.to_string()],
                    );
                }
            }
            MessagePayload::JoinOffer { .. } | MessagePayload::TopologyUpdate { .. } => {
                tracing::warn!("{} from {} while coordinating", message.message_type(), from);
                ctx.emit(SessionEvent::CoordinatorConflict {
                    other_coordinator_id: from.to_string(),
                });
            }
            MessagePayload::StreamReady {
                stream_id,
                source_id,
            } => ctx.emit(SessionEvent::StreamReady {
                node_id: from.to_string(),
                stream_id: stream_id.clone(),
                source_id: source_id.clone(),
            }),
            MessagePayload::UserMessage { topic, data } => ctx.emit(SessionEvent::UserMessage {
                from: from.to_string(),
                topic: topic.clone(),
                data: data.clone(),
            }),
            MessagePayload::ConfigUpdate { config } => ctx.emit(SessionEvent::ConfigUpdate {
                from: from.to_string(),
                config: config.clone(),
            }),
            MessagePayload::JoinAccept { .. }
            | MessagePayload::JoinReject { .. }
            | MessagePayload::ConnectionTest { .. }
            | MessagePayload::ConnectionTestResponse { .. } => {
                tracing::debug!("Coordinator ignores {} from {}", message.message_type(), from);
            }
            MessagePayload::CreateStream { .. }
            | MessagePayload::StartStream(_)
            | MessagePayload::StopStream(_)
            | MessagePayload::PauseStream(_)
            | MessagePayload::ResumeStream(_)
            | MessagePayload::FlushStream(_)
            | MessagePayload::DestroyStream(_) => {
                tracing::warn!("Stream command {} from non-coordinator {}", message.message_type(), from);
            }
        }
    }

    fn on_tick(&mut self, now: DateTime<Utc>, state: &mut CoordinationState, ctx: &mut HandlerContext) {
        state.topology.touch(&self.local.id, now);

        let stale = state
            .topology
            .stale(now, self.config.node_timeout(), &self.local.id);
        let mut changed = false;
        for node_id in stale {
            tracing::warn!("Evicting {} after {:?} of silence", node_id, self.config.node_timeout());
            changed |= self.remove_member(&node_id, LeaveReason::Timeout, state, ctx);
        }

        ctx.broadcast(MessagePayload::Heartbeat {
            role: NodeRole::Coordinator,
        });
        self.announce(ctx);
        if changed {
            self.broadcast_topology(state, ctx);
        }
    }

    fn as_coordinator(&mut self) -> Option<&mut CoordinatorHandler> {
        Some(self)
    }
}
