//! Participant role
//!
//! Connection-management traffic is handled in every phase. Everything else,
//! stream lifecycle commands in particular, is ignored until the join has been
//! accepted.

use super::handler::{
    change_phase, HandlerContext, JoinOutcome, LeaveReason, MessageHandler, SessionEvent, StreamCommand,
};
use super::state::{CoordinationState, Phase};
use crate::config::CoordinationConfig;
use crate::protocol::{CoordinationMessage, MessagePayload};
use crate::types::{NetworkNode, NodeRole};
use chrono::{DateTime, Utc};

pub struct ParticipantHandler {
    local: NetworkNode,
    config: CoordinationConfig,
    coordinator_id: Option<String>,
    last_coordinator_contact: DateTime<Utc>,
    coordinator_lost: bool,
}

impl ParticipantHandler {
    pub fn new(local: NetworkNode, config: CoordinationConfig) -> Self {
        Self {
            local: local.with_role(NodeRole::Participant),
            config,
            coordinator_id: None,
            last_coordinator_contact: Utc::now(),
            coordinator_lost: false,
        }
    }

    pub fn coordinator_id(&self) -> Option<&str> {
        self.coordinator_id.as_deref()
    }

    /// Enter `Joining` towards `coordinator_id`; returns the request to send
    pub fn begin_join(
        &mut self,
        coordinator_id: &str,
        state: &mut CoordinationState,
        ctx: &mut HandlerContext,
    ) -> MessagePayload {
        self.coordinator_id = Some(coordinator_id.to_string());
        self.last_coordinator_contact = Utc::now();
        state.role = Some(NodeRole::Participant);
        state.coordinator_id = Some(coordinator_id.to_string());
        ctx.emit(SessionEvent::RoleAssigned(NodeRole::Participant));
        change_phase(state, ctx, Phase::Joining);
        MessagePayload::JoinRequest {
            node: self.local.clone(),
        }
    }

    fn is_from_coordinator(&self, message: &CoordinationMessage) -> bool {
        self.coordinator_id.as_deref() == Some(message.from_node_id.as_str())
    }

    fn report_coordinator_lost(&mut self, ctx: &mut HandlerContext) {
        if self.coordinator_lost {
            return;
        }
        if let Some(coordinator_id) = &self.coordinator_id {
            self.coordinator_lost = true;
            ctx.emit(SessionEvent::CoordinatorLost {
                coordinator_id: coordinator_id.clone(),
            });
        }
    }

    fn handle_connection_management(
        &mut self,
        message: &CoordinationMessage,
        state: &mut CoordinationState,
        ctx: &mut HandlerContext,
    ) {
        let from = message.from_node_id.as_str();
        match &message.payload {
            MessagePayload::JoinAccept {
                node_id,
                coordinator_id,
                topology,
            } => {
                if *node_id != self.local.id {
                    return;
                }
                if state.phase != Phase::Joining {
                    tracing::debug!("Duplicate join accept from {} in phase {}", from, state.phase);
                    return;
                }
                self.coordinator_id = Some(coordinator_id.clone());
                state.coordinator_id = Some(coordinator_id.clone());
                state.topology.apply_update(topology.clone());
                change_phase(state, ctx, Phase::Ready);
                tracing::info!(
                    "Joined session via coordinator {} ({} member(s))",
                    coordinator_id,
                    state.topology.len()
                );
                ctx.set_join_outcome(JoinOutcome::Accepted {
                    coordinator_id: coordinator_id.clone(),
                });
                ctx.emit(SessionEvent::TopologyChanged {
                    node_ids: state.topology.node_ids(),
                });
            }
            MessagePayload::JoinReject { node_id, reason } => {
                if *node_id != self.local.id || state.phase != Phase::Joining {
                    return;
                }
                tracing::warn!("Join rejected by {}: {}", from, reason);
                change_phase(state, ctx, Phase::Error);
                ctx.set_join_outcome(JoinOutcome::Rejected {
                    reason: reason.clone(),
                });
                ctx.emit(SessionEvent::JoinRejected {
                    reason: reason.clone(),
                });
            }
            MessagePayload::JoinOffer { .. } => {
                tracing::debug!("Join offer from {} in phase {}", from, state.phase);
            }
            MessagePayload::ConnectionTestResponse { .. } => {
                tracing::trace!("Late connection test response from {}", from);
            }
            MessagePayload::Heartbeat { role } => {
                state.topology.touch(from, Utc::now());
                if *role == NodeRole::Coordinator && self.coordinator_id.is_some() && !self.is_from_coordinator(message) {
                    tracing::warn!("Heartbeat from rival coordinator {}", from);
                    ctx.emit(SessionEvent::CoordinatorConflict {
                        other_coordinator_id: from.to_string(),
                    });
                }
            }
            MessagePayload::TopologyUpdate {
                coordinator_id,
                nodes,
            } => {
                if let Some(ours) = &self.coordinator_id {
                    if ours != coordinator_id {
                        tracing::warn!("Topology update from foreign coordinator {}", coordinator_id);
                        ctx.emit(SessionEvent::CoordinatorConflict {
                            other_coordinator_id: coordinator_id.clone(),
                        });
                        return;
                    }
                }

                let diff = state.topology.apply_update(nodes.clone());
                if diff.is_empty() {
                    return;
                }
                for node_id in &diff.added {
                    if let Some(node) = state.topology.get(node_id) {
                        ctx.emit(SessionEvent::NodeJoined(node.as_ref().clone()));
                    }
                }
                for node_id in diff.removed {
                    ctx.emit(SessionEvent::NodeLeft {
                        node_id,
                        reason: LeaveReason::Removed,
                    });
                }
                ctx.emit(SessionEvent::TopologyChanged {
                    node_ids: state.topology.node_ids(),
                });
                if state.phase == Phase::Ready && !state.topology.contains(&self.local.id) {
                    tracing::warn!("Coordinator {} no longer lists this node", coordinator_id);
                }
            }
            other => {
                tracing::debug!("Unexpected {} from {}", other.message_type(), from);
            }
        }
    }
}

impl MessageHandler for ParticipantHandler {
    fn role(&self) -> NodeRole {
        NodeRole::Participant
    }

    fn handle(&mut self, message: &CoordinationMessage, state: &mut CoordinationState, ctx: &mut HandlerContext) {
        if self.is_from_coordinator(message) {
            self.last_coordinator_contact = Utc::now();
            self.coordinator_lost = false;
        }

        let message_type = message.message_type();
        if message_type.is_connection_management() {
            self.handle_connection_management(message, state, ctx);
            return;
        }

        if state.phase != Phase::Ready {
            tracing::debug!(
                "Ignoring {} from {} in phase {}",
                message_type,
                message.from_node_id,
                state.phase
            );
            return;
        }

        let from = message.from_node_id.as_str();
        if let Some(command) = StreamCommand::from_payload(&message.payload) {
            if !self.is_from_coordinator(message) {
                tracing::warn!("Stream command {} from non-coordinator {}", message_type, from);
                return;
            }
            ctx.emit(SessionEvent::StreamCommand {
                from: from.to_string(),
                command,
            });
            return;
        }

        match &message.payload {
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
            MessagePayload::NodeLeaving { node_id, reason } => {
                if node_id != from {
                    return;
                }
                if state.topology.remove(node_id).is_some() {
                    ctx.emit(SessionEvent::NodeLeft {
                        node_id: node_id.clone(),
                        reason: LeaveReason::Announced(reason.clone()),
                    });
                    ctx.emit(SessionEvent::TopologyChanged {
                        node_ids: state.topology.node_ids(),
                    });
                }
                if self.is_from_coordinator(message) {
                    tracing::warn!("Coordinator {} is leaving", from);
                    self.report_coordinator_lost(ctx);
                }
            }
            MessagePayload::Discovery { coordinator_id, .. } => match coordinator_id {
                Some(other) if Some(other.as_str()) != self.coordinator_id.as_deref() => {
                    tracing::warn!("Node {} advertises coordinator {}", from, other);
                    ctx.emit(SessionEvent::CoordinatorConflict {
                        other_coordinator_id: other.clone(),
                    });
                }
                _ => {
                    state.topology.touch(from, Utc::now());
                }
            },
            other => {
                tracing::debug!("Participant ignores {} from {}", other.message_type(), from);
            }
        }
    }

    fn on_tick(&mut self, now: DateTime<Utc>, state: &mut CoordinationState, ctx: &mut HandlerContext) {
        if state.phase != Phase::Ready {
            return;
        }
        let coordinator_id = match &self.coordinator_id {
            Some(id) => id.clone(),
            None => return,
        };

        state.topology.touch(&self.local.id, now);
        ctx.send_to(
            MessagePayload::Heartbeat {
                role: NodeRole::Participant,
            },
            vec![coordinator_id.clone()],
        );

        let timeout = chrono::Duration::from_std(self.config.node_timeout()).unwrap_or(chrono::Duration::MAX);
        if now.signed_duration_since(self.last_coordinator_contact) > timeout && !self.coordinator_lost {
            tracing::warn!(
                "No contact with coordinator {} for {:?}",
                coordinator_id,
                self.config.node_timeout()
            );
            self.report_coordinator_lost(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StreamControl;
    use std::sync::Arc;

    fn joining() -> (ParticipantHandler, CoordinationState) {
        let mut handler = ParticipantHandler::new(NetworkNode::new("n2", "Node 2"), CoordinationConfig::default());
        let mut state = CoordinationState::new("n2");
        let request = handler.begin_join("n1", &mut state, &mut HandlerContext::new());
        assert!(matches!(request, MessagePayload::JoinRequest { node } if node.id == "n2"));
        (handler, state)
    }

    fn from_coordinator(payload: MessagePayload) -> CoordinationMessage {
        CoordinationMessage::new("lab", "n1", payload)
    }

    fn accept() -> CoordinationMessage {
        from_coordinator(MessagePayload::JoinAccept {
            node_id: "n2".to_string(),
            coordinator_id: "n1".to_string(),
            topology: vec![
                NetworkNode::new("n1", "Node 1").with_role(NodeRole::Coordinator),
                NetworkNode::new("n2", "Node 2").with_role(NodeRole::Participant),
            ],
        })
    }

    fn ready() -> (ParticipantHandler, CoordinationState) {
        let (mut handler, mut state) = joining();
        handler.handle(&accept(), &mut state, &mut HandlerContext::new());
        assert_eq!(state.phase, Phase::Ready);
        (handler, state)
    }

    #[test]
    fn test_stream_commands_ignored_before_ready() {
        let (mut handler, mut state) = joining();
        let mut ctx = HandlerContext::new();
        let start = from_coordinator(MessagePayload::StartStream(StreamControl::new("eeg")));
        handler.handle(&start, &mut state, &mut ctx);

        assert!(ctx.is_empty());
        assert_eq!(state.phase, Phase::Joining);
    }

    #[test]
    fn test_join_accept_makes_ready() {
        let (mut handler, mut state) = joining();
        let mut ctx = HandlerContext::new();
        handler.handle(&accept(), &mut state, &mut ctx);

        assert_eq!(state.phase, Phase::Ready);
        assert_eq!(state.role, Some(NodeRole::Participant));
        assert_eq!(state.topology.node_ids(), vec!["n1", "n2"]);
        assert_eq!(
            ctx.join_outcome(),
            Some(&JoinOutcome::Accepted {
                coordinator_id: "n1".to_string()
            })
        );

        // Stream commands flow once ready
        let mut ctx = HandlerContext::new();
        let start = from_coordinator(MessagePayload::StartStream(StreamControl::new("eeg")));
        handler.handle(&start, &mut state, &mut ctx);
        assert_eq!(
            ctx.events(),
            &[SessionEvent::StreamCommand {
                from: "n1".to_string(),
                command: StreamCommand::Start("eeg".to_string()),
            }]
        );
    }

    #[test]
    fn test_join_reject_is_terminal() {
        let (mut handler, mut state) = joining();
        let mut ctx = HandlerContext::new();
        let reject = from_coordinator(MessagePayload::JoinReject {
            node_id: "n2".to_string(),
            reason: "Maximum nodes reached".to_string(),
        });
        handler.handle(&reject, &mut state, &mut ctx);

        assert_eq!(state.phase, Phase::Error);
        assert_eq!(
            ctx.join_outcome(),
            Some(&JoinOutcome::Rejected {
                reason: "Maximum nodes reached".to_string()
            })
        );
    }

    #[test]
    fn test_reject_for_other_node_ignored() {
        let (mut handler, mut state) = joining();
        let mut ctx = HandlerContext::new();
        let reject = from_coordinator(MessagePayload::JoinReject {
            node_id: "n7".to_string(),
            reason: "Maximum nodes reached".to_string(),
        });
        handler.handle(&reject, &mut state, &mut ctx);
        assert_eq!(state.phase, Phase::Joining);
        assert!(ctx.join_outcome().is_none());
    }

    #[test]
    fn test_topology_update_is_diffed() {
        let (mut handler, mut state) = ready();
        let mut ctx = HandlerContext::new();
        let three = from_coordinator(MessagePayload::TopologyUpdate {
            coordinator_id: "n1".to_string(),
            nodes: vec![
                NetworkNode::new("n1", "Node 1").with_role(NodeRole::Coordinator),
                NetworkNode::new("n2", "Node 2").with_role(NodeRole::Participant),
                NetworkNode::new("n3", "Node 3").with_role(NodeRole::Participant),
            ],
        });
        handler.handle(&three, &mut state, &mut ctx);
        let n1 = state.topology.get("n1").unwrap().clone();

        let mut ctx = HandlerContext::new();
        let without_n2 = from_coordinator(MessagePayload::TopologyUpdate {
            coordinator_id: "n1".to_string(),
            nodes: vec![
                NetworkNode::new("n1", "Node 1").with_role(NodeRole::Coordinator),
                NetworkNode::new("n3", "Node 3").with_role(NodeRole::Participant),
            ],
        });
        handler.handle(&without_n2, &mut state, &mut ctx);

        assert_eq!(state.topology.node_ids(), vec!["n1", "n3"]);
        assert!(Arc::ptr_eq(state.topology.get("n1").unwrap(), &n1));
        assert!(ctx.events().contains(&SessionEvent::NodeLeft {
            node_id: "n2".to_string(),
            reason: LeaveReason::Removed,
        }));
    }

    #[test]
    fn test_coordinator_leaving_reports_loss() {
        let (mut handler, mut state) = ready();
        let mut ctx = HandlerContext::new();
        let leaving = from_coordinator(MessagePayload::NodeLeaving {
            node_id: "n1".to_string(),
            reason: None,
        });
        handler.handle(&leaving, &mut state, &mut ctx);
        assert!(ctx.events().contains(&SessionEvent::CoordinatorLost {
            coordinator_id: "n1".to_string()
        }));
        assert!(!state.topology.contains("n1"));
    }

    #[test]
    fn test_coordinator_silence_reported_once() {
        let (mut handler, mut state) = ready();
        let later = Utc::now() + chrono::Duration::seconds(60);

        let mut ctx = HandlerContext::new();
        handler.on_tick(later, &mut state, &mut ctx);
        assert!(matches!(ctx.outbound()[0].payload, MessagePayload::Heartbeat { .. }));
        assert_eq!(ctx.outbound()[0].targets, Some(vec!["n1".to_string()]));
        assert!(ctx.events().contains(&SessionEvent::CoordinatorLost {
            coordinator_id: "n1".to_string()
        }));

        let mut ctx = HandlerContext::new();
        handler.on_tick(later, &mut state, &mut ctx);
        assert!(ctx.events().is_empty());
    }

    #[test]
    fn test_stream_command_from_non_coordinator_ignored() {
        let (mut handler, mut state) = ready();
        let mut ctx = HandlerContext::new();
        let rogue = CoordinationMessage::new("lab", "n3", MessagePayload::PauseStream(StreamControl::new("eeg")));
        handler.handle(&rogue, &mut state, &mut ctx);
        assert!(ctx.events().is_empty());
    }
}
