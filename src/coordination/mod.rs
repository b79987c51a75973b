//! Session membership, roles and leader election
//!
//! - [`state`] - phases, the `Arc`-sharing topology and per-node state
//! - [`handler`] - the handler seam, effects context and session events
//! - [`coordinator`] / [`participant`] - the two role handlers
//! - [`election`] - deterministic leader election strategies
//! - [`session`] - the public session handle and its driver thread

pub mod coordinator;
pub mod election;
pub mod handler;
pub mod participant;
pub mod session;
pub mod state;

pub use coordinator::{CoordinatorHandler, REJECT_MAX_NODES, REJECT_NOT_ACCEPTING};
pub use election::{strategy_from_config, CapabilityStrategy, ElectionStrategy, FirstNodeStrategy, Preference};
pub use handler::{HandlerContext, JoinOutcome, LeaveReason, MessageHandler, Outbound, SessionEvent, StreamCommand};
pub use participant::ParticipantHandler;
pub use session::{CoordinationSession, SessionDriver, EVENT_QUEUE_CAPACITY};
pub use state::{CoordinationState, Phase, Topology, TopologyDiff};
