//! Polling workers and their controllers
//!
//! A polling worker runs on its own thread, owns a dynamic set of inlets and
//! pulls them on a fixed schedule. It talks to exactly one controller through
//! crossbeam channels; nothing else ever touches its endpoints.
//!
//! # Architecture
//!
//! - [`WorkerEnvelope`] - timestamped message crossing the worker boundary
//! - [`WorkerMessage`] - Command/Data/Error/Metrics/Config/Response payloads
//! - [`WorkerContext`] - what a worker entry point receives from the controller
//! - [`PollingWorker`] - the polling loop itself
//! - [`TickScheduler`] - busy-wait and timer scheduling
//! - [`WorkerController`] - start handshake, commands, bounded stop
//! - [`WorkerRegistry`] - explicit name → controller map
//!
//! # Example
//!
//! ```ignore
//! use lsl_coord::worker::{PollingWorker, WorkerCommand, WorkerController};
//!
//! let entry = PollingWorker::entry(transport.clone(), config.data_polling.clone());
//! let controller = WorkerController::start("eeg", entry, Duration::from_secs(5))?;
//! controller.send_command(WorkerCommand::AddEndpoints(descriptors))?;
//!
//! for envelope in controller.drain() {
//!     if let WorkerMessage::Data(sample) = envelope.message {
//!         // Handle sample
//!     }
//! }
//! controller.stop(Duration::from_millis(500));
//! ```

pub mod controller;
pub mod poller;
pub mod registry;
pub mod scheduler;

pub use controller::{StopOutcome, WorkerController};
pub use poller::PollingWorker;
pub use registry::WorkerRegistry;
pub use scheduler::{ScheduleMode, TickScheduler};

use crate::config::PollingConfig;
use crate::error::{CoordError, Result};
use crate::types::{Sample, StreamDescriptor};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Capacity of a worker's command inbox
pub const DEFAULT_INBOX_CAPACITY: usize = 256;

/// Lifecycle of a polling worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    Starting,
    Running,
    Paused,
    Stopping,
    Terminated,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Starting => write!(f, "starting"),
            WorkerState::Running => write!(f, "running"),
            WorkerState::Paused => write!(f, "paused"),
            WorkerState::Stopping => write!(f, "stopping"),
            WorkerState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Commands a controller sends to its worker
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    /// Open inlets for these streams (duplicates and self-originated skipped)
    AddEndpoints(Vec<StreamDescriptor>),
    /// Destroy and forget the inlet with this endpoint id
    RemoveEndpoint(String),
    /// Suspend ticking until `Resume`
    Pause,
    /// Resume ticking
    Resume,
    /// Discard everything buffered in the managed inlets
    Flush,
    /// Destroy all endpoints, then terminate
    Stop,
}

/// One sample forwarded by a worker
#[derive(Debug, Clone, PartialEq)]
pub struct PolledSample {
    /// Endpoint the sample was pulled from
    pub endpoint_id: String,
    /// Source id of the producing outlet
    pub source_id: String,
    /// Logical stream id of the producing descriptor
    pub stream_id: String,
    /// The sample, stamped by its producer
    pub sample: Sample,
    /// Local transport clock when the sample was pulled
    pub capture_timestamp: f64,
}

/// A contained failure inside a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerError {
    /// Endpoint involved, if any
    pub endpoint_id: Option<String>,
    /// Human readable description
    pub message: String,
}

/// Counters reported once per metrics window
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PollingMetrics {
    /// Samples forwarded during the window
    pub samples_processed: u64,
    /// Failed pulls during the window
    pub dropped_samples: u64,
    /// Samples forwarded since the worker started
    pub total_samples: u64,
    /// Failed pulls since the worker started
    pub total_dropped: u64,
    /// Poll passes per second during the window
    pub actual_frequency: f64,
    /// Configured poll passes per second
    pub target_frequency: f64,
    /// Ticks abandoned because the loop fell more than one interval behind
    pub skipped_ticks: u64,
    /// Inlets currently managed
    pub managed_endpoints: usize,
    /// Outbound messages dropped because the controller fell behind
    pub outbox_overflows: u64,
}

/// Acknowledgements of commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerResponse {
    /// Result of `AddEndpoints`
    EndpointsAdded {
        added: Vec<String>,
        skipped: Vec<String>,
        failed: Vec<String>,
    },
    /// Result of `RemoveEndpoint`
    EndpointRemoved { endpoint_id: String, existed: bool },
    /// State changed by `Pause`/`Resume`
    StateChanged(WorkerState),
    /// Result of `Flush`
    Flushed { samples: usize },
    /// A `Config` message arrived while running
    ConfigRejected { reason: String },
    /// Last message a worker sends
    Stopped,
}

/// Payload of a [`WorkerEnvelope`]
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Command(WorkerCommand),
    Data(PolledSample),
    Error(WorkerError),
    Metrics(PollingMetrics),
    Config(PollingConfig),
    Response(WorkerResponse),
}

impl WorkerMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Command(_) => "command",
            WorkerMessage::Data(_) => "data",
            WorkerMessage::Error(_) => "error",
            WorkerMessage::Metrics(_) => "metrics",
            WorkerMessage::Config(_) => "config",
            WorkerMessage::Response(_) => "response",
        }
    }
}

/// Message crossing the worker boundary, stamped with a monotonic clock
#[derive(Debug, Clone)]
pub struct WorkerEnvelope {
    /// Seconds on the sender's monotonic clock
    pub timestamp: f64,
    pub message: WorkerMessage,
}

impl WorkerEnvelope {
    pub fn new(timestamp: f64, message: WorkerMessage) -> Self {
        Self { timestamp, message }
    }
}

/// Handed to a worker entry point by [`WorkerController::start`]
pub struct WorkerContext {
    name: String,
    outbox: Sender<WorkerEnvelope>,
    handshake: Option<Sender<Sender<WorkerEnvelope>>>,
    kill: Arc<AtomicBool>,
}

impl WorkerContext {
    pub(crate) fn new(
        name: String,
        outbox: Sender<WorkerEnvelope>,
        handshake: Sender<Sender<WorkerEnvelope>>,
        kill: Arc<AtomicBool>,
    ) -> Self {
        Self {
            name,
            outbox,
            handshake: Some(handshake),
            kill,
        }
    }

    /// Worker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channel back to the controller
    pub fn outbox(&self) -> &Sender<WorkerEnvelope> {
        &self.outbox
    }

    /// Flag set by the controller when it gives up on a graceful stop
    pub fn kill_flag(&self) -> Arc<AtomicBool> {
        self.kill.clone()
    }

    /// Whether the controller has force-terminated this worker
    pub fn is_killed(&self) -> bool {
        self.kill.load(Ordering::SeqCst)
    }

    /// Open the worker's inbox and hand its sender to the controller
    ///
    /// Succeeds at most once per worker.
    pub fn signal_ready(&mut self, inbox_capacity: usize) -> Result<Receiver<WorkerEnvelope>> {
        let handshake = self.handshake.take().ok_or_else(|| {
            CoordError::InvalidState(format!("worker '{}' already signalled ready", self.name))
        })?;
        let (inbox_tx, inbox_rx) = bounded(inbox_capacity.max(1));
        handshake
            .send(inbox_tx)
            .map_err(|_| CoordError::Channel(format!("controller of '{}' is gone", self.name)))?;
        Ok(inbox_rx)
    }
}
