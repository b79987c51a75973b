//! # lsl-coord: multi-device coordination over a discovery-based streaming transport
//!
//! Networked devices running the same session id find each other through
//! stream discovery, elect a coordinator, track membership and exchange
//! independent data streams, each pulled by its own high-frequency polling
//! worker.
//!
//! ## Architecture
//!
//! - **Transport**: a trait seam over the pub/sub streaming library, with an
//!   in-process [`MemoryTransport`](transport::MemoryTransport)
//! - **Workers**: polling threads that own inlets and talk to a controller over
//!   crossbeam channels
//! - **Protocol**: JSON coordination messages carried as string samples
//! - **Coordination**: join, election, heartbeats and topology per session
//! - **Layers**: per-stream outlets and inlets driven by coordinator commands
//!
//! ## Configuration
//!
//! [`SessionConfig`] is stored as TOML in the platform config directory under
//! `lsl-coord/session.toml`:
//!
//! - **Linux**: `~/.config/lsl-coord/`
//! - **macOS**: `~/Library/Application Support/lsl-coord/`
//! - **Windows**: `%APPDATA%\lsl-coord\`
//!
//! ## Example
//!
//! ```ignore
//! use lsl_coord::{CoordinationSession, LayerManager, MemoryTransport, SessionConfig};
//! use std::sync::Arc;
//!
//! let transport = Arc::new(MemoryTransport::new());
//! let config = SessionConfig::new("lab", "Node 1");
//! let session = CoordinationSession::start(config, transport.clone())?;
//!
//! let mut layers = LayerManager::new(session.node_id(), transport);
//! while let Some(event) = session.next_event(Duration::from_secs(1)) {
//!     if let SessionEvent::StreamCommand { command, .. } = event {
//!         layers.apply_stream_command(&command)?;
//!     }
//! }
//! ```

pub mod config;
pub mod coordination;
pub mod error;
pub mod layers;
pub mod protocol;
pub mod resolver;
pub mod transport;
pub mod types;
pub mod worker;

// Re-export commonly used types
pub use config::{CoordinationConfig, ElectionConfig, PollingConfig, SessionConfig};
pub use coordination::{CoordinationSession, CoordinationState, Phase, SessionEvent, StreamCommand};
pub use error::{CoordError, Result};
pub use layers::{LayerConfig, LayerManager};
pub use protocol::{CoordinationMessage, MessagePayload, MessageType};
pub use resolver::{StreamPredicate, StreamResolver};
pub use transport::{MemoryTransport, Transport};
pub use types::{NetworkNode, NodeRole, Sample, SampleData, StreamDescriptor};
pub use worker::{PollingWorker, WorkerController, WorkerRegistry};
