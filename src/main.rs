//! lsl-coord demo
//!
//! Runs a small in-process session on the memory transport: the first node
//! becomes coordinator, the others join, the coordinator creates a data layer
//! on every node and each node streams samples to its peers for a few seconds.
//!
//! Set `LSL_COORD_LOG_DIR` to also write a daily rolling log file.

use anyhow::Context;
use lsl_coord::{
    CoordinationSession, LayerManager, MemoryTransport, SampleData, SessionConfig, SessionEvent,
    StreamCommand, StreamDescriptor, Transport,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const NODE_COUNT: usize = 3;
const RUN_TIME: Duration = Duration::from_secs(3);
const SEND_INTERVAL: Duration = Duration::from_millis(10);

/// One demo node: its session plus its layers
struct DemoNode {
    session: CoordinationSession,
    layers: LayerManager,
}

impl DemoNode {
    fn start(index: usize, transport: Arc<dyn Transport>) -> anyhow::Result<Self> {
        let config = SessionConfig::new("demo", format!("Node {}", index))
            .with_node_id(format!("node{}", index))
            .with_metadata("cpu_cores", 4 + index as u64);
        let layers = LayerManager::from_config(&config, transport.clone());
        let session = CoordinationSession::start(config, transport)
            .with_context(|| format!("node{} failed to join", index))?;
        Ok(Self { session, layers })
    }

    /// Apply pending session events to the layers
    fn pump(&mut self) -> anyhow::Result<()> {
        for event in self.session.drain_events() {
            match event {
                SessionEvent::StreamCommand { from, command } => {
                    tracing::info!("{} <- {}: {:?}", self.session.node_id(), from, command);
                    self.layers.apply_stream_command(&command)?;
                    if let StreamCommand::Create(stream) = &command {
                        let source_id = self
                            .layers
                            .layer(&stream.id)
                            .map(|l| l.descriptor().source_id.clone())
                            .unwrap_or_default();
                        self.session.announce_stream_ready(stream.id.clone(), source_id)?;
                    }
                }
                SessionEvent::TopologyChanged { node_ids } => {
                    self.layers.update_known_nodes(&node_ids)?;
                }
                other => tracing::debug!("{}: {:?}", self.session.node_id(), other),
            }
        }
        Ok(())
    }
}

fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,lsl_coord=debug"));
    let registry = tracing_subscriber::registry().with(filter).with(fmt::layer());

    match std::env::var_os("LSL_COORD_LOG_DIR") {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "lsl-coord.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

fn main() -> anyhow::Result<()> {
    let _log_guard = init_logging();
    tracing::info!("Starting lsl-coord demo with {} nodes", NODE_COUNT);

    let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
    let mut nodes = Vec::with_capacity(NODE_COUNT);
    for index in 1..=NODE_COUNT {
        nodes.push(DemoNode::start(index, transport.clone())?);
    }

    let coordinator = nodes
        .iter()
        .position(|n| n.session.is_coordinator())
        .context("no node became coordinator")?;
    tracing::info!(
        "Coordinator is {}, topology: {:?}",
        nodes[coordinator].session.node_id(),
        nodes[coordinator].session.topology().node_ids()
    );

    // Give the last join's topology update time to reach everyone
    std::thread::sleep(Duration::from_millis(300));
    for node in &mut nodes {
        let node_ids = node.session.topology().node_ids();
        node.layers.update_known_nodes(&node_ids)?;
    }

    let stream = StreamDescriptor::new("counter", "Counter", "").with_sample_rate(100.0);
    let commands = [
        StreamCommand::Create(stream.clone()),
        StreamCommand::Start(stream.id.clone()),
    ];
    for command in commands {
        // The coordinator does not receive its own broadcasts
        nodes[coordinator].layers.apply_stream_command(&command)?;
        nodes[coordinator].session.broadcast_stream_command(command)?;
    }

    // Let the commands reach the participants
    std::thread::sleep(Duration::from_millis(200));
    let mut receivers = Vec::with_capacity(nodes.len());
    for node in &mut nodes {
        node.pump()?;
        receivers.push(node.layers.subscribe(&stream.id)?);
    }

    let started = Instant::now();
    let mut counter = 0u64;
    while started.elapsed() < RUN_TIME {
        for node in &mut nodes {
            node.pump()?;
            node.layers
                .send_data(&stream.id, SampleData::Float64(vec![counter as f64]))?;
        }
        counter += 1;
        std::thread::sleep(SEND_INTERVAL);
    }

    nodes[coordinator]
        .session
        .send_user_message("demo", serde_json::json!({ "sent": counter }))?;

    for (node, rx) in nodes.iter().zip(&receivers) {
        let received = rx.try_iter().count();
        let metrics = node.layers.layer(&stream.id).and_then(|l| l.metrics());
        tracing::info!(
            "{}: sent {}, received {} ({:?})",
            node.session.node_id(),
            counter,
            received,
            metrics.map(|m| m.actual_frequency)
        );
    }

    // Participants leave first so the coordinator sees the departures
    for (index, node) in nodes.iter_mut().enumerate().rev() {
        node.layers.dispose_all();
        if index != coordinator {
            node.session.leave(Some("demo finished".to_string()))?;
        }
    }
    nodes[coordinator].session.shutdown();

    tracing::info!("Demo finished");
    Ok(())
}
