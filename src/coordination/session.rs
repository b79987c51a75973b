//! Session orchestration
//!
//! [`CoordinationSession::start`] runs the join sequence on the calling thread
//! and returns once the node is `Ready` (as coordinator or participant) or the
//! join failed. A [`SessionDriver`] thread then owns the coordination channel,
//! the installed [`MessageHandler`] and all state mutation. The handle reads
//! state snapshots and talks to the driver through a command channel.
//!
//! Join sequence:
//!
//! 1. Sleep a random settle delay so simultaneously started nodes spread out.
//! 2. Broadcast `Discovery` hellos every `announce_interval` and listen for a
//!    coordinator (announcement, `JoinOffer`, heartbeat or topology update)
//!    for at most `discovery_wait`.
//! 3. Coordinator found: confirm the connection, send `JoinRequest`, wait
//!    `join_timeout` for the answer.
//! 4. Nobody found: become coordinator.
//! 5. Peers found but no coordinator: elect among the peers and ourselves.
//!    The winner becomes coordinator, everyone else waits for its
//!    announcement and joins it.

use super::coordinator::CoordinatorHandler;
use super::election::{strategy_from_config, ElectionStrategy, FirstNodeStrategy};
use super::handler::{change_phase, HandlerContext, JoinOutcome, MessageHandler, SessionEvent, StreamCommand};
use super::participant::ParticipantHandler;
use super::state::{CoordinationState, Phase, Topology};
use crate::config::SessionConfig;
use crate::error::{CoordError, Result};
use crate::protocol::{CoordinationChannel, CoordinationMessage, HandshakePolicy, MessagePayload};
use crate::transport::Transport;
use crate::types::{NetworkNode, NodeRole};
use crate::worker::StopOutcome;
use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Capacity of the session event queue
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

const COMMAND_QUEUE_CAPACITY: usize = 256;

/// Longest a driver iteration blocks waiting for a message
const DRIVER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Reason attached to the departure announced on shutdown
const SHUTDOWN_REASON: &str = "shutdown";

/// Requests from the handle to the driver thread
#[derive(Debug)]
enum SessionCommand {
    StreamCommand(StreamCommand),
    UserMessage {
        topic: String,
        data: serde_json::Value,
        targets: Option<Vec<String>>,
    },
    ConfigUpdate(serde_json::Value),
    StreamReady {
        stream_id: String,
        source_id: String,
    },
    SetAccepting(bool),
    Leave(Option<String>),
}

fn read_lock(state: &RwLock<CoordinationState>) -> RwLockReadGuard<'_, CoordinationState> {
    state.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock(state: &RwLock<CoordinationState>) -> RwLockWriteGuard<'_, CoordinationState> {
    state.write().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a running session
pub struct CoordinationSession {
    local: NetworkNode,
    session_id: String,
    state: Arc<RwLock<CoordinationState>>,
    commands: Sender<SessionCommand>,
    events: Receiver<SessionEvent>,
    driver: Option<JoinHandle<()>>,
    stop_grace: Duration,
}

impl CoordinationSession {
    /// Discover, elect or join, and start the driver thread
    ///
    /// Fails with [`CoordError::JoinRejected`] when the coordinator refuses
    /// us, [`CoordError::Timeout`] when the handshake or join times out and
    /// [`CoordError::Election`] when an elected peer never takes over.
    pub fn start(mut config: SessionConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.ensure_node_id();
        config.validate()?;

        let (event_tx, events) = bounded(EVENT_QUEUE_CAPACITY);
        let (commands, command_rx) = bounded(COMMAND_QUEUE_CAPACITY);
        let stop_grace = config.coordination.worker_stop_grace();
        let session_id = config.session_id.clone();

        let mut driver = SessionDriver::new(config, transport, event_tx, command_rx)?;
        if let Err(e) = driver.join_session() {
            tracing::error!("Node {} failed to join session '{}': {}", driver.local.id, session_id, e);
            driver.close();
            return Err(e);
        }

        let local = driver.local.clone();
        let state = driver.state.clone();
        let handle = std::thread::Builder::new()
            .name(format!("session-{}", local.id))
            .spawn(move || driver.run())?;

        Ok(Self {
            local,
            session_id,
            state,
            commands,
            events,
            driver: Some(handle),
            stop_grace,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.local.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn local_node(&self) -> &NetworkNode {
        &self.local
    }

    /// Snapshot of the current state
    pub fn state(&self) -> CoordinationState {
        read_lock(&self.state).clone()
    }

    pub fn phase(&self) -> Phase {
        read_lock(&self.state).phase
    }

    pub fn role(&self) -> Option<NodeRole> {
        read_lock(&self.state).role
    }

    pub fn is_coordinator(&self) -> bool {
        read_lock(&self.state).is_coordinator()
    }

    pub fn coordinator_id(&self) -> Option<String> {
        read_lock(&self.state).coordinator_id.clone()
    }

    pub fn topology(&self) -> Topology {
        read_lock(&self.state).topology.clone()
    }

    /// Session events in emission order
    pub fn events(&self) -> &Receiver<SessionEvent> {
        &self.events
    }

    pub fn next_event(&self, timeout: Duration) -> Option<SessionEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    pub fn drain_events(&self) -> Vec<SessionEvent> {
        self.events.try_iter().collect()
    }

    pub fn is_running(&self) -> bool {
        self.driver.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Send a stream lifecycle command to every participant
    pub fn broadcast_stream_command(&self, command: StreamCommand) -> Result<()> {
        self.require_coordinator("broadcast stream commands")?;
        self.send(SessionCommand::StreamCommand(command))
    }

    /// Publish an application message to everyone
    pub fn send_user_message(&self, topic: impl Into<String>, data: serde_json::Value) -> Result<()> {
        self.send(SessionCommand::UserMessage {
            topic: topic.into(),
            data,
            targets: None,
        })
    }

    /// Publish an application message to specific nodes
    pub fn send_user_message_to(
        &self,
        topic: impl Into<String>,
        data: serde_json::Value,
        targets: Vec<String>,
    ) -> Result<()> {
        self.send(SessionCommand::UserMessage {
            topic: topic.into(),
            data,
            targets: Some(targets),
        })
    }

    pub fn send_config_update(&self, config: serde_json::Value) -> Result<()> {
        self.require_coordinator("send config updates")?;
        self.send(SessionCommand::ConfigUpdate(config))
    }

    /// Tell the session that our outlet for `stream_id` is up
    pub fn announce_stream_ready(&self, stream_id: impl Into<String>, source_id: impl Into<String>) -> Result<()> {
        self.send(SessionCommand::StreamReady {
            stream_id: stream_id.into(),
            source_id: source_id.into(),
        })
    }

    /// Open or close admission of new nodes
    pub fn set_accepting_new_nodes(&self, accepting: bool) -> Result<()> {
        self.require_coordinator("change admission")?;
        self.send(SessionCommand::SetAccepting(accepting))
    }

    /// Announce our departure and stop the driver
    pub fn leave(&mut self, reason: Option<String>) -> Result<StopOutcome> {
        self.send(SessionCommand::Leave(reason))?;
        Ok(self.wait_for_driver())
    }

    /// Leave (if joined) and stop the driver; never hangs
    pub fn shutdown(&mut self) -> StopOutcome {
        if self.driver.is_none() {
            return StopOutcome::AlreadyStopped;
        }
        if let Err(e) = self.send(SessionCommand::Leave(Some(SHUTDOWN_REASON.to_string()))) {
            tracing::debug!("Session driver of {} not reachable: {}", self.local.id, e);
        }
        self.wait_for_driver()
    }

    fn require_coordinator(&self, action: &str) -> Result<()> {
        let state = read_lock(&self.state);
        if state.is_coordinator() && state.is_ready() {
            Ok(())
        } else {
            Err(CoordError::InvalidState(format!(
                "only a ready coordinator may {} (phase {}, role {:?})",
                action, state.phase, state.role
            )))
        }
    }

    fn send(&self, command: SessionCommand) -> Result<()> {
        if !self.is_running() {
            return Err(CoordError::InvalidState("session driver has stopped".to_string()));
        }
        self.commands.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => CoordError::Channel("session command queue is full".to_string()),
            TrySendError::Disconnected(_) => CoordError::InvalidState("session driver has stopped".to_string()),
        })
    }

    fn wait_for_driver(&mut self) -> StopOutcome {
        let handle = match self.driver.take() {
            Some(handle) => handle,
            None => return StopOutcome::AlreadyStopped,
        };

        // Leaving includes stopping the coordination worker with the same grace
        let deadline = Instant::now() + self.stop_grace * 2 + Duration::from_secs(1);
        while Instant::now() < deadline {
            if handle.is_finished() {
                if handle.join().is_err() {
                    tracing::warn!("Session driver of {} panicked", self.local.id);
                }
                return StopOutcome::Graceful;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        tracing::warn!("Session driver of {} did not stop in time, detaching", self.local.id);
        StopOutcome::Forced
    }
}

impl Drop for CoordinationSession {
    fn drop(&mut self) {
        if self.driver.is_some() {
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for CoordinationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationSession")
            .field("node_id", &self.local.id)
            .field("session_id", &self.session_id)
            .field("phase", &self.phase())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Owner of the coordination channel and the session state
pub struct SessionDriver {
    config: SessionConfig,
    local: NetworkNode,
    channel: CoordinationChannel,
    state: Arc<RwLock<CoordinationState>>,
    handler: Option<Box<dyn MessageHandler>>,
    strategy: Box<dyn ElectionStrategy>,
    events: Sender<SessionEvent>,
    commands: Receiver<SessionCommand>,
    dropped_events: u64,
    last_tick: Instant,
}

impl SessionDriver {
    fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        events: Sender<SessionEvent>,
        commands: Receiver<SessionCommand>,
    ) -> Result<Self> {
        let mut local = NetworkNode::new(config.node_id.clone(), config.node_name.clone());
        local.metadata = config.metadata.clone();

        let channel = CoordinationChannel::initialize(&config, transport)?;
        let state = Arc::new(RwLock::new(CoordinationState::new(local.id.clone())));
        let strategy = strategy_from_config(&config.election);

        Ok(Self {
            config,
            local,
            channel,
            state,
            handler: None,
            strategy,
            events,
            commands,
            dropped_events: 0,
            last_tick: Instant::now(),
        })
    }

    fn join_session(&mut self) -> Result<()> {
        let settle_max = self.config.coordination.settle_delay_max_ms;
        if settle_max > 0 {
            let settle = Duration::from_millis(rand::thread_rng().gen_range(0..=settle_max));
            tracing::debug!("Settling for {:?} before discovery", settle);
            std::thread::sleep(settle);
        }

        let mut peers = BTreeMap::new();
        let wait = self.config.coordination.discovery_wait();
        if let Some(coordinator_id) = self.listen_for_coordinator(wait, &mut peers)? {
            return self.join_coordinator(&coordinator_id);
        }

        if peers.is_empty() && !self.channel.has_peers() {
            tracing::info!(
                "No session '{}' found within {:?}",
                self.config.session_id,
                wait
            );
            return self.become_coordinator();
        }
        self.elect(peers)
    }

    /// Broadcast hellos until a coordinator shows up or `wait` expires
    fn listen_for_coordinator(
        &mut self,
        wait: Duration,
        peers: &mut BTreeMap<String, NetworkNode>,
    ) -> Result<Option<String>> {
        let deadline = Instant::now() + wait;
        let announce_interval = self.config.coordination.announce_interval();
        let mut next_hello = Instant::now();

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.channel.pump_discovery()?;
            if now >= next_hello {
                self.channel.broadcast(MessagePayload::Discovery {
                    node: self.local.clone(),
                    coordinator_id: None,
                })?;
                next_hello = now + announce_interval;
            }

            let timeout = deadline.min(next_hello).saturating_duration_since(Instant::now());
            if let Some(message) = self.channel.next_message(timeout) {
                if let Some(coordinator_id) = observe_discovery(&message, peers) {
                    tracing::info!("Found coordinator {} of session '{}'", coordinator_id, self.config.session_id);
                    return Ok(Some(coordinator_id));
                }
            }
        }
    }

    fn elect(&mut self, mut peers: BTreeMap<String, NetworkNode>) -> Result<()> {
        for node_id in self.channel.peer_node_ids() {
            peers
                .entry(node_id.clone())
                .or_insert_with(|| NetworkNode::new(node_id.clone(), node_id));
        }
        peers.insert(self.local.id.clone(), self.local.clone());
        // Same order on every node
        let candidates: Vec<NetworkNode> = peers.into_values().collect();

        let winner = match self.strategy.elect_leader(&candidates) {
            Some(winner) => winner,
            None => {
                tracing::warn!(
                    "{} election found no eligible candidate, falling back to smallest id",
                    self.strategy.name()
                );
                FirstNodeStrategy
                    .elect_leader(&candidates)
                    .ok_or_else(|| CoordError::Election("no election candidates".to_string()))?
            }
        };
        tracing::info!(
            "Elected {} among {} candidate(s) using {}",
            winner.id,
            candidates.len(),
            self.strategy.name()
        );

        if winner.id == self.local.id {
            return self.become_coordinator();
        }

        let wait = self.config.coordination.join_timeout();
        match self.listen_for_coordinator(wait, &mut BTreeMap::new())? {
            Some(coordinator_id) => self.join_coordinator(&coordinator_id),
            None => {
                self.fail_join();
                Err(CoordError::Election(format!(
                    "elected coordinator {} did not announce itself within {:?}",
                    winner.id, wait
                )))
            }
        }
    }

    fn become_coordinator(&mut self) -> Result<()> {
        let handler = CoordinatorHandler::new(self.local.clone(), self.config.coordination.clone());
        let mut ctx = HandlerContext::new();
        {
            let mut state = write_lock(&self.state);
            change_phase(&mut state, &mut ctx, Phase::Ready);
            handler.assume_role(&mut state, &mut ctx);
        }
        tracing::info!(
            "Node {} coordinates session '{}'",
            self.local.id,
            self.config.session_id
        );
        self.handler = Some(Box::new(handler));
        self.apply(ctx);
        Ok(())
    }

    fn join_coordinator(&mut self, coordinator_id: &str) -> Result<()> {
        let mut participant = ParticipantHandler::new(self.local.clone(), self.config.coordination.clone());
        let mut ctx = HandlerContext::new();
        let request = {
            let mut state = write_lock(&self.state);
            participant.begin_join(coordinator_id, &mut state, &mut ctx)
        };
        self.handler = Some(Box::new(participant));
        self.apply(ctx);

        let policy = HandshakePolicy::from_config(&self.config);
        if let Err(e) = self.channel.confirm_connection(coordinator_id, policy) {
            self.fail_join();
            return Err(e.with_context(format!("connection test with coordinator {}", coordinator_id)));
        }
        if let Err(e) = self.channel.send_to(request, vec![coordinator_id.to_string()]) {
            self.fail_join();
            return Err(e);
        }

        let join_timeout = self.config.coordination.join_timeout();
        let deadline = Instant::now() + join_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.fail_join();
                return Err(CoordError::timeout(format!(
                    "no join response from {} within {:?}",
                    coordinator_id, join_timeout
                )));
            }
            self.channel.pump_discovery()?;
            let message = match self.channel.next_message(remaining.min(DRIVER_POLL_INTERVAL)) {
                Some(message) => message,
                None => continue,
            };
            match self.dispatch(&message) {
                Some(JoinOutcome::Accepted { .. }) => return Ok(()),
                Some(JoinOutcome::Rejected { reason }) => return Err(CoordError::JoinRejected { reason }),
                None => {}
            }
        }
    }

    fn fail_join(&mut self) {
        let mut ctx = HandlerContext::new();
        {
            let mut state = write_lock(&self.state);
            change_phase(&mut state, &mut ctx, Phase::Error);
        }
        self.apply(ctx);
    }

    fn run(mut self) {
        tracing::info!("Session driver of {} running", self.local.id);
        self.last_tick = Instant::now();
        let heartbeat_interval = self.config.coordination.heartbeat_interval();

        loop {
            if let Some(reason) = self.process_commands() {
                self.leave(reason);
                break;
            }

            if let Err(e) = self.channel.pump_discovery() {
                tracing::warn!("Coordination discovery failed: {}", e);
            }
            if let Some(message) = self.channel.next_message(DRIVER_POLL_INTERVAL) {
                self.dispatch(&message);
                for message in self.channel.poll() {
                    self.dispatch(&message);
                }
            }

            if self.last_tick.elapsed() >= heartbeat_interval {
                self.tick();
            }
        }
        self.close();
    }

    /// Handle queued commands; returns the leave reason when asked to leave
    fn process_commands(&mut self) -> Option<Option<String>> {
        loop {
            let command = match self.commands.try_recv() {
                Ok(command) => command,
                Err(TryRecvError::Empty) => return None,
                // Handle dropped without shutdown
                Err(TryRecvError::Disconnected) => return Some(Some(SHUTDOWN_REASON.to_string())),
            };

            let mut ctx = HandlerContext::new();
            match command {
                SessionCommand::Leave(reason) => return Some(reason),
                SessionCommand::StreamCommand(command) => match self.coordinator() {
                    Some(coordinator) => coordinator.broadcast_stream_command(&command, &mut ctx),
                    None => tracing::warn!("Dropping {:?}: not the coordinator", command),
                },
                SessionCommand::ConfigUpdate(config) => match self.coordinator() {
                    Some(coordinator) => coordinator.broadcast_config_update(config, &mut ctx),
                    None => tracing::warn!("Dropping config update: not the coordinator"),
                },
                SessionCommand::SetAccepting(accepting) => match self.coordinator() {
                    Some(coordinator) => {
                        coordinator.set_accepting(accepting);
                        tracing::info!("Admission of new nodes {}", if accepting { "opened" } else { "closed" });
                    }
                    None => tracing::warn!("Ignoring admission change: not the coordinator"),
                },
                SessionCommand::UserMessage {
                    topic,
                    data,
                    targets,
                } => {
                    let payload = MessagePayload::UserMessage { topic, data };
                    match targets {
                        Some(targets) => ctx.send_to(payload, targets),
                        None => ctx.broadcast(payload),
                    }
                }
                SessionCommand::StreamReady {
                    stream_id,
                    source_id,
                } => ctx.broadcast(MessagePayload::StreamReady {
                    stream_id,
                    source_id,
                }),
            }
            self.apply(ctx);
        }
    }

    fn coordinator(&mut self) -> Option<&mut CoordinatorHandler> {
        self.handler.as_mut().and_then(|h| h.as_coordinator())
    }

    /// Run a message through the installed handler
    fn dispatch(&mut self, message: &CoordinationMessage) -> Option<JoinOutcome> {
        let handler = self.handler.as_mut()?;
        let mut ctx = HandlerContext::new();
        {
            let mut state = write_lock(&self.state);
            handler.handle(message, &mut state, &mut ctx);
        }
        self.apply(ctx)
    }

    fn tick(&mut self) {
        self.last_tick = Instant::now();
        let handler = match self.handler.as_mut() {
            Some(handler) => handler,
            None => return,
        };
        let mut ctx = HandlerContext::new();
        {
            let mut state = write_lock(&self.state);
            handler.on_tick(Utc::now(), &mut state, &mut ctx);
        }
        self.apply(ctx);
    }

    /// Send outbound messages and publish events
    fn apply(&mut self, ctx: HandlerContext) -> Option<JoinOutcome> {
        let (outbound, events, outcome) = ctx.into_parts();
        for out in outbound {
            let mut message = self.channel.message(out.payload);
            if let Some(targets) = out.targets {
                message = message.targeted(targets);
            }
            if let Some(reply_to) = out.reply_to {
                message = message.reply_to(reply_to);
            }
            if let Err(e) = self.channel.send_message(&message) {
                tracing::warn!("Failed to send {}: {}", message.message_type(), e);
            }
        }
        for event in events {
            self.emit(event);
        }
        outcome
    }

    fn emit(&mut self, event: SessionEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped_events += 1;
                if self.dropped_events == 1 || self.dropped_events % 100 == 0 {
                    tracing::warn!("Session event queue full, {} event(s) dropped", self.dropped_events);
                }
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn leave(&mut self, reason: Option<String>) {
        let mut ctx = HandlerContext::new();
        {
            let mut state = write_lock(&self.state);
            if state.phase == Phase::Ready {
                change_phase(&mut state, &mut ctx, Phase::Leaving);
                ctx.broadcast(MessagePayload::NodeLeaving {
                    node_id: self.local.id.clone(),
                    reason: reason.clone(),
                });
            }
        }
        self.apply(ctx);

        let mut ctx = HandlerContext::new();
        {
            let mut state = write_lock(&self.state);
            change_phase(&mut state, &mut ctx, Phase::Disconnected);
            state.role = Some(NodeRole::Disconnected);
            state.topology.clear();
        }
        self.apply(ctx);
        tracing::info!(
            "Node {} left session '{}' ({})",
            self.local.id,
            self.config.session_id,
            reason.as_deref().unwrap_or("no reason")
        );
    }

    fn close(&mut self) {
        self.channel.shutdown(self.config.coordination.worker_stop_grace());
        let stats = self.channel.stats();
        tracing::debug!(
            "Coordination of {}: {} sent, {} accepted, {} duplicate(s), {} malformed, {} dropped event(s)",
            self.local.id,
            stats.sent,
            stats.accepted,
            stats.duplicates,
            stats.malformed,
            self.dropped_events
        );
    }
}

/// Learn peers and the coordinator from discovery-phase traffic
fn observe_discovery(message: &CoordinationMessage, peers: &mut BTreeMap<String, NetworkNode>) -> Option<String> {
    match &message.payload {
        MessagePayload::Discovery {
            node,
            coordinator_id,
        } => {
            if node.id == message.from_node_id {
                peers.insert(node.id.clone(), node.clone());
            }
            coordinator_id.clone()
        }
        MessagePayload::JoinOffer { .. } => Some(message.from_node_id.clone()),
        MessagePayload::Heartbeat {
            role: NodeRole::Coordinator,
        } => Some(message.from_node_id.clone()),
        MessagePayload::TopologyUpdate { coordinator_id, .. } => Some(coordinator_id.clone()),
        _ => None,
    }
}
