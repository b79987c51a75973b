//! The coordination channel of one node
//!
//! One outlet carries this node's messages; inbound traffic from every peer's
//! coordination outlet is pulled by a dedicated polling worker that is never
//! shared with data layers, so heavy data traffic cannot starve heartbeats.
//!
//! Inbound samples run through a filter chain before anything else sees them:
//!
//! 1. decode (malformed → logged, unknown type → logged at debug)
//! 2. session id check (foreign sessions dropped silently)
//! 3. self skip
//! 4. target filter
//! 5. duplicate suppression
//!
//! Connection tests addressed to this node are answered inside the channel.

use super::dedup::RecentMessages;
use super::messages::{CoordinationMessage, MessagePayload};
use super::wire::{self, Decoded};
use crate::config::SessionConfig;
use crate::error::{CoordError, Result};
use crate::resolver::{ContinuousResolver, StreamResolver};
use crate::transport::{naming, open_outlet, Outlet, Transport};
use crate::types::StreamDescriptor;
use crate::worker::{PollingWorker, WorkerCommand, WorkerController, WorkerEnvelope, WorkerMessage};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outlet buffer of the coordination stream
const COORDINATION_BUFFER_SAMPLES: usize = 360;

/// Counters of the inbound filter chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub sent: u64,
    pub accepted: u64,
    pub malformed: u64,
    pub unknown_types: u64,
    pub foreign_session: u64,
    pub not_addressed: u64,
    pub duplicates: u64,
    pub connection_tests_answered: u64,
}

/// Retry policy of the connection confirmation handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakePolicy {
    /// Wait for one response
    pub timeout: Duration,
    /// Attempts before giving up
    pub retries: u32,
    /// Fixed delay between attempts
    pub backoff: Duration,
}

impl HandshakePolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            timeout: config.coordination.connection_test_timeout(),
            retries: config.coordination.connection_test_retries.max(1),
            backoff: config.coordination.connection_test_backoff(),
        }
    }
}

/// Streams added/removed by one discovery pump
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryChange {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl DiscoveryChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Coordination traffic of one node in one session
pub struct CoordinationChannel {
    session_id: String,
    node_id: String,
    outlet: Outlet,
    worker: WorkerController,
    resolver: ContinuousResolver,
    /// Peer coordination streams currently polled, by endpoint id
    peers: BTreeMap<String, StreamDescriptor>,
    dedup: RecentMessages,
    /// Messages set aside while a handshake was waiting
    pending: VecDeque<CoordinationMessage>,
    stats: ChannelStats,
}

impl CoordinationChannel {
    /// Open the outlet, start peer discovery and the coordination worker
    pub fn initialize(config: &SessionConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        if config.node_id.is_empty() {
            return Err(CoordError::Config(
                "coordination channel requires a node id".to_string(),
            ));
        }
        let session_id = config.session_id.clone();
        let node_id = config.node_id.clone();
        let own_prefix = naming::own_coordination_prefix(&node_id);

        let descriptor = naming::coordination_descriptor(&session_id, &node_id);
        let outlet = open_outlet(transport.as_ref(), &descriptor, 1, COORDINATION_BUFFER_SAMPLES)?;

        let polling = config.coordination_polling.clone().excluding_prefix(own_prefix.clone());
        let worker = WorkerController::start_polling(
            format!("coordination-{}", node_id),
            PollingWorker::entry(transport.clone(), polling.clone()),
            config.coordination.worker_startup_timeout(),
            &polling,
        )?;

        let resolver = StreamResolver::new(transport)
            .with_excluded_prefix(own_prefix)
            .resolve_continuous(
                naming::coordination_predicate(&session_id),
                config.coordination.resolve_interval(),
            );

        tracing::info!(
            "Coordination channel for node {} in session '{}' initialized",
            node_id,
            session_id
        );

        Ok(Self {
            session_id,
            node_id,
            outlet,
            worker,
            resolver,
            peers: BTreeMap::new(),
            dedup: RecentMessages::new(config.coordination.dedup_capacity),
            pending: VecDeque::new(),
            stats: ChannelStats::default(),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Build a message from this node
    pub fn message(&self, payload: MessagePayload) -> CoordinationMessage {
        CoordinationMessage::new(self.session_id.clone(), self.node_id.clone(), payload)
    }

    /// Encode and push a message
    pub fn send_message(&mut self, message: &CoordinationMessage) -> Result<()> {
        let sample = wire::encode_sample(message)?;
        self.outlet.push(sample, None)?;
        self.stats.sent += 1;
        tracing::debug!(
            "-> {} {}{}",
            message.message_type(),
            message.message_id,
            message
                .target_nodes
                .as_ref()
                .map(|t| format!(" to {:?}", t))
                .unwrap_or_default()
        );
        Ok(())
    }

    /// Send `payload` to everyone
    pub fn broadcast(&mut self, payload: MessagePayload) -> Result<CoordinationMessage> {
        let message = self.message(payload);
        self.send_message(&message)?;
        Ok(message)
    }

    /// Send `payload` addressed to `targets`
    pub fn send_to(&mut self, payload: MessagePayload, targets: Vec<String>) -> Result<CoordinationMessage> {
        let message = self.message(payload).targeted(targets);
        self.send_message(&message)?;
        Ok(message)
    }

    /// Whether any peer currently polls our coordination stream
    pub fn has_listeners(&self) -> bool {
        self.outlet.have_consumers()
    }

    /// Node ids of the peers whose coordination streams are known
    pub fn peer_node_ids(&self) -> Vec<String> {
        let ids: BTreeSet<String> = self
            .peers
            .values()
            .filter_map(|d| naming::owner_node_id(&d.source_id).map(str::to_string))
            .collect();
        ids.into_iter().collect()
    }

    pub fn has_peers(&self) -> bool {
        !self.peers.is_empty()
    }

    /// Apply the latest discovery snapshot to the coordination worker
    pub fn pump_discovery(&mut self) -> Result<DiscoveryChange> {
        let snapshot = match self.resolver.latest() {
            Some(snapshot) => snapshot,
            None => return Ok(DiscoveryChange::default()),
        };

        let current: BTreeMap<String, StreamDescriptor> = snapshot
            .into_iter()
            .map(|d| (d.endpoint_id(), d))
            .collect();

        let added: Vec<StreamDescriptor> = current
            .iter()
            .filter(|(id, _)| !self.peers.contains_key(*id))
            .map(|(_, d)| d.clone())
            .collect();
        let removed: Vec<String> = self
            .peers
            .keys()
            .filter(|id| !current.contains_key(*id))
            .cloned()
            .collect();

        let change = DiscoveryChange {
            added: added.iter().map(StreamDescriptor::endpoint_id).collect(),
            removed: removed.clone(),
        };

        if !added.is_empty() {
            self.worker.send_command(WorkerCommand::AddEndpoints(added))?;
        }
        for endpoint_id in removed {
            self.worker.send_command(WorkerCommand::RemoveEndpoint(endpoint_id))?;
        }
        if !change.is_empty() {
            tracing::debug!(
                "Coordination peers changed: +{:?} -{:?}",
                change.added,
                change.removed
            );
        }
        self.peers = current;
        Ok(change)
    }

    /// Run one worker message through the filter chain
    pub fn accept(&mut self, envelope: WorkerEnvelope) -> Option<CoordinationMessage> {
        let polled = match envelope.message {
            WorkerMessage::Data(polled) => polled,
            WorkerMessage::Error(e) => {
                tracing::warn!("Coordination inlet error: {:?} {}", e.endpoint_id, e.message);
                return None;
            }
            WorkerMessage::Metrics(m) => {
                tracing::trace!(
                    "Coordination worker: {} samples, {} dropped",
                    m.samples_processed,
                    m.dropped_samples
                );
                return None;
            }
            other => {
                tracing::trace!("Coordination worker {}", other.kind());
                return None;
            }
        };

        let message = match wire::decode_sample(&polled.sample.data) {
            Ok(Decoded::Message(message)) => message,
            Ok(Decoded::UnknownType(envelope)) => {
                self.stats.unknown_types += 1;
                tracing::debug!(
                    "Dropping unknown message type '{}' from {}",
                    envelope.message_type,
                    envelope.from_node_id
                );
                return None;
            }
            Err(e) => {
                self.stats.malformed += 1;
                tracing::warn!("Dropping message from {}: {}", polled.source_id, e);
                return None;
            }
        };

        if message.session_id != self.session_id {
            self.stats.foreign_session += 1;
            return None;
        }
        if message.from_node_id == self.node_id {
            return None;
        }
        if !message.is_addressed_to(&self.node_id) {
            self.stats.not_addressed += 1;
            return None;
        }
        if !self
            .dedup
            .check_and_insert(&message.from_node_id, &message.message_id)
        {
            self.stats.duplicates += 1;
            tracing::debug!("Duplicate {} from {}", message.message_id, message.from_node_id);
            return None;
        }

        self.stats.accepted += 1;
        tracing::debug!(
            "<- {} {} from {}",
            message.message_type(),
            message.message_id,
            message.from_node_id
        );

        if let MessagePayload::ConnectionTest { test_id } = &message.payload {
            self.answer_connection_test(&message, test_id.clone());
            return None;
        }
        Some(message)
    }

    fn answer_connection_test(&mut self, test: &CoordinationMessage, test_id: String) {
        let response = self
            .message(MessagePayload::ConnectionTestResponse { test_id })
            .targeted(vec![test.from_node_id.clone()])
            .reply_to(test.message_id.clone());
        match self.send_message(&response) {
            Ok(()) => self.stats.connection_tests_answered += 1,
            Err(e) => tracing::warn!("Failed to answer connection test from {}: {}", test.from_node_id, e),
        }
    }

    fn receive(&mut self, timeout: Duration) -> Option<CoordinationMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let envelope = self.worker.recv_timeout(remaining)?;
            if let Some(message) = self.accept(envelope) {
                return Some(message);
            }
            if Instant::now() >= deadline {
                return None;
            }
        }
    }

    /// Next accepted message, waiting at most `timeout`
    pub fn next_message(&mut self, timeout: Duration) -> Option<CoordinationMessage> {
        if let Some(message) = self.pending.pop_front() {
            return Some(message);
        }
        self.receive(timeout)
    }

    /// Every accepted message available right now
    pub fn poll(&mut self) -> Vec<CoordinationMessage> {
        let mut messages: Vec<CoordinationMessage> = self.pending.drain(..).collect();
        let envelopes: Vec<WorkerEnvelope> = self.worker.drain().collect();
        messages.extend(envelopes.into_iter().filter_map(|e| self.accept(e)));
        messages
    }

    /// Confirm two-way connectivity with `target_node_id`
    ///
    /// Sends `ConnectionTest` and waits for the matching response, retrying
    /// with a fixed backoff. Unrelated messages received meanwhile are kept
    /// for [`poll`](Self::poll).
    pub fn confirm_connection(&mut self, target_node_id: &str, policy: HandshakePolicy) -> Result<()> {
        // Nothing we send is seen before a peer subscribes to our stream
        if !self.outlet.wait_for_consumers(policy.timeout) {
            tracing::debug!("No listeners yet on our coordination stream");
        }

        for attempt in 1..=policy.retries {
            let test_id = uuid::Uuid::new_v4().to_string();
            self.send_to(
                MessagePayload::ConnectionTest {
                    test_id: test_id.clone(),
                },
                vec![target_node_id.to_string()],
            )?;

            let deadline = Instant::now() + policy.timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match self.receive(remaining) {
                    Some(message) => {
                        let confirmed = matches!(
                            &message.payload,
                            MessagePayload::ConnectionTestResponse { test_id: id } if *id == test_id
                        ) && message.from_node_id == target_node_id;
                        if confirmed {
                            tracing::debug!("Connection to {} confirmed (attempt {})", target_node_id, attempt);
                            return Ok(());
                        }
                        self.pending.push_back(message);
                    }
                    None => break,
                }
            }

            tracing::warn!(
                "Connection test {}/{} to {} timed out",
                attempt,
                policy.retries,
                target_node_id
            );
            if attempt < policy.retries {
                std::thread::sleep(policy.backoff);
                self.pump_discovery()?;
            }
        }

        Err(CoordError::timeout(format!(
            "no connection test response from {} after {} attempt(s)",
            target_node_id, policy.retries
        )))
    }

    /// Stop discovery and the worker, then destroy the outlet
    pub fn shutdown(&mut self, grace: Duration) {
        self.resolver.cancel();
        let outcome = self.worker.stop(grace);
        if let Err(e) = self.outlet.destroy() {
            tracing::warn!("Failed to destroy coordination outlet: {}", e);
        }
        tracing::info!("Coordination channel of {} shut down ({:?})", self.node_id, outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use crate::types::{NetworkNode, NodeRole, SampleData};
    use crate::worker::PolledSample;
    use crate::types::Sample;

    fn config(node: &str) -> SessionConfig {
        let mut config = SessionConfig::new("lab", node).with_node_id(node);
        config.coordination.resolve_interval_ms = 10;
        config.coordination.connection_test_timeout_ms = 300;
        config.coordination.connection_test_backoff_ms = 10;
        config.coordination_polling = crate::config::PollingConfig::timer(1000.0);
        config
    }

    fn channel(transport: &MemoryTransport, node: &str) -> CoordinationChannel {
        CoordinationChannel::initialize(&config(node), Arc::new(transport.clone())).unwrap()
    }

    fn envelope_for(message: &CoordinationMessage) -> WorkerEnvelope {
        WorkerEnvelope::new(
            0.0,
            WorkerMessage::Data(PolledSample {
                endpoint_id: "x".to_string(),
                source_id: format!("coord:{}:lab", message.from_node_id),
                stream_id: "coordination".to_string(),
                sample: Sample::new(wire::encode_sample(message).unwrap(), 0.0),
                capture_timestamp: 0.0,
            }),
        )
    }

    fn heartbeat(session: &str, from: &str) -> CoordinationMessage {
        CoordinationMessage::new(session, from, MessagePayload::Heartbeat {
            role: NodeRole::Participant,
        })
    }

    fn wait_for_peers(channel: &mut CoordinationChannel, count: usize) {
        for _ in 0..200 {
            channel.pump_discovery().unwrap();
            if channel.peer_node_ids().len() >= count {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("peers never discovered");
    }

    #[test]
    fn test_filter_chain() {
        let transport = MemoryTransport::new();
        let mut ch = channel(&transport, "n1");

        // Accepted
        let hb = heartbeat("lab", "n2");
        assert!(ch.accept(envelope_for(&hb)).is_some());
        // Duplicate
        assert!(ch.accept(envelope_for(&hb)).is_none());
        // Foreign session
        assert!(ch.accept(envelope_for(&heartbeat("other", "n2"))).is_none());
        // Self
        assert!(ch.accept(envelope_for(&heartbeat("lab", "n1"))).is_none());
        // Addressed to someone else
        let targeted = heartbeat("lab", "n2").targeted(vec!["n3".to_string()]);
        assert!(ch.accept(envelope_for(&targeted)).is_none());
        // Malformed
        let junk = WorkerEnvelope::new(
            0.0,
            WorkerMessage::Data(PolledSample {
                endpoint_id: "x".to_string(),
                source_id: "coord:n2:lab".to_string(),
                stream_id: "coordination".to_string(),
                sample: Sample::new(SampleData::text("{oops"), 0.0),
                capture_timestamp: 0.0,
            }),
        );
        assert!(ch.accept(junk).is_none());

        let stats = ch.stats().clone();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.foreign_session, 1);
        assert_eq!(stats.not_addressed, 1);
        assert_eq!(stats.malformed, 1);
        ch.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_peer_node_ids_are_unique() {
        let transport = MemoryTransport::new();
        let mut ch = channel(&transport, "n1");
        let n2 = naming::coordination_descriptor("lab", "n2");
        let n3 = naming::coordination_descriptor("lab", "n3");
        ch.peers.insert("a".to_string(), n2.clone());
        ch.peers.insert("b".to_string(), n3);
        ch.peers.insert("c".to_string(), n2);

        assert_eq!(ch.peer_node_ids(), vec!["n2".to_string(), "n3".to_string()]);
        ch.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_messages_flow_between_nodes() {
        let transport = MemoryTransport::new();
        let mut a = channel(&transport, "a");
        let mut b = channel(&transport, "b");
        wait_for_peers(&mut a, 1);
        wait_for_peers(&mut b, 1);
        assert_eq!(b.peer_node_ids(), vec!["a".to_string()]);
        assert!(a.outlet.wait_for_consumers(Duration::from_secs(2)));

        a.broadcast(MessagePayload::Discovery {
            node: NetworkNode::new("a", "A"),
            coordinator_id: None,
        })
        .unwrap();

        let received = b.next_message(Duration::from_secs(2)).unwrap();
        assert_eq!(received.from_node_id, "a");
        assert!(matches!(received.payload, MessagePayload::Discovery { .. }));

        a.shutdown(Duration::from_secs(1));
        b.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_connection_handshake() {
        let transport = MemoryTransport::new();
        let mut a = channel(&transport, "a");
        let mut b = channel(&transport, "b");
        wait_for_peers(&mut a, 1);
        wait_for_peers(&mut b, 1);

        // b answers tests from inside its filter chain while it polls
        let responder = std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(3);
            while Instant::now() < deadline {
                b.pump_discovery().unwrap();
                let _ = b.poll();
                std::thread::sleep(Duration::from_millis(2));
            }
            b.stats().connection_tests_answered
        });

        let policy = HandshakePolicy {
            timeout: Duration::from_millis(500),
            retries: 3,
            backoff: Duration::from_millis(10),
        };
        a.confirm_connection("b", policy).unwrap();
        assert!(responder.join().unwrap() >= 1);
        a.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_handshake_fails_without_peer() {
        let transport = MemoryTransport::new();
        let mut a = channel(&transport, "a");
        let policy = HandshakePolicy {
            timeout: Duration::from_millis(30),
            retries: 2,
            backoff: Duration::from_millis(5),
        };
        let err = a.confirm_connection("ghost", policy).unwrap_err();
        assert!(matches!(err, CoordError::Timeout(_)));
        a.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_requires_node_id() {
        let transport = MemoryTransport::new();
        let config = SessionConfig::new("lab", "nameless");
        assert!(CoordinationChannel::initialize(&config, Arc::new(transport)).is_err());
    }
}
