//! One data layer: an optional outlet, an optional polling worker and the
//! relay thread fanning the worker's samples out to subscribers.

use super::LayerConfig;
use crate::transport::Outlet;
use crate::worker::{PolledSample, PollingMetrics, WorkerEnvelope, WorkerMessage, WorkerResponse};
use crate::types::StreamDescriptor;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

const RELAY_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    Active,
    Paused,
    /// Worker and outlet released until the next Start
    Stopped,
}

/// Shared between a layer and its relay thread
#[derive(Default)]
pub(crate) struct RelayShared {
    subscribers: Mutex<Vec<Sender<PolledSample>>>,
    metrics: Mutex<Option<PollingMetrics>>,
    /// Endpoints the worker could not open, pending reconciliation
    failed_endpoints: Mutex<BTreeSet<String>>,
    relayed: AtomicU64,
    overflowed: AtomicU64,
    stop: AtomicBool,
}

pub struct Layer {
    pub(crate) config: LayerConfig,
    /// The stream as published by this node
    pub(crate) descriptor: StreamDescriptor,
    pub(crate) outlet: Option<Outlet>,
    /// Registry name of the polling worker, if the layer has inlets
    pub(crate) worker_name: Option<String>,
    pub(crate) state: LayerState,
    /// Peer node id → endpoint id of the inlet requested for its stream
    pub(crate) attached: BTreeMap<String, String>,
    pub(crate) relay: Option<JoinHandle<()>>,
    pub(crate) shared: Arc<RelayShared>,
    pub(crate) samples_sent: u64,
    pub(crate) dropped_while_paused: u64,
}

impl Layer {
    pub fn name(&self) -> &str {
        &self.config.stream.id
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> LayerState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.state == LayerState::Paused
    }

    pub fn has_outlet(&self) -> bool {
        self.outlet.is_some()
    }

    pub fn has_consumers(&self) -> bool {
        self.outlet.as_ref().map_or(false, Outlet::have_consumers)
    }

    pub fn is_stopped(&self) -> bool {
        self.state == LayerState::Stopped
    }

    /// Peers whose stream is pulled or being opened
    ///
    /// Peers whose inlet failed to open are left out until a refresh retries them.
    pub fn attached_nodes(&self) -> Vec<String> {
        let failed = self.shared.failed_endpoints();
        self.attached
            .iter()
            .filter(|(_, endpoint_id)| !failed.contains(*endpoint_id))
            .map(|(node_id, _)| node_id.clone())
            .collect()
    }

    /// Forget attachments whose inlet the worker failed to open
    ///
    /// Returns the peers that need another attempt.
    pub(crate) fn take_failed_attachments(&mut self) -> Vec<String> {
        let failed = std::mem::take(
            &mut *self
                .shared
                .failed_endpoints
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if failed.is_empty() {
            return Vec::new();
        }
        let nodes: Vec<String> = self
            .attached
            .iter()
            .filter(|(_, endpoint_id)| failed.contains(*endpoint_id))
            .map(|(node_id, _)| node_id.clone())
            .collect();
        for node_id in &nodes {
            self.attached.remove(node_id);
        }
        nodes
    }

    /// Most recent metrics of the layer's worker
    pub fn metrics(&self) -> Option<PollingMetrics> {
        self.shared
            .metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn samples_sent(&self) -> u64 {
        self.samples_sent
    }

    pub fn samples_received(&self) -> u64 {
        self.shared.relayed.load(Ordering::Relaxed)
    }

    pub fn dropped_while_paused(&self) -> u64 {
        self.dropped_while_paused
    }

    /// Samples a full subscriber queue could not take
    pub fn subscriber_overflows(&self) -> u64 {
        self.shared.overflowed.load(Ordering::Relaxed)
    }

    pub(crate) fn add_subscriber(&self, sender: Sender<PolledSample>) {
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sender);
    }

    pub(crate) fn stop_relay(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.relay.take() {
            if handle.join().is_err() {
                tracing::warn!("Relay of layer '{}' panicked", self.config.stream.id);
            }
        }
    }
}

impl RelayShared {
    fn failed_endpoints(&self) -> BTreeSet<String> {
        self.failed_endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_endpoints(&self, added: &[String], failed: &[String]) {
        let mut set = self.failed_endpoints.lock().unwrap_or_else(PoisonError::into_inner);
        for endpoint_id in added {
            set.remove(endpoint_id);
        }
        set.extend(failed.iter().cloned());
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("name", &self.config.stream.id)
            .field("state", &self.state)
            .field("outlet", &self.outlet.is_some())
            .field("worker", &self.worker_name)
            .field("attached", &self.attached)
            .finish()
    }
}

/// Forward worker output of `layer` until stopped or the worker is gone
pub(crate) fn spawn_relay(
    layer: String,
    messages: Receiver<WorkerEnvelope>,
    shared: Arc<RelayShared>,
) -> std::io::Result<JoinHandle<()>> {
    // A restarted layer reuses the subscribers of its previous relay
    shared.stop.store(false, Ordering::SeqCst);
    shared
        .failed_endpoints
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
    std::thread::Builder::new()
        .name(format!("relay-{}", layer))
        .spawn(move || {
            while !shared.stop.load(Ordering::SeqCst) {
                let envelope = match messages.recv_timeout(RELAY_POLL_INTERVAL) {
                    Ok(envelope) => envelope,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                match envelope.message {
                    WorkerMessage::Data(sample) => fan_out(&shared, sample),
                    WorkerMessage::Metrics(metrics) => {
                        *shared.metrics.lock().unwrap_or_else(PoisonError::into_inner) = Some(metrics);
                    }
                    WorkerMessage::Error(e) => {
                        tracing::warn!("Layer '{}' inlet error {:?}: {}", layer, e.endpoint_id, e.message);
                    }
                    WorkerMessage::Response(WorkerResponse::EndpointsAdded { added, skipped, failed }) => {
                        if !failed.is_empty() {
                            tracing::warn!("Layer '{}' could not open {:?}", layer, failed);
                        }
                        tracing::debug!(
                            "Layer '{}' opened {:?}, skipped {:?}",
                            layer,
                            added,
                            skipped
                        );
                        shared.record_endpoints(&added, &failed);
                    }
                    WorkerMessage::Response(response) => {
                        tracing::debug!("Layer '{}' worker: {:?}", layer, response);
                    }
                    other => tracing::trace!("Layer '{}' worker {}", layer, other.kind()),
                }
            }
            tracing::debug!("Relay of layer '{}' stopped", layer);
        })
}

fn fan_out(shared: &RelayShared, sample: PolledSample) {
    shared.relayed.fetch_add(1, Ordering::Relaxed);
    let mut subscribers = shared.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
    subscribers.retain(|subscriber| match subscriber.try_send(sample.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            shared.overflowed.fetch_add(1, Ordering::Relaxed);
            true
        }
        Err(TrySendError::Disconnected(_)) => false,
    });
}
