//! Data layers
//!
//! A layer is one named data stream of the session. Each node publishes its own
//! instance of the stream (source id `data:{node}:{stream}`) through an outlet
//! and pulls the instances of the known peer nodes through a dedicated polling
//! worker. Data layers never share a worker with the coordination channel.
//!
//! ```ignore
//! let mut layers = LayerManager::from_config(&config, transport.clone());
//! layers.create_layer(LayerConfig::new(StreamDescriptor::new("eeg", "EEG", "")))?;
//! layers.update_known_nodes(&session.topology().node_ids())?;
//! let samples = layers.subscribe("eeg")?;
//! layers.send_data("eeg", SampleData::Float32(vec![0.1, 0.2]))?;
//! ```

mod layer;

pub use layer::{Layer, LayerState};

use crate::config::{PollingConfig, SessionConfig};
use crate::coordination::StreamCommand;
use crate::error::{CoordError, Result};
use crate::resolver::StreamResolver;
use crate::transport::{naming, open_outlet, Transport};
use crate::types::{SampleData, StreamDescriptor};
use crate::worker::{PolledSample, PollingWorker, WorkerCommand, WorkerController, WorkerRegistry};
use crossbeam_channel::{bounded, Receiver};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// How a layer's stream is materialized on this node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    /// Stream template; the source id is replaced by this node's
    pub stream: StreamDescriptor,
    #[serde(default = "default_true")]
    pub pausable: bool,
    /// Publish this node's instance of the stream
    #[serde(default = "default_true")]
    pub requires_outlet: bool,
    /// Pull the peers' instances of the stream
    #[serde(default = "default_true")]
    pub requires_inlet: bool,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub chunk_size: usize,
    #[serde(default = "default_max_buffer")]
    pub max_buffer: usize,
    /// Wait of one peer stream lookup
    #[serde(default = "default_resolve_wait_ms")]
    pub resolve_wait_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_buffer() -> usize {
    360
}

fn default_resolve_wait_ms() -> u64 {
    200
}

impl LayerConfig {
    pub fn new(stream: StreamDescriptor) -> Self {
        Self {
            stream,
            pausable: true,
            requires_outlet: true,
            requires_inlet: true,
            polling: PollingConfig::default(),
            chunk_size: 0,
            max_buffer: default_max_buffer(),
            resolve_wait_ms: default_resolve_wait_ms(),
        }
    }

    pub fn pausable(mut self, pausable: bool) -> Self {
        self.pausable = pausable;
        self
    }

    /// Publish only, never pull peers
    pub fn outlet_only(mut self) -> Self {
        self.requires_outlet = true;
        self.requires_inlet = false;
        self
    }

    /// Pull peers only, never publish
    pub fn inlet_only(mut self) -> Self {
        self.requires_outlet = false;
        self.requires_inlet = true;
        self
    }

    pub fn with_polling(mut self, polling: PollingConfig) -> Self {
        self.polling = polling;
        self
    }

    pub fn resolve_wait(&self) -> Duration {
        Duration::from_millis(self.resolve_wait_ms)
    }
}

/// Named data layers of one node
pub struct LayerManager {
    node_id: String,
    transport: Arc<dyn Transport>,
    layers: BTreeMap<String, Layer>,
    workers: WorkerRegistry,
    known_nodes: BTreeSet<String>,
    default_polling: PollingConfig,
    startup_timeout: Duration,
    stop_grace: Duration,
}

impl LayerManager {
    pub fn new(node_id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        let defaults = crate::config::CoordinationConfig::default();
        Self {
            node_id: node_id.into(),
            transport,
            layers: BTreeMap::new(),
            workers: WorkerRegistry::new(),
            known_nodes: BTreeSet::new(),
            default_polling: PollingConfig::default(),
            startup_timeout: defaults.worker_startup_timeout(),
            stop_grace: defaults.worker_stop_grace(),
        }
    }

    /// Manager using the session's node id, data polling and worker timing
    pub fn from_config(config: &SessionConfig, transport: Arc<dyn Transport>) -> Self {
        let mut manager =
            Self::new(config.node_id.clone(), transport).with_default_polling(config.data_polling.clone());
        manager.startup_timeout = config.coordination.worker_startup_timeout();
        manager.stop_grace = config.coordination.worker_stop_grace();
        manager
    }

    /// Polling used by layers created from coordinator commands
    pub fn with_default_polling(mut self, polling: PollingConfig) -> Self {
        self.default_polling = polling;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.get(name)
    }

    pub fn layer_names(&self) -> Vec<String> {
        self.layers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn known_nodes(&self) -> Vec<String> {
        self.known_nodes.iter().cloned().collect()
    }

    fn layer_mut(&mut self, name: &str) -> Result<&mut Layer> {
        self.layers
            .get_mut(name)
            .ok_or_else(|| CoordError::InvalidState(format!("no layer named '{}'", name)))
    }

    /// Open the layer's endpoints and start pulling known peers
    pub fn create_layer(&mut self, config: LayerConfig) -> Result<&Layer> {
        let name = config.stream.id.clone();
        if self.layers.contains_key(&name) {
            return Err(CoordError::InvalidState(format!("layer '{}' already exists", name)));
        }
        config
            .polling
            .validate()
            .map_err(|e| CoordError::Config(format!("layer '{}' polling: {}", name, e)))?;

        let descriptor = config
            .stream
            .for_source(naming::data_source_id(&self.node_id, &name));

        let mut outlet = if config.requires_outlet {
            Some(open_outlet(
                self.transport.as_ref(),
                &descriptor,
                config.chunk_size,
                config.max_buffer,
            )?)
        } else {
            None
        };

        let mut layer = Layer {
            config: config.clone(),
            descriptor,
            outlet: None,
            worker_name: None,
            state: LayerState::Active,
            attached: BTreeMap::new(),
            relay: None,
            shared: Arc::default(),
            samples_sent: 0,
            dropped_while_paused: 0,
        };

        if config.requires_inlet {
            if let Err(e) = self.start_worker(&mut layer) {
                if let Some(outlet) = outlet.as_mut() {
                    if let Err(destroy_err) = outlet.destroy() {
                        tracing::warn!("Failed to destroy outlet of '{}': {}", name, destroy_err);
                    }
                }
                return Err(e.with_context(format!("creating layer '{}'", name)));
            }
        }
        layer.outlet = outlet;

        tracing::info!(
            "Layer '{}' created (outlet: {}, inlets: {})",
            name,
            config.requires_outlet,
            config.requires_inlet
        );
        self.layers.insert(name.clone(), layer);
        if config.requires_inlet && !self.known_nodes.is_empty() {
            self.refresh(&name)?;
        }
        self.layer(&name)
            .ok_or_else(|| CoordError::InvalidState(format!("layer '{}' vanished", name)))
    }

    fn start_worker(&mut self, layer: &mut Layer) -> Result<()> {
        let worker_name = format!("layer-{}", layer.name());
        let polling = layer
            .config
            .polling
            .clone()
            .excluding_prefix(naming::own_data_prefix(&self.node_id));
        let controller = WorkerController::start_polling(
            worker_name.clone(),
            PollingWorker::entry(self.transport.clone(), polling.clone()),
            self.startup_timeout,
            &polling,
        )?;

        let relay = self::layer::spawn_relay(
            layer.name().to_string(),
            controller.messages().clone(),
            layer.shared.clone(),
        );
        self.workers.register(controller)?;
        match relay {
            Ok(handle) => layer.relay = Some(handle),
            Err(e) => {
                self.workers.stop(&worker_name, self.stop_grace);
                return Err(e.into());
            }
        }
        layer.worker_name = Some(worker_name);
        Ok(())
    }

    /// Look up and attach known peers whose stream is not pulled yet
    ///
    /// Peers whose inlet failed to open since the last call are retried.
    /// Returns the peers attached by this call.
    pub fn refresh(&mut self, name: &str) -> Result<Vec<String>> {
        let layer = self.layer_mut(name)?;
        if layer.worker_name.is_none() {
            return Ok(Vec::new());
        }
        let retry = layer.take_failed_attachments();
        if !retry.is_empty() {
            tracing::debug!("Layer '{}' retrying {:?}", name, retry);
        }

        let layer = self
            .layers
            .get(name)
            .ok_or_else(|| CoordError::InvalidState(format!("no layer named '{}'", name)))?;
        let missing: BTreeSet<String> = self
            .known_nodes
            .iter()
            .filter(|n| **n != self.node_id && !layer.attached.contains_key(*n))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        let found = StreamResolver::new(self.transport.clone())
            .with_excluded_prefix(naming::own_data_prefix(&self.node_id))
            .resolve(
                &naming::data_predicate(&layer.config.stream.name),
                layer.config.resolve_wait(),
                usize::MAX,
            )?;

        let mut endpoints: Vec<StreamDescriptor> = Vec::new();
        let mut attached = Vec::new();
        for descriptor in found {
            let owner = match naming::owner_node_id(&descriptor.source_id) {
                Some(owner) if missing.contains(owner) => owner.to_string(),
                _ => continue,
            };
            attached.push((owner, descriptor.endpoint_id()));
            endpoints.push(descriptor);
        }
        if endpoints.is_empty() {
            tracing::debug!("Layer '{}': no stream yet from {:?}", name, missing);
            return Ok(Vec::new());
        }

        let worker_name = layer.worker_name.clone().unwrap_or_default();
        if let Some(worker) = self.workers.get(&worker_name) {
            worker.send_command(WorkerCommand::AddEndpoints(endpoints))?;
        }

        let layer = self.layer_mut(name)?;
        let mut nodes = Vec::new();
        for (owner, endpoint_id) in attached {
            tracing::debug!("Layer '{}' attached {} ({})", name, owner, endpoint_id);
            nodes.push(owner.clone());
            layer.attached.insert(owner, endpoint_id);
        }
        Ok(nodes)
    }

    /// Replace the set of peer nodes whose streams layers pull
    pub fn update_known_nodes(&mut self, node_ids: &[String]) -> Result<()> {
        let next: BTreeSet<String> = node_ids
            .iter()
            .filter(|id| **id != self.node_id)
            .cloned()
            .collect();
        let departed: Vec<String> = self.known_nodes.difference(&next).cloned().collect();
        self.known_nodes = next;

        for name in self.layer_names() {
            for node_id in &departed {
                if let Err(e) = self.detach(&name, node_id) {
                    tracing::warn!("Layer '{}' could not detach {}: {}", name, node_id, e);
                }
            }
            if let Err(e) = self.refresh(&name) {
                tracing::warn!("Layer '{}' could not refresh peers: {}", name, e);
            }
        }
        Ok(())
    }

    fn detach(&mut self, name: &str, node_id: &str) -> Result<()> {
        let layer = self.layer_mut(name)?;
        let endpoint_id = match layer.attached.remove(node_id) {
            Some(endpoint_id) => endpoint_id,
            None => return Ok(()),
        };
        let worker_name = layer.worker_name.clone().unwrap_or_default();
        tracing::debug!("Layer '{}' detached {}", name, node_id);
        if let Some(worker) = self.workers.get(&worker_name) {
            worker.send_command(WorkerCommand::RemoveEndpoint(endpoint_id))?;
        }
        Ok(())
    }

    pub fn pause(&mut self, name: &str) -> Result<()> {
        self.set_paused(name, true)
    }

    pub fn resume(&mut self, name: &str) -> Result<()> {
        self.set_paused(name, false)
    }

    fn set_paused(&mut self, name: &str, paused: bool) -> Result<()> {
        let layer = self.layer_mut(name)?;
        if !layer.config.pausable {
            return Err(CoordError::UnsupportedOperation(format!(
                "layer '{}' is not pausable",
                name
            )));
        }
        if layer.is_stopped() {
            return Err(CoordError::InvalidState(format!("layer '{}' is stopped", name)));
        }
        layer.state = if paused {
            LayerState::Paused
        } else {
            LayerState::Active
        };
        let worker_name = layer.worker_name.clone();
        if let Some(worker) = worker_name.and_then(|w| self.workers.get(&w)) {
            worker.send_command(if paused {
                WorkerCommand::Pause
            } else {
                WorkerCommand::Resume
            })?;
        }
        tracing::debug!("Layer '{}' {}", name, if paused { "paused" } else { "resumed" });
        Ok(())
    }

    /// Discard samples buffered in the layer's inlets
    pub fn flush(&mut self, name: &str) -> Result<()> {
        let worker_name = self.layer_mut(name)?.worker_name.clone();
        if let Some(worker) = worker_name.and_then(|w| self.workers.get(&w)) {
            worker.send_command(WorkerCommand::Flush)?;
        }
        Ok(())
    }

    /// Publish one sample; returns `false` if dropped because the layer is paused
    pub fn send_data(&mut self, name: &str, data: SampleData) -> Result<bool> {
        let layer = self.layer_mut(name)?;
        if !layer.config.requires_outlet {
            return Err(CoordError::UnsupportedOperation(format!(
                "layer '{}' has no outlet",
                name
            )));
        }
        if layer.is_stopped() {
            return Err(CoordError::InvalidState(format!("layer '{}' is stopped", name)));
        }
        if layer.is_paused() {
            layer.dropped_while_paused += 1;
            return Ok(false);
        }
        let outlet = layer
            .outlet
            .as_mut()
            .ok_or_else(|| CoordError::InvalidState(format!("outlet of layer '{}' is closed", name)))?;
        outlet.push(data, None)?;
        layer.samples_sent += 1;
        Ok(true)
    }

    /// Receive every sample pulled from peers by this layer
    pub fn subscribe(&mut self, name: &str) -> Result<Receiver<PolledSample>> {
        let layer = self.layer_mut(name)?;
        let capacity = layer.config.polling.buffer_size.max(1);
        if !layer.config.requires_inlet {
            return Err(CoordError::UnsupportedOperation(format!(
                "layer '{}' has no inlets",
                name
            )));
        }
        let (tx, rx) = bounded(capacity);
        layer.add_subscriber(tx);
        Ok(rx)
    }

    /// Apply a lifecycle command received from the coordinator
    pub fn apply_stream_command(&mut self, command: &StreamCommand) -> Result<()> {
        match command {
            StreamCommand::Create(stream) => {
                if self.layers.contains_key(&stream.id) {
                    tracing::debug!("Layer '{}' already exists", stream.id);
                    return Ok(());
                }
                let config = LayerConfig::new(stream.clone()).with_polling(self.default_polling.clone());
                self.create_layer(config).map(|_| ())
            }
            StreamCommand::Start(id) => match self.layer_mut(id)?.state() {
                LayerState::Stopped => self.start_layer(id),
                LayerState::Paused => {
                    self.resume(id)?;
                    self.refresh(id).map(|_| ())
                }
                LayerState::Active => self.refresh(id).map(|_| ()),
            },
            StreamCommand::Stop(id) => self.stop_layer(id),
            StreamCommand::Pause(id) => self.pause(id),
            StreamCommand::Resume(id) => self.resume(id),
            StreamCommand::Flush(id) => self.flush(id),
            StreamCommand::Destroy(id) => self.destroy_layer(id),
        }
    }

    /// Release the layer's worker and outlet, keeping the layer and its subscribers
    pub fn stop_layer(&mut self, name: &str) -> Result<()> {
        let layer = self
            .layers
            .get_mut(name)
            .ok_or_else(|| CoordError::InvalidState(format!("no layer named '{}'", name)))?;
        if layer.is_stopped() {
            return Ok(());
        }
        layer.state = LayerState::Stopped;

        if let Some(worker_name) = layer.worker_name.take() {
            if let Some(outcome) = self.workers.stop(&worker_name, self.stop_grace) {
                tracing::debug!("Worker of layer '{}' stopped: {:?}", name, outcome);
            }
        }
        layer.stop_relay();
        layer.attached.clear();
        if let Some(mut outlet) = layer.outlet.take() {
            outlet.destroy()?;
        }
        tracing::info!("Layer '{}' stopped", name);
        Ok(())
    }

    /// Reopen the endpoints of a stopped layer and attach known peers
    pub fn start_layer(&mut self, name: &str) -> Result<()> {
        let mut layer = self
            .layers
            .remove(name)
            .ok_or_else(|| CoordError::InvalidState(format!("no layer named '{}'", name)))?;
        let reopened = self.reopen(&mut layer);
        self.layers.insert(name.to_string(), layer);
        reopened.map_err(|e| e.with_context(format!("starting layer '{}'", name)))?;

        tracing::info!("Layer '{}' started", name);
        self.refresh(name).map(|_| ())
    }

    fn reopen(&mut self, layer: &mut Layer) -> Result<()> {
        if layer.config.requires_outlet && layer.outlet.is_none() {
            layer.outlet = Some(open_outlet(
                self.transport.as_ref(),
                &layer.descriptor,
                layer.config.chunk_size,
                layer.config.max_buffer,
            )?);
        }
        if layer.config.requires_inlet && layer.worker_name.is_none() {
            self.start_worker(layer)?;
        }
        layer.state = LayerState::Active;
        Ok(())
    }

    /// Stop the layer's worker and destroy its endpoints
    pub fn destroy_layer(&mut self, name: &str) -> Result<()> {
        let mut layer = self
            .layers
            .remove(name)
            .ok_or_else(|| CoordError::InvalidState(format!("no layer named '{}'", name)))?;

        if let Some(worker_name) = &layer.worker_name {
            if let Some(outcome) = self.workers.stop(worker_name, self.stop_grace) {
                tracing::debug!("Worker of layer '{}' stopped: {:?}", name, outcome);
            }
        }
        layer.stop_relay();
        if let Some(outlet) = layer.outlet.as_mut() {
            outlet.destroy()?;
        }
        tracing::info!("Layer '{}' destroyed", name);
        Ok(())
    }

    /// Tear down every layer; failures are logged, never returned
    pub fn dispose_all(&mut self) {
        for name in self.layer_names() {
            if let Err(e) = self.destroy_layer(&name) {
                tracing::warn!("Failed to dispose layer '{}': {}", name, e);
            }
        }
        // Workers orphaned by a failed destroy
        for (name, outcome) in self.workers.stop_all(self.stop_grace) {
            tracing::debug!("Worker '{}' stopped during dispose: {:?}", name, outcome);
        }
    }
}

impl Drop for LayerManager {
    fn drop(&mut self) {
        if !self.layers.is_empty() || !self.workers.is_empty() {
            self.dispose_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn manager(transport: &MemoryTransport, node: &str) -> LayerManager {
        LayerManager::new(node, Arc::new(transport.clone())).with_default_polling(PollingConfig::timer(500.0))
    }

    fn eeg() -> LayerConfig {
        LayerConfig::new(StreamDescriptor::new("eeg", "EEG", "")).with_polling(PollingConfig::timer(500.0))
    }

    #[test]
    fn test_create_layer_publishes_own_instance() {
        let transport = MemoryTransport::new();
        let mut layers = manager(&transport, "a");
        let layer = layers.create_layer(eeg()).unwrap();
        assert_eq!(layer.descriptor().source_id, "data:a:eeg");
        assert!(layer.has_outlet());
        assert_eq!(transport.stream_count(), 1);

        assert!(layers.create_layer(eeg()).is_err());
        layers.dispose_all();
        assert_eq!(transport.stream_count(), 0);
        assert!(layers.is_empty());
    }

    #[test]
    fn test_pause_requires_pausable() {
        let transport = MemoryTransport::new();
        let mut layers = manager(&transport, "a");
        layers.create_layer(eeg().pausable(false)).unwrap();

        assert!(matches!(layers.pause("eeg"), Err(CoordError::UnsupportedOperation(_))));
        assert!(matches!(layers.resume("eeg"), Err(CoordError::UnsupportedOperation(_))));
    }

    #[test]
    fn test_send_requires_outlet() {
        let transport = MemoryTransport::new();
        let mut layers = manager(&transport, "a");
        layers.create_layer(eeg().inlet_only()).unwrap();
        let err = layers.send_data("eeg", SampleData::Float32(vec![1.0])).unwrap_err();
        assert!(matches!(err, CoordError::UnsupportedOperation(_)));
    }

    #[test]
    fn test_paused_layer_drops_sends() {
        let transport = MemoryTransport::new();
        let mut layers = manager(&transport, "a");
        layers.create_layer(eeg().outlet_only()).unwrap();

        assert!(layers.send_data("eeg", SampleData::Float32(vec![1.0])).unwrap());
        layers.pause("eeg").unwrap();
        assert!(!layers.send_data("eeg", SampleData::Float32(vec![2.0])).unwrap());
        layers.resume("eeg").unwrap();
        assert!(layers.send_data("eeg", SampleData::Float32(vec![3.0])).unwrap());

        let layer = layers.layer("eeg").unwrap();
        assert_eq!(layer.samples_sent(), 2);
        assert_eq!(layer.dropped_while_paused(), 1);
        assert!(matches!(layers.subscribe("eeg"), Err(CoordError::UnsupportedOperation(_))));
    }

    #[test]
    fn test_samples_flow_to_subscribers() {
        let transport = MemoryTransport::new();
        let mut producer = manager(&transport, "a");
        let mut consumer = manager(&transport, "b");
        producer.create_layer(eeg().outlet_only()).unwrap();
        consumer.create_layer(eeg().inlet_only()).unwrap();
        let samples = consumer.subscribe("eeg").unwrap();

        consumer
            .update_known_nodes(&["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(consumer.layer("eeg").unwrap().attached_nodes(), vec!["a"]);

        // Give the worker time to open the inlet
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let received = loop {
            producer.send_data("eeg", SampleData::Float32(vec![0.5])).unwrap();
            if let Ok(sample) = samples.recv_timeout(Duration::from_millis(20)) {
                break sample;
            }
            assert!(std::time::Instant::now() < deadline, "no sample relayed");
        };
        assert_eq!(received.source_id, "data:a:eeg");
        assert_eq!(received.stream_id, "eeg");

        consumer.update_known_nodes(&["b".to_string()]).unwrap();
        assert!(consumer.layer("eeg").unwrap().attached_nodes().is_empty());
    }

    #[test]
    fn test_stream_commands() {
        let transport = MemoryTransport::new();
        let mut layers = manager(&transport, "a");
        let stream = StreamDescriptor::new("markers", "Markers", "");

        layers.apply_stream_command(&StreamCommand::Create(stream.clone())).unwrap();
        layers.apply_stream_command(&StreamCommand::Create(stream)).unwrap();
        assert_eq!(layers.layer_names(), vec!["markers"]);

        layers.apply_stream_command(&StreamCommand::Pause("markers".to_string())).unwrap();
        assert!(layers.layer("markers").unwrap().is_paused());
        layers.apply_stream_command(&StreamCommand::Start("markers".to_string())).unwrap();
        assert!(!layers.layer("markers").unwrap().is_paused());
        layers.apply_stream_command(&StreamCommand::Flush("markers".to_string())).unwrap();

        layers.apply_stream_command(&StreamCommand::Destroy("markers".to_string())).unwrap();
        assert!(layers.is_empty());
        assert!(layers
            .apply_stream_command(&StreamCommand::Resume("markers".to_string()))
            .is_err());
    }

    #[test]
    fn test_stop_releases_endpoints_until_start() {
        let transport = MemoryTransport::new();
        let mut layers = manager(&transport, "a");
        layers.create_layer(eeg().pausable(false)).unwrap();
        let samples = layers.subscribe("eeg").unwrap();

        layers.apply_stream_command(&StreamCommand::Stop("eeg".to_string())).unwrap();
        let layer = layers.layer("eeg").unwrap();
        assert_eq!(layer.state(), LayerState::Stopped);
        assert!(!layer.has_outlet());
        assert_eq!(transport.stream_count(), 0);
        assert!(matches!(
            layers.send_data("eeg", SampleData::Float32(vec![1.0])),
            Err(CoordError::InvalidState(_))
        ));
        // Stopping twice is harmless
        layers.stop_layer("eeg").unwrap();

        layers.apply_stream_command(&StreamCommand::Start("eeg".to_string())).unwrap();
        let layer = layers.layer("eeg").unwrap();
        assert_eq!(layer.state(), LayerState::Active);
        assert!(layer.has_outlet());
        assert_eq!(transport.stream_count(), 1);
        assert!(layers.send_data("eeg", SampleData::Float32(vec![2.0])).unwrap());
        drop(samples);
    }

    #[test]
    fn test_subscriber_queue_follows_layer_polling() {
        let transport = MemoryTransport::new();
        let mut layers = manager(&transport, "a");
        let polling = PollingConfig {
            buffer_size: 16,
            ..PollingConfig::timer(500.0)
        };
        layers.create_layer(eeg().with_polling(polling)).unwrap();

        let samples = layers.subscribe("eeg").unwrap();
        assert_eq!(samples.capacity(), Some(16));
    }

    #[test]
    fn test_create_layer_rejects_invalid_polling() {
        let transport = MemoryTransport::new();
        let mut layers = manager(&transport, "a");
        let polling = PollingConfig {
            pull_timeout_secs: 1e30,
            ..PollingConfig::timer(500.0)
        };
        let err = layers.create_layer(eeg().with_polling(polling)).unwrap_err();
        assert!(matches!(err, CoordError::Config(_)));
        assert_eq!(transport.stream_count(), 0);
    }

    #[test]
    fn test_dead_worker_does_not_block_other_layers() {
        let transport = MemoryTransport::new();
        let mut producer = manager(&transport, "b");
        let mut consumer = manager(&transport, "a");
        for id in ["first", "second"] {
            let stream = StreamDescriptor::new(id, id, "");
            producer.create_layer(LayerConfig::new(stream.clone()).outlet_only()).unwrap();
            consumer
                .create_layer(
                    LayerConfig::new(stream)
                        .inlet_only()
                        .with_polling(PollingConfig::timer(500.0)),
                )
                .unwrap();
        }
        consumer
            .update_known_nodes(&["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(consumer.layer("first").unwrap().attached_nodes(), vec!["b"]);
        assert_eq!(consumer.layer("second").unwrap().attached_nodes(), vec!["b"]);

        // The first layer's worker exits while still registered
        let worker = consumer.workers.get("layer-first").unwrap();
        worker.send_command(WorkerCommand::Stop).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while worker.is_running() {
            assert!(std::time::Instant::now() < deadline, "worker did not exit");
            std::thread::sleep(Duration::from_millis(10));
        }

        consumer.update_known_nodes(&["a".to_string()]).unwrap();
        assert!(consumer.layer("second").unwrap().attached_nodes().is_empty());
    }
}
