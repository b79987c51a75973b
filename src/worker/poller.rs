//! The polling loop
//!
//! [`PollingWorker`] owns its inlets exclusively. Between ticks it drains the
//! command inbox; each tick pulls every managed inlet once. A failing inlet is
//! counted, logged and reported but never stops the loop.

use super::{
    PolledSample, PollingMetrics, TickScheduler, WorkerCommand, WorkerContext, WorkerEnvelope,
    WorkerError, WorkerMessage, WorkerResponse, WorkerState, DEFAULT_INBOX_CAPACITY,
};
use crate::config::PollingConfig;
use crate::transport::{open_inlet, Inlet, Transport};
use crate::types::StreamDescriptor;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Inbox wait while paused
const PAUSED_WAIT: Duration = Duration::from_millis(10);

/// Polling worker
pub struct PollingWorker {
    name: String,
    transport: Arc<dyn Transport>,
    config: PollingConfig,
    /// Commands from the controller
    inbox: Receiver<WorkerEnvelope>,
    /// Data/Error/Metrics/Response to the controller
    outbox: Sender<WorkerEnvelope>,
    kill: Arc<AtomicBool>,
    state: WorkerState,
    /// Managed inlets in insertion order
    inlets: Vec<Inlet>,
    scheduler: TickScheduler,
    metrics: PollingMetrics,
    window_start: Instant,
    window_ticks: u64,
}

impl PollingWorker {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        config: PollingConfig,
        inbox: Receiver<WorkerEnvelope>,
        outbox: Sender<WorkerEnvelope>,
        kill: Arc<AtomicBool>,
    ) -> Self {
        let scheduler = TickScheduler::from_config(&config);
        let metrics = PollingMetrics {
            target_frequency: config.target_frequency(),
            ..PollingMetrics::default()
        };
        Self {
            name: name.into(),
            transport,
            config,
            inbox,
            outbox,
            kill,
            state: WorkerState::Starting,
            inlets: Vec::new(),
            scheduler,
            metrics,
            window_start: Instant::now(),
            window_ticks: 0,
        }
    }

    /// Entry point for [`WorkerController::start`](super::WorkerController::start)
    pub fn entry(
        transport: Arc<dyn Transport>,
        config: PollingConfig,
    ) -> impl FnOnce(WorkerContext) + Send + 'static {
        move |mut ctx: WorkerContext| {
            let inbox = match ctx.signal_ready(DEFAULT_INBOX_CAPACITY) {
                Ok(inbox) => inbox,
                Err(e) => {
                    tracing::error!("Worker '{}' could not signal ready: {}", ctx.name(), e);
                    return;
                }
            };
            let mut worker = PollingWorker::new(
                ctx.name().to_string(),
                transport,
                config,
                inbox,
                ctx.outbox().clone(),
                ctx.kill_flag(),
            );
            worker.run();
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Endpoint ids of the managed inlets
    pub fn endpoint_ids(&self) -> Vec<String> {
        self.inlets.iter().map(Inlet::endpoint_id).collect()
    }

    pub fn metrics(&self) -> &PollingMetrics {
        &self.metrics
    }

    /// Run until stopped, killed or orphaned by the controller
    pub fn run(&mut self) {
        tracing::info!(
            "Polling worker '{}' started ({} Hz, {})",
            self.name,
            self.config.target_frequency(),
            if self.config.use_busy_wait { "busy-wait" } else { "timer" }
        );
        self.state = WorkerState::Running;
        self.scheduler.reset();
        self.window_start = Instant::now();

        loop {
            if self.kill.load(Ordering::SeqCst) {
                tracing::warn!("Polling worker '{}' killed", self.name);
                break;
            }

            self.process_commands();
            if self.state == WorkerState::Stopping {
                break;
            }

            match self.state {
                WorkerState::Running => {
                    self.poll_once();
                    self.maybe_emit_metrics();
                    self.scheduler.wait();
                }
                WorkerState::Paused => {
                    self.maybe_emit_metrics();
                    self.wait_while_paused();
                }
                _ => {}
            }
        }

        self.shutdown();
    }

    /// Drain the inbox without blocking
    pub fn process_commands(&mut self) {
        loop {
            match self.inbox.try_recv() {
                Ok(envelope) => self.handle_envelope(envelope),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    tracing::debug!("Controller of '{}' disconnected", self.name);
                    self.state = WorkerState::Stopping;
                    break;
                }
            }
        }
    }

    fn wait_while_paused(&mut self) {
        match self.inbox.recv_timeout(PAUSED_WAIT) {
            Ok(envelope) => self.handle_envelope(envelope),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => self.state = WorkerState::Stopping,
        }
    }

    fn handle_envelope(&mut self, envelope: WorkerEnvelope) {
        match envelope.message {
            WorkerMessage::Command(cmd) => self.handle_command(cmd),
            WorkerMessage::Config(_) => {
                // Polling config is fixed for the lifetime of a worker
                let reason = format!("worker '{}' is {}; restart it to reconfigure", self.name, self.state);
                tracing::warn!("Rejected config update: {}", reason);
                self.respond(WorkerResponse::ConfigRejected { reason });
            }
            other => {
                tracing::debug!("Worker '{}' ignoring inbound {} message", self.name, other.kind());
            }
        }
    }

    fn handle_command(&mut self, cmd: WorkerCommand) {
        match cmd {
            WorkerCommand::AddEndpoints(descriptors) => self.add_endpoints(descriptors),
            WorkerCommand::RemoveEndpoint(endpoint_id) => self.remove_endpoint(&endpoint_id),
            WorkerCommand::Pause => {
                if self.state == WorkerState::Running {
                    self.state = WorkerState::Paused;
                    tracing::debug!("Worker '{}' paused", self.name);
                }
                self.respond(WorkerResponse::StateChanged(self.state));
            }
            WorkerCommand::Resume => {
                if self.state == WorkerState::Paused {
                    self.state = WorkerState::Running;
                    self.scheduler.reset();
                    tracing::debug!("Worker '{}' resumed", self.name);
                }
                self.respond(WorkerResponse::StateChanged(self.state));
            }
            WorkerCommand::Flush => self.flush(),
            WorkerCommand::Stop => {
                tracing::debug!("Worker '{}' stopping", self.name);
                self.state = WorkerState::Stopping;
            }
        }
    }

    fn add_endpoints(&mut self, descriptors: Vec<StreamDescriptor>) {
        let mut added = Vec::new();
        let mut skipped = Vec::new();
        let mut failed = Vec::new();

        for descriptor in descriptors {
            let endpoint_id = descriptor.endpoint_id();

            let is_self = self
                .config
                .exclude_source_prefix
                .as_deref()
                .map(|prefix| descriptor.source_id.starts_with(prefix))
                .unwrap_or(false);
            let is_duplicate = self.inlets.iter().any(|i| i.endpoint_id() == endpoint_id);
            if is_self || is_duplicate {
                skipped.push(endpoint_id);
                continue;
            }

            match open_inlet(
                self.transport.as_ref(),
                &descriptor,
                self.config.buffer_size,
                0,
                true,
            ) {
                Ok(inlet) => {
                    tracing::debug!("Worker '{}' now polling {}", self.name, endpoint_id);
                    self.inlets.push(inlet);
                    added.push(endpoint_id);
                }
                Err(e) => {
                    // Partial success is expected; the endpoint is simply omitted
                    tracing::warn!("Worker '{}' could not open {}: {}", self.name, endpoint_id, e);
                    failed.push(endpoint_id);
                }
            }
        }

        self.metrics.managed_endpoints = self.inlets.len();
        self.respond(WorkerResponse::EndpointsAdded {
            added,
            skipped,
            failed,
        });
    }

    fn remove_endpoint(&mut self, endpoint_id: &str) {
        let position = self.inlets.iter().position(|i| i.endpoint_id() == endpoint_id);
        let existed = match position {
            Some(index) => {
                let mut inlet = self.inlets.remove(index);
                if let Err(e) = inlet.destroy() {
                    tracing::warn!("Failed to destroy {}: {}", endpoint_id, e);
                }
                tracing::debug!("Worker '{}' stopped polling {}", self.name, endpoint_id);
                true
            }
            None => false,
        };
        self.metrics.managed_endpoints = self.inlets.len();
        self.respond(WorkerResponse::EndpointRemoved {
            endpoint_id: endpoint_id.to_string(),
            existed,
        });
    }

    fn flush(&mut self) {
        let mut samples = 0;
        for inlet in &mut self.inlets {
            match inlet.flush() {
                Ok(n) => samples += n,
                Err(e) => tracing::warn!("Flush of {} failed: {}", inlet.endpoint_id(), e),
            }
        }
        tracing::debug!("Worker '{}' flushed {} sample(s)", self.name, samples);
        self.respond(WorkerResponse::Flushed { samples });
    }

    /// One poll pass over every managed inlet
    pub fn poll_once(&mut self) {
        let timeout = self.config.pull_timeout();
        let mut outgoing = Vec::new();

        for inlet in &mut self.inlets {
            match inlet.pull(timeout) {
                Ok(Some(sample)) => {
                    self.metrics.samples_processed += 1;
                    self.metrics.total_samples += 1;
                    let descriptor = inlet.descriptor();
                    outgoing.push(WorkerMessage::Data(PolledSample {
                        endpoint_id: descriptor.endpoint_id(),
                        source_id: descriptor.source_id.clone(),
                        stream_id: descriptor.id.clone(),
                        sample,
                        capture_timestamp: self.transport.local_clock(),
                    }));
                }
                Ok(None) => {}
                Err(e) => {
                    self.metrics.dropped_samples += 1;
                    self.metrics.total_dropped += 1;
                    let endpoint_id = inlet.endpoint_id();
                    tracing::warn!("Pull from {} failed: {}", endpoint_id, e);
                    outgoing.push(WorkerMessage::Error(WorkerError {
                        endpoint_id: Some(endpoint_id),
                        message: e.to_string(),
                    }));
                }
            }
        }

        self.window_ticks += 1;
        for message in outgoing {
            self.try_send_message(message);
        }
    }

    fn maybe_emit_metrics(&mut self) {
        let elapsed = self.window_start.elapsed();
        if elapsed < self.config.metrics_interval() {
            return;
        }

        self.metrics.actual_frequency = self.window_ticks as f64 / elapsed.as_secs_f64();
        self.metrics.skipped_ticks = self.scheduler.skipped_ticks();
        self.metrics.managed_endpoints = self.inlets.len();
        let snapshot = self.metrics.clone();
        tracing::trace!(
            "Worker '{}': {} samples, {} dropped, {:.1} Hz",
            self.name,
            snapshot.samples_processed,
            snapshot.dropped_samples,
            snapshot.actual_frequency
        );
        self.try_send_message(WorkerMessage::Metrics(snapshot));

        self.metrics.samples_processed = 0;
        self.metrics.dropped_samples = 0;
        self.window_ticks = 0;
        self.window_start = Instant::now();
    }

    fn respond(&mut self, response: WorkerResponse) {
        self.try_send_message(WorkerMessage::Response(response));
    }

    /// Send without blocking; overflow is counted, not waited on
    fn try_send_message(&mut self, message: WorkerMessage) {
        let envelope = WorkerEnvelope::new(self.transport.local_clock(), message);
        if self.outbox.try_send(envelope).is_err() {
            self.metrics.outbox_overflows += 1;
        }
    }

    fn shutdown(&mut self) {
        self.state = WorkerState::Stopping;
        for inlet in &mut self.inlets {
            if let Err(e) = inlet.destroy() {
                tracing::warn!("Failed to destroy {}: {}", inlet.endpoint_id(), e);
            }
        }
        self.inlets.clear();
        self.metrics.managed_endpoints = 0;
        self.respond(WorkerResponse::Stopped);
        self.state = WorkerState::Terminated;
        tracing::info!("Polling worker '{}' stopped", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{open_outlet, MemoryTransport, Outlet};
    use crate::types::{ChannelFormat, SampleData};
    use crossbeam_channel::bounded;

    fn descriptor(node: &str) -> StreamDescriptor {
        StreamDescriptor::new("eeg", "EEG", format!("data:{}:eeg", node))
            .with_channels(1, ChannelFormat::Float32)
    }

    fn create_test_worker(
        config: PollingConfig,
    ) -> (
        PollingWorker,
        MemoryTransport,
        Sender<WorkerEnvelope>,
        Receiver<WorkerEnvelope>,
    ) {
        let transport = MemoryTransport::new();
        let (cmd_tx, cmd_rx) = bounded(16);
        let (msg_tx, msg_rx) = bounded(64);
        let worker = PollingWorker::new(
            "test",
            Arc::new(transport.clone()),
            config,
            cmd_rx,
            msg_tx,
            Arc::new(AtomicBool::new(false)),
        );
        (worker, transport, cmd_tx, msg_rx)
    }

    fn command(cmd: WorkerCommand) -> WorkerEnvelope {
        WorkerEnvelope::new(0.0, WorkerMessage::Command(cmd))
    }

    fn responses(rx: &Receiver<WorkerEnvelope>) -> Vec<WorkerResponse> {
        rx.try_iter()
            .filter_map(|e| match e.message {
                WorkerMessage::Response(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    fn outlet(transport: &MemoryTransport, node: &str) -> Outlet {
        open_outlet(transport, &descriptor(node), 0, 64).unwrap()
    }

    #[test]
    fn test_add_endpoints_skips_duplicates_and_self() {
        let config = PollingConfig::default().excluding_prefix("data:me:");
        let (mut worker, transport, cmd_tx, msg_rx) = create_test_worker(config);
        let _a = outlet(&transport, "a");
        let _me = outlet(&transport, "me");

        cmd_tx
            .send(command(WorkerCommand::AddEndpoints(vec![
                descriptor("a"),
                descriptor("a"),
                descriptor("me"),
            ])))
            .unwrap();
        worker.process_commands();

        assert_eq!(worker.endpoint_ids(), vec!["EEG@data:a:eeg".to_string()]);
        match responses(&msg_rx).pop().unwrap() {
            WorkerResponse::EndpointsAdded {
                added,
                skipped,
                failed,
            } => {
                assert_eq!(added.len(), 1);
                assert_eq!(skipped.len(), 2);
                assert!(failed.is_empty());
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_failed_endpoint_is_omitted() {
        let (mut worker, transport, cmd_tx, msg_rx) = create_test_worker(PollingConfig::default());
        let _a = outlet(&transport, "a");
        let _b = outlet(&transport, "b");
        transport.fail_inlet_creation("data:b:eeg", true);

        cmd_tx
            .send(command(WorkerCommand::AddEndpoints(vec![descriptor("a"), descriptor("b")])))
            .unwrap();
        worker.process_commands();

        assert_eq!(worker.endpoint_ids().len(), 1);
        assert!(matches!(
            responses(&msg_rx).pop(),
            Some(WorkerResponse::EndpointsAdded { failed, .. }) if failed == vec!["EEG@data:b:eeg".to_string()]
        ));
    }

    #[test]
    fn test_poll_forwards_samples() {
        let (mut worker, transport, cmd_tx, msg_rx) = create_test_worker(PollingConfig::default());
        let mut out = outlet(&transport, "a");
        cmd_tx
            .send(command(WorkerCommand::AddEndpoints(vec![descriptor("a")])))
            .unwrap();
        worker.process_commands();
        let _ = responses(&msg_rx);

        out.push(SampleData::Float32(vec![3.0]), Some(1.25)).unwrap();
        worker.poll_once();

        let data: Vec<PolledSample> = msg_rx
            .try_iter()
            .filter_map(|e| match e.message {
                WorkerMessage::Data(d) => Some(d),
                _ => None,
            })
            .collect();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].source_id, "data:a:eeg");
        assert_eq!(data[0].stream_id, "eeg");
        assert_eq!(data[0].sample.timestamp, 1.25);
        assert_eq!(worker.metrics().total_samples, 1);
    }

    #[test]
    fn test_failing_inlet_does_not_stop_siblings() {
        let (mut worker, transport, cmd_tx, msg_rx) = create_test_worker(PollingConfig::default());
        let mut a = outlet(&transport, "a");
        let _b = outlet(&transport, "b");
        cmd_tx
            .send(command(WorkerCommand::AddEndpoints(vec![descriptor("a"), descriptor("b")])))
            .unwrap();
        worker.process_commands();
        transport.fail_pulls("data:b:eeg", true);

        for i in 0..3 {
            a.push(SampleData::Float32(vec![i as f32]), None).unwrap();
            worker.poll_once();
        }

        let (mut data, mut errors) = (0, 0);
        for envelope in msg_rx.try_iter() {
            match envelope.message {
                WorkerMessage::Data(_) => data += 1,
                WorkerMessage::Error(e) => {
                    assert_eq!(e.endpoint_id.as_deref(), Some("EEG@data:b:eeg"));
                    errors += 1;
                }
                _ => {}
            }
        }
        assert_eq!(data, 3);
        assert_eq!(errors, 3);
        assert_eq!(worker.metrics().total_dropped, 3);
    }

    #[test]
    fn test_remove_endpoint() {
        let (mut worker, transport, cmd_tx, msg_rx) = create_test_worker(PollingConfig::default());
        let _a = outlet(&transport, "a");
        cmd_tx
            .send(command(WorkerCommand::AddEndpoints(vec![descriptor("a")])))
            .unwrap();
        cmd_tx
            .send(command(WorkerCommand::RemoveEndpoint("EEG@data:a:eeg".to_string())))
            .unwrap();
        cmd_tx
            .send(command(WorkerCommand::RemoveEndpoint("EEG@data:zz:eeg".to_string())))
            .unwrap();
        worker.process_commands();

        assert!(worker.endpoint_ids().is_empty());
        assert_eq!(transport.consumer_count("data:a:eeg"), 0);
        let responses = responses(&msg_rx);
        assert!(responses.contains(&WorkerResponse::EndpointRemoved {
            endpoint_id: "EEG@data:a:eeg".to_string(),
            existed: true
        }));
        assert!(responses.contains(&WorkerResponse::EndpointRemoved {
            endpoint_id: "EEG@data:zz:eeg".to_string(),
            existed: false
        }));
    }

    #[test]
    fn test_pause_resume_and_config_rejection() {
        let (mut worker, _transport, cmd_tx, msg_rx) = create_test_worker(PollingConfig::default());
        worker.state = WorkerState::Running;

        cmd_tx.send(command(WorkerCommand::Pause)).unwrap();
        worker.process_commands();
        assert_eq!(worker.state(), WorkerState::Paused);

        cmd_tx.send(command(WorkerCommand::Resume)).unwrap();
        cmd_tx
            .send(WorkerEnvelope::new(0.0, WorkerMessage::Config(PollingConfig::timer(10.0))))
            .unwrap();
        worker.process_commands();
        assert_eq!(worker.state(), WorkerState::Running);

        let responses = responses(&msg_rx);
        assert!(responses
            .iter()
            .any(|r| matches!(r, WorkerResponse::ConfigRejected { .. })));
    }

    #[test]
    fn test_flush_discards_buffered_samples() {
        let (mut worker, transport, cmd_tx, msg_rx) = create_test_worker(PollingConfig::default());
        let mut a = outlet(&transport, "a");
        cmd_tx
            .send(command(WorkerCommand::AddEndpoints(vec![descriptor("a")])))
            .unwrap();
        worker.process_commands();
        for i in 0..4 {
            a.push(SampleData::Float32(vec![i as f32]), None).unwrap();
        }

        cmd_tx.send(command(WorkerCommand::Flush)).unwrap();
        worker.process_commands();
        assert!(responses(&msg_rx).contains(&WorkerResponse::Flushed { samples: 4 }));

        worker.poll_once();
        assert_eq!(worker.metrics().total_samples, 0);
    }

    #[test]
    fn test_stop_destroys_endpoints() {
        let (mut worker, transport, cmd_tx, msg_rx) = create_test_worker(PollingConfig::timer(1000.0));
        let _a = outlet(&transport, "a");
        cmd_tx
            .send(command(WorkerCommand::AddEndpoints(vec![descriptor("a")])))
            .unwrap();
        cmd_tx.send(command(WorkerCommand::Stop)).unwrap();

        worker.run();

        assert_eq!(worker.state(), WorkerState::Terminated);
        assert_eq!(transport.consumer_count("data:a:eeg"), 0);
        assert_eq!(responses(&msg_rx).last(), Some(&WorkerResponse::Stopped));
    }

    #[test]
    fn test_outbox_overflow_is_counted() {
        let transport = MemoryTransport::new();
        let (_cmd_tx, cmd_rx) = bounded(16);
        let (msg_tx, _msg_rx) = bounded(1);
        let mut worker = PollingWorker::new(
            "tiny",
            Arc::new(transport.clone()),
            PollingConfig::default(),
            cmd_rx,
            msg_tx,
            Arc::new(AtomicBool::new(false)),
        );
        let mut a = open_outlet(&transport, &descriptor("a"), 0, 64).unwrap();
        worker.add_endpoints(vec![descriptor("a")]);
        for i in 0..3 {
            a.push(SampleData::Float32(vec![i as f32]), None).unwrap();
            worker.poll_once();
        }
        assert!(worker.metrics().outbox_overflows >= 3);
    }
}
