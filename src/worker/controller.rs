//! Supervision of one polling worker
//!
//! The controller spawns the worker thread, waits for its ready handshake,
//! relays commands into the worker's inbox and exposes the worker's outbound
//! messages. Stopping is bounded: a worker that ignores `Stop` for longer than
//! the grace period is flagged as killed and detached.

use super::{WorkerCommand, WorkerContext, WorkerEnvelope, WorkerMessage};
use crate::config::{PollingConfig, DEFAULT_WORKER_BUFFER_SIZE};
use crate::error::{CoordError, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Poll interval while waiting for a stopping worker
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Grace period used when a controller is dropped while its worker runs
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_millis(500);

/// How a stop request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The worker terminated within the grace period
    Graceful,
    /// The worker was flagged as killed and detached
    Forced,
    /// The worker had already terminated
    AlreadyStopped,
}

/// Controller of exactly one worker
pub struct WorkerController {
    name: String,
    inbox: Sender<WorkerEnvelope>,
    messages: Receiver<WorkerEnvelope>,
    kill: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    epoch: Instant,
}

impl WorkerController {
    /// Spawn `entry` and wait up to `startup_timeout` for its ready handshake
    pub fn start<F>(name: impl Into<String>, entry: F, startup_timeout: Duration) -> Result<Self>
    where
        F: FnOnce(WorkerContext) + Send + 'static,
    {
        Self::start_with_capacity(name, entry, startup_timeout, DEFAULT_WORKER_BUFFER_SIZE)
    }

    /// Spawn a polling worker sized by `config`
    pub fn start_polling<F>(
        name: impl Into<String>,
        entry: F,
        startup_timeout: Duration,
        config: &PollingConfig,
    ) -> Result<Self>
    where
        F: FnOnce(WorkerContext) + Send + 'static,
    {
        Self::start_with_capacity(name, entry, startup_timeout, config.buffer_size)
    }

    /// Like [`start`](Self::start) with an explicit outbound buffer size
    pub fn start_with_capacity<F>(
        name: impl Into<String>,
        entry: F,
        startup_timeout: Duration,
        capacity: usize,
    ) -> Result<Self>
    where
        F: FnOnce(WorkerContext) + Send + 'static,
    {
        let name = name.into();
        let (handshake_tx, handshake_rx) = bounded::<Sender<WorkerEnvelope>>(1);
        let (outbox_tx, outbox_rx) = bounded(capacity.max(1));
        let kill = Arc::new(AtomicBool::new(false));

        let ctx = WorkerContext::new(name.clone(), outbox_tx, handshake_tx, kill.clone());
        let handle = std::thread::Builder::new()
            .name(format!("worker-{}", name))
            .spawn(move || entry(ctx))
            .map_err(|e| CoordError::WorkerStartup {
                worker: name.clone(),
                message: format!("failed to spawn thread: {}", e),
            })?;

        let inbox = match handshake_rx.recv_timeout(startup_timeout) {
            Ok(inbox) => inbox,
            Err(RecvTimeoutError::Timeout) => {
                kill.store(true, Ordering::SeqCst);
                tracing::error!("Worker '{}' did not signal ready within {:?}", name, startup_timeout);
                return Err(CoordError::WorkerStartup {
                    worker: name,
                    message: format!("no ready handshake within {:?}", startup_timeout),
                });
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                return Err(CoordError::WorkerStartup {
                    worker: name,
                    message: "worker exited before signalling ready".to_string(),
                });
            }
        };

        tracing::debug!("Worker '{}' ready", name);
        Ok(Self {
            name,
            inbox,
            messages: outbox_rx,
            kill,
            handle: Some(handle),
            epoch: Instant::now(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the worker thread is still alive
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    fn envelope(&self, message: WorkerMessage) -> WorkerEnvelope {
        WorkerEnvelope::new(self.epoch.elapsed().as_secs_f64(), message)
    }

    fn send(&self, message: WorkerMessage) -> Result<()> {
        match self.inbox.try_send(self.envelope(message)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(CoordError::Channel(format!(
                "inbox of worker '{}' is full",
                self.name
            ))),
            Err(TrySendError::Disconnected(_)) => Err(CoordError::Channel(format!(
                "worker '{}' has terminated",
                self.name
            ))),
        }
    }

    /// Queue a command; commands are delivered in send order
    pub fn send_command(&self, command: WorkerCommand) -> Result<()> {
        tracing::trace!("Worker '{}' <- {:?}", self.name, command);
        self.send(WorkerMessage::Command(command))
    }

    /// Ask the worker to adopt a new polling config (rejected while running)
    pub fn send_config(&self, config: PollingConfig) -> Result<()> {
        self.send(WorkerMessage::Config(config))
    }

    /// The worker's Data/Error/Metrics/Response messages
    pub fn messages(&self) -> &Receiver<WorkerEnvelope> {
        &self.messages
    }

    /// Try to receive a message (non-blocking)
    pub fn try_recv(&self) -> Option<WorkerEnvelope> {
        self.messages.try_recv().ok()
    }

    /// Wait up to `timeout` for a message
    pub fn recv_timeout(&self, timeout: Duration) -> Option<WorkerEnvelope> {
        self.messages.recv_timeout(timeout).ok()
    }

    /// Drain all pending messages
    pub fn drain(&self) -> impl Iterator<Item = WorkerEnvelope> + '_ {
        self.messages.try_iter()
    }

    /// Send `Stop`, wait up to `grace`, then force-terminate
    ///
    /// Never blocks longer than `grace` plus one poll interval.
    pub fn stop(&mut self, grace: Duration) -> StopOutcome {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return StopOutcome::AlreadyStopped,
        };
        if handle.is_finished() {
            let _ = handle.join();
            return StopOutcome::AlreadyStopped;
        }

        if let Err(e) = self.send_command(WorkerCommand::Stop) {
            tracing::debug!("Could not deliver Stop to '{}': {}", self.name, e);
        }

        let deadline = Instant::now() + grace;
        loop {
            if handle.is_finished() {
                if handle.join().is_err() {
                    tracing::warn!("Worker '{}' panicked during shutdown", self.name);
                }
                tracing::debug!("Worker '{}' stopped gracefully", self.name);
                return StopOutcome::Graceful;
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(STOP_POLL_INTERVAL);
        }

        // The thread may be blocked in a pull; flag it and let it go
        self.kill.store(true, Ordering::SeqCst);
        tracing::warn!(
            "Worker '{}' did not stop within {:?}, force-terminated",
            self.name,
            grace
        );
        drop(handle);
        StopOutcome::Forced
    }
}

impl Drop for WorkerController {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop(DEFAULT_STOP_GRACE);
        }
    }
}

impl std::fmt::Debug for WorkerController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerController")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollingConfig;
    use crate::transport::MemoryTransport;
    use crate::worker::{PollingWorker, WorkerResponse};

    fn polling_entry() -> impl FnOnce(WorkerContext) + Send + 'static {
        PollingWorker::entry(Arc::new(MemoryTransport::new()), PollingConfig::timer(500.0))
    }

    #[test]
    fn test_start_and_graceful_stop() {
        let mut controller =
            WorkerController::start("poller", polling_entry(), Duration::from_secs(5)).unwrap();
        assert!(controller.is_running());

        assert_eq!(controller.stop(Duration::from_secs(2)), StopOutcome::Graceful);
        assert!(!controller.is_running());
        assert_eq!(controller.stop(Duration::from_secs(2)), StopOutcome::AlreadyStopped);

        let stopped = controller
            .drain()
            .any(|e| matches!(e.message, WorkerMessage::Response(WorkerResponse::Stopped)));
        assert!(stopped);
    }

    #[test]
    fn test_startup_timeout() {
        let entry = |ctx: WorkerContext| {
            // Never signals ready
            while !ctx.is_killed() {
                std::thread::sleep(Duration::from_millis(1));
            }
        };
        let err = WorkerController::start("silent", entry, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, CoordError::WorkerStartup { .. }));
    }

    #[test]
    fn test_worker_exiting_before_ready() {
        let entry = |_ctx: WorkerContext| {};
        let err = WorkerController::start("quitter", entry, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, CoordError::WorkerStartup { .. }));
    }

    #[test]
    fn test_unresponsive_worker_is_forced() {
        let entry = |mut ctx: WorkerContext| {
            let _inbox = ctx.signal_ready(4).unwrap();
            // Ignores Stop; only honors the kill flag
            while !ctx.is_killed() {
                std::thread::sleep(Duration::from_millis(1));
            }
        };
        let mut controller = WorkerController::start("stuck", entry, Duration::from_secs(1)).unwrap();

        let start = Instant::now();
        assert_eq!(controller.stop(Duration::from_millis(50)), StopOutcome::Forced);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_send_after_stop_fails() {
        let mut controller =
            WorkerController::start("poller", polling_entry(), Duration::from_secs(5)).unwrap();
        controller.stop(Duration::from_secs(2));
        assert!(controller.send_command(WorkerCommand::Pause).is_err());
    }
}
