//! Stream discovery
//!
//! [`StreamResolver`] performs one-shot, bounded-time searches and spawns
//! [`ContinuousResolver`]s that re-query on a fixed cadence. Predicate matching
//! is left to the transport; the resolver owns cadence, lifecycle and self
//! filtering by source id prefix.

pub use crate::transport::StreamPredicate;

use crate::error::Result;
use crate::transport::Transport;
use crate::types::StreamDescriptor;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Snapshot of every stream matching a predicate
pub type Snapshot = Vec<StreamDescriptor>;

/// Discovery window of one continuous pass, capped by the pass interval
pub const DEFAULT_CONTINUOUS_WAIT: Duration = Duration::from_millis(100);

/// One-shot and continuous stream discovery
#[derive(Clone)]
pub struct StreamResolver {
    transport: Arc<dyn Transport>,
    excluded_prefix: Option<String>,
    continuous_wait: Duration,
}

impl StreamResolver {
    /// Create a resolver on top of a transport
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            excluded_prefix: None,
            continuous_wait: DEFAULT_CONTINUOUS_WAIT,
        }
    }

    /// Drop descriptors whose source id starts with `prefix`
    pub fn with_excluded_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.excluded_prefix = Some(prefix.into());
        self
    }

    /// Discovery window of each continuous pass
    pub fn with_continuous_wait(mut self, wait: Duration) -> Self {
        self.continuous_wait = wait;
        self
    }

    /// Single bounded-time search; an empty result is not an error
    pub fn resolve(&self, predicate: &StreamPredicate, wait: Duration, max_streams: usize) -> Result<Snapshot> {
        let found = self.transport.discover(predicate, wait, max_streams)?;
        let found = filter_excluded(found, self.excluded_prefix.as_deref());
        tracing::trace!("Resolved {} stream(s) for {}", found.len(), predicate.to_query());
        Ok(found)
    }

    /// Start re-querying `predicate` every `interval` on a background thread
    pub fn resolve_continuous(&self, predicate: StreamPredicate, interval: Duration) -> ContinuousResolver {
        ContinuousResolver::spawn(
            self.transport.clone(),
            predicate,
            interval,
            self.continuous_wait.min(interval),
            self.excluded_prefix.clone(),
        )
    }
}

fn filter_excluded(found: Snapshot, excluded_prefix: Option<&str>) -> Snapshot {
    match excluded_prefix {
        Some(prefix) => found
            .into_iter()
            .filter(|d| !d.source_id.starts_with(prefix))
            .collect(),
        None => found,
    }
}

/// Handle to a background discovery loop
///
/// Yields the latest snapshot; stale snapshots a slow consumer never picked up
/// are replaced rather than queued. Iteration ends once the loop is cancelled.
pub struct ContinuousResolver {
    transport: Arc<dyn Transport>,
    predicate: StreamPredicate,
    interval: Duration,
    wait: Duration,
    excluded_prefix: Option<String>,
    snapshots: Receiver<Snapshot>,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ContinuousResolver {
    fn spawn(
        transport: Arc<dyn Transport>,
        predicate: StreamPredicate,
        interval: Duration,
        wait: Duration,
        excluded_prefix: Option<String>,
    ) -> Self {
        let (snapshots, stop_tx, handle) = start_loop(
            transport.clone(),
            predicate.clone(),
            interval,
            wait,
            excluded_prefix.clone(),
        );
        Self {
            transport,
            predicate,
            interval,
            wait,
            excluded_prefix,
            snapshots,
            stop_tx: Some(stop_tx),
            handle,
        }
    }

    /// Predicate being resolved
    pub fn predicate(&self) -> &StreamPredicate {
        &self.predicate
    }

    /// Whether the background loop is alive
    pub fn is_running(&self) -> bool {
        self.stop_tx.is_some()
            && self
                .handle
                .as_ref()
                .map(|h| !h.is_finished())
                .unwrap_or(false)
    }

    /// Latest snapshot, if a new one arrived since the last call
    pub fn latest(&self) -> Option<Snapshot> {
        self.snapshots.try_recv().ok()
    }

    /// Wait up to `timeout` for the next snapshot
    pub fn next_timeout(&self, timeout: Duration) -> Option<Snapshot> {
        self.snapshots.recv_timeout(timeout).ok()
    }

    /// Stop the loop and release the discovery handle
    pub fn cancel(&mut self) {
        // Dropping the sender wakes the loop out of its interval wait
        if self.stop_tx.take().is_none() {
            return;
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Resolver thread for {} panicked", self.predicate.to_query());
            }
        }
        tracing::debug!("Cancelled continuous resolve of {}", self.predicate.to_query());
    }

    /// Cancel and begin a fresh snapshot sequence
    pub fn restart(&mut self) {
        self.cancel();
        let (snapshots, stop_tx, handle) = start_loop(
            self.transport.clone(),
            self.predicate.clone(),
            self.interval,
            self.wait,
            self.excluded_prefix.clone(),
        );
        self.snapshots = snapshots;
        self.stop_tx = Some(stop_tx);
        self.handle = handle;
    }
}

impl Iterator for ContinuousResolver {
    type Item = Snapshot;

    fn next(&mut self) -> Option<Snapshot> {
        if self.stop_tx.is_none() {
            return None;
        }
        self.snapshots.recv().ok()
    }
}

impl Drop for ContinuousResolver {
    fn drop(&mut self) {
        self.cancel();
    }
}

type LoopParts = (Receiver<Snapshot>, Sender<()>, Option<JoinHandle<()>>);

fn start_loop(
    transport: Arc<dyn Transport>,
    predicate: StreamPredicate,
    interval: Duration,
    wait: Duration,
    excluded_prefix: Option<String>,
) -> LoopParts {
    let (snapshot_tx, snapshot_rx) = bounded::<Snapshot>(1);
    let (stop_tx, stop_rx) = bounded::<()>(0);
    let latest_rx = snapshot_rx.clone();

    let spawned = std::thread::Builder::new()
        .name("stream-resolver".to_string())
        .spawn(move || {
            tracing::debug!("Continuous resolve of {} started", predicate.to_query());
            loop {
                let started = Instant::now();
                match transport.discover(&predicate, wait, usize::MAX) {
                    Ok(found) => {
                        let mut pending = filter_excluded(found, excluded_prefix.as_deref());
                        loop {
                            match snapshot_tx.try_send(pending) {
                                Ok(()) => break,
                                Err(TrySendError::Full(returned)) => {
                                    // Replace the snapshot nobody consumed yet
                                    let _ = latest_rx.try_recv();
                                    pending = returned;
                                }
                                Err(TrySendError::Disconnected(_)) => return,
                            }
                        }
                    }
                    Err(e) => tracing::warn!("Discovery of {} failed: {}", predicate.to_query(), e),
                }

                match stop_rx.recv_timeout(interval.saturating_sub(started.elapsed())) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            }
            tracing::debug!("Continuous resolve of {} stopped", predicate.to_query());
        });

    let handle = match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::error!("Failed to spawn resolver thread: {}", e);
            None
        }
    };
    (snapshot_rx, stop_tx, handle)
}
