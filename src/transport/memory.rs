//! In-process transport for tests, demos and single-host sessions
//!
//! [`MemoryTransport`] is a broadcast bus shared by every clone of the
//! transport. Each outlet registers its descriptor under its source id; each
//! inlet subscribes with its own bounded buffer.
//!
//! # Semantics
//!
//! - Inlets only see samples pushed after they subscribed.
//! - A full inlet buffer drops its oldest sample to make room.
//! - Destroying an outlet disconnects its inlets. With `recover = true` an
//!   inlet keeps returning "no sample" and resubscribes once a stream with the
//!   same source id reappears; without it, the pull fails.
//! - Opening a second outlet with an existing source id fails.
//!
//! # Fault Injection
//!
//! Tests can make pulls, pushes or inlet creation fail for a given source id
//! with [`MemoryTransport::fail_pulls`], [`MemoryTransport::fail_pushes`] and
//! [`MemoryTransport::fail_inlet_creation`].

use super::{BufferConfig, RawInlet, RawOutlet, StreamPredicate, Transport};
use crate::error::{CoordError, Result};
use crate::types::{Sample, SampleData, StreamDescriptor};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Poll interval while `discover` waits for more streams
const DISCOVER_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// One inlet's buffer on the bus
struct Subscriber {
    id: u64,
    tx: Sender<Sample>,
    /// Kept so a full buffer can drop its oldest sample
    rx: Receiver<Sample>,
}

/// One live outlet on the bus
struct StreamEntry {
    descriptor: StreamDescriptor,
    generation: u64,
    subscribers: Vec<Subscriber>,
}

#[derive(Default)]
struct Bus {
    streams: HashMap<String, StreamEntry>,
    next_id: u64,
    failing_pulls: HashSet<String>,
    failing_pushes: HashSet<String>,
    failing_inlets: HashSet<String>,
}

impl Bus {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn subscribe(&mut self, source_id: &str, capacity: usize) -> Option<(u64, Receiver<Sample>)> {
        let id = self.next_id();
        let entry = self.streams.get_mut(source_id)?;
        let (tx, rx) = bounded(capacity.max(1));
        entry.subscribers.push(Subscriber {
            id,
            tx,
            rx: rx.clone(),
        });
        Some((id, rx))
    }

    fn unsubscribe(&mut self, source_id: &str, subscriber_id: u64) {
        if let Some(entry) = self.streams.get_mut(source_id) {
            entry.subscribers.retain(|s| s.id != subscriber_id);
        }
    }
}

/// Shared in-process broadcast transport
#[derive(Clone)]
pub struct MemoryTransport {
    bus: Arc<Mutex<Bus>>,
    epoch: Instant,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            bus: Arc::new(Mutex::new(Bus::default())),
            epoch: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Bus> {
        lock_bus(&self.bus)
    }

    /// Number of live outlets
    pub fn stream_count(&self) -> usize {
        self.lock().streams.len()
    }

    /// Number of inlets subscribed to `source_id`
    pub fn consumer_count(&self, source_id: &str) -> usize {
        self.lock()
            .streams
            .get(source_id)
            .map(|e| e.subscribers.len())
            .unwrap_or(0)
    }

    /// Make every pull on inlets bound to `source_id` fail
    pub fn fail_pulls(&self, source_id: impl Into<String>, fail: bool) {
        toggle(&mut self.lock().failing_pulls, source_id.into(), fail);
    }

    /// Make every push on the outlet with `source_id` fail
    pub fn fail_pushes(&self, source_id: impl Into<String>, fail: bool) {
        toggle(&mut self.lock().failing_pushes, source_id.into(), fail);
    }

    /// Make opening inlets bound to `source_id` fail
    pub fn fail_inlet_creation(&self, source_id: impl Into<String>, fail: bool) {
        toggle(&mut self.lock().failing_inlets, source_id.into(), fail);
    }
}

fn toggle(set: &mut HashSet<String>, key: String, on: bool) {
    if on {
        set.insert(key);
    } else {
        set.remove(&key);
    }
}

/// A poisoned bus only means another endpoint panicked mid-operation; the
/// maps are still structurally valid, so keep going.
fn lock_bus(bus: &Mutex<Bus>) -> MutexGuard<'_, Bus> {
    bus.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Transport for MemoryTransport {
    fn discover(
        &self,
        predicate: &StreamPredicate,
        wait: Duration,
        max_results: usize,
    ) -> Result<Vec<StreamDescriptor>> {
        let deadline = Instant::now() + wait;
        loop {
            let mut found: Vec<StreamDescriptor> = self
                .lock()
                .streams
                .values()
                .filter(|entry| predicate.matches(&entry.descriptor))
                .map(|entry| entry.descriptor.clone())
                .collect();
            found.sort_by(|a, b| a.source_id.cmp(&b.source_id));

            if found.len() >= max_results {
                found.truncate(max_results);
                return Ok(found);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(found);
            }
            std::thread::sleep(DISCOVER_POLL_INTERVAL.min(deadline - now));
        }
    }

    fn open_outlet(&self, descriptor: &StreamDescriptor, _buffer: BufferConfig) -> Result<Box<dyn RawOutlet>> {
        let mut bus = self.lock();
        if bus.streams.contains_key(&descriptor.source_id) {
            return Err(CoordError::transport(format!(
                "an outlet with source id '{}' already exists",
                descriptor.source_id
            )));
        }
        let generation = bus.next_id();
        bus.streams.insert(
            descriptor.source_id.clone(),
            StreamEntry {
                descriptor: descriptor.clone(),
                generation,
                subscribers: Vec::new(),
            },
        );
        Ok(Box::new(MemoryOutlet {
            bus: self.bus.clone(),
            source_id: descriptor.source_id.clone(),
            generation,
            epoch: self.epoch,
        }))
    }

    fn open_inlet(&self, descriptor: &StreamDescriptor, buffer: BufferConfig) -> Result<Box<dyn RawInlet>> {
        let mut bus = self.lock();
        if bus.failing_inlets.contains(&descriptor.source_id) {
            return Err(CoordError::transport(format!(
                "cannot open inlet for '{}'",
                descriptor.source_id
            )));
        }
        let (subscriber_id, rx) = bus
            .subscribe(&descriptor.source_id, buffer.max_buffered)
            .ok_or_else(|| {
                CoordError::transport(format!("stream '{}' not found", descriptor.source_id))
            })?;
        Ok(Box::new(MemoryInlet {
            bus: self.bus.clone(),
            source_id: descriptor.source_id.clone(),
            capacity: buffer.max_buffered,
            recover: buffer.recover,
            subscriber_id,
            rx,
        }))
    }

    fn local_clock(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

struct MemoryOutlet {
    bus: Arc<Mutex<Bus>>,
    source_id: String,
    generation: u64,
    epoch: Instant,
}

impl RawOutlet for MemoryOutlet {
    fn push(&mut self, data: &SampleData, timestamp: Option<f64>) -> Result<()> {
        let bus = lock_bus(&self.bus);
        if bus.failing_pushes.contains(&self.source_id) {
            return Err(CoordError::transport(format!("push to '{}' failed", self.source_id)));
        }
        let entry = match bus.streams.get(&self.source_id) {
            Some(entry) if entry.generation == self.generation => entry,
            _ => {
                return Err(CoordError::transport(format!(
                    "outlet '{}' is no longer registered",
                    self.source_id
                )))
            }
        };

        let sample = Sample::new(
            data.clone(),
            timestamp.unwrap_or_else(|| self.epoch.elapsed().as_secs_f64()),
        );
        for subscriber in &entry.subscribers {
            let mut pending = sample.clone();
            loop {
                match subscriber.tx.try_send(pending) {
                    Ok(()) => break,
                    Err(TrySendError::Full(returned)) => {
                        // Drop the oldest buffered sample
                        let _ = subscriber.rx.try_recv();
                        pending = returned;
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
        }
        Ok(())
    }

    fn have_consumers(&self) -> bool {
        lock_bus(&self.bus)
            .streams
            .get(&self.source_id)
            .map(|e| e.generation == self.generation && !e.subscribers.is_empty())
            .unwrap_or(false)
    }

    fn destroy(&mut self) -> Result<()> {
        let mut bus = lock_bus(&self.bus);
        let owned = bus
            .streams
            .get(&self.source_id)
            .map(|e| e.generation == self.generation)
            .unwrap_or(false);
        if owned {
            bus.streams.remove(&self.source_id);
        }
        Ok(())
    }
}

struct MemoryInlet {
    bus: Arc<Mutex<Bus>>,
    source_id: String,
    capacity: usize,
    recover: bool,
    subscriber_id: u64,
    rx: Receiver<Sample>,
}

impl MemoryInlet {
    /// Resubscribe if a stream with our source id is live again
    fn try_recover(&mut self) -> bool {
        let mut bus = lock_bus(&self.bus);
        match bus.subscribe(&self.source_id, self.capacity) {
            Some((id, rx)) => {
                tracing::debug!("Inlet for '{}' recovered", self.source_id);
                self.subscriber_id = id;
                self.rx = rx;
                true
            }
            None => false,
        }
    }

    fn lost(&mut self, timeout: Duration) -> Result<Option<Sample>> {
        if !self.recover {
            return Err(CoordError::transport(format!("stream '{}' was lost", self.source_id)));
        }
        if self.try_recover() {
            return self.receive(timeout);
        }
        std::thread::sleep(timeout);
        Ok(None)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<Sample>> {
        if timeout.is_zero() {
            match self.rx.try_recv() {
                Ok(sample) => Ok(Some(sample)),
                Err(TryRecvError::Empty) => Ok(None),
                Err(TryRecvError::Disconnected) => Ok(None),
            }
        } else {
            match self.rx.recv_timeout(timeout) {
                Ok(sample) => Ok(Some(sample)),
                Err(RecvTimeoutError::Timeout) => Ok(None),
                Err(RecvTimeoutError::Disconnected) => Ok(None),
            }
        }
    }
}

impl RawInlet for MemoryInlet {
    fn pull(&mut self, timeout: Duration) -> Result<Option<Sample>> {
        let live = {
            let bus = lock_bus(&self.bus);
            if bus.failing_pulls.contains(&self.source_id) {
                return Err(CoordError::transport(format!("pull from '{}' failed", self.source_id)));
            }
            bus.streams
                .get(&self.source_id)
                .map(|e| e.subscribers.iter().any(|s| s.id == self.subscriber_id))
                .unwrap_or(false)
        };

        if live {
            return self.receive(timeout);
        }

        // Deliver what was buffered before the stream went away
        if let Ok(sample) = self.rx.try_recv() {
            return Ok(Some(sample));
        }
        self.lost(timeout)
    }

    fn destroy(&mut self) -> Result<()> {
        lock_bus(&self.bus).unsubscribe(&self.source_id, self.subscriber_id);
        Ok(())
    }
}
