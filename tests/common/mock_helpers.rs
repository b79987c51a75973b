//! Mock construction helpers

use crossbeam_channel::{bounded, Receiver, Sender};
use lsl_coord::error::{CoordError, Result};
use lsl_coord::transport::{BufferConfig, RawInlet, RawOutlet, StreamPredicate, Transport};
use lsl_coord::types::{Sample, SampleData, StreamDescriptor};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Create test channels with default size
pub fn create_test_channels<T, U>() -> (Sender<T>, Receiver<T>, Sender<U>, Receiver<U>) {
    let (tx1, rx1) = bounded(16);
    let (tx2, rx2) = bounded(16);
    (tx1, rx1, tx2, rx2)
}

/// Transport whose inlets always have a sample ready
///
/// Inlets bound to a source id listed as failing return an error on every
/// pull instead. Every stream handed to `discover` up front is advertised.
pub struct SyntheticTransport {
    streams: Vec<StreamDescriptor>,
    failing: HashSet<String>,
    epoch: Instant,
}

impl SyntheticTransport {
    pub fn new(streams: Vec<StreamDescriptor>) -> Self {
        Self {
            streams,
            failing: HashSet::new(),
            epoch: Instant::now(),
        }
    }

    pub fn failing(mut self, source_id: &str) -> Self {
        self.failing.insert(source_id.to_string());
        self
    }

    pub fn shared(self) -> Arc<dyn Transport> {
        Arc::new(self)
    }
}

struct ReadyInlet {
    epoch: Instant,
    counter: u64,
}

impl RawInlet for ReadyInlet {
    fn pull(&mut self, _timeout: Duration) -> Result<Option<Sample>> {
        self.counter += 1;
        Ok(Some(Sample::new(
            SampleData::Float32(vec![self.counter as f32]),
            self.epoch.elapsed().as_secs_f64(),
        )))
    }

    fn destroy(&mut self) -> Result<()> {
        Ok(())
    }
}

struct BrokenInlet;

impl RawInlet for BrokenInlet {
    fn pull(&mut self, _timeout: Duration) -> Result<Option<Sample>> {
        Err(CoordError::transport("synthetic pull failure"))
    }

    fn destroy(&mut self) -> Result<()> {
        Ok(())
    }
}

struct NullOutlet;

impl RawOutlet for NullOutlet {
    fn push(&mut self, _data: &SampleData, _timestamp: Option<f64>) -> Result<()> {
        Ok(())
    }

    fn have_consumers(&self) -> bool {
        false
    }

    fn destroy(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Transport for SyntheticTransport {
    fn discover(
        &self,
        predicate: &StreamPredicate,
        _wait: Duration,
        max_results: usize,
    ) -> Result<Vec<StreamDescriptor>> {
        Ok(self
            .streams
            .iter()
            .filter(|d| predicate.matches(d))
            .take(max_results)
            .cloned()
            .collect())
    }

    fn open_outlet(&self, _descriptor: &StreamDescriptor, _buffer: BufferConfig) -> Result<Box<dyn RawOutlet>> {
        Ok(Box::new(NullOutlet))
    }

    fn open_inlet(&self, descriptor: &StreamDescriptor, _buffer: BufferConfig) -> Result<Box<dyn RawInlet>> {
        if self.failing.contains(&descriptor.source_id) {
            Ok(Box::new(BrokenInlet))
        } else {
            Ok(Box::new(ReadyInlet {
                epoch: self.epoch,
                counter: 0,
            }))
        }
    }

    fn local_clock(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}
