//! Guarded send/receive endpoints bound to a stream descriptor
//!
//! [`Outlet`] and [`Inlet`] wrap the native handles returned by a
//! [`Transport`](super::Transport). Both carry a `created` guard so that
//! `destroy()` after `destroy()` is a no-op, and both destroy themselves on
//! drop so endpoints never outlive the descriptor owner that opened them.

use super::{BufferConfig, RawInlet, RawOutlet, Transport};
use crate::error::{CoordError, Result};
use crate::types::{Sample, SampleData, StreamDescriptor};
use std::time::{Duration, Instant};

/// Poll interval of `Outlet::wait_for_consumers`
const CONSUMER_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Counters for one endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointStats {
    /// Samples pushed successfully
    pub pushed: u64,
    /// Samples pulled successfully
    pub pulled: u64,
    /// Pulls that returned no sample within the timeout
    pub timeouts: u64,
    /// Failed push/pull operations
    pub failures: u64,
}

/// Open a send endpoint for `descriptor`
pub fn open_outlet(
    transport: &dyn Transport,
    descriptor: &StreamDescriptor,
    chunk_size: usize,
    max_buffer_samples: usize,
) -> Result<Outlet> {
    let buffer = BufferConfig {
        chunk_size,
        max_buffered: max_buffer_samples,
        ..BufferConfig::default()
    };
    let raw = transport.open_outlet(descriptor, buffer)?;
    tracing::debug!("Opened outlet {}", descriptor.endpoint_id());
    Ok(Outlet::from_raw(descriptor.clone(), raw))
}

/// Open a receive endpoint for `descriptor`
pub fn open_inlet(
    transport: &dyn Transport,
    descriptor: &StreamDescriptor,
    max_buffer_samples: usize,
    max_chunk_length: usize,
    recover: bool,
) -> Result<Inlet> {
    let buffer = BufferConfig {
        chunk_size: 0,
        max_buffered: max_buffer_samples,
        max_chunk_len: max_chunk_length,
        recover,
    };
    let raw = transport.open_inlet(descriptor, buffer)?;
    tracing::debug!("Opened inlet {}", descriptor.endpoint_id());
    Ok(Inlet::from_raw(descriptor.clone(), raw))
}

/// Send endpoint
pub struct Outlet {
    descriptor: StreamDescriptor,
    raw: Box<dyn RawOutlet>,
    created: bool,
    stats: EndpointStats,
}

impl Outlet {
    /// Wrap a native outlet handle
    pub fn from_raw(descriptor: StreamDescriptor, raw: Box<dyn RawOutlet>) -> Self {
        Self {
            descriptor,
            raw,
            created: true,
            stats: EndpointStats::default(),
        }
    }

    /// Descriptor this outlet advertises
    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    /// Whether the native handle is still alive
    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Endpoint counters
    pub fn stats(&self) -> &EndpointStats {
        &self.stats
    }

    /// Push one sample; returns once the transport has buffered it
    pub fn push(&mut self, data: SampleData, timestamp: Option<f64>) -> Result<()> {
        if !self.created {
            return Err(CoordError::transport(format!(
                "push on destroyed outlet {}",
                self.descriptor.endpoint_id()
            )));
        }
        if data.channel_count() != self.descriptor.channel_count as usize {
            self.stats.failures += 1;
            return Err(CoordError::transport(format!(
                "outlet {} expects {} channels, got {}",
                self.descriptor.endpoint_id(),
                self.descriptor.channel_count,
                data.channel_count()
            )));
        }
        match self.raw.push(&data, timestamp) {
            Ok(()) => {
                self.stats.pushed += 1;
                Ok(())
            }
            Err(e) => {
                self.stats.failures += 1;
                Err(e)
            }
        }
    }

    /// Whether any inlet is currently connected
    pub fn have_consumers(&self) -> bool {
        self.created && self.raw.have_consumers()
    }

    /// Wait until at least one consumer connects or `timeout` elapses
    pub fn wait_for_consumers(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.have_consumers() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline || !self.created {
                return false;
            }
            std::thread::sleep(CONSUMER_POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Release the native handle; calling again is a no-op
    pub fn destroy(&mut self) -> Result<()> {
        if !self.created {
            return Ok(());
        }
        self.created = false;
        tracing::debug!("Destroying outlet {}", self.descriptor.endpoint_id());
        self.raw.destroy()
    }
}

impl Drop for Outlet {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            tracing::warn!("Failed to destroy outlet {}: {}", self.descriptor.endpoint_id(), e);
        }
    }
}

impl std::fmt::Debug for Outlet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outlet")
            .field("endpoint", &self.descriptor.endpoint_id())
            .field("created", &self.created)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Receive endpoint
pub struct Inlet {
    descriptor: StreamDescriptor,
    raw: Box<dyn RawInlet>,
    created: bool,
    stats: EndpointStats,
}

impl Inlet {
    /// Wrap a native inlet handle
    pub fn from_raw(descriptor: StreamDescriptor, raw: Box<dyn RawInlet>) -> Self {
        Self {
            descriptor,
            raw,
            created: true,
            stats: EndpointStats::default(),
        }
    }

    /// Descriptor of the stream this inlet is bound to
    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    /// Identifier used by polling workers
    pub fn endpoint_id(&self) -> String {
        self.descriptor.endpoint_id()
    }

    /// Whether the native handle is still alive
    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Endpoint counters
    pub fn stats(&self) -> &EndpointStats {
        &self.stats
    }

    /// Pull one sample, blocking at most `timeout`
    ///
    /// Returns `Ok(None)` when nothing arrived in time; that is not an error.
    pub fn pull(&mut self, timeout: Duration) -> Result<Option<Sample>> {
        if !self.created {
            return Err(CoordError::transport(format!(
                "pull on destroyed inlet {}",
                self.descriptor.endpoint_id()
            )));
        }
        match self.raw.pull(timeout) {
            Ok(Some(sample)) => {
                self.stats.pulled += 1;
                Ok(Some(sample))
            }
            Ok(None) => {
                self.stats.timeouts += 1;
                Ok(None)
            }
            Err(e) => {
                self.stats.failures += 1;
                Err(e)
            }
        }
    }

    /// Discard everything currently buffered, returning how many samples were dropped
    pub fn flush(&mut self) -> Result<usize> {
        let mut flushed = 0;
        while self.created {
            match self.raw.pull(Duration::ZERO)? {
                Some(_) => flushed += 1,
                None => break,
            }
        }
        Ok(flushed)
    }

    /// Release the native handle; calling again is a no-op
    pub fn destroy(&mut self) -> Result<()> {
        if !self.created {
            return Ok(());
        }
        self.created = false;
        tracing::debug!("Destroying inlet {}", self.descriptor.endpoint_id());
        self.raw.destroy()
    }
}

impl Drop for Inlet {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            tracing::warn!("Failed to destroy inlet {}: {}", self.descriptor.endpoint_id(), e);
        }
    }
}

impl std::fmt::Debug for Inlet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inlet")
            .field("endpoint", &self.descriptor.endpoint_id())
            .field("created", &self.created)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockRawInlet, MockRawOutlet};
    use crate::types::ChannelFormat;

    fn descriptor() -> StreamDescriptor {
        StreamDescriptor::new("eeg", "EEG", "data:n1:eeg").with_channels(2, ChannelFormat::Float32)
    }

    #[test]
    fn test_outlet_destroy_is_idempotent() {
        let mut raw = MockRawOutlet::new();
        raw.expect_destroy().times(1).returning(|| Ok(()));

        let mut outlet = Outlet::from_raw(descriptor(), Box::new(raw));
        assert!(outlet.destroy().is_ok());
        assert!(outlet.destroy().is_ok());
        assert!(outlet.destroy().is_ok());
        assert!(!outlet.is_created());
        // Drop must not call the native destroy a second time either
    }

    #[test]
    fn test_inlet_destroy_is_idempotent() {
        let mut raw = MockRawInlet::new();
        raw.expect_destroy().times(1).returning(|| Ok(()));

        let mut inlet = Inlet::from_raw(descriptor(), Box::new(raw));
        for _ in 0..5 {
            assert!(inlet.destroy().is_ok());
        }
    }

    #[test]
    fn test_drop_destroys_once() {
        let mut raw = MockRawInlet::new();
        raw.expect_destroy().times(1).returning(|| Ok(()));
        let inlet = Inlet::from_raw(descriptor(), Box::new(raw));
        drop(inlet);
    }

    #[test]
    fn test_push_checks_channel_count() {
        let mut raw = MockRawOutlet::new();
        raw.expect_push().times(1).returning(|_, _| Ok(()));
        raw.expect_destroy().returning(|| Ok(()));

        let mut outlet = Outlet::from_raw(descriptor(), Box::new(raw));
        assert!(outlet.push(SampleData::Float32(vec![1.0]), None).is_err());
        assert!(outlet.push(SampleData::Float32(vec![1.0, 2.0]), None).is_ok());
        assert_eq!(outlet.stats().pushed, 1);
        assert_eq!(outlet.stats().failures, 1);
    }

    #[test]
    fn test_push_after_destroy_fails() {
        let mut raw = MockRawOutlet::new();
        raw.expect_destroy().times(1).returning(|| Ok(()));
        raw.expect_push().never();

        let mut outlet = Outlet::from_raw(descriptor(), Box::new(raw));
        outlet.destroy().unwrap();
        let err = outlet
            .push(SampleData::Float32(vec![1.0, 2.0]), None)
            .unwrap_err();
        assert!(matches!(err, CoordError::Transport(_)));
    }

    #[test]
    fn test_pull_timeout_is_not_an_error() {
        let mut raw = MockRawInlet::new();
        raw.expect_pull().returning(|_| Ok(None));
        raw.expect_destroy().returning(|| Ok(()));

        let mut inlet = Inlet::from_raw(descriptor(), Box::new(raw));
        assert!(inlet.pull(Duration::from_millis(1)).unwrap().is_none());
        assert_eq!(inlet.stats().timeouts, 1);
    }

    #[test]
    fn test_pull_failure_is_counted() {
        let mut raw = MockRawInlet::new();
        raw.expect_pull()
            .returning(|_| Err(CoordError::transport("native pull failed")));
        raw.expect_destroy().returning(|| Ok(()));

        let mut inlet = Inlet::from_raw(descriptor(), Box::new(raw));
        assert!(inlet.pull(Duration::ZERO).is_err());
        assert_eq!(inlet.stats().failures, 1);
    }

    #[test]
    fn test_wait_for_consumers_times_out() {
        let mut raw = MockRawOutlet::new();
        raw.expect_have_consumers().returning(|| false);
        raw.expect_destroy().returning(|| Ok(()));

        let outlet = Outlet::from_raw(descriptor(), Box::new(raw));
        let start = Instant::now();
        assert!(!outlet.wait_for_consumers(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
