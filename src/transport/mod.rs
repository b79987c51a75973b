//! Transport abstraction over a discovery-based pub/sub streaming library
//!
//! The underlying streaming library is an external collaborator. This module
//! defines the seam it plugs into and the endpoint wrappers the rest of the
//! crate uses.
//!
//! # Components
//!
//! - [`Transport`] - discover streams, open raw outlets/inlets, read the clock
//! - [`RawOutlet`] / [`RawInlet`] - native endpoint handles
//! - [`Outlet`] / [`Inlet`] - guarded wrappers with idempotent `destroy()`
//! - [`MemoryTransport`] - in-process implementation for tests and demos
//! - [`naming`] - stream name and source id conventions
//!
//! # Example
//!
//! ```ignore
//! use lsl_coord::transport::{open_inlet, open_outlet, MemoryTransport};
//!
//! let transport = MemoryTransport::new();
//! let mut outlet = open_outlet(&transport, &descriptor, 1, 360)?;
//! let mut inlet = open_inlet(&transport, &descriptor, 360, 0, true)?;
//! outlet.push(SampleData::Float32(vec![1.0]), None)?;
//! let sample = inlet.pull(Duration::from_millis(10))?;
//! ```

pub mod channel;
pub mod memory;
pub mod naming;

pub use channel::{open_inlet, open_outlet, EndpointStats, Inlet, Outlet};
pub use memory::MemoryTransport;

use crate::error::Result;
use crate::types::{Sample, SampleData, StreamDescriptor};
use std::time::Duration;

/// Buffering options passed to the transport when opening an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    /// Samples per chunk on the outlet side (0 = transport default)
    pub chunk_size: usize,
    /// Maximum buffered samples before the oldest are dropped
    pub max_buffered: usize,
    /// Maximum chunk length delivered to an inlet (0 = sender's chunking)
    pub max_chunk_len: usize,
    /// Whether an inlet silently waits for a lost stream to come back
    pub recover: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 0,
            max_buffered: 360,
            max_chunk_len: 0,
            recover: true,
        }
    }
}

/// Predicate used to discover streams
///
/// Matching is delegated to the transport via [`StreamPredicate::matches`];
/// [`StreamPredicate::to_query`] renders the equivalent query string for
/// transports that take textual predicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamPredicate {
    /// Exact stream name
    pub name: Option<String>,
    /// Exact stream content type
    pub stream_type: Option<String>,
    /// Required source id prefix
    pub source_id_prefix: Option<String>,
}

impl StreamPredicate {
    /// Match every stream
    pub fn any() -> Self {
        Self::default()
    }

    /// Match streams with this exact name
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Additionally require a content type
    pub fn with_type(mut self, stream_type: impl Into<String>) -> Self {
        self.stream_type = Some(stream_type.into());
        self
    }

    /// Additionally require a source id prefix
    pub fn with_source_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.source_id_prefix = Some(prefix.into());
        self
    }

    /// Whether a descriptor satisfies this predicate
    pub fn matches(&self, descriptor: &StreamDescriptor) -> bool {
        self.name.as_ref().map_or(true, |n| *n == descriptor.name)
            && self
                .stream_type
                .as_ref()
                .map_or(true, |t| *t == descriptor.stream_type)
            && self
                .source_id_prefix
                .as_ref()
                .map_or(true, |p| descriptor.source_id.starts_with(p.as_str()))
    }

    /// Render as an XPath-style query (`name='x' and starts-with(source_id,'y')`)
    pub fn to_query(&self) -> String {
        let mut clauses = Vec::new();
        if let Some(name) = &self.name {
            clauses.push(format!("name='{}'", name));
        }
        if let Some(stream_type) = &self.stream_type {
            clauses.push(format!("type='{}'", stream_type));
        }
        if let Some(prefix) = &self.source_id_prefix {
            clauses.push(format!("starts-with(source_id,'{}')", prefix));
        }
        clauses.join(" and ")
    }
}

/// Native send endpoint
#[cfg_attr(test, mockall::automock)]
pub trait RawOutlet: Send {
    /// Push one sample; `timestamp` defaults to the transport clock
    fn push(&mut self, data: &SampleData, timestamp: Option<f64>) -> Result<()>;

    /// Whether at least one inlet is connected
    fn have_consumers(&self) -> bool;

    /// Release the native handle
    fn destroy(&mut self) -> Result<()>;
}

/// Native receive endpoint
#[cfg_attr(test, mockall::automock)]
pub trait RawInlet: Send {
    /// Pull one sample, blocking at most `timeout`; `Ok(None)` on timeout
    fn pull(&mut self, timeout: Duration) -> Result<Option<Sample>>;

    /// Release the native handle
    fn destroy(&mut self) -> Result<()>;
}

/// The external streaming library
///
/// Implementations must be shareable across worker threads.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    /// Find streams matching `predicate`, waiting at most `wait`
    ///
    /// Returns early once `max_results` streams were found. An empty result
    /// is not an error.
    fn discover(
        &self,
        predicate: &StreamPredicate,
        wait: Duration,
        max_results: usize,
    ) -> Result<Vec<StreamDescriptor>>;

    /// Create a send endpoint advertising `descriptor`
    fn open_outlet(&self, descriptor: &StreamDescriptor, buffer: BufferConfig) -> Result<Box<dyn RawOutlet>>;

    /// Create a receive endpoint bound to the stream `descriptor` describes
    fn open_inlet(&self, descriptor: &StreamDescriptor, buffer: BufferConfig) -> Result<Box<dyn RawInlet>>;

    /// Monotonic clock in seconds, shared by all endpoints of this transport
    fn local_clock(&self) -> f64;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, source_id: &str) -> StreamDescriptor {
        StreamDescriptor::new("s", name, source_id).with_type("Coordination")
    }

    #[test]
    fn test_predicate_matching() {
        let pred = StreamPredicate::by_name("lab_coordination").with_source_prefix("coord:");
        assert!(pred.matches(&descriptor("lab_coordination", "coord:n1:lab")));
        assert!(!pred.matches(&descriptor("lab_coordination", "data:n1:eeg")));
        assert!(!pred.matches(&descriptor("other_coordination", "coord:n1:other")));

        assert!(StreamPredicate::any().matches(&descriptor("x", "y")));
        assert!(!StreamPredicate::any()
            .with_type("EEG")
            .matches(&descriptor("x", "y")));
    }

    #[test]
    fn test_predicate_query_rendering() {
        let pred = StreamPredicate::by_name("lab_coordination").with_source_prefix("coord:");
        assert_eq!(
            pred.to_query(),
            "name='lab_coordination' and starts-with(source_id,'coord:')"
        );
        assert_eq!(StreamPredicate::any().to_query(), "");
    }
}
