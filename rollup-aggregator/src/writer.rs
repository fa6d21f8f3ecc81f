//! Downstream interface receiving flushed aggregates.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::aggregation::AggregatedValue;
use crate::policy::Policy;

/// The aggregate of one window of one metric under one policy.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregatedMetric {
    /// The metric identifier.
    pub id: Bytes,
    /// The policy the value was aggregated with.
    pub policy: Policy,
    /// UNIX timestamp in nanoseconds of the end of the window.
    pub timestamp_nanos: i64,
    /// The aggregated value.
    pub value: AggregatedValue,
}

/// An error reported by a [`Writer`].
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// The writer was closed and accepts no more metrics.
    #[error("writer is closed")]
    Closed,
    /// The downstream rejected the metric.
    #[error("metric rejected: {0}")]
    Rejected(String),
    /// An I/O error from the underlying transport.
    #[error("failed to write metric")]
    Io(#[from] std::io::Error),
}

/// Receives flushed aggregates for a single metric list.
///
/// Writers are driven by one flush at a time. Errors are reported back to the flush, which keeps
/// the affected windows for the next cycle.
pub trait Writer: Send {
    /// Writes one aggregated metric.
    fn write(&mut self, metric: AggregatedMetric) -> Result<(), WriteError>;

    /// Flushes buffered metrics downstream.
    fn flush(&mut self) -> Result<(), WriteError>;

    /// Flushes and releases the writer.
    fn close(&mut self) -> Result<(), WriteError> {
        self.flush()
    }
}

/// Creates writers, one per metric list.
pub trait Handler: Send + Sync + fmt::Debug {
    /// Returns a new writer.
    fn new_writer(&self) -> Box<dyn Writer>;
}

/// A handler whose writers drop everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlackholeHandler;

impl Handler for BlackholeHandler {
    fn new_writer(&self) -> Box<dyn Writer> {
        Box::new(BlackholeHandler)
    }
}

impl Writer for BlackholeHandler {
    fn write(&mut self, _metric: AggregatedMetric) -> Result<(), WriteError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), WriteError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Captured {
    metrics: Mutex<Vec<AggregatedMetric>>,
    flushes: AtomicUsize,
    failing: AtomicBool,
}

/// A handler collecting all written metrics in memory.
///
/// All writers created by the same handler share one buffer. Writes can be made to fail with
/// [`set_failing`](Self::set_failing).
#[derive(Clone, Debug, Default)]
pub struct CapturingHandler {
    captured: Arc<Captured>,
}

impl CapturingHandler {
    /// Creates a new capturing handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything written so far.
    pub fn take(&self) -> Vec<AggregatedMetric> {
        std::mem::take(&mut *self.captured.metrics.lock())
    }

    /// Returns the number of metrics written so far.
    pub fn len(&self) -> usize {
        self.captured.metrics.lock().len()
    }

    /// Returns `true` if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns how often a writer of this handler was flushed.
    pub fn flushes(&self) -> usize {
        self.captured.flushes.load(Ordering::Relaxed)
    }

    /// Makes all subsequent writes fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.captured.failing.store(failing, Ordering::Relaxed);
    }
}

impl Handler for CapturingHandler {
    fn new_writer(&self) -> Box<dyn Writer> {
        Box::new(CapturingWriter {
            captured: Arc::clone(&self.captured),
        })
    }
}

struct CapturingWriter {
    captured: Arc<Captured>,
}

impl Writer for CapturingWriter {
    fn write(&mut self, metric: AggregatedMetric) -> Result<(), WriteError> {
        if self.captured.failing.load(Ordering::Relaxed) {
            return Err(WriteError::Rejected("capturing writer is failing".to_owned()));
        }

        self.captured.metrics.lock().push(metric);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), WriteError> {
        self.captured.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
