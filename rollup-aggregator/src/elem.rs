//! Aggregation elements holding the in-flight windows of one metric under one policy.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::aggregation::{AggregatedValue, Aggregation, CounterValue, GaugeValue, TimerValue};
use crate::list::FlushMode;
use crate::metric::{MetricKind, MetricValue};
use crate::policy::{Policy, TimeUnit};
use crate::pool::ObjectPool;
use crate::time::{duration_nanos, truncate_nanos};
use crate::writer::{AggregatedMetric, WriteError, Writer};

/// Shared handle to an element.
///
/// The handle is held by both the owning [`Entry`](crate::Entry) and the
/// [`MetricList`](crate::MetricList) the element was pushed to. It stays valid after the entry
/// drops it, so the list can drain the remaining windows.
pub type ElemRef = Arc<Mutex<MetricElem>>;

/// An error adding a sample to an element.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ElemError {
    /// The element no longer accepts writes.
    #[error("element is tombstoned")]
    Tombstoned,
    /// The sample has no known kind.
    #[error("unknown metric type {0}")]
    UnknownType(u8),
    /// The sample kind does not match the element kind.
    #[error("cannot add {found} sample to {expected} element")]
    MismatchedType {
        /// The kind of the element.
        expected: MetricKind,
        /// The kind of the sample.
        found: MetricKind,
    },
}

/// One in-flight aggregation window.
#[derive(Clone, Debug)]
pub struct Window<A> {
    /// UNIX timestamp in nanoseconds of the start of the window.
    pub start_nanos: i64,
    /// The accumulator of the window.
    pub value: A,
}

/// Element state shared by all metric kinds.
#[derive(Debug)]
pub struct GenericElem<A> {
    id: Bytes,
    policy: Policy,
    values: Vec<Window<A>>,
    tombstoned: bool,
}

impl<A: Aggregation> GenericElem<A> {
    /// Creates an element for the given metric and policy.
    pub fn new(id: Bytes, policy: Policy) -> Self {
        Self {
            id,
            policy,
            values: Vec::new(),
            tombstoned: false,
        }
    }

    /// Reinitializes a pooled element.
    pub fn reset_set_data(&mut self, id: Bytes, policy: Policy) {
        self.id = id;
        self.policy = policy;
        self.values.clear();
        self.tombstoned = false;
    }

    /// Adds a sample value to the window starting at `aligned_start_nanos`.
    pub fn add(&mut self, aligned_start_nanos: i64, input: &A::Input) -> Result<(), ElemError> {
        if self.tombstoned {
            return Err(ElemError::Tombstoned);
        }

        // Windows are sorted by start, and samples mostly hit the most recent one.
        let index = match self.values.last() {
            Some(last) if last.start_nanos == aligned_start_nanos => self.values.len() - 1,
            _ => match self
                .values
                .binary_search_by_key(&aligned_start_nanos, |w| w.start_nanos)
            {
                Ok(index) => index,
                Err(index) => {
                    let window = Window {
                        start_nanos: aligned_start_nanos,
                        value: A::default(),
                    };
                    self.values.insert(index, window);
                    index
                }
            },
        };

        self.values[index].value.add(input);
        Ok(())
    }

    /// Consumes all windows ending at or before `cutoff_nanos`.
    ///
    /// Consumed windows are written in [`FlushMode::Write`] and dropped in [`FlushMode::Discard`].
    /// A window is removed only after it was handled, so a write error leaves it and all later
    /// windows in place. Returns the number of consumed windows.
    pub fn consume(
        &mut self,
        cutoff_nanos: i64,
        mode: FlushMode,
        writer: &mut dyn Writer,
    ) -> Result<usize, WriteError> {
        let resolution = duration_nanos(self.policy.window());

        let mut consumed = 0;
        let mut result = Ok(());

        for window in &self.values {
            let end_nanos = window.start_nanos.saturating_add(resolution);
            if end_nanos > cutoff_nanos {
                break;
            }

            if mode == FlushMode::Write {
                let metric = AggregatedMetric {
                    id: self.id.clone(),
                    policy: self.policy,
                    timestamp_nanos: end_nanos,
                    value: window.value.value(),
                };

                if let Err(error) = writer.write(metric) {
                    result = Err(error);
                    break;
                }
            }

            consumed += 1;
        }

        self.values.drain(..consumed);
        result.map(|()| consumed)
    }

    /// Returns the in-flight windows.
    pub fn windows(&self) -> &[Window<A>] {
        &self.values
    }
}

impl<A: Aggregation> Default for GenericElem<A> {
    fn default() -> Self {
        let policy = Policy::new(Duration::ZERO, TimeUnit::Nanosecond, Duration::ZERO);
        Self::new(Bytes::new(), policy)
    }
}

/// Counter element.
pub type CounterElem = GenericElem<CounterValue>;
/// Timer element.
pub type TimerElem = GenericElem<TimerValue>;
/// Gauge element.
pub type GaugeElem = GenericElem<GaugeValue>;

/// An aggregation element of any kind.
#[derive(Debug)]
pub enum MetricElem {
    /// Aggregates counters.
    Counter(CounterElem),
    /// Aggregates batch timers.
    Timer(TimerElem),
    /// Aggregates gauges.
    Gauge(GaugeElem),
}

macro_rules! with_elem {
    ($elem:expr, $inner:ident => $body:expr) => {
        match $elem {
            MetricElem::Counter($inner) => $body,
            MetricElem::Timer($inner) => $body,
            MetricElem::Gauge($inner) => $body,
        }
    };
}

impl MetricElem {
    /// Returns the kind of metric aggregated by this element.
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricElem::Counter(_) => CounterValue::KIND,
            MetricElem::Timer(_) => TimerValue::KIND,
            MetricElem::Gauge(_) => GaugeValue::KIND,
        }
    }

    /// Returns the metric identifier.
    pub fn id(&self) -> &Bytes {
        with_elem!(self, e => &e.id)
    }

    /// Returns the aggregation policy.
    pub fn policy(&self) -> Policy {
        with_elem!(self, e => e.policy)
    }

    /// Returns `true` once the element stopped accepting writes.
    pub fn is_tombstoned(&self) -> bool {
        with_elem!(self, e => e.tombstoned)
    }

    /// Stops accepting writes. Remaining windows are still flushed.
    pub fn tombstone(&mut self) {
        with_elem!(self, e => e.tombstoned = true)
    }

    /// Returns `true` if the element is tombstoned and has no windows left.
    pub fn is_drained(&self) -> bool {
        with_elem!(self, e => e.tombstoned && e.values.is_empty())
    }

    /// Returns the number of in-flight windows.
    pub fn num_windows(&self) -> usize {
        with_elem!(self, e => e.values.len())
    }

    /// Adds a sample value at `now_nanos` to the window aligned to the policy resolution.
    pub fn add_metric(&mut self, now_nanos: i64, value: &MetricValue) -> Result<(), ElemError> {
        let aligned = truncate_nanos(now_nanos, self.policy().window());

        match (self, value) {
            (MetricElem::Counter(e), MetricValue::Counter(v)) => e.add(aligned, v),
            (MetricElem::Timer(e), MetricValue::BatchTimer(v)) => e.add(aligned, v.as_slice()),
            (MetricElem::Gauge(e), MetricValue::Gauge(v)) => e.add(aligned, v),
            (elem, value) => match value.kind() {
                Ok(found) => Err(ElemError::MismatchedType {
                    expected: elem.kind(),
                    found,
                }),
                Err(ty) => Err(ElemError::UnknownType(ty)),
            },
        }
    }

    /// Consumes all windows ending at or before `cutoff_nanos`, see [`GenericElem::consume`].
    pub fn consume(
        &mut self,
        cutoff_nanos: i64,
        mode: FlushMode,
        writer: &mut dyn Writer,
    ) -> Result<usize, WriteError> {
        with_elem!(self, e => e.consume(cutoff_nanos, mode, writer))
    }

    /// Returns the start and current value of every in-flight window.
    pub fn snapshot(&self) -> Vec<(i64, AggregatedValue)> {
        with_elem!(self, e => e
            .values
            .iter()
            .map(|w| (w.start_nanos, w.value.value()))
            .collect())
    }
}

/// Per-kind pools of aggregation elements.
#[derive(Debug)]
pub struct ElemPools {
    counter: ObjectPool<CounterElem>,
    timer: ObjectPool<TimerElem>,
    gauge: ObjectPool<GaugeElem>,
}

impl ElemPools {
    /// Creates pools retaining up to `capacity` idle elements of each kind.
    pub fn new(capacity: usize) -> Self {
        Self {
            counter: ObjectPool::with_default(capacity),
            timer: ObjectPool::with_default(capacity),
            gauge: ObjectPool::with_default(capacity),
        }
    }

    /// Takes an element of the given kind, initialized for `id` and `policy`.
    pub fn get(&self, kind: MetricKind, id: Bytes, policy: Policy) -> MetricElem {
        match kind {
            MetricKind::Counter => {
                let mut elem = self.counter.get();
                elem.reset_set_data(id, policy);
                MetricElem::Counter(elem)
            }
            MetricKind::Timer => {
                let mut elem = self.timer.get();
                elem.reset_set_data(id, policy);
                MetricElem::Timer(elem)
            }
            MetricKind::Gauge => {
                let mut elem = self.gauge.get();
                elem.reset_set_data(id, policy);
                MetricElem::Gauge(elem)
            }
        }
    }

    /// Resets an element and returns it to the pool of its kind.
    pub fn put(&self, elem: MetricElem) {
        match elem {
            MetricElem::Counter(mut e) => {
                e.reset_set_data(Bytes::new(), e.policy);
                self.counter.put(e);
            }
            MetricElem::Timer(mut e) => {
                e.reset_set_data(Bytes::new(), e.policy);
                self.timer.put(e);
            }
            MetricElem::Gauge(mut e) => {
                e.reset_set_data(Bytes::new(), e.policy);
                self.gauge.put(e);
            }
        }
    }

    /// Returns the number of idle elements of the given kind.
    pub fn idle(&self, kind: MetricKind) -> usize {
        match kind {
            MetricKind::Counter => self.counter.len(),
            MetricKind::Timer => self.timer.len(),
            MetricKind::Gauge => self.gauge.len(),
        }
    }
}

impl Default for ElemPools {
    fn default() -> Self {
        Self::new(0)
    }
}
