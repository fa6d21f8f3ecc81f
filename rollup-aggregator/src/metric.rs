//! Unaggregated metric samples as produced by the decoder.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::policy::VersionedPolicies;
use crate::pool::TimerValuePool;

/// The kind of an aggregated metric.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MetricKind {
    /// Sums up increments.
    Counter,
    /// Summarizes a distribution of timings.
    Timer,
    /// Tracks the last reported value.
    Gauge,
}

impl MetricKind {
    /// Returns the name of the kind, used as tag value.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Timer => "timer",
            MetricKind::Gauge => "gauge",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The value carried by a [`MetricUnion`].
#[derive(Clone, Debug, PartialEq)]
pub enum MetricValue {
    /// A counter increment.
    Counter(i64),
    /// A batch of timer values.
    BatchTimer(Vec<f64>),
    /// A gauge reading.
    Gauge(f64),
    /// A value of a kind this aggregator does not know, identified by its raw type byte.
    Unknown(u8),
}

impl MetricValue {
    /// Returns the metric kind, or the raw type of an unknown value.
    pub fn kind(&self) -> Result<MetricKind, u8> {
        match self {
            MetricValue::Counter(_) => Ok(MetricKind::Counter),
            MetricValue::BatchTimer(_) => Ok(MetricKind::Timer),
            MetricValue::Gauge(_) => Ok(MetricKind::Gauge),
            MetricValue::Unknown(ty) => Err(*ty),
        }
    }
}

/// A single unaggregated metric sample.
///
/// `owns_id` tells whether `id` is exclusively owned by this sample. When it is not, the id still
/// references a buffer of the decoder, and elements keep their own copy of it.
#[derive(Clone)]
pub struct MetricUnion {
    /// The metric identifier.
    pub id: Bytes,
    /// Whether the identifier buffer belongs to this sample.
    pub owns_id: bool,
    /// The sample value.
    pub value: MetricValue,
    /// Pool receiving the [`MetricValue::BatchTimer`] buffer once it was aggregated.
    pub timer_val_pool: Option<Arc<TimerValuePool>>,
}

impl MetricUnion {
    /// Creates a sample with a borrowed identifier.
    pub fn new(id: impl Into<Bytes>, value: MetricValue) -> Self {
        Self {
            id: id.into(),
            owns_id: false,
            value,
            timer_val_pool: None,
        }
    }

    /// Creates a counter sample.
    pub fn counter(id: impl Into<Bytes>, value: i64) -> Self {
        Self::new(id, MetricValue::Counter(value))
    }

    /// Creates a batch timer sample.
    pub fn batch_timer(id: impl Into<Bytes>, values: Vec<f64>) -> Self {
        Self::new(id, MetricValue::BatchTimer(values))
    }

    /// Creates a gauge sample.
    pub fn gauge(id: impl Into<Bytes>, value: f64) -> Self {
        Self::new(id, MetricValue::Gauge(value))
    }

    /// Marks the identifier as owned by this sample.
    pub fn with_owned_id(mut self) -> Self {
        self.owns_id = true;
        self
    }

    /// Attaches the pool that receives the batch timer buffer after aggregation.
    pub fn with_timer_pool(mut self, pool: Arc<TimerValuePool>) -> Self {
        self.timer_val_pool = Some(pool);
        self
    }

    /// Returns the metric kind, or the raw type of an unknown value.
    pub fn kind(&self) -> Result<MetricKind, u8> {
        self.value.kind()
    }

    /// Returns the batch timer buffer to its pool, if any.
    pub(crate) fn release_timer_values(self) {
        if let (MetricValue::BatchTimer(values), Some(pool)) = (self.value, self.timer_val_pool) {
            pool.put(values);
        }
    }
}

impl fmt::Debug for MetricUnion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricUnion")
            .field("id", &self.id)
            .field("owns_id", &self.owns_id)
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

/// A sample and its policies travelling through the [`PacketQueue`](crate::PacketQueue).
#[derive(Debug)]
pub struct Packet {
    /// The sample.
    pub metric: MetricUnion,
    /// The policies to aggregate the sample with.
    pub policies: VersionedPolicies,
}

impl Packet {
    /// Creates a new packet.
    pub fn new(metric: MetricUnion, policies: VersionedPolicies) -> Self {
        Self { metric, policies }
    }
}
