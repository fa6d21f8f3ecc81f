//! Per-window accumulators of the three metric kinds.

use crate::metric::MetricKind;

/// An accumulator for a single aggregation window.
///
/// Each metric kind has one implementation. The [`GenericElem`](crate::elem::GenericElem) keeps one
/// accumulator per in-flight window and converts it into an [`AggregatedValue`] on flush.
pub trait Aggregation: Default + Clone + std::fmt::Debug + Send + 'static {
    /// The kind of metric this accumulator aggregates.
    const KIND: MetricKind;

    /// The sample value consumed by [`add`](Self::add).
    type Input: ?Sized;

    /// Folds a sample value into the accumulator.
    fn add(&mut self, input: &Self::Input);

    /// Returns the aggregated value of the window.
    fn value(&self) -> AggregatedValue;
}

/// Sum of counter increments.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CounterValue {
    /// The sum of all increments.
    pub sum: i64,
    /// The number of increments.
    pub count: u64,
}

impl Aggregation for CounterValue {
    const KIND: MetricKind = MetricKind::Counter;
    type Input = i64;

    fn add(&mut self, input: &i64) {
        self.sum = self.sum.saturating_add(*input);
        self.count += 1;
    }

    fn value(&self) -> AggregatedValue {
        AggregatedValue::Counter(*self)
    }
}

/// Summary statistics over timer values.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimerValue {
    /// The number of values.
    pub count: u64,
    /// The sum of all values.
    pub sum: f64,
    /// The sum of the squares of all values.
    pub sum_sq: f64,
    /// The smallest value.
    pub min: f64,
    /// The largest value.
    pub max: f64,
}

impl TimerValue {
    /// Returns the arithmetic mean, or `None` if no values were added.
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

impl Default for TimerValue {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            sum_sq: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl Aggregation for TimerValue {
    const KIND: MetricKind = MetricKind::Timer;
    type Input = [f64];

    fn add(&mut self, input: &[f64]) {
        for &value in input {
            self.count += 1;
            self.sum += value;
            self.sum_sq += value * value;
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
    }

    fn value(&self) -> AggregatedValue {
        AggregatedValue::Timer(*self)
    }
}

/// A snapshot of gauge readings.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GaugeValue {
    /// The last value reported in the window.
    ///
    /// This aggregation is not commutative.
    pub last: f64,
    /// The minimum value reported in the window.
    pub min: f64,
    /// The maximum value reported in the window.
    pub max: f64,
    /// The sum of all values reported in the window.
    pub sum: f64,
    /// The number of times this window was updated with a new value.
    pub count: u64,
}

impl GaugeValue {
    /// Creates a gauge snapshot from a single value.
    pub fn single(value: f64) -> Self {
        Self {
            last: value,
            min: value,
            max: value,
            sum: value,
            count: 1,
        }
    }
}

impl Aggregation for GaugeValue {
    const KIND: MetricKind = MetricKind::Gauge;
    type Input = f64;

    fn add(&mut self, input: &f64) {
        let value = *input;
        if self.count == 0 {
            *self = Self::single(value);
            return;
        }

        self.last = value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.count += 1;
    }

    fn value(&self) -> AggregatedValue {
        AggregatedValue::Gauge(*self)
    }
}

/// The result of aggregating one window, handed to the [`Writer`](crate::Writer).
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AggregatedValue {
    /// See [`CounterValue`].
    Counter(CounterValue),
    /// See [`TimerValue`].
    Timer(TimerValue),
    /// See [`GaugeValue`].
    Gauge(GaugeValue),
}

impl AggregatedValue {
    /// Returns the metric kind of the value.
    pub fn kind(&self) -> MetricKind {
        match self {
            AggregatedValue::Counter(_) => MetricKind::Counter,
            AggregatedValue::Timer(_) => MetricKind::Timer,
            AggregatedValue::Gauge(_) => MetricKind::Gauge,
        }
    }
}
