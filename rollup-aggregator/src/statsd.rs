use rollup_statsd::{CounterMetric, DistributionMetric, GaugeMetric, TimerMetric};

/// Counter metrics for the aggregator.
pub enum AggregatorCounters {
    /// Incremented for every packet accepted by the packet queue.
    QueueEnqueues,

    /// Incremented for every packet taken from the packet queue by a worker.
    QueueDequeues,

    /// Incremented for every packet dropped by the packet queue.
    ///
    /// Tagged by `reason`, either `full` or `closed`.
    QueueDiscarded,

    /// Incremented for every sample that could not be aggregated.
    ///
    /// Tagged by `reason`.
    AddMetricErrors,

    /// Incremented every time an entry is created for a new metric id.
    EntriesCreated,

    /// The number of idle entries removed by the expiration sweep.
    EntriesExpired,

    /// The number of aggregation windows consumed by a flush.
    ///
    /// Tagged by `resolution` and flush `mode`. In `discard` mode the windows were dropped
    /// because another instance wrote them.
    WindowsFlushed,

    /// The number of drained tombstoned elements removed from metric lists.
    ///
    /// Tagged by `resolution`.
    ElemsRemoved,

    /// Incremented for every metric list that failed to flush.
    ///
    /// The windows of the list are retried on the next flush.
    FlushErrors,

    /// Incremented every time the flush times store could not be read or written.
    ///
    /// Tagged by `op`, either `get` or `put`.
    StoreErrors,

    /// Incremented every time the flush manager changes its role.
    ///
    /// Tagged by the new `role`.
    RoleChanges,
}

impl CounterMetric for AggregatorCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::QueueEnqueues => "aggregator.queue.enqueues",
            Self::QueueDequeues => "aggregator.queue.dequeues",
            Self::QueueDiscarded => "aggregator.queue.discarded",
            Self::AddMetricErrors => "aggregator.add_metric.errors",
            Self::EntriesCreated => "aggregator.entries.created",
            Self::EntriesExpired => "aggregator.entries.expired",
            Self::WindowsFlushed => "aggregator.windows.flushed",
            Self::ElemsRemoved => "aggregator.elems.removed",
            Self::FlushErrors => "aggregator.flush.errors",
            Self::StoreErrors => "aggregator.flush_times.errors",
            Self::RoleChanges => "aggregator.flush.role_changes",
        }
    }
}

/// Gauge metrics for the aggregator.
pub enum AggregatorGauges {
    /// The number of live entries in the metric map.
    Entries,

    /// The number of metric lists, one per resolution.
    Lists,

    /// The number of elements in a metric list after a flush.
    ///
    /// Tagged by `resolution`.
    ListElems,

    /// The number of packets buffered in the packet queue.
    ///
    /// Reported by the expiration ticker.
    QueueDepth,
}

impl GaugeMetric for AggregatorGauges {
    fn name(&self) -> &'static str {
        match *self {
            Self::Entries => "aggregator.entries",
            Self::Lists => "aggregator.lists",
            Self::ListElems => "aggregator.list.elems",
            Self::QueueDepth => "aggregator.queue.depth",
        }
    }
}

/// Timer metrics for the aggregator.
pub enum AggregatorTimers {
    /// Time spent in one expiration sweep of the metric map.
    TickDuration,

    /// Time spent running a flush task across all due metric lists.
    ///
    /// Tagged by the `role` that prepared the task.
    FlushDuration,
}

impl TimerMetric for AggregatorTimers {
    fn name(&self) -> &'static str {
        match *self {
            Self::TickDuration => "aggregator.tick.duration",
            Self::FlushDuration => "aggregator.flush.duration",
        }
    }
}

/// Distribution metrics for the aggregator.
pub enum AggregatorDistributions {
    /// The number of metric lists flushed by a single flush task.
    FlushedLists,
}

impl DistributionMetric for AggregatorDistributions {
    fn name(&self) -> &'static str {
        match *self {
            Self::FlushedLists => "aggregator.flush.lists",
        }
    }
}
