use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::elem::ElemPools;
use crate::flush::{FlushManager, FlushManagerOptions};
use crate::pool::TimerValuePool;
use crate::time::Clock;
use crate::writer::{BlackholeHandler, Handler};

/// Parameters used by the [`Aggregator`](crate::Aggregator).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// The time in seconds after which an entry without writes is expired.
    ///
    /// Defaults to `3600` seconds. Expired entries release their elements, which keep flushing
    /// their in-flight windows before they are dropped.
    pub entry_ttl_secs: u64,

    /// The interval in seconds at which idle entries are expired.
    ///
    /// Defaults to `60` seconds.
    pub entry_check_interval_secs: u64,

    /// The lower bound of the flush interval of a metric list, in milliseconds.
    ///
    /// Defaults to `1000`. A list flushes at its resolution, but never more often than this.
    pub min_flush_interval_ms: u64,

    /// How long to wait for late samples after a window ended, in milliseconds.
    ///
    /// Defaults to `0`. A window starting at `t` is flushed once the clock passes
    /// `t + resolution + allowed_lateness`.
    pub allowed_lateness_ms: u64,

    /// Whether to stagger flushes of different resolutions.
    ///
    /// Defaults to `true`. Each flush interval is shifted by a deterministic offset, bounded by
    /// [`max_jitter_ms`](Self::max_jitter_ms) and by the interval itself.
    pub flush_jitter: bool,

    /// The maximum flush offset in milliseconds.
    ///
    /// Defaults to `10000`.
    pub max_jitter_ms: u64,

    /// How often a follower reads the flush times published by the leader, in milliseconds.
    ///
    /// Defaults to `1000`.
    pub follower_check_interval_ms: u64,

    /// The capacity of the packet queue.
    ///
    /// Defaults to `65536`. Packets are dropped while the queue is full.
    pub queue_size: usize,

    /// The number of worker threads draining the packet queue.
    ///
    /// Defaults to `4`.
    pub num_workers: usize,

    /// The maximum number of idle entries kept for reuse.
    ///
    /// Defaults to `4096`. Set to `0` to disable pooling.
    pub entry_pool_capacity: usize,

    /// The maximum number of idle elements kept for reuse, per metric kind.
    ///
    /// Defaults to `4096`. Set to `0` to disable pooling.
    pub elem_pool_capacity: usize,

    /// The maximum number of idle batch timer buffers kept for reuse.
    ///
    /// Defaults to `1024`. Set to `0` to disable pooling.
    pub timer_value_pool_capacity: usize,
}

impl AggregatorConfig {
    /// Returns the entry TTL.
    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_secs)
    }

    /// Returns the entry expiration interval.
    pub fn entry_check_interval(&self) -> Duration {
        Duration::from_secs(self.entry_check_interval_secs)
    }

    /// Returns the minimum flush interval.
    pub fn min_flush_interval(&self) -> Duration {
        Duration::from_millis(self.min_flush_interval_ms)
    }

    /// Returns the allowed lateness of samples.
    pub fn allowed_lateness(&self) -> Duration {
        Duration::from_millis(self.allowed_lateness_ms)
    }

    /// Returns the maximum flush offset, or `None` if jitter is disabled.
    pub fn max_jitter(&self) -> Option<Duration> {
        self.flush_jitter
            .then(|| Duration::from_millis(self.max_jitter_ms))
    }

    /// Returns the follower check interval.
    pub fn follower_check_interval(&self) -> Duration {
        Duration::from_millis(self.follower_check_interval_ms)
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            entry_ttl_secs: 60 * 60,       // 1 hour
            entry_check_interval_secs: 60, // 1 minute
            min_flush_interval_ms: 1000,
            allowed_lateness_ms: 0,
            flush_jitter: true,
            max_jitter_ms: 10_000,
            follower_check_interval_ms: 1000,
            queue_size: 65_536,
            num_workers: 4,
            entry_pool_capacity: 4096,
            elem_pool_capacity: 4096,
            timer_value_pool_capacity: 1024,
        }
    }
}

/// Runtime collaborators shared by entries, lists and the aggregator.
///
/// Created from an [`AggregatorConfig`] and customized with the `with_*` methods.
#[derive(Clone)]
pub struct Options {
    /// The time source.
    pub clock: Clock,
    /// Idle time after which entries expire.
    pub entry_ttl: Duration,
    /// Interval of the expiration sweep.
    pub entry_check_interval: Duration,
    /// Lower bound of list flush intervals.
    pub min_flush_interval: Duration,
    /// Capacity of the packet queue.
    pub queue_size: usize,
    /// Number of queue workers.
    pub num_workers: usize,
    /// Maximum number of idle entries kept for reuse.
    pub entry_pool_capacity: usize,
    /// Pools of aggregation elements.
    pub elem_pools: Arc<ElemPools>,
    /// Pool of batch timer buffers, handed to decoders.
    pub timer_value_pool: Arc<TimerValuePool>,
    /// Creates writers for flushed aggregates.
    pub handler: Arc<dyn Handler>,
    /// Flushes metric lists, if set.
    pub flush_manager: Option<Arc<FlushManager>>,
}

impl Options {
    /// Creates options from the given configuration.
    ///
    /// The options use the system clock, a [`BlackholeHandler`] and no flush manager.
    pub fn from_config(config: &AggregatorConfig) -> Self {
        Self {
            clock: Clock::system(),
            entry_ttl: config.entry_ttl(),
            entry_check_interval: config.entry_check_interval(),
            min_flush_interval: config.min_flush_interval(),
            queue_size: config.queue_size,
            num_workers: config.num_workers,
            entry_pool_capacity: config.entry_pool_capacity,
            elem_pools: Arc::new(ElemPools::new(config.elem_pool_capacity)),
            timer_value_pool: Arc::new(TimerValuePool::with_default(
                config.timer_value_pool_capacity,
            )),
            handler: Arc::new(BlackholeHandler),
            flush_manager: None,
        }
    }

    /// Creates options with a flush manager configured from `config`.
    ///
    /// The flush manager shares the clock of the options.
    pub fn with_config_flush_manager(self, config: &AggregatorConfig) -> Self {
        let flush_opts = FlushManagerOptions::from_config(config, self.clock.clone());
        self.with_flush_manager(Arc::new(FlushManager::new(flush_opts)))
    }

    /// Sets the clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the entry TTL.
    pub fn with_entry_ttl(mut self, entry_ttl: Duration) -> Self {
        self.entry_ttl = entry_ttl;
        self
    }

    /// Sets the minimum flush interval.
    pub fn with_min_flush_interval(mut self, interval: Duration) -> Self {
        self.min_flush_interval = interval;
        self
    }

    /// Sets the handler creating list writers.
    pub fn with_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = handler;
        self
    }

    /// Sets the flush manager lists register with.
    pub fn with_flush_manager(mut self, flush_manager: Arc<FlushManager>) -> Self {
        self.flush_manager = Some(flush_manager);
        self
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::from_config(&AggregatorConfig::default())
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("clock", &self.clock)
            .field("entry_ttl", &self.entry_ttl)
            .field("entry_check_interval", &self.entry_check_interval)
            .field("min_flush_interval", &self.min_flush_interval)
            .field("queue_size", &self.queue_size)
            .field("num_workers", &self.num_workers)
            .field("handler", &self.handler)
            .field("flush_manager", &self.flush_manager.is_some())
            .finish_non_exhaustive()
    }
}
