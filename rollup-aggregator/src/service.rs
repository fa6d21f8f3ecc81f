use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use rollup_statsd::metric;

use crate::config::Options;
use crate::flush::{FlushManager, FlushManagerError};
use crate::list::MetricLists;
use crate::map::{MapError, MetricMap};
use crate::metric::{MetricUnion, Packet};
use crate::policy::VersionedPolicies;
use crate::queue::PacketQueue;
use crate::statsd::AggregatorGauges;

/// Expiration sweeps never run more often than this.
const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// An error of the [`Aggregator`].
#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    /// The aggregator was opened before.
    #[error("aggregator is already open")]
    AlreadyOpen,
    /// The aggregator was closed.
    #[error("aggregator is closed")]
    Closed,
    /// A worker thread could not be started.
    #[error("failed to spawn aggregator thread")]
    Spawn(#[source] io::Error),
    /// The flush manager could not be started.
    #[error("failed to open flush manager")]
    FlushManager(#[from] FlushManagerError),
    /// A sample could not be aggregated.
    #[error(transparent)]
    AddMetric(#[from] MapError),
}

struct Running {
    workers: Vec<JoinHandle<()>>,
    ticker: JoinHandle<()>,
    stop_ticker: Sender<()>,
}

enum State {
    NotOpen,
    Open(Running),
    Closed,
}

/// Aggregates metric samples into per-policy windows and flushes them downstream.
///
/// Decoders push [`Packet`]s into the [`queue`](Self::queue), from which worker threads add them
/// to the entries of the [`MetricMap`]. A ticker thread expires idle entries, and the
/// [`FlushManager`], if configured, flushes completed windows to the handler's writers.
///
/// Dropping the aggregator closes it.
pub struct Aggregator {
    opts: Options,
    queue: Arc<PacketQueue>,
    lists: Arc<MetricLists>,
    map: Arc<MetricMap>,
    state: Mutex<State>,
}

impl Aggregator {
    /// Creates a new aggregator. Call [`open`](Self::open) to start processing the queue.
    pub fn new(opts: Options) -> Self {
        let lists = Arc::new(MetricLists::new(opts.clone()));
        let map = Arc::new(MetricMap::new(Arc::clone(&lists), opts.clone()));

        Self {
            queue: Arc::new(PacketQueue::new(opts.queue_size)),
            lists,
            map,
            opts,
            state: Mutex::new(State::NotOpen),
        }
    }

    /// Starts the worker threads, the expiration ticker and the flush manager.
    ///
    /// With a flush manager configured, this must be called within a tokio runtime.
    pub fn open(&self) -> Result<(), AggregatorError> {
        let mut state = self.state.lock();
        match *state {
            State::NotOpen => (),
            State::Open(_) => return Err(AggregatorError::AlreadyOpen),
            State::Closed => return Err(AggregatorError::Closed),
        }

        if let Some(flush_manager) = &self.opts.flush_manager {
            flush_manager.open()?;
        }

        let num_workers = self.opts.num_workers.max(1);
        let mut workers = Vec::with_capacity(num_workers);
        for index in 0..num_workers {
            match self.spawn_worker(index) {
                Ok(worker) => workers.push(worker),
                Err(error) => {
                    // Let the started workers drain and exit.
                    self.queue.close();
                    join_all(workers);
                    *state = State::Closed;
                    return Err(AggregatorError::Spawn(error));
                }
            }
        }

        let (stop_ticker, ticker) = match self.spawn_ticker() {
            Ok(ticker) => ticker,
            Err(error) => {
                self.queue.close();
                join_all(workers);
                *state = State::Closed;
                return Err(AggregatorError::Spawn(error));
            }
        };

        *state = State::Open(Running {
            workers,
            ticker,
            stop_ticker,
        });

        rollup_log::info!(workers = num_workers, "aggregator started");
        Ok(())
    }

    fn spawn_worker(&self, index: usize) -> io::Result<JoinHandle<()>> {
        let queue = Arc::clone(&self.queue);
        let map = Arc::clone(&self.map);

        thread::Builder::new()
            .name(format!("rollup-worker-{index}"))
            .spawn(move || {
                while let Some(Packet { metric, policies }) = queue.dequeue() {
                    // Failures are counted by the map.
                    if let Err(error) = map.add_metric_with_policies(metric, &policies) {
                        rollup_log::trace!(
                            error = &error as &dyn std::error::Error,
                            "dropped packet"
                        );
                    }
                }
            })
    }

    fn spawn_ticker(&self) -> io::Result<(Sender<()>, JoinHandle<()>)> {
        let queue = Arc::clone(&self.queue);
        let map = Arc::clone(&self.map);
        let ticks = crossbeam_channel::tick(self.opts.entry_check_interval.max(MIN_TICK_INTERVAL));
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);

        let handle = thread::Builder::new()
            .name("rollup-ticker".to_owned())
            .spawn(move || {
                loop {
                    crossbeam_channel::select! {
                        recv(ticks) -> _ => {
                            map.tick();
                            metric!(gauge(AggregatorGauges::QueueDepth) = queue.len() as u64);
                        }
                        // Closing the sender stops the ticker.
                        recv(stop_rx) -> _ => break,
                    }
                }
            })?;

        Ok((stop_tx, handle))
    }

    /// Returns the queue decoders push packets into.
    pub fn queue(&self) -> Arc<PacketQueue> {
        Arc::clone(&self.queue)
    }

    /// Returns the entries of this aggregator.
    pub fn map(&self) -> &MetricMap {
        &self.map
    }

    /// Returns the metric lists of this aggregator.
    pub fn lists(&self) -> &MetricLists {
        &self.lists
    }

    /// Returns the flush manager, if configured.
    pub fn flush_manager(&self) -> Option<&Arc<FlushManager>> {
        self.opts.flush_manager.as_ref()
    }

    /// Aggregates a sample directly, bypassing the queue.
    pub fn add_metric_with_policies(
        &self,
        metric: MetricUnion,
        policies: &VersionedPolicies,
    ) -> Result<(), AggregatorError> {
        Ok(self.map.add_metric_with_policies(metric, policies)?)
    }

    /// Stops all threads and rejects further samples.
    ///
    /// Packets already in the queue are aggregated before the workers exit. Subsequent calls have
    /// no effect.
    pub fn close(&self) {
        let running = match std::mem::replace(&mut *self.state.lock(), State::Closed) {
            State::Closed => return,
            State::NotOpen => None,
            State::Open(running) => Some(running),
        };

        self.queue.close();

        if let Some(Running {
            workers,
            ticker,
            stop_ticker,
        }) = running
        {
            join_all(workers);
            drop(stop_ticker);
            if ticker.join().is_err() {
                rollup_log::error!("aggregator ticker panicked");
            }
        }

        // Lists release their writers on close, so no further flush may be scheduled by then.
        if let Some(flush_manager) = &self.opts.flush_manager {
            flush_manager.close();
        }
        self.lists.close();
        self.map.close();

        rollup_log::info!("aggregator stopped");
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("opts", &self.opts)
            .field("queue", &self.queue.len())
            .field("map", &self.map)
            .field("lists", &self.lists)
            .finish_non_exhaustive()
    }
}

fn join_all(workers: Vec<JoinHandle<()>>) {
    for worker in workers {
        if worker.join().is_err() {
            rollup_log::error!("aggregator worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::aggregation::{AggregatedValue, CounterValue};
    use crate::config::AggregatorConfig;
    use crate::flush::{FlushManagerOptions, FlushState, Flusher};
    use crate::list::{FlushMode, FlushRequest, FlushStats};
    use crate::time::Clock;
    use crate::writer::CapturingHandler;

    const SECOND: i64 = 1_000_000_000;
    const NOW: i64 = 1_700_000_000 * SECOND;

    fn policies(policies: &[&str]) -> VersionedPolicies {
        let policies = policies.iter().map(|p| p.parse().unwrap()).collect();
        VersionedPolicies::new(1, 0, policies)
    }

    #[test]
    fn test_workers_drain_queue() {
        rollup_log::init_test!();

        let clock = Clock::manual(NOW);
        let opts = Options::default().with_clock(clock);
        let aggregator = Aggregator::new(opts);
        aggregator.open().unwrap();

        let queue = aggregator.queue();
        for value in 1..=3 {
            queue.enqueue(Packet::new(
                MetricUnion::counter("foo", value),
                policies(&["10s:2d", "1m:40d"]),
            ));
        }

        // Closing waits for the workers to drain the queue.
        aggregator.close();
        assert!(queue.is_empty());

        let list = aggregator.lists().get(Duration::from_secs(10)).unwrap();
        let elems = list.elems();
        assert_eq!(elems.len(), 1);
        assert_eq!(
            elems[0].lock().snapshot(),
            [(NOW, AggregatedValue::Counter(CounterValue { sum: 6, count: 3 }))]
        );
        assert_eq!(aggregator.lists().len(), 2);
    }

    #[test]
    fn test_open_close_lifecycle() {
        let aggregator = Aggregator::new(Options::default());
        aggregator.open().unwrap();
        assert!(matches!(
            aggregator.open(),
            Err(AggregatorError::AlreadyOpen)
        ));

        aggregator.close();
        aggregator.close();
        assert!(matches!(aggregator.open(), Err(AggregatorError::Closed)));
        assert!(matches!(
            aggregator.add_metric_with_policies(
                MetricUnion::counter("foo", 1),
                &policies(&["10s:2d"])
            ),
            Err(AggregatorError::AddMetric(MapError::Closed))
        ));
    }

    #[test]
    fn test_flush_manager_requires_runtime() {
        let config = AggregatorConfig::default();
        let opts = Options::from_config(&config).with_config_flush_manager(&config);
        let aggregator = Aggregator::new(opts);

        assert!(matches!(
            aggregator.open(),
            Err(AggregatorError::FlushManager(FlushManagerError::NoRuntime))
        ));

        // The aggregator can still be opened once a runtime is available.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        aggregator.open().unwrap();
        aggregator.close();
    }

    #[test]
    fn test_ticker_expires_idle_entries() {
        let clock = Clock::manual(NOW);
        let opts = Options {
            entry_check_interval: Duration::from_millis(5),
            ..Options::default()
        }
        .with_clock(clock.clone())
        .with_entry_ttl(Duration::from_secs(60));

        let aggregator = Aggregator::new(opts);
        aggregator
            .add_metric_with_policies(MetricUnion::counter("foo", 1), &policies(&["10s:2d"]))
            .unwrap();
        assert_eq!(aggregator.map().len(), 1);

        aggregator.open().unwrap();
        clock.advance(Duration::from_secs(61));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !aggregator.map().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(aggregator.map().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_aggregate_and_flush() {
        rollup_log::init_test!();

        let config = AggregatorConfig {
            min_flush_interval_ms: 0,
            flush_jitter: false,
            follower_check_interval_ms: 10,
            num_workers: 2,
            ..Default::default()
        };
        let handler = CapturingHandler::new();
        let opts = Options::from_config(&config)
            .with_handler(Arc::new(handler.clone()))
            .with_flush_manager(Arc::new(FlushManager::new(
                FlushManagerOptions::from_config(&config, Clock::system()),
            )));

        let aggregator = Aggregator::new(opts);
        aggregator.open().unwrap();

        let queue = aggregator.queue();
        for value in [1, 2, 3] {
            queue.enqueue(Packet::new(
                MetricUnion::counter("foo", value),
                policies(&["100ms:1h"]),
            ));
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut total = 0;
        while total < 6 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
            total += handler
                .take()
                .iter()
                .map(|metric| match metric.value {
                    AggregatedValue::Counter(value) => value.sum,
                    _ => 0,
                })
                .sum::<i64>();
        }
        assert_eq!(total, 6);

        let flush_manager = aggregator.flush_manager().unwrap();
        assert_eq!(flush_manager.status().state, FlushState::Open);

        aggregator.close();
        assert_eq!(flush_manager.status().state, FlushState::Closed);
    }

    #[test]
    fn test_close_stops_flushing() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();

        let config = AggregatorConfig::default();
        let handler = CapturingHandler::new();
        let opts = Options::from_config(&config)
            .with_clock(Clock::manual(NOW))
            .with_handler(Arc::new(handler.clone()))
            .with_config_flush_manager(&config);

        let aggregator = Aggregator::new(opts);
        aggregator.open().unwrap();
        aggregator
            .add_metric_with_policies(MetricUnion::counter("foo", 1), &policies(&["10s:2d"]))
            .unwrap();
        aggregator.close();

        let flush_manager = aggregator.flush_manager().unwrap();
        assert_eq!(flush_manager.status().state, FlushState::Closed);

        // A flush prepared before closing finds the list closed and leaves the writer alone.
        let list = aggregator.lists().get(Duration::from_secs(10)).unwrap();
        assert!(list.is_closed());
        let flushes = handler.flushes();
        let stats = list
            .flush(FlushRequest {
                cutoff_nanos: NOW + 60 * SECOND,
                mode: FlushMode::Write,
            })
            .unwrap();
        assert_eq!(stats, FlushStats::default());
        assert!(handler.is_empty());
        assert_eq!(handler.flushes(), flushes);
    }
}
