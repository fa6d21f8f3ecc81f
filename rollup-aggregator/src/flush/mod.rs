//! Flush coordination across metric lists and aggregator instances.
//!
//! Metric lists register with the [`FlushManager`] as [`Flusher`]s and are grouped into buckets
//! sharing a flush interval. The manager delegates the decision of what to flush, and when, to a
//! role strategy:
//!
//!  - The leader flushes every bucket at its interval boundary, writes the aggregates downstream
//!    and publishes the flush cutoffs to a [`FlushTimesStore`].
//!  - A follower aggregates the same traffic but discards windows the leader has published. When
//!    the store cannot be read, it falls back to leader timing and writes on its own.
//!
//! An [`ElectionManager`] decides the desired role. A follower only takes over once it caught up
//! with the published cutoffs, so no window is written twice or skipped during a handover.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rollup_statsd::metric;
use serde::Serialize;
use tokio::sync::{Notify, watch};

use crate::config::AggregatorConfig;
use crate::list::{FlushError, FlushRequest, FlushStats};
use crate::statsd::{AggregatorCounters, AggregatorDistributions, AggregatorTimers};
use crate::time::Clock;

mod election;
mod follower;
mod leader;
mod schedule;
mod store;

pub use self::election::*;
pub use self::follower::*;
pub use self::leader::*;
pub use self::store::*;

/// Time to wait before preparing the next flush when nothing is scheduled.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// A collection of aggregates that is flushed periodically.
pub trait Flusher: Send + Sync + fmt::Debug {
    /// Returns the interval at which this flusher is flushed.
    fn flush_interval(&self) -> Duration;

    /// Consumes all windows eligible for the request.
    fn flush(&self, request: FlushRequest) -> Result<FlushStats, FlushError>;

    /// Returns the cutoff of the last successful flush in UNIX nanoseconds.
    fn last_flushed_nanos(&self) -> i64;
}

/// Flushers sharing a flush interval.
#[derive(Clone, Debug)]
pub struct FlushBucket {
    interval: Duration,
    flushers: Vec<Arc<dyn Flusher>>,
}

impl FlushBucket {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            flushers: Vec::new(),
        }
    }

    /// Returns the flush interval of all flushers in this bucket.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns the registered flushers.
    pub fn flushers(&self) -> &[Arc<dyn Flusher>] {
        &self.flushers
    }

    fn remove(&mut self, flusher: &Arc<dyn Flusher>) -> bool {
        let position = self
            .flushers
            .iter()
            .position(|f| std::ptr::addr_eq(Arc::as_ptr(f), Arc::as_ptr(flusher)));

        match position {
            Some(index) => {
                self.flushers.swap_remove(index);
                true
            }
            None => false,
        }
    }
}

/// A prepared flush, ready to run.
pub trait FlushTask: Send {
    /// Flushes all due lists synchronously.
    fn run(self: Box<Self>);
}

/// A flush strategy for one role.
///
/// The manager notifies both strategies about every bucket change, but only asks the strategy of
/// the current role to prepare flushes.
pub trait RoleBasedFlushManager: Send {
    /// Activates the strategy when the manager switches to its role.
    fn open(&mut self);

    /// Replaces all state derived from buckets.
    fn init(&mut self, buckets: &[FlushBucket]);

    /// Returns the flush task due now, if any, and the time to wait until the next call.
    fn prepare(&mut self, buckets: &[FlushBucket]) -> (Option<Box<dyn FlushTask>>, Duration);

    /// Called when a bucket was created.
    fn on_bucket_added(&mut self, bucket: &FlushBucket);

    /// Called when a flusher was added to an existing or new bucket.
    fn on_flusher_added(&mut self, _bucket: &FlushBucket, _flusher: &Arc<dyn Flusher>) {}

    /// Returns `true` if the strategy can hand over to a leader without losing windows.
    fn can_lead(&self) -> bool;

    /// Deactivates the strategy when the manager leaves its role.
    fn close(&mut self);
}

/// What happens with the cutoffs of successfully flushed buckets.
pub(crate) enum Completion {
    /// Records the cutoffs and publishes them to the store.
    Publish {
        flush_times: Arc<Mutex<FlushTimes>>,
        store: Arc<dyn FlushTimesStore>,
    },
    /// Records the cutoffs locally.
    Record { processed: Arc<Mutex<FlushTimes>> },
}

/// The flushers of one bucket and the request to flush them with.
pub(crate) struct BucketFlush {
    pub interval: Duration,
    pub flushers: Vec<Arc<dyn Flusher>>,
    pub request: FlushRequest,
}

impl BucketFlush {
    pub fn new(bucket: &FlushBucket, request: FlushRequest) -> Self {
        Self {
            interval: bucket.interval,
            flushers: bucket.flushers.clone(),
            request,
        }
    }
}

/// Flushes a set of buckets and records the cutoffs of the successful ones.
pub(crate) struct BucketsFlushTask {
    role: Role,
    buckets: Vec<BucketFlush>,
    completion: Completion,
}

impl BucketsFlushTask {
    pub fn new(role: Role, buckets: Vec<BucketFlush>, completion: Completion) -> Self {
        Self {
            role,
            buckets,
            completion,
        }
    }
}

impl FlushTask for BucketsFlushTask {
    fn run(self: Box<Self>) {
        let start = Instant::now();
        let mut flushed_lists = 0;
        let mut succeeded = Vec::new();

        for bucket in &self.buckets {
            let mut ok = true;

            for flusher in &bucket.flushers {
                match flusher.flush(bucket.request) {
                    Ok(_) => flushed_lists += 1,
                    Err(error) => {
                        ok = false;
                        metric!(counter(AggregatorCounters::FlushErrors) += 1);
                        rollup_log::error!(
                            error = &error as &dyn std::error::Error,
                            interval = ?bucket.interval,
                            mode = bucket.request.mode.as_str(),
                            "failed to flush metric list"
                        );
                    }
                }
            }

            if ok {
                succeeded.push((bucket.interval, bucket.request.cutoff_nanos));
            }
        }

        match self.completion {
            Completion::Publish { flush_times, store } => {
                let mut changed = false;
                let snapshot = {
                    let mut flush_times = flush_times.lock();
                    for &(interval, cutoff) in &succeeded {
                        changed |= flush_times.advance(interval, cutoff);
                    }
                    flush_times.clone()
                };

                if changed {
                    if let Err(error) = store.put(&snapshot) {
                        metric!(counter(AggregatorCounters::StoreErrors) += 1, op = "put");
                        rollup_log::error!(
                            "failed to publish flush times: {}",
                            rollup_log::LogError(&error)
                        );
                    }
                }
            }
            Completion::Record { processed } => {
                let mut processed = processed.lock();
                for &(interval, cutoff) in &succeeded {
                    processed.advance(interval, cutoff);
                }
            }
        }

        metric!(distribution(AggregatorDistributions::FlushedLists) = flushed_lists as u64);
        metric!(
            timer(AggregatorTimers::FlushDuration) = start.elapsed(),
            role = self.role.as_str(),
        );
    }
}

/// Parameters of the [`FlushManager`].
#[derive(Clone)]
pub struct FlushManagerOptions {
    /// The time source for schedules and cutoffs.
    pub clock: Clock,
    /// How long windows wait for late samples after they ended.
    pub allowed_lateness: Duration,
    /// Upper bound of the per-bucket flush offset. `None` disables jitter.
    pub max_jitter: Option<Duration>,
    /// How often followers read the published flush times.
    pub follower_check_interval: Duration,
    /// Decides which role this instance should take.
    pub election: Arc<dyn ElectionManager>,
    /// Shared storage of published flush times.
    pub store: Arc<dyn FlushTimesStore>,
}

impl FlushManagerOptions {
    /// Creates options from the given configuration.
    ///
    /// Without further setup, the instance is elected leader and publishes to an in-memory store.
    pub fn from_config(config: &AggregatorConfig, clock: Clock) -> Self {
        Self {
            clock,
            allowed_lateness: config.allowed_lateness(),
            max_jitter: config.max_jitter(),
            follower_check_interval: config.follower_check_interval(),
            election: Arc::new(ManualElection::new(Role::Leader)),
            store: Arc::new(MemoryFlushTimesStore::new()),
        }
    }

    /// Sets the election manager.
    pub fn with_election(mut self, election: Arc<dyn ElectionManager>) -> Self {
        self.election = election;
        self
    }

    /// Sets the flush times store.
    pub fn with_store(mut self, store: Arc<dyn FlushTimesStore>) -> Self {
        self.store = store;
        self
    }
}

impl Default for FlushManagerOptions {
    fn default() -> Self {
        Self::from_config(&AggregatorConfig::default(), Clock::system())
    }
}

impl fmt::Debug for FlushManagerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushManagerOptions")
            .field("clock", &self.clock)
            .field("allowed_lateness", &self.allowed_lateness)
            .field("max_jitter", &self.max_jitter)
            .field("follower_check_interval", &self.follower_check_interval)
            .field("election", &self.election)
            .field("store", &self.store)
            .finish()
    }
}

/// An error of the [`FlushManager`].
#[derive(Debug, thiserror::Error)]
pub enum FlushManagerError {
    /// The manager was closed.
    #[error("flush manager is closed")]
    Closed,
    /// The manager was opened outside of a tokio runtime.
    #[error("flush manager requires a tokio runtime")]
    NoRuntime,
    /// The flusher was never registered, or already unregistered.
    #[error("flusher is not registered")]
    FlusherNotFound,
}

/// The lifecycle state of the [`FlushManager`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushState {
    /// Created, but the flush loop was not started yet.
    NotOpen,
    /// The flush loop is running.
    Open,
    /// The manager was closed.
    Closed,
}

/// A snapshot of the [`FlushManager`] state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct FlushStatus {
    /// Lifecycle state.
    pub state: FlushState,
    /// The current role.
    pub role: Role,
    /// Whether the current role could hand over to a leader.
    pub can_lead: bool,
}

struct ManagerState {
    state: FlushState,
    role: Role,
    buckets: Vec<FlushBucket>,
    leader: LeaderFlushManager,
    follower: FollowerFlushManager,
}

impl ManagerState {
    fn current(&mut self) -> &mut dyn RoleBasedFlushManager {
        match self.role {
            Role::Leader => &mut self.leader,
            Role::Follower => &mut self.follower,
        }
    }

    fn set_role(&mut self, role: Role) {
        if self.role == role {
            return;
        }

        self.current().close();
        self.role = role;

        let Self {
            buckets,
            leader,
            follower,
            ..
        } = self;
        let next: &mut dyn RoleBasedFlushManager = match role {
            Role::Leader => leader,
            Role::Follower => follower,
        };
        next.init(buckets);
        next.open();

        metric!(counter(AggregatorCounters::RoleChanges) += 1, role = role.as_str());
        rollup_log::info!(role = role.as_str(), "flush manager changed role");
    }
}

/// Schedules flushes of all registered metric lists.
///
/// The manager starts as follower and switches roles as the [`ElectionManager`] decides. Use
/// [`open`](Self::open) to run the flush loop in the background, or call
/// [`prepare`](Self::prepare) and run the returned tasks manually.
pub struct FlushManager {
    election: Arc<dyn ElectionManager>,
    inner: Mutex<ManagerState>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
}

impl FlushManager {
    /// Creates a new flush manager without any flushers.
    pub fn new(opts: FlushManagerOptions) -> Self {
        let mut follower = FollowerFlushManager::new(&opts);
        follower.open();

        Self {
            election: Arc::clone(&opts.election),
            inner: Mutex::new(ManagerState {
                state: FlushState::NotOpen,
                role: Role::Follower,
                buckets: Vec::new(),
                leader: LeaderFlushManager::new(&opts),
                follower,
            }),
            wake: Notify::new(),
            shutdown: watch::Sender::new(false),
        }
    }

    /// Starts the flush loop on the current tokio runtime.
    ///
    /// Opening an open manager has no effect. Flush tasks run on the blocking thread pool, since
    /// they lock metric lists.
    pub fn open(self: &Arc<Self>) -> Result<(), FlushManagerError> {
        let mut inner = self.inner.lock();
        match inner.state {
            FlushState::Open => return Ok(()),
            FlushState::Closed => return Err(FlushManagerError::Closed),
            FlushState::NotOpen => (),
        }

        let handle =
            tokio::runtime::Handle::try_current().map_err(|_| FlushManagerError::NoRuntime)?;
        let shutdown = self.shutdown.subscribe();
        inner.state = FlushState::Open;
        drop(inner);

        handle.spawn(Arc::clone(self).run(shutdown));
        rollup_log::debug!("flush manager started");

        Ok(())
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let (task, wait) = self.prepare();
            if let Some(task) = task {
                if let Err(error) = tokio::task::spawn_blocking(move || task.run()).await {
                    rollup_log::error!(
                        error = &error as &dyn std::error::Error,
                        "flush task panicked"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(wait) => (),
                _ = self.wake.notified() => (),
                _ = shutdown.changed() => break,
            }
        }

        rollup_log::debug!("flush manager stopped");
    }

    /// Reinitializes both strategies with the current buckets and returns to the follower role.
    pub fn reset(&self) -> Result<(), FlushManagerError> {
        let mut inner = self.inner.lock();
        if inner.state == FlushState::Closed {
            return Err(FlushManagerError::Closed);
        }

        let previous = inner.role;
        inner.current().close();
        inner.role = Role::Follower;

        let ManagerState {
            buckets,
            leader,
            follower,
            ..
        } = &mut *inner;
        leader.init(buckets);
        follower.init(buckets);
        follower.open();

        if previous == Role::Leader {
            metric!(counter(AggregatorCounters::RoleChanges) += 1, role = "follower");
        }
        rollup_log::info!("flush manager reset");

        Ok(())
    }

    /// Registers a flusher in the bucket of its flush interval.
    pub fn register(&self, flusher: Arc<dyn Flusher>) -> Result<(), FlushManagerError> {
        let mut inner = self.inner.lock();
        if inner.state == FlushState::Closed {
            return Err(FlushManagerError::Closed);
        }

        let interval = flusher.flush_interval();
        let ManagerState {
            buckets,
            leader,
            follower,
            ..
        } = &mut *inner;

        let index = match buckets.iter().position(|b| b.interval == interval) {
            Some(index) => index,
            None => {
                let bucket = FlushBucket::new(interval);
                leader.on_bucket_added(&bucket);
                follower.on_bucket_added(&bucket);
                buckets.push(bucket);
                buckets.len() - 1
            }
        };

        let bucket = &mut buckets[index];
        bucket.flushers.push(Arc::clone(&flusher));
        leader.on_flusher_added(bucket, &flusher);
        follower.on_flusher_added(bucket, &flusher);
        drop(inner);

        self.wake.notify_one();
        Ok(())
    }

    /// Removes a flusher registered with [`register`](Self::register).
    pub fn unregister(&self, flusher: &Arc<dyn Flusher>) -> Result<(), FlushManagerError> {
        let mut inner = self.inner.lock();
        if inner.state == FlushState::Closed {
            return Err(FlushManagerError::Closed);
        }

        let interval = flusher.flush_interval();
        let removed = inner
            .buckets
            .iter_mut()
            .find(|b| b.interval == interval)
            .is_some_and(|b| b.remove(flusher));

        if !removed {
            return Err(FlushManagerError::FlusherNotFound);
        }
        Ok(())
    }

    /// Returns the number of registered flushers across all buckets.
    pub fn num_flushers(&self) -> usize {
        let inner = self.inner.lock();
        inner.buckets.iter().map(|b| b.flushers.len()).sum()
    }

    /// Updates the role and prepares the next flush.
    ///
    /// Returns the task due now, if any, and the time to wait before preparing again. The task
    /// must be run outside of any lock held on metric lists.
    pub fn prepare(&self) -> (Option<Box<dyn FlushTask>>, Duration) {
        let mut inner = self.inner.lock();
        if inner.state == FlushState::Closed {
            return (None, IDLE_WAIT);
        }

        match (inner.role, self.election.role()) {
            (Role::Follower, Role::Leader) if inner.follower.can_lead() => {
                inner.set_role(Role::Leader)
            }
            (Role::Leader, Role::Follower) => inner.set_role(Role::Follower),
            _ => (),
        }

        let ManagerState {
            role,
            buckets,
            leader,
            follower,
            ..
        } = &mut *inner;

        match role {
            Role::Leader => leader.prepare(buckets),
            Role::Follower => follower.prepare(buckets),
        }
    }

    /// Returns the current state, role and leadership readiness.
    pub fn status(&self) -> FlushStatus {
        let mut inner = self.inner.lock();
        FlushStatus {
            state: inner.state,
            role: inner.role,
            can_lead: inner.current().can_lead(),
        }
    }

    /// Stops the flush loop.
    ///
    /// A flush task that is already running completes. Subsequent calls have no effect.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.state == FlushState::Closed {
            return;
        }

        inner.state = FlushState::Closed;
        inner.current().close();
        drop(inner);

        self.shutdown.send_replace(true);
    }
}

impl fmt::Debug for FlushManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("FlushManager")
            .field("state", &inner.state)
            .field("role", &inner.role)
            .field("buckets", &inner.buckets.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testutils {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::writer::WriteError;

    /// A flusher recording all requests.
    #[derive(Debug)]
    pub struct TestFlusher {
        interval: Duration,
        requests: Mutex<Vec<FlushRequest>>,
        failing: AtomicBool,
    }

    impl TestFlusher {
        pub fn new(interval: Duration) -> Arc<Self> {
            Arc::new(Self {
                interval,
                requests: Mutex::new(Vec::new()),
                failing: AtomicBool::new(false),
            })
        }

        pub fn requests(&self) -> Vec<FlushRequest> {
            self.requests.lock().clone()
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::Relaxed);
        }
    }

    impl Flusher for TestFlusher {
        fn flush_interval(&self) -> Duration {
            self.interval
        }

        fn flush(&self, request: FlushRequest) -> Result<FlushStats, FlushError> {
            self.requests.lock().push(request);
            if self.failing.load(Ordering::Relaxed) {
                return Err(FlushError::Write(WriteError::Rejected("test".to_owned())));
            }
            Ok(FlushStats::default())
        }

        fn last_flushed_nanos(&self) -> i64 {
            self.requests
                .lock()
                .last()
                .map_or(0, |request| request.cutoff_nanos)
        }
    }
}
