use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rollup_statsd::metric;

use super::schedule::FlushSchedule;
use super::{
    BucketFlush, BucketsFlushTask, Completion, FlushBucket, FlushManagerOptions, FlushTask,
    FlushTimes, FlushTimesStore, Role, RoleBasedFlushManager,
};
use crate::list::{FlushMode, FlushRequest};
use crate::statsd::AggregatorCounters;
use crate::time::{Clock, duration_nanos};

/// Mirrors the flushes of the leader by discarding the windows it published.
///
/// When the published flush times cannot be read, the follower flushes on the leader's schedule
/// and writes the windows itself.
#[derive(Debug)]
pub struct FollowerFlushManager {
    clock: Clock,
    allowed_lateness: Duration,
    check_interval: Duration,
    store: Arc<dyn FlushTimesStore>,
    schedule: FlushSchedule,
    intervals: Vec<Duration>,
    published: Option<FlushTimes>,
    processed: Arc<Mutex<FlushTimes>>,
    next_check_nanos: i64,
}

impl FollowerFlushManager {
    pub(crate) fn new(opts: &FlushManagerOptions) -> Self {
        Self {
            clock: opts.clock.clone(),
            allowed_lateness: opts.allowed_lateness,
            check_interval: opts.follower_check_interval,
            store: Arc::clone(&opts.store),
            schedule: FlushSchedule::new(opts.max_jitter),
            intervals: Vec::new(),
            published: None,
            processed: Arc::new(Mutex::new(FlushTimes::new())),
            next_check_nanos: i64::MIN,
        }
    }

    /// Returns the cutoffs this follower has flushed up to.
    pub fn processed(&self) -> FlushTimes {
        self.processed.lock().clone()
    }

    fn discard_published(
        &mut self,
        buckets: &[FlushBucket],
        published: FlushTimes,
    ) -> Vec<BucketFlush> {
        let mut flushes = Vec::new();
        let mut processed = self.processed.lock();

        for bucket in buckets {
            let Some(cutoff) = published.get(bucket.interval()) else {
                continue;
            };
            if processed
                .get(bucket.interval())
                .is_some_and(|done| done >= cutoff)
            {
                continue;
            }

            if bucket.flushers().is_empty() {
                // Nothing to discard, the bucket is caught up.
                processed.advance(bucket.interval(), cutoff);
                continue;
            }

            let request = FlushRequest {
                cutoff_nanos: cutoff,
                mode: FlushMode::Discard,
            };
            flushes.push(BucketFlush::new(bucket, request));
        }

        self.published = Some(published);
        flushes
    }

    fn write_due(&mut self, buckets: &[FlushBucket], now: i64) -> Vec<BucketFlush> {
        let due = self.schedule.pop_due(now);
        let request = FlushRequest {
            cutoff_nanos: now - duration_nanos(self.allowed_lateness),
            mode: FlushMode::Write,
        };

        buckets
            .iter()
            .filter(|bucket| !bucket.flushers().is_empty() && due.contains(&bucket.interval()))
            .map(|bucket| BucketFlush::new(bucket, request))
            .collect()
    }
}

impl RoleBasedFlushManager for FollowerFlushManager {
    fn open(&mut self) {
        self.published = None;
        self.next_check_nanos = i64::MIN;
    }

    fn init(&mut self, buckets: &[FlushBucket]) {
        let now = self.clock.now_nanos();
        self.schedule.clear();
        self.intervals.clear();

        for bucket in buckets {
            self.intervals.push(bucket.interval());
            self.schedule.insert(bucket.interval(), now);
        }
    }

    fn prepare(&mut self, buckets: &[FlushBucket]) -> (Option<Box<dyn FlushTask>>, Duration) {
        let now = self.clock.now_nanos();
        if now < self.next_check_nanos {
            let wait = u64::try_from(self.next_check_nanos - now).unwrap_or_default();
            return (None, Duration::from_nanos(wait));
        }
        self.next_check_nanos = now.saturating_add(duration_nanos(self.check_interval));

        let flushes = match self.store.get() {
            Ok(published) => {
                // Keep the fallback schedule aligned in case the store becomes unavailable.
                self.schedule.pop_due(now);
                self.discard_published(buckets, published)
            }
            Err(error) => {
                metric!(counter(AggregatorCounters::StoreErrors) += 1, op = "get");
                rollup_log::warn!(
                    error = &error as &dyn std::error::Error,
                    "failed to read flush times, flushing on local schedule"
                );
                self.write_due(buckets, now)
            }
        };

        if flushes.is_empty() {
            return (None, self.check_interval);
        }

        let completion = Completion::Record {
            processed: Arc::clone(&self.processed),
        };
        let task: Box<dyn FlushTask> =
            Box::new(BucketsFlushTask::new(Role::Follower, flushes, completion));

        (Some(task), self.check_interval)
    }

    fn on_bucket_added(&mut self, bucket: &FlushBucket) {
        self.intervals.push(bucket.interval());
        self.schedule.insert(bucket.interval(), self.clock.now_nanos());
    }

    fn can_lead(&self) -> bool {
        let Some(published) = &self.published else {
            return false;
        };

        let processed = self.processed.lock();
        self.intervals
            .iter()
            .all(|&interval| match published.get(interval) {
                Some(cutoff) => processed.get(interval).is_some_and(|done| done >= cutoff),
                None => true,
            })
    }

    fn close(&mut self) {
        self.published = None;
    }
}
