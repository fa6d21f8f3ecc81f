use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rollup_statsd::metric;

use super::schedule::FlushSchedule;
use super::{
    BucketFlush, BucketsFlushTask, Completion, FlushBucket, FlushManagerOptions, FlushTask,
    FlushTimes, FlushTimesStore, IDLE_WAIT, Role, RoleBasedFlushManager,
};
use crate::list::{FlushMode, FlushRequest};
use crate::statsd::AggregatorCounters;
use crate::time::{Clock, duration_nanos};

/// Flushes buckets at their interval boundaries and publishes the cutoffs.
#[derive(Debug)]
pub struct LeaderFlushManager {
    clock: Clock,
    allowed_lateness: Duration,
    schedule: FlushSchedule,
    flush_times: Arc<Mutex<FlushTimes>>,
    store: Arc<dyn FlushTimesStore>,
}

impl LeaderFlushManager {
    pub(crate) fn new(opts: &FlushManagerOptions) -> Self {
        Self {
            clock: opts.clock.clone(),
            allowed_lateness: opts.allowed_lateness,
            schedule: FlushSchedule::new(opts.max_jitter),
            flush_times: Arc::new(Mutex::new(FlushTimes::new())),
            store: Arc::clone(&opts.store),
        }
    }

    /// Returns the cutoffs of all successful flushes.
    pub fn flush_times(&self) -> FlushTimes {
        self.flush_times.lock().clone()
    }
}

impl RoleBasedFlushManager for LeaderFlushManager {
    fn open(&mut self) {
        // Continue from the cutoffs of the previous leader.
        match self.store.get() {
            Ok(flush_times) => *self.flush_times.lock() = flush_times,
            Err(error) => {
                metric!(counter(AggregatorCounters::StoreErrors) += 1, op = "get");
                rollup_log::warn!(
                    error = &error as &dyn std::error::Error,
                    "failed to load flush times"
                );
            }
        }
    }

    fn init(&mut self, buckets: &[FlushBucket]) {
        let now = self.clock.now_nanos();
        self.schedule.clear();
        for bucket in buckets {
            self.schedule.insert(bucket.interval(), now);
        }
    }

    fn prepare(&mut self, buckets: &[FlushBucket]) -> (Option<Box<dyn FlushTask>>, Duration) {
        let now = self.clock.now_nanos();
        let due = self.schedule.pop_due(now);
        let wait = self.schedule.wait(now).unwrap_or(IDLE_WAIT);

        let request = FlushRequest {
            cutoff_nanos: now - duration_nanos(self.allowed_lateness),
            mode: FlushMode::Write,
        };

        let flushes: Vec<_> = buckets
            .iter()
            .filter(|bucket| !bucket.flushers().is_empty() && due.contains(&bucket.interval()))
            .map(|bucket| BucketFlush::new(bucket, request))
            .collect();

        if flushes.is_empty() {
            return (None, wait);
        }

        let completion = Completion::Publish {
            flush_times: Arc::clone(&self.flush_times),
            store: Arc::clone(&self.store),
        };
        let task: Box<dyn FlushTask> =
            Box::new(BucketsFlushTask::new(Role::Leader, flushes, completion));

        (Some(task), wait)
    }

    fn on_bucket_added(&mut self, bucket: &FlushBucket) {
        self.schedule.insert(bucket.interval(), self.clock.now_nanos());
    }

    fn can_lead(&self) -> bool {
        true
    }

    fn close(&mut self) {
        self.schedule.clear();
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::flush::testutils::TestFlusher;
    use crate::flush::{Flusher, ManualElection, MemoryFlushTimesStore};

    const SECOND: i64 = 1_000_000_000;

    struct Setup {
        clock: Clock,
        store: Arc<MemoryFlushTimesStore>,
        leader: LeaderFlushManager,
    }

    fn setup(allowed_lateness: Duration) -> Setup {
        let clock = Clock::manual(0);
        let store = Arc::new(MemoryFlushTimesStore::new());
        let opts = FlushManagerOptions {
            clock: clock.clone(),
            allowed_lateness,
            max_jitter: None,
            follower_check_interval: Duration::from_secs(1),
            election: Arc::new(ManualElection::new(Role::Leader)),
            store: Arc::clone(&store) as Arc<dyn FlushTimesStore>,
        };

        Setup {
            clock,
            store,
            leader: LeaderFlushManager::new(&opts),
        }
    }

    fn bucket(flushers: &[&Arc<TestFlusher>]) -> FlushBucket {
        let mut bucket = FlushBucket::new(flushers[0].flush_interval());
        for flusher in flushers {
            bucket.flushers.push(Arc::clone(flusher) as Arc<dyn Flusher>);
        }
        bucket
    }

    fn run(leader: &mut LeaderFlushManager, buckets: &[FlushBucket]) -> Duration {
        let (task, wait) = leader.prepare(buckets);
        if let Some(task) = task {
            task.run();
        }
        wait
    }

    #[test]
    fn test_flush_due_buckets_only() {
        let Setup {
            clock, mut leader, ..
        } = setup(Duration::ZERO);

        let ten = TestFlusher::new(Duration::from_secs(10));
        let minute = TestFlusher::new(Duration::from_secs(60));
        let buckets = [bucket(&[&ten]), bucket(&[&minute])];
        leader.init(&buckets);
        leader.open();

        assert_eq!(run(&mut leader, &buckets), Duration::from_secs(10));

        clock.set_nanos(10 * SECOND);
        run(&mut leader, &buckets);
        assert_eq!(ten.requests().len(), 1);
        assert!(minute.requests().is_empty());

        clock.set_nanos(60 * SECOND);
        run(&mut leader, &buckets);
        assert_eq!(ten.requests().len(), 2);
        assert_eq!(minute.requests().len(), 1);
        assert_eq!(minute.requests()[0].cutoff_nanos, 60 * SECOND);
    }

    #[test]
    fn test_allowed_lateness() {
        let Setup {
            clock, mut leader, ..
        } = setup(Duration::from_secs(2));

        let flusher = TestFlusher::new(Duration::from_secs(10));
        let buckets = [bucket(&[&flusher])];
        leader.init(&buckets);

        clock.set_nanos(10 * SECOND);
        run(&mut leader, &buckets);
        assert_eq!(
            flusher.requests(),
            [FlushRequest {
                cutoff_nanos: 8 * SECOND,
                mode: FlushMode::Write,
            }]
        );
    }

    #[test]
    fn test_publish_successful_buckets() {
        rollup_log::init_test!();

        let Setup {
            clock,
            store,
            mut leader,
        } = setup(Duration::ZERO);

        let ok = TestFlusher::new(Duration::from_secs(10));
        let failing = TestFlusher::new(Duration::from_secs(20));
        let other = TestFlusher::new(Duration::from_secs(20));
        failing.set_failing(true);

        let buckets = [bucket(&[&ok]), bucket(&[&failing, &other])];
        leader.init(&buckets);

        clock.set_nanos(20 * SECOND);
        let captures = rollup_statsd::with_capturing_test_client(|| {
            run(&mut leader, &buckets);
        });
        assert!(captures.contains(&"aggregator.flush.errors:1|c".to_owned()));

        // The other list of the failing bucket is flushed regardless.
        assert_eq!(other.requests().len(), 1);

        let published = store.get().unwrap();
        assert_eq!(published.get(Duration::from_secs(10)), Some(20 * SECOND));
        assert_eq!(published.get(Duration::from_secs(20)), None);
        assert_eq!(leader.flush_times(), published);
    }

    #[test]
    fn test_open_resumes_published_times() {
        let Setup {
            clock,
            store,
            mut leader,
        } = setup(Duration::ZERO);

        let mut previous = FlushTimes::new();
        previous.advance(Duration::from_secs(10), 100 * SECOND);
        store.put(&previous).unwrap();

        let flusher = TestFlusher::new(Duration::from_secs(10));
        let buckets = [bucket(&[&flusher])];
        leader.init(&buckets);
        leader.open();

        // A clock lagging behind the previous leader does not move cutoffs backwards.
        clock.set_nanos(50 * SECOND);
        run(&mut leader, &buckets);
        assert_eq!(flusher.requests().len(), 1);
        assert_eq!(
            store.get().unwrap().get(Duration::from_secs(10)),
            Some(100 * SECOND)
        );
    }

    #[test]
    fn test_empty_buckets_are_skipped() {
        let Setup {
            clock, mut leader, ..
        } = setup(Duration::ZERO);

        let buckets = [FlushBucket::new(Duration::from_secs(10))];
        leader.init(&buckets);

        clock.set_nanos(10 * SECOND);
        let (task, wait) = leader.prepare(&buckets);
        assert!(task.is_none());
        assert_eq!(wait, Duration::from_secs(10));

        leader.close();
        assert_eq!(leader.prepare(&buckets).1, IDLE_WAIT);
    }
}
