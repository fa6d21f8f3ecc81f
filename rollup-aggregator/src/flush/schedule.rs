use std::cmp::Reverse;
use std::time::Duration;

use priority_queue::PriorityQueue;

use crate::time::{duration_nanos, truncate_nanos};

/// Flush intervals below this are scheduled as if they were this long.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Next flush times of all buckets, ordered by due time.
///
/// Each bucket flushes at the boundaries of its interval, shifted by an offset. The offset is
/// derived from a fixed-seed hash of the interval, so all instances agree on it and different
/// intervals spread their flushes instead of firing at the same instant.
#[derive(Debug)]
pub struct FlushSchedule {
    queue: PriorityQueue<Duration, Reverse<i64>>,
    max_jitter: Option<Duration>,
    hasher: ahash::RandomState,
}

impl FlushSchedule {
    /// Creates an empty schedule.
    ///
    /// `None` disables jitter, so buckets flush exactly at their interval boundaries.
    pub fn new(max_jitter: Option<Duration>) -> Self {
        Self {
            queue: PriorityQueue::new(),
            max_jitter,
            hasher: ahash::RandomState::with_seeds(
                0x6a09_e667_f3bc_c908,
                0xbb67_ae85_84ca_a73b,
                0x3c6e_f372_fe94_f82b,
                0xa54f_f53a_5f1d_36f1,
            ),
        }
    }

    /// Removes all buckets.
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Returns the flush offset of the given interval in nanoseconds.
    ///
    /// The offset is smaller than both the maximum jitter and the interval.
    pub fn offset_nanos(&self, interval: Duration) -> i64 {
        let Some(max_jitter) = self.max_jitter else {
            return 0;
        };

        let bound = duration_nanos(max_jitter.min(interval.max(MIN_INTERVAL)));
        if bound <= 0 {
            return 0;
        }

        let hash = self.hasher.hash_one(interval.as_nanos());
        (hash % bound as u64) as i64
    }

    /// Returns the first flush time of the interval strictly after `now_nanos`.
    pub fn next_flush_nanos(&self, interval: Duration, now_nanos: i64) -> i64 {
        let interval = interval.max(MIN_INTERVAL);
        let offset = self.offset_nanos(interval);
        truncate_nanos(now_nanos - offset, interval) + duration_nanos(interval) + offset
    }

    /// Schedules the interval for its next flush after `now_nanos`.
    ///
    /// Rescheduling an interval that is already scheduled replaces its flush time.
    pub fn insert(&mut self, interval: Duration, now_nanos: i64) {
        let next = self.next_flush_nanos(interval, now_nanos);
        self.queue.push(interval, Reverse(next));
    }

    /// Removes and reschedules all intervals due at `now_nanos`.
    ///
    /// Returns the due intervals in the order of their flush times.
    pub fn pop_due(&mut self, now_nanos: i64) -> Vec<Duration> {
        let mut due = Vec::new();

        while let Some((_, &Reverse(next))) = self.queue.peek() {
            if next > now_nanos {
                break;
            }
            if let Some((interval, _)) = self.queue.pop() {
                due.push(interval);
            }
        }

        for interval in &due {
            self.insert(*interval, now_nanos);
        }

        due
    }

    /// Returns the time until the next bucket is due, or `None` if the schedule is empty.
    pub fn wait(&self, now_nanos: i64) -> Option<Duration> {
        let (_, &Reverse(next)) = self.queue.peek()?;
        let nanos = u64::try_from(next.saturating_sub(now_nanos)).unwrap_or_default();
        Some(Duration::from_nanos(nanos))
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    const SECOND: i64 = 1_000_000_000;

    #[test]
    fn test_next_flush_without_jitter() {
        let schedule = FlushSchedule::new(None);
        let ten_secs = Duration::from_secs(10);

        assert_eq!(schedule.next_flush_nanos(ten_secs, 12 * SECOND), 20 * SECOND);
        // Flushing exactly on a boundary schedules the following one.
        assert_eq!(schedule.next_flush_nanos(ten_secs, 20 * SECOND), 30 * SECOND);
    }

    #[test]
    fn test_offset_is_bounded() {
        let schedule = FlushSchedule::new(Some(Duration::from_secs(5)));

        for secs in [1, 2, 10, 60, 600] {
            let interval = Duration::from_secs(secs);
            let offset = schedule.offset_nanos(interval);
            assert!(offset >= 0);
            assert!(offset < 5 * SECOND);
            assert!(offset < duration_nanos(interval));
        }
    }

    #[test]
    fn test_offset_is_stable() {
        let first = FlushSchedule::new(Some(Duration::from_secs(10)));
        let second = FlushSchedule::new(Some(Duration::from_secs(10)));
        let interval = Duration::from_secs(60);

        assert_eq!(first.offset_nanos(interval), second.offset_nanos(interval));
    }

    #[test]
    fn test_next_flush_with_jitter() {
        let schedule = FlushSchedule::new(Some(Duration::from_secs(10)));
        let interval = Duration::from_secs(60);
        let offset = schedule.offset_nanos(interval);

        let now = 1_000 * SECOND;
        let next = schedule.next_flush_nanos(interval, now);
        assert!(next > now);
        assert!(next <= now + 60 * SECOND);
        assert_eq!((next - offset).rem_euclid(60 * SECOND), 0);
    }

    #[test]
    fn test_zero_interval() {
        let schedule = FlushSchedule::new(Some(Duration::from_secs(1)));
        let next = schedule.next_flush_nanos(Duration::ZERO, 5);
        assert!(next > 5);
    }

    #[test]
    fn test_pop_due() {
        let mut schedule = FlushSchedule::new(None);
        schedule.insert(Duration::from_secs(10), 0);
        schedule.insert(Duration::from_secs(60), 0);

        assert_eq!(schedule.wait(0), Some(Duration::from_secs(10)));
        assert!(schedule.pop_due(9 * SECOND).is_empty());

        assert_eq!(
            schedule.pop_due(10 * SECOND),
            vec![Duration::from_secs(10)]
        );
        assert_eq!(schedule.wait(10 * SECOND), Some(Duration::from_secs(10)));

        let due = schedule.pop_due(60 * SECOND);
        assert_eq!(due, vec![Duration::from_secs(10), Duration::from_secs(60)]);
        assert_eq!(schedule.wait(60 * SECOND), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_wait_empty_and_overdue() {
        let mut schedule = FlushSchedule::new(None);
        assert_eq!(schedule.wait(0), None);

        schedule.insert(Duration::from_secs(10), 0);
        assert_eq!(schedule.wait(15 * SECOND), Some(Duration::ZERO));
    }
}
