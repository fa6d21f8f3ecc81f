use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Flush cutoffs per flush interval.
///
/// Leaders publish the cutoff of the last successful flush of every bucket. Followers compare it
/// with their own progress to discard windows the leader has already written.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlushTimes {
    /// Cutoff UNIX timestamps in nanoseconds, keyed by flush interval in nanoseconds.
    cutoffs: BTreeMap<u64, i64>,
}

impl FlushTimes {
    /// Creates empty flush times.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cutoff of the given flush interval.
    pub fn get(&self, interval: Duration) -> Option<i64> {
        self.cutoffs.get(&interval_key(interval)).copied()
    }

    /// Records a cutoff for the given flush interval.
    ///
    /// Cutoffs never move backwards. Returns `true` if the stored cutoff changed.
    pub fn advance(&mut self, interval: Duration, cutoff_nanos: i64) -> bool {
        let current = self.cutoffs.entry(interval_key(interval)).or_insert(i64::MIN);
        if cutoff_nanos > *current {
            *current = cutoff_nanos;
            true
        } else {
            false
        }
    }

    /// Returns the number of intervals with a cutoff.
    pub fn len(&self) -> usize {
        self.cutoffs.len()
    }

    /// Returns `true` if no cutoff was recorded.
    pub fn is_empty(&self) -> bool {
        self.cutoffs.is_empty()
    }

    /// Iterates over flush intervals and their cutoffs in ascending interval order.
    pub fn iter(&self) -> impl Iterator<Item = (Duration, i64)> + '_ {
        self.cutoffs
            .iter()
            .map(|(&interval, &cutoff)| (Duration::from_nanos(interval), cutoff))
    }
}

fn interval_key(interval: Duration) -> u64 {
    u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX)
}

/// An error accessing a [`FlushTimesStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store cannot be reached.
    #[error("flush times store is unavailable")]
    Unavailable,
    /// The store returned an error.
    #[error("flush times store failed: {0}")]
    Backend(String),
}

/// Shared storage for the flush times published by the leader.
///
/// All instances of a replicated deployment read and write the same store.
pub trait FlushTimesStore: Send + Sync + fmt::Debug {
    /// Reads the most recently published flush times.
    fn get(&self) -> Result<FlushTimes, StoreError>;

    /// Replaces the published flush times.
    fn put(&self, flush_times: &FlushTimes) -> Result<(), StoreError>;
}

/// A [`FlushTimesStore`] kept in memory.
///
/// Serves single-instance deployments and tests. Instances sharing one store through an `Arc`
/// coordinate like a replicated deployment.
#[derive(Debug, Default)]
pub struct MemoryFlushTimesStore {
    flush_times: Mutex<FlushTimes>,
    unavailable: AtomicBool,
}

impl MemoryFlushTimesStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes all subsequent reads and writes fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }
}

impl FlushTimesStore for MemoryFlushTimesStore {
    fn get(&self) -> Result<FlushTimes, StoreError> {
        self.check_available()?;
        Ok(self.flush_times.lock().clone())
    }

    fn put(&self, flush_times: &FlushTimes) -> Result<(), StoreError> {
        self.check_available()?;
        flush_times.clone_into(&mut self.flush_times.lock());
        Ok(())
    }
}
