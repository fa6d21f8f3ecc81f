//! Registry of entries keyed by metric id.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::RwLock;
use rollup_statsd::metric;

use crate::config::Options;
use crate::entry::{Entry, EntryError};
use crate::list::MetricLists;
use crate::metric::MetricUnion;
use crate::policy::VersionedPolicies;
use crate::pool::ObjectPool;
use crate::statsd::{AggregatorCounters, AggregatorGauges, AggregatorTimers};

/// An error adding a sample to the [`MetricMap`].
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    /// The map was closed.
    #[error("metric map is closed")]
    Closed,
    /// The entry rejected the sample.
    #[error(transparent)]
    Entry(#[from] EntryError),
}

impl MapError {
    /// Returns a short name of the error, used as tag value.
    pub fn as_str(&self) -> &'static str {
        match self {
            MapError::Closed => "map_closed",
            MapError::Entry(EntryError::InvalidMetric(_)) => "invalid_metric",
            MapError::Entry(EntryError::EntryClosed) => "entry_closed",
            MapError::Entry(EntryError::List(_)) => "list",
            MapError::Entry(EntryError::Elem(_)) => "elem",
        }
    }
}

struct MapInner {
    closed: bool,
    entries: HashMap<Bytes, Arc<Entry>>,
}

/// All entries of an aggregator.
///
/// Entries are created on the first sample of a metric id and expired by [`tick`](Self::tick) once
/// they are idle for longer than the entry TTL.
pub struct MetricMap {
    opts: Options,
    lists: Arc<MetricLists>,
    entry_pool: ObjectPool<Entry>,
    inner: RwLock<MapInner>,
}

impl MetricMap {
    /// Creates an empty map whose entries push elements to `lists`.
    pub fn new(lists: Arc<MetricLists>, opts: Options) -> Self {
        let entry_opts = opts.clone();
        Self {
            entry_pool: ObjectPool::new(opts.entry_pool_capacity, move || {
                Entry::new(entry_opts.clone())
            }),
            opts,
            lists,
            inner: RwLock::new(MapInner {
                closed: false,
                entries: HashMap::new(),
            }),
        }
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Returns `true` if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the entry for the given id, if it exists.
    pub fn get(&self, id: &[u8]) -> Option<Arc<Entry>> {
        self.inner.read().entries.get(id).cloned()
    }

    /// Aggregates a sample with the given policies.
    ///
    /// The batch timer buffer of the sample is returned to its pool afterwards.
    pub fn add_metric_with_policies(
        &self,
        metric: MetricUnion,
        policies: &VersionedPolicies,
    ) -> Result<(), MapError> {
        let result = self.add_with_retry(&metric, policies);
        metric.release_timer_values();

        if let Err(error) = &result {
            metric!(
                counter(AggregatorCounters::AddMetricErrors) += 1,
                reason = error.as_str()
            );
        }

        result
    }

    fn add_with_retry(
        &self,
        metric: &MetricUnion,
        policies: &VersionedPolicies,
    ) -> Result<(), MapError> {
        let entry = self.find_or_create(metric)?;
        let result = entry.add_metric_with_policies(metric, policies);
        entry.dec_writer();

        match result {
            Err(EntryError::EntryClosed) => {
                rollup_log::debug!("entry closed during write, retrying with a new entry");
                self.remove_entry(&metric.id, &entry);

                let entry = self.find_or_create(metric)?;
                let result = entry.add_metric_with_policies(metric, policies);
                entry.dec_writer();
                Ok(result?)
            }
            result => Ok(result?),
        }
    }

    /// Looks up or creates the entry for the sample and registers a writer on it.
    ///
    /// The writer is registered while the map lock is held, so the entry cannot expire before the
    /// caller writes to it.
    fn find_or_create(&self, metric: &MetricUnion) -> Result<Arc<Entry>, MapError> {
        {
            let inner = self.inner.read();
            if inner.closed {
                return Err(MapError::Closed);
            }
            if let Some(entry) = inner.entries.get(&metric.id) {
                entry.inc_writer();
                return Ok(Arc::clone(entry));
            }
        }

        let mut inner = self.inner.write();
        if inner.closed {
            return Err(MapError::Closed);
        }
        if let Some(entry) = inner.entries.get(&metric.id) {
            entry.inc_writer();
            return Ok(Arc::clone(entry));
        }

        let mut entry = self.entry_pool.get();
        entry.reset_set_data(Arc::clone(&self.lists));
        let entry = Arc::new(entry);
        entry.inc_writer();

        let id = if metric.owns_id {
            metric.id.clone()
        } else {
            Bytes::copy_from_slice(&metric.id)
        };
        inner.entries.insert(id, Arc::clone(&entry));
        metric!(counter(AggregatorCounters::EntriesCreated) += 1);

        Ok(entry)
    }

    fn remove_entry(&self, id: &Bytes, entry: &Arc<Entry>) {
        let mut inner = self.inner.write();
        if let Some(current) = inner.entries.get(id) {
            if Arc::ptr_eq(current, entry) {
                inner.entries.remove(id);
            }
        }
    }

    /// Expires all entries that are idle for longer than the entry TTL.
    ///
    /// Returns the number of expired entries.
    pub fn tick(&self) -> usize {
        let start = Instant::now();
        let now = self.opts.clock.now_nanos();

        let candidates: Vec<(Bytes, Arc<Entry>)> = self
            .inner
            .read()
            .entries
            .iter()
            .filter(|(_, entry)| entry.should_expire(now))
            .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
            .collect();

        let mut expired = Vec::new();
        let remaining = {
            let mut inner = self.inner.write();
            for (id, entry) in candidates {
                if entry.try_expire(now) {
                    inner.entries.remove(&id);
                    expired.push(entry);
                }
            }
            inner.entries.len()
        };

        let num_expired = expired.len();
        for entry in expired {
            if let Ok(entry) = Arc::try_unwrap(entry) {
                self.entry_pool.put(entry);
            }
        }

        metric!(counter(AggregatorCounters::EntriesExpired) += num_expired as i64);
        metric!(gauge(AggregatorGauges::Entries) = remaining as u64);
        metric!(timer(AggregatorTimers::TickDuration) = start.elapsed());

        if num_expired > 0 {
            rollup_log::debug!(expired = num_expired, remaining, "expired idle entries");
        }

        num_expired
    }

    /// Drops all entries and rejects further samples.
    pub fn close(&self) {
        let mut inner = self.inner.write();
        inner.closed = true;
        inner.entries.clear();
    }
}

impl std::fmt::Debug for MetricMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricMap")
            .field("entries", &self.len())
            .field("entry_pool", &self.entry_pool)
            .finish_non_exhaustive()
    }
}
