//! Per-metric aggregation state and policy reconciliation.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use bytes::Bytes;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::config::Options;
use crate::elem::{ElemError, ElemRef};
use crate::list::{ListError, MetricLists};
use crate::metric::{MetricKind, MetricUnion};
use crate::policy::{Policy, VersionedPolicies};
use crate::time::duration_nanos;

/// An error adding a sample to an [`Entry`].
#[derive(Debug, thiserror::Error)]
pub enum EntryError {
    /// The sample kind is not known.
    #[error("invalid metric type {0}")]
    InvalidMetric(u8),
    /// The entry expired. Callers should look up a fresh entry.
    #[error("entry is closed")]
    EntryClosed,
    /// A list for a new policy could not be created.
    #[error(transparent)]
    List(#[from] ListError),
    /// An element rejected the sample.
    #[error(transparent)]
    Elem(#[from] ElemError),
}

#[derive(Debug, Default)]
struct EntryState {
    closed: bool,
    /// `None` until the first policy set was applied.
    version: Option<u32>,
    lists: Option<Arc<MetricLists>>,
    aggregations: IndexMap<Policy, ElemRef>,
}

impl EntryState {
    fn should_update_policies(&self, now_nanos: i64, version: u32, cutover_nanos: i64) -> bool {
        match self.version {
            None => true,
            Some(current) => version > current && cutover_nanos <= now_nanos,
        }
    }

    /// Policies are ordered, so a reordered set counts as a change. Repeated policies in the
    /// incoming set count once, at their first position.
    fn has_policy_changes(&self, policies: &[Policy]) -> bool {
        let mut current = self.aggregations.keys();

        for (index, policy) in policies.iter().enumerate() {
            if policies[..index].contains(policy) {
                continue;
            }
            if current.next() != Some(policy) {
                return true;
            }
        }

        current.next().is_some()
    }
}

/// Aggregation state of a single metric id.
///
/// An entry maps each active policy to the element aggregating the metric under that policy.
/// Writers must bracket every write with [`inc_writer`](Self::inc_writer) and
/// [`dec_writer`](Self::dec_writer); an entry with active writers never expires.
#[derive(Debug)]
pub struct Entry {
    opts: Options,
    num_writers: AtomicI32,
    last_access_nanos: AtomicI64,
    state: Mutex<EntryState>,
}

impl Entry {
    /// Creates an entry that is not attached to metric lists yet.
    ///
    /// Writes fail with [`EntryError::EntryClosed`] until [`reset_set_data`](Self::reset_set_data)
    /// attaches the entry.
    pub fn new(opts: Options) -> Self {
        Self {
            opts,
            num_writers: AtomicI32::new(0),
            last_access_nanos: AtomicI64::new(0),
            state: Mutex::new(EntryState::default()),
        }
    }

    /// Reinitializes the entry for use with the given lists.
    pub fn reset_set_data(&mut self, lists: Arc<MetricLists>) {
        *self.num_writers.get_mut() = 0;
        *self.last_access_nanos.get_mut() = self.opts.clock.now_nanos();

        let state = self.state.get_mut();
        state.closed = false;
        state.version = None;
        state.lists = Some(lists);
        state.aggregations.clear();
    }

    /// Registers an in-flight writer.
    pub fn inc_writer(&self) {
        self.num_writers.fetch_add(1, Ordering::AcqRel);
    }

    /// Unregisters an in-flight writer.
    pub fn dec_writer(&self) {
        self.num_writers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Returns the number of in-flight writers.
    pub fn num_writers(&self) -> i32 {
        self.num_writers.load(Ordering::Acquire)
    }

    /// Returns the UNIX timestamp in nanoseconds of the last write.
    pub fn last_access_nanos(&self) -> i64 {
        self.last_access_nanos.load(Ordering::Acquire)
    }

    /// Returns the version of the applied policy set, or `None` before the first write.
    pub fn version(&self) -> Option<u32> {
        self.state.lock().version
    }

    /// Returns `true` once the entry expired.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Returns the active policies and their elements in policy order.
    pub fn aggregations(&self) -> Vec<(Policy, ElemRef)> {
        self.state
            .lock()
            .aggregations
            .iter()
            .map(|(policy, elem)| (*policy, Arc::clone(elem)))
            .collect()
    }

    /// Returns the lists this entry pushes elements to, or `None` once expired.
    pub fn lists(&self) -> Option<Arc<MetricLists>> {
        self.state.lock().lists.clone()
    }

    /// Adds a sample, reconciling the policy set first if `policies` supersedes it.
    ///
    /// The policies are applied if the entry has none yet, or if their version is newer and their
    /// cutover has passed. The sample is then aggregated under every active policy.
    pub fn add_metric_with_policies(
        &self,
        metric: &MetricUnion,
        policies: &VersionedPolicies,
    ) -> Result<(), EntryError> {
        let kind = metric.kind().map_err(EntryError::InvalidMetric)?;

        let now = self.opts.clock.now_nanos();
        let mut state = self.state.lock();
        if state.closed {
            return Err(EntryError::EntryClosed);
        }

        if state.should_update_policies(now, policies.version, policies.cutover_nanos) {
            self.update_policies_with_lock(&mut state, kind, metric, policies)?;
        }

        for elem in state.aggregations.values() {
            elem.lock().add_metric(now, &metric.value)?;
        }
        drop(state);

        self.last_access_nanos.store(now, Ordering::Release);
        Ok(())
    }

    fn update_policies_with_lock(
        &self,
        state: &mut EntryState,
        kind: MetricKind,
        metric: &MetricUnion,
        policies: &VersionedPolicies,
    ) -> Result<(), EntryError> {
        if !state.has_policy_changes(&policies.policies) {
            state.version = Some(policies.version);
            return Ok(());
        }

        let Some(lists) = state.lists.clone() else {
            return Err(EntryError::EntryClosed);
        };

        let id = self.elem_id(state, metric);
        let mut aggregations = IndexMap::with_capacity(policies.policies.len());
        let mut created = Vec::new();

        for policy in &policies.policies {
            if aggregations.contains_key(policy) {
                continue;
            }

            if let Some(elem) = state.aggregations.get(policy) {
                aggregations.insert(*policy, Arc::clone(elem));
                continue;
            }

            let elem = self.opts.elem_pools.get(kind, id.clone(), *policy);
            let pushed = lists
                .find_or_create(policy.window())
                .and_then(|list| list.push_back(elem));

            match pushed {
                Ok(elem) => {
                    created.push(Arc::clone(&elem));
                    aggregations.insert(*policy, elem);
                }
                Err(error) => {
                    // The previous policies stay active. New elements are dropped by their lists.
                    for elem in created {
                        elem.lock().tombstone();
                    }
                    return Err(error.into());
                }
            }
        }

        for (policy, elem) in &state.aggregations {
            if !aggregations.contains_key(policy) {
                elem.lock().tombstone();
            }
        }

        rollup_log::trace!(
            version = policies.version,
            created = created.len(),
            "reconciled entry policies"
        );

        state.aggregations = aggregations;
        state.version = Some(policies.version);
        Ok(())
    }

    /// Returns the id for new elements.
    ///
    /// A sample that does not own its id references a decoder buffer. Existing elements already
    /// hold a private copy, which is shared. Otherwise the id is copied.
    fn elem_id(&self, state: &EntryState, metric: &MetricUnion) -> Bytes {
        if metric.owns_id {
            return metric.id.clone();
        }

        match state.aggregations.values().next() {
            Some(elem) => elem.lock().id().clone(),
            None => Bytes::copy_from_slice(&metric.id),
        }
    }

    /// Returns `true` if the entry is idle for longer than its TTL.
    ///
    /// Closed entries and entries with in-flight writers never expire.
    pub fn should_expire(&self, now_nanos: i64) -> bool {
        let state = self.state.lock();
        self.should_expire_with_lock(&state, now_nanos)
    }

    fn should_expire_with_lock(&self, state: &EntryState, now_nanos: i64) -> bool {
        if state.closed || self.num_writers() > 0 {
            return false;
        }

        now_nanos - self.last_access_nanos() >= duration_nanos(self.opts.entry_ttl)
    }

    /// Expires the entry if it is still idle.
    ///
    /// On success all elements are tombstoned, the entry releases its lists and is closed.
    pub fn try_expire(&self, now_nanos: i64) -> bool {
        let mut state = self.state.lock();
        if !self.should_expire_with_lock(&state, now_nanos) {
            return false;
        }

        for elem in state.aggregations.values() {
            elem.lock().tombstone();
        }

        state.aggregations.clear();
        state.lists = None;
        state.closed = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;
    use std::time::Duration;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::aggregation::{AggregatedValue, CounterValue};
    use crate::elem::MetricElem;
    use crate::metric::MetricValue;
    use crate::time::{Clock, truncate_nanos};

    const NOW: i64 = 1_700_000_123_456_789_000;
    const VERSION: u32 = 2;

    fn policies(raw: &[&str]) -> Vec<Policy> {
        raw.iter().map(|s| s.parse().unwrap()).collect()
    }

    fn test_policies() -> Vec<Policy> {
        policies(&["10s:6h", "1m:2d", "10m:30d"])
    }

    fn test_new_policies() -> Vec<Policy> {
        policies(&["10s:6h", "1m:7d", "5m:7d"])
    }

    fn test_options() -> Options {
        Options::default()
            .with_clock(Clock::manual(NOW))
            .with_entry_ttl(Duration::from_secs(3600))
            .with_min_flush_interval(Duration::ZERO)
    }

    fn test_entry() -> (Entry, Arc<MetricLists>) {
        let opts = test_options();
        let lists = Arc::new(MetricLists::new(opts.clone()));
        let mut entry = Entry::new(opts);
        entry.reset_set_data(Arc::clone(&lists));
        (entry, lists)
    }

    fn since_one_second(version: u32, policies: Vec<Policy>) -> VersionedPolicies {
        VersionedPolicies::effective_since(version, NOW, Duration::from_secs(1), policies)
    }

    fn test_sample(kind: MetricKind) -> MetricUnion {
        match kind {
            MetricKind::Counter => MetricUnion::counter("testCounter", 1234),
            MetricKind::Timer => {
                MetricUnion::batch_timer("testBatchTimer", vec![1.0, 3.5, 2.2, 6.5, 4.8])
            }
            MetricKind::Gauge => MetricUnion::gauge("testGauge", 123.456),
        }
    }

    /// Populates the entry with elements for the test policies, as if they had been applied.
    fn populate(entry: &Entry, kind: MetricKind) {
        let sample = test_sample(kind);
        let mut state = entry.state.lock();
        let lists = state.lists.clone().unwrap();
        for policy in test_policies() {
            let elem = entry.opts.elem_pools.get(kind, sample.id.clone(), policy);
            let list = lists.find_or_create(policy.window()).unwrap();
            let elem = list.push_back(elem).unwrap();
            state.aggregations.insert(policy, elem);
        }
        state.version = Some(VERSION);
    }

    fn check_value(elem: &MetricElem, kind: MetricKind, policy: &Policy) {
        let snapshot = elem.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, truncate_nanos(NOW, policy.window()));

        match (kind, snapshot[0].1) {
            (MetricKind::Counter, AggregatedValue::Counter(v)) => assert_eq!(v.sum, 1234),
            (MetricKind::Timer, AggregatedValue::Timer(v)) => assert_eq!(v.sum, 18.0),
            (MetricKind::Gauge, AggregatedValue::Gauge(v)) => assert_eq!(v.last, 123.456),
            (kind, value) => panic!("unexpected {value:?} for {kind}"),
        }
    }

    fn check_tombstoned(lists: &MetricLists, resolutions: &[&str], deleted: &[Policy]) {
        for resolution in resolutions {
            let policy: Policy = format!("{resolution}:1h").parse().unwrap();
            let list = lists.get(policy.window()).unwrap();
            for elem in list.elems() {
                let elem = elem.lock();
                assert_eq!(
                    elem.is_tombstoned(),
                    deleted.contains(&elem.policy()),
                    "{}",
                    elem.policy()
                );
            }
        }
    }

    fn list_lengths(lists: &MetricLists, resolutions: &[&str]) -> Vec<usize> {
        resolutions
            .iter()
            .map(|r| {
                let policy: Policy = format!("{r}:1h").parse().unwrap();
                lists.get(policy.window()).map_or(0, |list| list.len())
            })
            .collect()
    }

    const KINDS: [MetricKind; 3] = [MetricKind::Counter, MetricKind::Timer, MetricKind::Gauge];

    #[test]
    fn test_inc_dec_writer() {
        let entry = Arc::new(Entry::new(test_options()));
        assert_eq!(entry.num_writers(), 0);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let entry = Arc::clone(&entry);
                thread::spawn(move || entry.inc_writer())
            })
            .collect();
        handles.into_iter().for_each(|h| h.join().unwrap());
        assert_eq!(entry.num_writers(), 10);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let entry = Arc::clone(&entry);
                thread::spawn(move || entry.dec_writer())
            })
            .collect();
        handles.into_iter().for_each(|h| h.join().unwrap());
        assert_eq!(entry.num_writers(), 0);
    }

    #[test]
    fn test_reset_set_data() {
        let (entry, lists) = test_entry();

        assert!(!entry.is_closed());
        assert!(Arc::ptr_eq(&entry.lists().unwrap(), &lists));
        assert_eq!(entry.version(), None);
        assert_eq!(entry.num_writers(), 0);
        assert_eq!(entry.last_access_nanos(), NOW);
    }

    #[test]
    fn test_unattached_entry_is_closed() {
        let entry = Entry::new(test_options());
        let result = entry.add_metric_with_policies(
            &test_sample(MetricKind::Counter),
            &since_one_second(1, test_policies()),
        );
        assert!(matches!(result, Err(EntryError::EntryClosed)));
    }

    #[test]
    fn test_has_policy_changes_different_length() {
        let (entry, _) = test_entry();
        assert!(entry.state.lock().has_policy_changes(&test_policies()));
    }

    #[test]
    fn test_has_policy_changes_same_length_different_policies() {
        let (entry, _) = test_entry();
        populate(&entry, MetricKind::Counter);

        let mut changed = test_policies();
        changed[2].retention -= Duration::from_secs(1);
        assert!(entry.state.lock().has_policy_changes(&changed));
    }

    #[test]
    fn test_has_policy_changes_same_policies() {
        let (entry, _) = test_entry();
        populate(&entry, MetricKind::Counter);
        assert!(!entry.state.lock().has_policy_changes(&test_policies()));
    }

    #[test]
    fn test_has_policy_changes_reordered() {
        let (entry, _) = test_entry();
        populate(&entry, MetricKind::Counter);

        let mut reordered = test_policies();
        reordered.swap(0, 1);
        assert!(entry.state.lock().has_policy_changes(&reordered));
    }

    #[test]
    fn test_has_policy_changes_repeated_policies() {
        let (entry, _) = test_entry();
        populate(&entry, MetricKind::Counter);

        let repeated = policies(&["10s:6h", "10s:6h", "1m:2d", "10m:30d", "1m:2d"]);
        assert!(!entry.state.lock().has_policy_changes(&repeated));

        let shorter = policies(&["10s:6h", "10s:6h", "1m:2d"]);
        assert!(entry.state.lock().has_policy_changes(&shorter));
    }

    #[test]
    fn test_add_metric_repeated_policies_keep_elems() {
        let (entry, lists) = test_entry();
        populate(&entry, MetricKind::Counter);
        let before: Vec<ElemRef> = entry.aggregations().into_iter().map(|(_, e)| e).collect();

        let repeated = policies(&["10s:6h", "1m:2d", "1m:2d", "10m:30d"]);
        entry
            .add_metric_with_policies(
                &test_sample(MetricKind::Counter),
                &since_one_second(VERSION + 1, repeated),
            )
            .unwrap();

        assert_eq!(entry.version(), Some(VERSION + 1));
        let after: Vec<ElemRef> = entry.aggregations().into_iter().map(|(_, e)| e).collect();
        assert_eq!(after.len(), before.len());
        assert!(before.iter().zip(&after).all(|(a, b)| Arc::ptr_eq(a, b)));
        assert_eq!(list_lengths(&lists, &["10s", "1m", "10m"]), vec![1, 1, 1]);
        check_tombstoned(&lists, &["10s", "1m", "10m"], &[]);
    }

    #[test]
    fn test_should_update_policies() {
        let (entry, _) = test_entry();
        let cutover = NOW - 1_000_000_000;
        let mut state = entry.state.lock();

        // An entry without policies takes any version.
        assert!(state.should_update_policies(NOW, 0, cutover));

        // Newer versions apply once their cutover has passed.
        state.version = Some(2);
        assert!(state.should_update_policies(NOW, 3, cutover));
        assert!(!state.should_update_policies(NOW, 2, cutover));
        assert!(!state.should_update_policies(NOW, 1, cutover));
        assert!(!state.should_update_policies(NOW, 3, NOW + 1_000_000_000));
    }

    #[test]
    fn test_add_metric_no_policy_update() {
        rollup_log::init_test!();

        for kind in KINDS {
            let (entry, lists) = test_entry();
            populate(&entry, kind);

            entry
                .add_metric_with_policies(
                    &test_sample(kind),
                    &since_one_second(VERSION, test_policies()),
                )
                .unwrap();

            assert_eq!(entry.last_access_nanos(), NOW);
            assert_eq!(entry.version(), Some(VERSION));
            for (policy, elem) in entry.aggregations() {
                check_value(&elem.lock(), kind, &policy);
            }

            assert_eq!(lists.len(), 3);
            assert_eq!(list_lengths(&lists, &["10s", "1m", "10m"]), vec![1, 1, 1]);
            check_tombstoned(&lists, &["10s", "1m", "10m"], &[]);
        }
    }

    #[test]
    fn test_add_metric_policy_update_without_changes() {
        for kind in KINDS {
            let (entry, lists) = test_entry();
            populate(&entry, kind);

            entry
                .add_metric_with_policies(
                    &test_sample(kind),
                    &since_one_second(VERSION + 1, test_policies()),
                )
                .unwrap();

            assert_eq!(entry.version(), Some(VERSION + 1));
            assert_eq!(list_lengths(&lists, &["10s", "1m", "10m"]), vec![1, 1, 1]);
            check_tombstoned(&lists, &["10s", "1m", "10m"], &[]);
        }
    }

    #[test]
    fn test_add_metric_policy_update_reuses_elem_id() {
        for kind in KINDS {
            let (entry, lists) = test_entry();
            populate(&entry, kind);
            let old_policies = test_policies();

            let kept_elem = entry.aggregations()[0].1.clone();
            let existing_id = kept_elem.lock().id().clone();

            entry
                .add_metric_with_policies(
                    &test_sample(kind),
                    &since_one_second(VERSION + 1, test_new_policies()),
                )
                .unwrap();

            assert_eq!(entry.version(), Some(VERSION + 1));
            let aggregations = entry.aggregations();
            let active: Vec<Policy> = aggregations.iter().map(|(p, _)| *p).collect();
            assert_eq!(active, test_new_policies());

            // The element for the retained policy is untouched.
            assert!(Arc::ptr_eq(&aggregations[0].1, &kept_elem));

            // New elements share the buffer of the existing id.
            for (_, elem) in &aggregations[1..] {
                let elem = elem.lock();
                assert_eq!(elem.id(), &existing_id);
                assert_eq!(elem.id().as_ptr(), existing_id.as_ptr());
            }

            for (policy, elem) in &aggregations {
                check_value(&elem.lock(), kind, policy);
            }

            assert_eq!(lists.len(), 4);
            assert_eq!(
                list_lengths(&lists, &["10s", "1m", "10m", "5m"]),
                vec![1, 2, 1, 1]
            );
            check_tombstoned(
                &lists,
                &["10s", "1m", "10m", "5m"],
                &[old_policies[1], old_policies[2]],
            );
        }
    }

    #[test]
    fn test_add_metric_first_policies_copy_id() {
        for kind in KINDS {
            let (entry, lists) = test_entry();
            let sample = test_sample(kind);

            entry
                .add_metric_with_policies(&sample, &since_one_second(VERSION + 1, test_policies()))
                .unwrap();

            assert_eq!(entry.version(), Some(VERSION + 1));
            for (policy, elem) in entry.aggregations() {
                let elem = elem.lock();
                assert_eq!(elem.id(), &sample.id);
                assert_ne!(elem.id().as_ptr(), sample.id.as_ptr());
                check_value(&elem, kind, &policy);
            }
            assert_eq!(list_lengths(&lists, &["10s", "1m", "10m"]), vec![1, 1, 1]);
        }
    }

    #[test]
    fn test_add_metric_first_policies_owned_id() {
        for kind in KINDS {
            let (entry, _) = test_entry();
            let sample = test_sample(kind).with_owned_id();

            entry
                .add_metric_with_policies(&sample, &since_one_second(VERSION + 1, test_policies()))
                .unwrap();

            for (_, elem) in entry.aggregations() {
                assert_eq!(elem.lock().id().as_ptr(), sample.id.as_ptr());
            }
        }
    }

    #[test]
    fn test_reconciliation_is_idempotent() {
        let (entry, lists) = test_entry();
        let sample = test_sample(MetricKind::Counter);

        entry
            .add_metric_with_policies(&sample, &since_one_second(3, test_policies()))
            .unwrap();
        let before: Vec<_> = entry.aggregations();

        entry
            .add_metric_with_policies(&sample, &since_one_second(4, test_policies()))
            .unwrap();
        let after: Vec<_> = entry.aggregations();

        assert_eq!(entry.version(), Some(4));
        for ((_, a), (_, b)) in before.iter().zip(&after) {
            assert!(Arc::ptr_eq(a, b));
        }
        assert_eq!(list_lengths(&lists, &["10s", "1m", "10m"]), vec![1, 1, 1]);
        check_tombstoned(&lists, &["10s", "1m", "10m"], &[]);

        // Both samples landed in the same window.
        let counter = after[0].1.lock().snapshot()[0].1;
        assert_eq!(
            counter,
            AggregatedValue::Counter(CounterValue {
                sum: 2468,
                count: 2
            })
        );
    }

    #[test]
    fn test_pending_cutover_is_ignored() {
        let (entry, _) = test_entry();
        populate(&entry, MetricKind::Counter);

        let pending = VersionedPolicies::new(
            VERSION + 1,
            NOW + 1_000_000_000,
            test_new_policies(),
        );
        entry
            .add_metric_with_policies(&test_sample(MetricKind::Counter), &pending)
            .unwrap();

        assert_eq!(entry.version(), Some(VERSION));
        let active: Vec<Policy> = entry.aggregations().iter().map(|(p, _)| *p).collect();
        assert_eq!(active, test_policies());
    }

    #[test]
    fn test_add_metric_errors() {
        let (entry, lists) = test_entry();
        entry.state.lock().version = Some(VERSION);
        let policies = since_one_second(VERSION + 1, test_new_policies());

        let invalid = MetricUnion::new("invalid", MetricValue::Unknown(42));
        assert!(matches!(
            entry.add_metric_with_policies(&invalid, &policies),
            Err(EntryError::InvalidMetric(42))
        ));

        entry.state.lock().closed = true;
        assert!(matches!(
            entry.add_metric_with_policies(&test_sample(MetricKind::Counter), &policies),
            Err(EntryError::EntryClosed)
        ));

        entry.state.lock().closed = false;
        lists.close();
        assert!(matches!(
            entry.add_metric_with_policies(&test_sample(MetricKind::Counter), &policies),
            Err(EntryError::List(ListError::ListsClosed))
        ));
        assert_eq!(entry.version(), Some(VERSION));
        assert!(entry.aggregations().is_empty());
    }

    #[test]
    fn test_failed_reconciliation_tombstones_new_elems() {
        let (entry, lists) = test_entry();
        populate(&entry, MetricKind::Counter);

        // Lists for 10s, 1m and 10m exist. Closing the 10m list only fails the first new
        // policy after the 1m/7d element was already created.
        let one_minute = lists.get(Duration::from_secs(60)).unwrap();
        let policies = since_one_second(
            VERSION + 1,
            policies(&["10s:6h", "1m:7d", "10m:7d"]),
        );
        lists.get(Duration::from_secs(600)).unwrap().close();

        let result =
            entry.add_metric_with_policies(&test_sample(MetricKind::Counter), &policies);
        assert!(matches!(
            result,
            Err(EntryError::List(ListError::ListClosed))
        ));

        assert_eq!(entry.version(), Some(VERSION));
        let active: Vec<Policy> = entry.aggregations().iter().map(|(p, _)| *p).collect();
        assert_eq!(active, test_policies());

        let tombstoned: HashSet<String> = one_minute
            .elems()
            .iter()
            .filter(|e| e.lock().is_tombstoned())
            .map(|e| e.lock().policy().to_string())
            .collect();
        assert_eq!(tombstoned, HashSet::from(["1m@1m:168h".to_owned()]));
    }

    #[test]
    fn test_should_expire() {
        let (entry, _) = test_entry();
        let ttl = duration_nanos(Duration::from_secs(3600));
        let second = 1_000_000_000;

        // Still within the TTL.
        assert!(!entry.should_expire(NOW + ttl - second));
        assert!(entry.should_expire(NOW + ttl));

        entry.state.lock().closed = true;
        assert!(!entry.should_expire(NOW + ttl + second));

        entry.state.lock().closed = false;
        entry.inc_writer();
        assert!(!entry.should_expire(NOW + ttl + second));
        assert!(!entry.try_expire(NOW + ttl + second));
        entry.dec_writer();
    }

    #[test]
    fn test_try_expire() {
        let (entry, _) = test_entry();
        populate(&entry, MetricKind::Counter);
        let elems: Vec<ElemRef> = entry.aggregations().into_iter().map(|(_, e)| e).collect();

        assert!(!entry.try_expire(NOW));

        let expired_at = NOW + duration_nanos(Duration::from_secs(3601));
        assert!(entry.try_expire(expired_at));
        assert!(entry.is_closed());
        assert!(entry.aggregations().is_empty());
        assert!(entry.lists().is_none());
        for elem in elems {
            assert!(elem.lock().is_tombstoned());
        }

        // A closed entry is never expired again.
        assert!(!entry.try_expire(expired_at));
    }

    #[test]
    fn test_concurrent_writers_converge() {
        let (entry, lists) = test_entry();
        let entry = Arc::new(entry);

        let handles: Vec<_> = (0..8u32)
            .map(|i| {
                let entry = Arc::clone(&entry);
                thread::spawn(move || {
                    let policies = if i % 2 == 0 {
                        test_policies()
                    } else {
                        test_new_policies()
                    };
                    entry.inc_writer();
                    let result = entry.add_metric_with_policies(
                        &test_sample(MetricKind::Counter),
                        &since_one_second(10 + i % 2, policies),
                    );
                    entry.dec_writer();
                    result
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        // Version 11 is newer, so it wins regardless of the order of writes.
        assert_eq!(entry.version(), Some(11));
        assert_eq!(entry.num_writers(), 0);
        let active: Vec<Policy> = entry.aggregations().iter().map(|(p, _)| *p).collect();
        assert_eq!(active, test_new_policies());
        assert!(lists.len() >= 3);
    }
}
