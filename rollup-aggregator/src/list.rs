//! Per-resolution lists of aggregation elements.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rollup_statsd::metric;

use crate::config::Options;
use crate::elem::{ElemPools, ElemRef, MetricElem};
use crate::flush::{FlushManager, FlushManagerError, Flusher};
use crate::policy::FormatDuration;
use crate::statsd::{AggregatorCounters, AggregatorGauges};
use crate::writer::{WriteError, Writer};

/// Whether a flush hands consumed windows to the writer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FlushMode {
    /// Writes consumed windows downstream.
    Write,
    /// Drops consumed windows. Used by followers to mirror the leader.
    Discard,
}

impl FlushMode {
    /// Returns the name of the mode, used as tag value.
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushMode::Write => "write",
            FlushMode::Discard => "discard",
        }
    }
}

/// Parameters of a single flush.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FlushRequest {
    /// Windows ending at or before this UNIX timestamp in nanoseconds are consumed.
    pub cutoff_nanos: i64,
    /// What happens with consumed windows.
    pub mode: FlushMode,
}

/// Outcome of a successful flush.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlushStats {
    /// Number of consumed windows across all elements.
    pub windows: usize,
    /// Number of drained tombstoned elements removed from the list.
    pub removed: usize,
}

/// An error mutating metric lists.
#[derive(Debug, thiserror::Error)]
pub enum ListError {
    /// The list no longer accepts elements.
    #[error("metric list is closed")]
    ListClosed,
    /// The lists were closed and no longer create lists.
    #[error("metric lists are closed")]
    ListsClosed,
    /// A new list could not be registered for flushing.
    #[error("failed to register metric list")]
    Register(#[source] FlushManagerError),
}

/// An error flushing a metric list.
#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    /// The writer rejected a window. It is retried on the next flush.
    #[error("failed to write aggregated window")]
    Write(#[from] WriteError),
}

struct ListInner {
    closed: bool,
    elems: Vec<ElemRef>,
    writer: Box<dyn Writer>,
    last_flushed_nanos: i64,
}

/// Ordered collection of all elements sharing one resolution.
pub struct MetricList {
    resolution: Duration,
    flush_interval: Duration,
    resolution_tag: String,
    elem_pools: Arc<ElemPools>,
    inner: Mutex<ListInner>,
}

impl MetricList {
    /// Creates a list for the given resolution.
    ///
    /// The list flushes every `max(resolution, min_flush_interval)`.
    pub fn new(resolution: Duration, opts: &Options) -> Self {
        Self {
            resolution,
            flush_interval: resolution.max(opts.min_flush_interval),
            resolution_tag: FormatDuration(resolution).to_string(),
            elem_pools: Arc::clone(&opts.elem_pools),
            inner: Mutex::new(ListInner {
                closed: false,
                elems: Vec::new(),
                writer: opts.handler.new_writer(),
                last_flushed_nanos: 0,
            }),
        }
    }

    /// Returns the resolution window of all elements in this list.
    pub fn resolution(&self) -> Duration {
        self.resolution
    }

    /// Returns the number of elements, including tombstoned ones.
    pub fn len(&self) -> usize {
        self.inner.lock().elems.len()
    }

    /// Returns `true` if the list holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once the list was closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Returns handles to all elements in list order.
    pub fn elems(&self) -> Vec<ElemRef> {
        self.inner.lock().elems.clone()
    }

    /// Appends an element and returns its handle.
    pub fn push_back(&self, elem: MetricElem) -> Result<ElemRef, ListError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ListError::ListClosed);
        }

        let elem = Arc::new(Mutex::new(elem));
        inner.elems.push(Arc::clone(&elem));
        Ok(elem)
    }

    /// Closes the list. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }

        inner.closed = true;
        if let Err(error) = inner.writer.close() {
            rollup_log::warn!(
                error = &error as &dyn std::error::Error,
                resolution = self.resolution_tag,
                "failed to close list writer"
            );
        }

        true
    }

    fn release(&self, elem: ElemRef) {
        // Entries drop their handle before tombstoning completes, so this usually succeeds.
        if let Ok(elem) = Arc::try_unwrap(elem) {
            self.elem_pools.put(elem.into_inner());
        }
    }
}

impl Flusher for MetricList {
    fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Consumes eligible windows of all elements.
    ///
    /// A write error stops the flush. Windows that were not written stay in place and the error
    /// is returned, so the next flush retries them. A closed list does not flush, its writer
    /// was already released.
    fn flush(&self, request: FlushRequest) -> Result<FlushStats, FlushError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(FlushStats::default());
        }

        let ListInner {
            elems,
            writer,
            last_flushed_nanos,
            ..
        } = &mut *inner;

        let mut stats = FlushStats::default();
        let mut result = Ok(());

        for elem in elems.iter() {
            match elem
                .lock()
                .consume(request.cutoff_nanos, request.mode, &mut **writer)
            {
                Ok(consumed) => stats.windows += consumed,
                Err(error) => {
                    result = Err(FlushError::Write(error));
                    break;
                }
            }
        }

        let mut drained = Vec::new();
        elems.retain(|elem| {
            let is_drained = elem.lock().is_drained();
            if is_drained {
                drained.push(Arc::clone(elem));
            }
            !is_drained
        });
        stats.removed = drained.len();
        for elem in drained {
            self.release(elem);
        }

        if result.is_ok() && request.mode == FlushMode::Write {
            result = writer.flush().map_err(FlushError::Write);
        }

        if result.is_ok() {
            *last_flushed_nanos = request.cutoff_nanos;
        }

        let remaining = elems.len();
        drop(inner);

        metric!(
            counter(AggregatorCounters::WindowsFlushed) += stats.windows as i64,
            resolution = &self.resolution_tag,
            mode = request.mode.as_str(),
        );
        metric!(
            counter(AggregatorCounters::ElemsRemoved) += stats.removed as i64,
            resolution = &self.resolution_tag,
        );
        metric!(
            gauge(AggregatorGauges::ListElems) = remaining as u64,
            resolution = &self.resolution_tag,
        );

        result.map(|()| stats)
    }

    fn last_flushed_nanos(&self) -> i64 {
        self.inner.lock().last_flushed_nanos
    }
}

impl std::fmt::Debug for MetricList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricList")
            .field("resolution", &self.resolution)
            .field("flush_interval", &self.flush_interval)
            .finish_non_exhaustive()
    }
}

struct ListsInner {
    closed: bool,
    lists: HashMap<Duration, Arc<MetricList>>,
}

/// Registry of metric lists keyed by resolution.
///
/// Lists are created on first use and registered with the flush manager, if one is configured.
pub struct MetricLists {
    opts: Options,
    inner: RwLock<ListsInner>,
}

impl MetricLists {
    /// Creates an empty registry.
    pub fn new(opts: Options) -> Self {
        Self {
            opts,
            inner: RwLock::new(ListsInner {
                closed: false,
                lists: HashMap::new(),
            }),
        }
    }

    /// Returns the number of lists.
    pub fn len(&self) -> usize {
        self.inner.read().lists.len()
    }

    /// Returns `true` if no list was created yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once the registry was closed.
    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    /// Returns the list for the given resolution, if it exists.
    pub fn get(&self, resolution: Duration) -> Option<Arc<MetricList>> {
        self.inner.read().lists.get(&resolution).cloned()
    }

    /// Returns the list for the given resolution, creating and registering it if necessary.
    pub fn find_or_create(&self, resolution: Duration) -> Result<Arc<MetricList>, ListError> {
        {
            let inner = self.inner.read();
            if inner.closed {
                return Err(ListError::ListsClosed);
            }
            if let Some(list) = inner.lists.get(&resolution) {
                return Ok(Arc::clone(list));
            }
        }

        let mut inner = self.inner.write();
        if inner.closed {
            return Err(ListError::ListsClosed);
        }
        if let Some(list) = inner.lists.get(&resolution) {
            return Ok(Arc::clone(list));
        }

        let list = Arc::new(MetricList::new(resolution, &self.opts));
        if let Some(flush_manager) = &self.opts.flush_manager {
            flush_manager
                .register(Arc::clone(&list) as Arc<dyn Flusher>)
                .map_err(ListError::Register)?;
        }

        inner.lists.insert(resolution, Arc::clone(&list));
        metric!(gauge(AggregatorGauges::Lists) = inner.lists.len() as u64);
        rollup_log::debug!(
            resolution = %FormatDuration(resolution),
            "created metric list"
        );

        Ok(list)
    }

    /// Closes all lists and unregisters them from the flush manager.
    ///
    /// Subsequent calls have no effect.
    pub fn close(&self) {
        let mut inner = self.inner.write();
        if inner.closed {
            return;
        }
        inner.closed = true;

        for list in inner.lists.values() {
            list.close();
            if let Some(flush_manager) = &self.opts.flush_manager {
                unregister(flush_manager, list);
            }
        }
    }
}

fn unregister(flush_manager: &FlushManager, list: &Arc<MetricList>) {
    let flusher = Arc::clone(list) as Arc<dyn Flusher>;
    match flush_manager.unregister(&flusher) {
        // A closed manager no longer holds any flushers.
        Ok(()) | Err(FlushManagerError::Closed) => {}
        Err(error) => {
            rollup_log::debug!(
                error = &error as &dyn std::error::Error,
                "failed to unregister metric list"
            );
        }
    }
}

impl std::fmt::Debug for MetricLists {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("MetricLists")
            .field("closed", &inner.closed)
            .field("resolutions", &inner.lists.keys().collect::<Vec<_>>())
            .finish()
    }
}
