//! Time sources and window alignment helpers.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Converts a [`Duration`] into signed nanoseconds, saturating at [`i64::MAX`].
pub fn duration_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

/// Truncates a UNIX timestamp in nanoseconds to the start of its window.
///
/// A zero window leaves the timestamp unchanged.
pub fn truncate_nanos(nanos: i64, window: Duration) -> i64 {
    let window = duration_nanos(window);
    if window <= 0 {
        return nanos;
    }
    nanos - nanos.rem_euclid(window)
}

#[derive(Clone, Debug)]
enum Source {
    System,
    Manual(Arc<AtomicI64>),
}

/// The clock used by entries, lists and the flush manager.
///
/// The system clock reads the wall time. A manual clock only moves when it is told to, which makes
/// window alignment and expiration deterministic in tests. Clones of a manual clock share the same
/// time.
#[derive(Clone, Debug)]
pub struct Clock(Source);

impl Clock {
    /// Returns a clock reading the system time.
    pub fn system() -> Self {
        Self(Source::System)
    }

    /// Returns a manual clock starting at the given UNIX timestamp in nanoseconds.
    pub fn manual(start_nanos: i64) -> Self {
        Self(Source::Manual(Arc::new(AtomicI64::new(start_nanos))))
    }

    /// Returns the current UNIX timestamp in nanoseconds.
    pub fn now_nanos(&self) -> i64 {
        match &self.0 {
            Source::System => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(duration_nanos)
                .unwrap_or_default(),
            Source::Manual(nanos) => nanos.load(Ordering::Acquire),
        }
    }

    /// Moves a manual clock forward.
    ///
    /// Has no effect on the system clock.
    pub fn advance(&self, by: Duration) {
        if let Source::Manual(nanos) = &self.0 {
            nanos.fetch_add(duration_nanos(by), Ordering::AcqRel);
        }
    }

    /// Sets a manual clock to the given UNIX timestamp in nanoseconds.
    ///
    /// Has no effect on the system clock.
    pub fn set_nanos(&self, value: i64) {
        if let Source::Manual(nanos) = &self.0 {
            nanos.store(value, Ordering::Release);
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}
