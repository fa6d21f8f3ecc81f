use std::fmt;

use parking_lot::Mutex;

/// A bounded free-list of reusable objects.
///
/// [`get`](Self::get) hands out a pooled object or allocates a fresh one when the pool is empty.
/// [`put`](Self::put) returns an object to the pool, dropping it once the pool holds `capacity`
/// objects. A pool with zero capacity never retains anything and allocates on every `get`.
///
/// Callers are responsible for resetting objects before returning them.
pub struct ObjectPool<T> {
    capacity: usize,
    free: Mutex<Vec<T>>,
    alloc: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T> ObjectPool<T> {
    /// Creates a pool retaining at most `capacity` objects, allocating with `alloc`.
    pub fn new(capacity: usize, alloc: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            capacity,
            free: Mutex::new(Vec::with_capacity(capacity.min(1024))),
            alloc: Box::new(alloc),
        }
    }

    /// Takes an object from the pool, or allocates a new one.
    pub fn get(&self) -> T {
        match self.free.lock().pop() {
            Some(value) => value,
            None => (self.alloc)(),
        }
    }

    /// Returns an object to the pool.
    pub fn put(&self, value: T) {
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(value);
        }
    }

    /// Returns the number of idle objects in the pool.
    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    /// Returns `true` if no idle objects are available.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the maximum number of idle objects the pool retains.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Default + 'static> ObjectPool<T> {
    /// Creates a pool that allocates with [`Default::default`].
    pub fn with_default(capacity: usize) -> Self {
        Self::new(capacity, T::default)
    }
}

impl<T> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("capacity", &self.capacity)
            .field("idle", &self.len())
            .finish()
    }
}

/// Pool of buffers backing batch timer values.
pub type TimerValuePool = ObjectPool<Vec<f64>>;

impl TimerValuePool {
    /// Takes a cleared buffer with room for at least `capacity` values.
    pub fn get_with_capacity(&self, capacity: usize) -> Vec<f64> {
        let mut values = self.get();
        values.clear();
        values.reserve(capacity);
        values
    }
}
