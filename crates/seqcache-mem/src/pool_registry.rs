//! Cache of idle page pools.
//!
//! Pool construction is not cheap (temp file, fallocate, mmap, mlock), and
//! encrypted mappings come and go with every overflow page. The registry
//! keeps a handful of idle pools around, matched by `(size, page_size)` on
//! the next request, and ages out pools that have sat unused too long.

use parking_lot::Mutex;
use tracing::debug;

use crate::page_pool::PagePool;
use crate::MemError;

/// Maximum number of idle pools kept.
const POOL_CAPACITY: usize = 10;

/// An idle pool older than this many allocation ticks is dropped.
const AGE_THRESHOLD: u64 = 10;

/// A pruning sweep runs once every this many allocations.
const PRUNE_TRIGGER: u64 = 10;

struct IdlePool {
    /// Virtual timestamp at which the pool became idle.
    stamp: u64,
    pool: PagePool,
}

/// A bounded registry of reusable [`PagePool`]s.
///
/// The registry is an ordinary injected object — typically shared through
/// the [`MmapFactory`](crate::MmapFactory) that owns it — not a hidden
/// process global.
pub struct PagePoolRegistry {
    inner: Mutex<Inner>,
}

struct Inner {
    /// Virtual clock, bumped once per `allocate` call.
    clock: u64,
    idle: Vec<IdlePool>,
}

impl PagePoolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        PagePoolRegistry {
            inner: Mutex::new(Inner {
                clock: 0,
                idle: Vec::new(),
            }),
        }
    }

    /// Returns a pool with at least `size` bytes of capacity in pages of
    /// at least `page_size` bytes, reusing an idle pool when one fits and
    /// constructing a fresh one otherwise.
    ///
    /// # Errors
    ///
    /// Propagates pool construction failures.
    pub fn allocate(&self, page_size: usize, size: usize) -> Result<PagePool, MemError> {
        let reused = {
            let mut inner = self.inner.lock();
            inner.clock += 1;
            let prune = inner.clock % PRUNE_TRIGGER == 0;
            let clock = inner.clock;

            let found = inner.idle.iter().position(|held| {
                let (sz, ps) = held.pool.create_params();
                sz >= size && ps >= page_size
            });
            let reused = found.map(|i| inner.idle.remove(i).pool);

            if prune {
                inner
                    .idle
                    .retain(|held| held.stamp + AGE_THRESHOLD >= clock && held.stamp <= clock);
            }
            reused
        };

        match reused {
            Some(pool) => {
                debug!(size, page_size, "reusing idle page pool");
                Ok(pool)
            }
            None => PagePool::new(size, page_size),
        }
    }

    /// Returns a pool to the registry, or drops it when the registry is
    /// full.
    pub fn release(&self, pool: PagePool) {
        let mut inner = self.inner.lock();
        if inner.idle.len() < POOL_CAPACITY {
            let stamp = inner.clock;
            inner.idle.push(IdlePool { stamp, pool });
        }
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.inner.lock().idle.len()
    }
}

impl Default for PagePoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_pool::os_page_size;

    #[test]
    fn test_reuses_matching_pool() {
        let ps = os_page_size();
        let registry = PagePoolRegistry::new();
        let pool = registry.allocate(ps, 4 * ps).unwrap();
        registry.release(pool);
        assert_eq!(registry.idle_count(), 1);

        // A smaller request matches the idle pool.
        let _pool = registry.allocate(ps, 2 * ps).unwrap();
        assert_eq!(registry.idle_count(), 0);
    }

    #[test]
    fn test_mismatched_pool_stays_idle() {
        let ps = os_page_size();
        let registry = PagePoolRegistry::new();
        let pool = registry.allocate(ps, 2 * ps).unwrap();
        registry.release(pool);

        // Larger request cannot reuse the smaller pool.
        let _fresh = registry.allocate(ps, 64 * ps).unwrap();
        assert_eq!(registry.idle_count(), 1);
    }

    #[test]
    fn test_capacity_bound() {
        let ps = os_page_size();
        let registry = PagePoolRegistry::new();
        for _ in 0..POOL_CAPACITY + 3 {
            let pool = PagePool::new(2 * ps, ps).unwrap();
            registry.release(pool);
        }
        assert_eq!(registry.idle_count(), POOL_CAPACITY);
    }

    #[test]
    fn test_old_pools_pruned() {
        let ps = os_page_size();
        let registry = PagePoolRegistry::new();
        let pool = registry.allocate(ps, 2 * ps).unwrap();
        registry.release(pool);

        // Advance the virtual clock past the age threshold with requests
        // that never match the idle pool.
        for _ in 0..(AGE_THRESHOLD + PRUNE_TRIGGER) {
            let _fresh = registry.allocate(ps, 512 * ps).unwrap();
        }
        assert_eq!(registry.idle_count(), 0);
    }
}
