use driftwatch_types::{Resource, Snapshot};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default byte-buffer size handed out by [`BufferPool`].
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Objects that can be recycled through a pool.
///
/// `reset` must return the object to its zero value; a checked-out object
/// has exactly one owner and must carry no prior state.
pub trait Reset {
    fn reset(&mut self);
}

impl Reset for Resource {
    fn reset(&mut self) {
        Resource::reset(self);
    }
}

impl Reset for Snapshot {
    fn reset(&mut self) {
        Snapshot::reset(self);
    }
}

#[derive(Default)]
struct PoolCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    returned: AtomicU64,
    discarded: AtomicU64,
}

/// Point-in-time view of pool activity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolStatsSnapshot {
    /// Checkouts served from the free list
    pub hits: u64,
    /// Checkouts that allocated fresh
    pub misses: u64,
    /// Objects accepted back
    pub returned: u64,
    /// Objects dropped because the free list was at the soft cap
    pub discarded: u64,
    /// Free-list length at snapshot time
    pub idle: usize,
}

/// Recycling pool for hot-path allocations.
///
/// Check-out resets the object to its zero value; check-in keeps the object
/// only while the free list is under the soft cap.
pub struct ObjectPool<T: Reset + Default + Send> {
    free: Mutex<VecDeque<T>>,
    soft_cap: usize,
    counters: PoolCounters,
}

/// Pool of [`Resource`] values
pub type ResourcePool = ObjectPool<Resource>;
/// Pool of [`Snapshot`] values
pub type SnapshotPool = ObjectPool<Snapshot>;

impl<T: Reset + Default + Send> ObjectPool<T> {
    pub fn new(soft_cap: usize) -> Self {
        Self {
            free: Mutex::new(VecDeque::with_capacity(soft_cap.min(64))),
            soft_cap,
            counters: PoolCounters::default(),
        }
    }

    /// Take an object; allocates when the free list is empty.
    pub fn checkout(&self) -> T {
        let recycled = self.free.lock().pop_front();
        match recycled {
            Some(mut obj) => {
                obj.reset();
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                obj
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                T::default()
            }
        }
    }

    /// Return an object; discarded silently above the soft cap.
    pub fn checkin(&self, obj: T) {
        let mut free = self.free.lock();
        if free.len() < self.soft_cap {
            free.push_back(obj);
            self.counters.returned.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop idle objects down to `keep`; reclaim hook for the GC governor.
    pub fn shrink_to(&self, keep: usize) -> usize {
        let mut free = self.free.lock();
        let dropped = free.len().saturating_sub(keep);
        free.truncate(keep);
        dropped
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            returned: self.counters.returned.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            idle: self.idle(),
        }
    }
}

/// Pool of fixed-size byte buffers for the storage and parsing hot paths.
pub struct BufferPool {
    buffer_size: usize,
    free: Mutex<VecDeque<Vec<u8>>>,
    soft_cap: usize,
    counters: PoolCounters,
}

impl BufferPool {
    pub fn new(buffer_size: usize, soft_cap: usize) -> Self {
        Self {
            buffer_size,
            free: Mutex::new(VecDeque::with_capacity(soft_cap.min(64))),
            soft_cap,
            counters: PoolCounters::default(),
        }
    }

    /// 64 KiB buffers, the default wire size.
    pub fn with_default_size(soft_cap: usize) -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, soft_cap)
    }

    /// Take an empty buffer with the pool's capacity.
    pub fn checkout(&self) -> Vec<u8> {
        let recycled = self.free.lock().pop_front();
        match recycled {
            Some(mut buf) => {
                buf.clear();
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(self.buffer_size)
            }
        }
    }

    /// Return a buffer. Buffers that grew past the fixed size are discarded
    /// so the pool's memory footprint stays bounded.
    pub fn checkin(&self, mut buf: Vec<u8>) {
        if buf.capacity() > self.buffer_size {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < self.soft_cap {
            free.push_back(buf);
            self.counters.returned.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn shrink_to(&self, keep: usize) -> usize {
        let mut free = self.free.lock();
        let dropped = free.len().saturating_sub(keep);
        free.truncate(keep);
        dropped
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            returned: self.counters.returned.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            idle: self.free.lock().len(),
        }
    }
}

/// Bounded queue of fixed-size byte slabs for the streaming parser.
///
/// On exhaustion the pool allocates fresh memory rather than block a
/// parse job.
pub struct SlabPool {
    slab_size: usize,
    slabs: Mutex<VecDeque<Vec<u8>>>,
    max_slabs: usize,
    fresh_allocations: AtomicU64,
}

impl SlabPool {
    pub fn new(slab_size: usize, max_slabs: usize) -> Self {
        let mut slabs = VecDeque::with_capacity(max_slabs);
        for _ in 0..max_slabs {
            slabs.push_back(vec![0u8; slab_size]);
        }
        Self {
            slab_size,
            slabs: Mutex::new(slabs),
            max_slabs,
            fresh_allocations: AtomicU64::new(0),
        }
    }

    /// Take a zeroed slab, allocating when the queue is drained.
    pub fn acquire(&self) -> Vec<u8> {
        if let Some(slab) = self.slabs.lock().pop_front() {
            return slab;
        }
        self.fresh_allocations.fetch_add(1, Ordering::Relaxed);
        vec![0u8; self.slab_size]
    }

    pub fn release(&self, mut slab: Vec<u8>) {
        if slab.len() != self.slab_size {
            slab.resize(self.slab_size, 0);
        }
        let mut slabs = self.slabs.lock();
        if slabs.len() < self.max_slabs {
            slabs.push_back(slab);
        }
    }

    pub fn slab_size(&self) -> usize {
        self.slab_size
    }

    /// Slabs allocated beyond the pre-sized queue
    pub fn fresh_allocations(&self) -> u64 {
        self.fresh_allocations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checkout_returns_zeroed_resource() {
        let pool = ResourcePool::new(4);
        let mut resource = pool.checkout();
        resource.id = "dirty".to_string();
        resource
            .configuration
            .insert("k".to_string(), json!("v"));
        pool.checkin(resource);

        let recycled = pool.checkout();
        assert!(recycled.id.is_empty());
        assert!(recycled.configuration.is_empty());

        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_soft_cap_discards_excess() {
        let pool = ResourcePool::new(2);
        for _ in 0..4 {
            pool.checkin(Resource::default());
        }
        let stats = pool.stats();
        assert_eq!(stats.returned, 2);
        assert_eq!(stats.discarded, 2);
        assert_eq!(stats.idle, 2);
    }

    #[test]
    fn test_buffer_pool_keeps_fixed_size() {
        let pool = BufferPool::new(1024, 4);
        let buf = pool.checkout();
        assert_eq!(buf.capacity(), 1024);

        let mut grown = pool.checkout();
        grown.reserve(10_000);
        pool.checkin(grown);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[test]
    fn test_slab_pool_allocates_fresh_on_exhaustion() {
        let pool = SlabPool::new(256, 2);
        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();
        assert_eq!(c.len(), 256);
        assert_eq!(pool.fresh_allocations(), 1);

        pool.release(a);
        pool.release(b);
        pool.release(c);
        // queue stays bounded at max_slabs
        assert_eq!(pool.slabs.lock().len(), 2);
    }

    #[test]
    fn test_shrink_to_reclaims_idle() {
        let pool = SnapshotPool::new(8);
        for _ in 0..6 {
            pool.checkin(Snapshot::default());
        }
        assert_eq!(pool.shrink_to(2), 4);
        assert_eq!(pool.idle(), 2);
    }
}
