pub mod backpressure;
pub mod memory_monitor;
pub mod object_pool;
pub mod rate_limiter;

pub use backpressure::BackpressureGate;
pub use memory_monitor::{MemoryEvent, MemoryMonitor, MemoryStatsSnapshot, ReclaimHook};
pub use object_pool::{
    BufferPool, ObjectPool, PoolStatsSnapshot, Reset, ResourcePool, SlabPool, SnapshotPool,
    DEFAULT_BUFFER_SIZE,
};
pub use rate_limiter::TokenBucket;
