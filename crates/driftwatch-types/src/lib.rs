pub mod config;
pub mod drift;
pub mod error;
pub mod resource;
pub mod snapshot;
pub mod work;

pub use config::{
    AutoscaleConfig, CacheConfig, DiffConfig, DispatchConfig, EngineConfig, MemoryConfig,
    ParserConfig, ProcessorConfig, RateLimitConfig, StorageConfig,
};
pub use drift::{Change, DiffResult, DriftReport, DriftSummary, DriftType, Severity};
pub use error::{DriftError, DriftResult};
pub use resource::{RawResource, Resource, ResourceMetadata};
pub use snapshot::{Snapshot, SnapshotMetadata};
pub use work::{WorkItem, WorkPriority, WorkResult};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::drift::{Change, DiffResult, DriftReport, DriftType, Severity};
    pub use crate::error::{DriftError, DriftResult};
    pub use crate::resource::{RawResource, Resource};
    pub use crate::snapshot::Snapshot;
    pub use crate::work::{WorkItem, WorkPriority, WorkResult};
}
