pub mod orchestrator;

pub use orchestrator::{
    ComponentHealth, DriftEngine, EngineHealth, EngineState, EngineStatsSnapshot,
    MemoryEventRecord,
};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::orchestrator::{DriftEngine, EngineState};
    pub use driftwatch_types::prelude::*;
    pub use driftwatch_workers::Normalizer;
}
