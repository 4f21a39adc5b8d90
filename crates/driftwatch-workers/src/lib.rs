pub mod autoscaler;
pub mod balancer;
pub mod health;
pub mod processor;
pub mod scalable;

pub use autoscaler::{Autoscaler, AutoscalerStatsSnapshot, PoolSignals, ScaleDecision};
pub use balancer::{LoadBalancer, Strategy};
pub use health::{HealthChecker, HealthCheckerStatsSnapshot};
pub use processor::{
    Normalizer, ProcessError, ProcessorStatsSnapshot, ResourceProcessorPool,
};
pub use scalable::{
    Processor, ScalablePool, ScalablePoolStats, WorkerSnapshot,
};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::autoscaler::{Autoscaler, ScaleDecision};
    pub use crate::balancer::{LoadBalancer, Strategy};
    pub use crate::health::HealthChecker;
    pub use crate::processor::{Normalizer, ResourceProcessorPool};
    pub use crate::scalable::{Processor, ScalablePool};
    pub use async_trait::async_trait;
}
