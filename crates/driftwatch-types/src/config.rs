use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level engine configuration, one section per pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default)]
    pub diff: DiffConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub autoscale: AutoscaleConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

/// Resource processor pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Number of normalization workers
    pub workers: usize,
    /// Bounded work-queue capacity
    pub queue_size: usize,
    /// Hard per-attempt timeout
    pub process_timeout: Duration,
    /// Maximum normalization attempts per raw resource
    pub max_retries: u32,
    /// Retry delay grows linearly: `attempt * retry_base_delay`
    pub retry_base_delay: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            queue_size: 100,
            process_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// State-file parser pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    pub workers: usize,
    pub queue_size: usize,
    /// Per-file parse timeout; the whole batch waits at most twice this
    pub parse_timeout: Duration,
    /// Files above this size are prioritized so they start first
    pub large_file_threshold: u64,
    /// Files above this size use the streaming decoder
    pub streaming_threshold: u64,
    /// Read chunk size for the streaming decoder
    pub chunk_size: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            queue_size: 100,
            parse_timeout: Duration::from_secs(60),
            large_file_threshold: 10 * 1024 * 1024,   // 10 MiB
            streaming_threshold: 50 * 1024 * 1024,    // 50 MiB
            chunk_size: 1024 * 1024,                  // 1 MiB
        }
    }
}

/// Diff worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffConfig {
    pub workers: usize,
    /// Per-comparison timeout; the aggregate wait is twice this
    pub compare_timeout: Duration,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            compare_timeout: Duration::from_secs(30),
        }
    }
}

/// Snapshot storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub workers: usize,
    /// Directory snapshot files live in
    pub base_dir: PathBuf,
    /// Gzip the on-disk container
    pub compression: bool,
    /// Encryption hook; the algorithm is supplied by the caller
    pub encryption: bool,
    /// Rotate the previous file to `*.backup` before replacing it
    pub backup: bool,
    /// Record a content digest in the save receipt
    pub checksum: bool,
    /// Files older than this are removed by the background cleaner
    pub retention: Duration,
    /// Cleaner cadence
    pub clean_interval: Duration,
    pub storage_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            base_dir: PathBuf::from("snapshots"),
            compression: true,
            encryption: false,
            backup: true,
            checksum: true,
            retention: Duration::from_secs(7 * 24 * 60 * 60), // 7 days
            clean_interval: Duration::from_secs(60 * 60),
            storage_timeout: Duration::from_secs(60),
        }
    }
}

/// Memory monitor and GC governor settings. Thresholds are absolute bytes;
/// unset thresholds derive from `max_memory` (70% gc, 80% backpressure).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub max_memory: u64,
    pub gc_threshold: Option<u64>,
    pub backpressure_threshold: Option<u64>,
    /// Residency sampling cadence
    pub monitor_interval: Duration,
    /// Collection pass runs on this cadence regardless of residency
    pub force_gc_interval: Duration,
    /// How long a producer waits for backpressure to clear
    pub backpressure_wait: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_memory: 1024 * 1024 * 1024, // 1 GiB
            gc_threshold: None,
            backpressure_threshold: None,
            monitor_interval: Duration::from_secs(5),
            force_gc_interval: Duration::from_secs(30),
            backpressure_wait: Duration::from_secs(10),
        }
    }
}

impl MemoryConfig {
    pub fn effective_gc_threshold(&self) -> u64 {
        self.gc_threshold
            .unwrap_or((self.max_memory as f64 * 0.7) as u64)
    }

    pub fn effective_backpressure_threshold(&self) -> u64 {
        self.backpressure_threshold
            .unwrap_or((self.max_memory as f64 * 0.8) as u64)
    }
}

/// Cache TTLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL for memoized per-resource diff results
    pub diff_ttl: Duration,
    /// TTL for parsed file metadata
    pub metadata_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            diff_ttl: Duration::from_secs(5 * 60),
            metadata_ttl: Duration::from_secs(10 * 60),
        }
    }
}

/// Autoscaler and health-check settings for scalable pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscaleConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub initial_workers: usize,
    /// Scale up above this utilization
    pub scale_up_threshold: f64,
    /// Scale down below this utilization
    pub scale_down_threshold: f64,
    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,
    /// System CPU fraction above which scaling up is forced
    pub cpu_threshold: f64,
    /// System memory fraction above which scaling up is forced
    pub memory_threshold: f64,
    /// Queue depth that forces a scale-up
    pub queue_depth_threshold: usize,
    /// Decision cadence
    pub check_interval: Duration,
    /// A worker silent longer than this with queued work is replaced
    pub health_interval: Duration,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: num_cpus::get() * 2,
            initial_workers: num_cpus::get(),
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            scale_up_cooldown: Duration::from_secs(30),
            scale_down_cooldown: Duration::from_secs(60),
            cpu_threshold: 0.8,
            memory_threshold: 0.8,
            queue_depth_threshold: 50,
            check_interval: Duration::from_secs(10),
            health_interval: Duration::from_secs(10),
        }
    }
}

/// Token-bucket admission control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained tokens per second
    pub rate: f64,
    /// Bucket capacity
    pub burst: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate: 100.0,
            burst: 200,
        }
    }
}

/// Orchestrator dispatch strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Workloads above this many items are split into batches
    pub batch_threshold: usize,
    pub batch_size: usize,
    /// Pause between sequential batches
    pub inter_batch_pause: Duration,
    /// Bound on the pre-dispatch wait for backpressure to clear
    pub backpressure_wait: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_threshold: 1000,
            batch_size: 500,
            inter_batch_pause: Duration::from_millis(100),
            backpressure_wait: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_thresholds_derive_from_max() {
        let config = MemoryConfig {
            max_memory: 1000,
            ..Default::default()
        };
        assert_eq!(config.effective_gc_threshold(), 700);
        assert_eq!(config.effective_backpressure_threshold(), 800);
    }

    #[test]
    fn test_explicit_thresholds_win() {
        let config = MemoryConfig {
            max_memory: 1000,
            gc_threshold: Some(450),
            backpressure_threshold: Some(600),
            ..Default::default()
        };
        assert_eq!(config.effective_gc_threshold(), 450);
        assert_eq!(config.effective_backpressure_threshold(), 600);
    }

    #[test]
    fn test_defaults_follow_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.processor.queue_size, 100);
        assert_eq!(config.processor.process_timeout, Duration::from_secs(30));
        assert_eq!(config.parser.parse_timeout, Duration::from_secs(60));
        assert_eq!(config.diff.compare_timeout, Duration::from_secs(30));
        assert_eq!(config.storage.storage_timeout, Duration::from_secs(60));
        assert_eq!(config.cache.diff_ttl, Duration::from_secs(300));
        assert_eq!(config.autoscale.scale_up_threshold, 0.8);
        assert_eq!(config.autoscale.scale_down_threshold, 0.3);
    }
}
