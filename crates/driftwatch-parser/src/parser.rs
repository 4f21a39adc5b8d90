use crate::state_file::StateFile;
use driftwatch_pool::SlabPool;
use driftwatch_types::{CacheConfig, DriftError, DriftResult, ParserConfig, Resource, WorkPriority};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// One failed file out of a parse batch.
#[derive(Debug)]
pub struct ParseError {
    pub path: PathBuf,
    pub error: DriftError,
}

#[derive(Default)]
struct ParserCounters {
    files_parsed: AtomicU64,
    files_failed: AtomicU64,
    resources_produced: AtomicU64,
    bytes_read: AtomicU64,
    streaming_decodes: AtomicU64,
    stat_cache_hits: AtomicU64,
}

/// Point-in-time parser statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserStatsSnapshot {
    pub files_parsed: u64,
    pub files_failed: u64,
    pub resources_produced: u64,
    pub bytes_read: u64,
    pub streaming_decodes: u64,
    pub stat_cache_hits: u64,
}

struct ParseJob {
    path: PathBuf,
    size: u64,
    priority: WorkPriority,
}

/// Pool that decodes IaC state files into resources.
///
/// Files are stat'ed up front; those above the large-file threshold are
/// submitted first so the longest jobs start early. Above the streaming
/// threshold a file is decoded incrementally through a pool-backed reader
/// instead of being loaded whole.
pub struct StateParserPool {
    config: ParserConfig,
    slabs: Arc<SlabPool>,
    counters: ParserCounters,
    /// File-size cache with TTL; avoids re-stat'ing hot paths
    stat_cache: RwLock<HashMap<PathBuf, (Instant, u64)>>,
    stat_ttl: std::time::Duration,
    self_ref: RwLock<Weak<Self>>,
}

impl StateParserPool {
    pub fn new(config: ParserConfig, cache: CacheConfig) -> Arc<Self> {
        let slabs = Arc::new(SlabPool::new(config.chunk_size, config.workers.max(1) * 2));
        let pool = Arc::new(Self {
            config,
            slabs,
            counters: ParserCounters::default(),
            stat_cache: RwLock::new(HashMap::new()),
            stat_ttl: cache.metadata_ttl,
            self_ref: RwLock::new(Weak::new()),
        });
        *pool.self_ref.write() = Arc::downgrade(&pool);
        pool
    }

    fn handle(&self) -> Arc<Self> {
        self.self_ref
            .read()
            .upgrade()
            .expect("self reference is set at construction")
    }

    /// Parse every path, priority-descending, and return the flattened
    /// resources plus the per-file failures.
    ///
    /// The batch fails only when no file parses or nothing is produced;
    /// the whole call is bounded by `2 x parse_timeout`.
    pub async fn parse_all(
        &self,
        paths: &[PathBuf],
    ) -> DriftResult<(Vec<Resource>, Vec<ParseError>)> {
        if paths.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let mut jobs = Vec::with_capacity(paths.len());
        let mut stat_failures = Vec::new();
        for path in paths {
            match self.file_size(path).await {
                Ok(size) => {
                    let priority = if size > self.config.large_file_threshold {
                        WorkPriority::High
                    } else {
                        WorkPriority::Normal
                    };
                    jobs.push(ParseJob {
                        path: path.clone(),
                        size,
                        priority,
                    });
                }
                Err(error) => stat_failures.push(ParseError {
                    path: path.clone(),
                    error,
                }),
            }
        }

        // biggest-first within each priority band
        jobs.sort_unstable_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(b.size.cmp(&a.size))
        });

        info!(
            files = jobs.len(),
            failed_stat = stat_failures.len(),
            "parsing state files"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut tasks = Vec::with_capacity(jobs.len());
        for job in jobs {
            let pool = self.handle();
            let semaphore = Arc::clone(&semaphore);
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let outcome = tokio::time::timeout(
                    pool.config.parse_timeout,
                    pool.parse_file(&job.path, job.size),
                )
                .await
                .unwrap_or_else(|_| Err(DriftError::timeout(pool.config.parse_timeout)));
                (job.path, outcome)
            }));
        }

        let collected =
            tokio::time::timeout(self.config.parse_timeout * 2, join_all(tasks)).await;
        let collected = match collected {
            Ok(results) => results,
            Err(_) => return Err(DriftError::timeout(self.config.parse_timeout * 2)),
        };

        let mut resources = Vec::new();
        let mut errors = stat_failures;
        let mut parsed_files = 0usize;
        for joined in collected {
            match joined {
                Ok((_, Ok(mut parsed))) => {
                    parsed_files += 1;
                    self.counters.files_parsed.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .resources_produced
                        .fetch_add(parsed.len() as u64, Ordering::Relaxed);
                    resources.append(&mut parsed);
                }
                Ok((path, Err(error))) => {
                    self.counters.files_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(path = %path.display(), error = %error, "state file failed to parse");
                    errors.push(ParseError { path, error });
                }
                Err(join_err) => {
                    errors.push(ParseError {
                        path: PathBuf::new(),
                        error: DriftError::internal(format!("parse task failed: {join_err}")),
                    });
                }
            }
        }

        // the batch stands as long as one file parsed and produced output
        if parsed_files == 0 || resources.is_empty() {
            return Err(DriftError::input(format!(
                "no state file yielded resources ({} failures)",
                errors.len()
            )));
        }
        Ok((resources, errors))
    }

    pub fn stats(&self) -> ParserStatsSnapshot {
        ParserStatsSnapshot {
            files_parsed: self.counters.files_parsed.load(Ordering::Relaxed),
            files_failed: self.counters.files_failed.load(Ordering::Relaxed),
            resources_produced: self.counters.resources_produced.load(Ordering::Relaxed),
            bytes_read: self.counters.bytes_read.load(Ordering::Relaxed),
            streaming_decodes: self.counters.streaming_decodes.load(Ordering::Relaxed),
            stat_cache_hits: self.counters.stat_cache_hits.load(Ordering::Relaxed),
        }
    }

    async fn file_size(&self, path: &Path) -> DriftResult<u64> {
        {
            let cache = self.stat_cache.read();
            if let Some((at, size)) = cache.get(path) {
                if at.elapsed() < self.stat_ttl {
                    self.counters.stat_cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(*size);
                }
            }
        }
        let meta = tokio::fs::metadata(path).await?;
        let size = meta.len();
        self.stat_cache
            .write()
            .insert(path.to_path_buf(), (Instant::now(), size));
        Ok(size)
    }

    async fn parse_file(&self, path: &Path, size: u64) -> DriftResult<Vec<Resource>> {
        let display_path = path.display().to_string();
        self.counters.bytes_read.fetch_add(size, Ordering::Relaxed);

        let state: StateFile = if size > self.config.streaming_threshold {
            self.counters.streaming_decodes.fetch_add(1, Ordering::Relaxed);
            debug!(path = %display_path, size, "streaming decode");
            let path = path.to_path_buf();
            let slabs = Arc::clone(&self.slabs);
            tokio::task::spawn_blocking(move || -> DriftResult<StateFile> {
                let file = std::fs::File::open(&path)?;
                let reader = PooledReader::new(file, slabs);
                Ok(serde_json::from_reader(reader)?)
            })
            .await
            .map_err(|e| DriftError::internal(format!("streaming decode task failed: {e}")))??
        } else {
            let bytes = tokio::fs::read(path).await?;
            serde_json::from_slice(&bytes)?
        };

        let resources = state.into_resources(&display_path);
        debug!(
            path = %display_path,
            resources = resources.len(),
            "state file parsed"
        );
        Ok(resources)
    }
}

/// Buffered reader whose internal buffer comes from the slab pool and goes
/// back on drop.
struct PooledReader {
    file: std::fs::File,
    slabs: Arc<SlabPool>,
    slab: Option<Vec<u8>>,
    pos: usize,
    filled: usize,
}

impl PooledReader {
    fn new(file: std::fs::File, slabs: Arc<SlabPool>) -> Self {
        let slab = slabs.acquire();
        Self {
            file,
            slabs,
            slab: Some(slab),
            pos: 0,
            filled: 0,
        }
    }
}

impl Read for PooledReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        let slab = self.slab.as_mut().expect("slab present until drop");
        if self.pos == self.filled {
            self.filled = self.file.read(slab)?;
            self.pos = 0;
            if self.filled == 0 {
                return Ok(0);
            }
        }
        let n = (self.filled - self.pos).min(out.len());
        out[..n].copy_from_slice(&slab[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Drop for PooledReader {
    fn drop(&mut self) {
        if let Some(slab) = self.slab.take() {
            self.slabs.release(slab);
        }
    }
}
