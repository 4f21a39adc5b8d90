use driftwatch_types::{DriftError, DriftResult, Snapshot, StorageConfig};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Grace window for the cleaner to notice cancellation before being
/// abandoned.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Encryption hook. The engine only guarantees the call sites; the
/// algorithm is supplied by the caller.
pub trait SnapshotCipher: Send + Sync {
    fn encrypt(&self, payload: Vec<u8>) -> DriftResult<Vec<u8>>;
    fn decrypt(&self, payload: Vec<u8>) -> DriftResult<Vec<u8>>;
}

/// Identity cipher used unless the caller installs a real one.
pub struct NoopCipher;

impl SnapshotCipher for NoopCipher {
    fn encrypt(&self, payload: Vec<u8>) -> DriftResult<Vec<u8>> {
        Ok(payload)
    }

    fn decrypt(&self, payload: Vec<u8>) -> DriftResult<Vec<u8>> {
        Ok(payload)
    }
}

/// Outcome of a successful save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveReceipt {
    pub snapshot_id: String,
    pub path: PathBuf,
    /// On-disk bytes, after compression when enabled
    pub bytes_written: u64,
    /// Hex digest over the on-disk bytes, when checksums are enabled
    pub checksum: Option<String>,
    pub compressed: bool,
    pub duration: Duration,
}

#[derive(Default)]
struct StorageCounters {
    saves: AtomicU64,
    loads: AtomicU64,
    save_failures: AtomicU64,
    load_failures: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    cleaned_files: AtomicU64,
}

/// Point-in-time storage statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStatsSnapshot {
    pub saves: u64,
    pub loads: u64,
    pub save_failures: u64,
    pub load_failures: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub cleaned_files: u64,
}

/// Snapshot persistence pool.
///
/// Saves are atomic: the snapshot is written to a sibling `*.tmp`,
/// optionally gzip-compressed and checksummed, the previous target is
/// rotated to `*.backup` when backups are on, and the tmp is renamed over
/// the target. A reader observes the old file, the new file, or briefly no
/// file, never a truncated one. Whether a file is compressed is carried by
/// configuration, not sniffed from magic bytes.
pub struct StorageManagerPool {
    config: StorageConfig,
    cipher: Arc<dyn SnapshotCipher>,
    permits: Arc<Semaphore>,
    counters: StorageCounters,
    running: AtomicBool,
    cancel: CancellationToken,
    cleaner: parking_lot::Mutex<Option<JoinHandle<()>>>,
    self_ref: parking_lot::RwLock<Weak<Self>>,
}

impl StorageManagerPool {
    pub fn new(config: StorageConfig) -> Arc<Self> {
        Self::with_cipher(config, Arc::new(NoopCipher))
    }

    pub fn with_cipher(config: StorageConfig, cipher: Arc<dyn SnapshotCipher>) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.workers.max(1)));
        let manager = Arc::new(Self {
            config,
            cipher,
            permits,
            counters: StorageCounters::default(),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            cleaner: parking_lot::Mutex::new(None),
            self_ref: parking_lot::RwLock::new(Weak::new()),
        });
        *manager.self_ref.write() = Arc::downgrade(&manager);
        manager
    }

    fn handle(&self) -> Arc<Self> {
        self.self_ref
            .read()
            .upgrade()
            .expect("self reference is set at construction")
    }

    /// Start the background retention cleaner.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("storage manager already running");
            return;
        }
        info!(
            base_dir = %self.config.base_dir.display(),
            retention_secs = self.config.retention.as_secs(),
            "starting storage manager"
        );
        let manager = self.handle();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.clean_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            while manager.running.load(Ordering::Acquire) {
                tokio::select! {
                    _ = manager.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        // opportunistic; a failed pass waits for the next tick
                        if let Err(e) = manager.clean_once().await {
                            warn!(error = %e, "retention clean pass failed");
                        }
                    }
                }
            }
        });
        *self.cleaner.lock() = Some(handle);
    }

    /// Stop the cleaner. It gets the hard 10 s window to exit cooperatively
    /// before it is abandoned.
    pub async fn stop(&self) {
        self.stop_by(tokio::time::Instant::now() + SHUTDOWN_DEADLINE)
            .await;
    }

    /// Stop against a caller-supplied deadline, so an orchestrator can
    /// impose one window across several pools.
    pub async fn stop_by(&self, deadline: tokio::time::Instant) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let cleaner = self.cleaner.lock().take();
        if let Some(handle) = cleaner {
            let aborter = handle.abort_handle();
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                warn!("shutdown deadline exceeded; abandoning retention cleaner");
                aborter.abort();
            }
        }
        info!("storage manager stopped");
    }

    /// Path a snapshot id maps to under the configured directory.
    pub fn snapshot_path(&self, snapshot_id: &str) -> PathBuf {
        let extension = if self.config.compression {
            "json.gz"
        } else {
            "json"
        };
        self.config
            .base_dir
            .join(format!("{snapshot_id}.{extension}"))
    }

    /// Atomically persist a snapshot.
    pub async fn save(&self, snapshot: &Snapshot) -> DriftResult<SaveReceipt> {
        let started = Instant::now();
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| DriftError::capacity("storage pool closed"))?;

        let config = self.config.clone();
        let cipher = Arc::clone(&self.cipher);
        let snapshot_id = snapshot.id.clone();
        let path = self.snapshot_path(&snapshot_id);
        let mut payload = serde_json::to_vec(snapshot)?;
        payload.push(b'\n');

        let task = tokio::task::spawn_blocking(move || {
            save_sync(&config, cipher.as_ref(), &path, payload)
        });
        let outcome = tokio::time::timeout(self.config.storage_timeout, task)
            .await
            .map_err(|_| DriftError::timeout(self.config.storage_timeout))?
            .map_err(|e| DriftError::internal(format!("save task failed: {e}")))?;

        match outcome {
            Ok((path, bytes_written, checksum)) => {
                self.counters.saves.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_written
                    .fetch_add(bytes_written, Ordering::Relaxed);
                debug!(
                    snapshot_id = %snapshot_id,
                    path = %path.display(),
                    bytes_written,
                    "snapshot saved"
                );
                Ok(SaveReceipt {
                    snapshot_id,
                    path,
                    bytes_written,
                    checksum,
                    compressed: self.config.compression,
                    duration: started.elapsed(),
                })
            }
            Err(e) => {
                self.counters.save_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Load a snapshot by id.
    pub async fn load(&self, snapshot_id: &str) -> DriftResult<Snapshot> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| DriftError::capacity("storage pool closed"))?;

        let path = self.snapshot_path(snapshot_id);
        let compression = self.config.compression;
        let cipher = Arc::clone(&self.cipher);
        let encryption = self.config.encryption;

        let task =
            tokio::task::spawn_blocking(move || load_sync(&path, compression, encryption, cipher.as_ref()));
        let outcome = tokio::time::timeout(self.config.storage_timeout, task)
            .await
            .map_err(|_| DriftError::timeout(self.config.storage_timeout))?
            .map_err(|e| DriftError::internal(format!("load task failed: {e}")))?;

        match outcome {
            Ok((snapshot, bytes_read)) => {
                self.counters.loads.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_read
                    .fetch_add(bytes_read, Ordering::Relaxed);
                Ok(snapshot)
            }
            Err(e) => {
                self.counters.load_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Remove snapshot files older than the retention window. Returns how
    /// many were removed.
    pub async fn clean_once(&self) -> DriftResult<usize> {
        let base_dir = self.config.base_dir.clone();
        let retention = self.config.retention;
        let removed = tokio::task::spawn_blocking(move || clean_sync(&base_dir, retention))
            .await
            .map_err(|e| DriftError::internal(format!("clean task failed: {e}")))??;
        if removed > 0 {
            self.counters
                .cleaned_files
                .fetch_add(removed as u64, Ordering::Relaxed);
            info!(removed, "retention clean removed expired snapshots");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> StorageStatsSnapshot {
        StorageStatsSnapshot {
            saves: self.counters.saves.load(Ordering::Relaxed),
            loads: self.counters.loads.load(Ordering::Relaxed),
            save_failures: self.counters.save_failures.load(Ordering::Relaxed),
            load_failures: self.counters.load_failures.load(Ordering::Relaxed),
            bytes_written: self.counters.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.counters.bytes_read.load(Ordering::Relaxed),
            cleaned_files: self.counters.cleaned_files.load(Ordering::Relaxed),
        }
    }
}

impl Drop for StorageManagerPool {
    fn drop(&mut self) {
        if let Some(handle) = self.cleaner.lock().take() {
            handle.abort();
        }
    }
}

/// Blocking save: tmp write, optional gzip and checksum, backup rotation,
/// rename. Any failure removes the tmp file.
fn save_sync(
    config: &StorageConfig,
    cipher: &dyn SnapshotCipher,
    path: &Path,
    payload: Vec<u8>,
) -> DriftResult<(PathBuf, u64, Option<String>)> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = tmp_path_for(path);

    let result = write_tmp(config, cipher, &tmp_path, payload).and_then(|(written, checksum)| {
        // rotate the previous version; failure here is fatal to the save
        if config.backup && path.exists() {
            let backup = backup_path_for(path);
            std::fs::rename(path, &backup).map_err(|e| {
                DriftError::storage(format!(
                    "backup rotation to {} failed: {e}",
                    backup.display()
                ))
            })?;
        }
        std::fs::rename(&tmp_path, path)?;
        Ok((written, checksum))
    });

    match result {
        Ok((written, checksum)) => Ok((path.to_path_buf(), written, checksum)),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp_path);
            Err(e)
        }
    }
}

fn write_tmp(
    config: &StorageConfig,
    cipher: &dyn SnapshotCipher,
    tmp_path: &Path,
    payload: Vec<u8>,
) -> DriftResult<(u64, Option<String>)> {
    let payload = if config.encryption {
        cipher.encrypt(payload)?
    } else {
        payload
    };

    let file = std::fs::File::create(tmp_path)?;
    let mut writer = HashingWriter::new(file, config.checksum);
    if config.compression {
        let mut encoder = GzEncoder::new(writer, Compression::default());
        encoder.write_all(&payload)?;
        writer = encoder.finish()?;
    } else {
        writer.write_all(&payload)?;
    }
    let (file, written, checksum) = writer.into_parts();
    file.sync_all()?;
    Ok((written, checksum))
}

fn load_sync(
    path: &Path,
    compression: bool,
    encryption: bool,
    cipher: &dyn SnapshotCipher,
) -> DriftResult<(Snapshot, u64)> {
    let file = std::fs::File::open(path)?;
    // the configured option decides, never file magic
    let mut reader: Box<dyn Read> = if compression {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut payload = Vec::new();
    reader.read_to_end(&mut payload)?;
    let bytes_read = payload.len() as u64;

    let payload = if encryption {
        cipher.decrypt(payload)?
    } else {
        payload
    };

    let snapshot: Snapshot = serde_json::from_slice(&payload)?;
    Ok((snapshot, bytes_read))
}

fn clean_sync(base_dir: &Path, retention: Duration) -> DriftResult<usize> {
    if !base_dir.exists() {
        return Ok(0);
    }
    let cutoff = SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = 0usize;
    for entry in std::fs::read_dir(base_dir)? {
        let entry = entry?;
        let metadata = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        let modified = match metadata.modified() {
            Ok(t) => t,
            Err(_) => continue,
        };
        if modified < cutoff && std::fs::remove_file(entry.path()).is_ok() {
            debug!(path = %entry.path().display(), "removed expired snapshot file");
            removed += 1;
        }
    }
    Ok(removed)
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn backup_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".backup");
    path.with_file_name(name)
}

/// Writer that counts and optionally hashes what actually lands on disk.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Option<Sha256>,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W, hash: bool) -> Self {
        Self {
            inner,
            hasher: hash.then(Sha256::new),
            written: 0,
        }
    }

    fn into_parts(self) -> (W, u64, Option<String>) {
        let digest = self.hasher.map(|h| hex::encode(h.finalize()));
        (self.inner, self.written, digest)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        if let Some(hasher) = &mut self.hasher {
            hasher.update(&buf[..n]);
        }
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
