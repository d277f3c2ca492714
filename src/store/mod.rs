//! Crash-safe persistence of small JSON documents.
//!
//! [`StateStore`] is the only component that touches shared state files.
//! Writes go to a uniquely named temp file in the target directory, are
//! flushed and fsynced, then atomically renamed over the target, so a reader
//! observes either the old document or the new one and never a torn write.
//! Transient OS conflicts are retried with bounded backoff; exhaustion is
//! reported in [`WriteOutcome`], never raised.
//!
//! Reads never fail: a missing or unparsable file resolves to the caller's
//! default. Repeated reads of one path inside a short window are coalesced.

pub mod retry;

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::StoreConfig;

use self::retry::{classify_io, retry_blocking, Backoff, ErrorClass};

/// Suffix shared by every in-flight temp file.
const TEMP_SUFFIX: &str = ".tmp";

/// Suffix of the long-lived sibling whose OS lock backs [`StateStore::with_exclusive`].
const GUARD_SUFFIX: &str = ".guard";

/// Errors surfaced by the non-defaulting store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem operation failed.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Value could not be serialised.
    #[error("failed to serialise document for {path}: {source}")]
    Serialize {
        /// Target file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// Document exists but does not match the expected schema.
    #[error("malformed document at {path}: {source}")]
    Malformed {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether the failure is a permission problem rather than contention.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::PermissionDenied)
    }
}

/// Outcome of an atomic write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    /// Whether the target now holds the new document.
    pub ok: bool,
    /// Retries spent (0 on first-attempt success).
    pub retries: u32,
    /// Total time including backoff.
    pub latency: Duration,
    /// Last error seen, if the write failed or needed retries.
    pub last_error: Option<String>,
}

/// Outcome of an exclusive create.
#[derive(Debug)]
pub enum CreateOutcome {
    /// The file did not exist and now holds the document.
    Created,
    /// Another writer got there first; nothing was written.
    AlreadyExists,
    /// The create failed for another reason.
    Failed(StoreError),
}

/// Retry activity within the contention window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentionReport {
    /// Retries recorded inside the window.
    pub retries_in_window: u32,
    /// Window length.
    pub window: Duration,
    /// Retries at or above which contention is systemic.
    pub threshold: u32,
}

impl ContentionReport {
    /// Whether write retries indicate systemic contention.
    pub fn is_contended(&self) -> bool {
        self.retries_in_window >= self.threshold
    }
}

#[derive(Debug, Clone)]
struct CachedRead {
    at: Instant,
    value: Option<serde_json::Value>,
}

/// Atomic JSON document store shared by every coordination component.
#[derive(Debug)]
pub struct StateStore {
    backoff: Backoff,
    coalesce: Duration,
    contention_window: Duration,
    contention_threshold: u32,
    cache: Mutex<HashMap<PathBuf, CachedRead>>,
    retry_log: Mutex<VecDeque<Instant>>,
}

impl StateStore {
    /// Create a store from its configuration section.
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            backoff: Backoff::from_config(config),
            coalesce: Duration::from_millis(config.read_coalesce_ms),
            contention_window: Duration::from_secs(config.contention_window_secs),
            contention_threshold: config.contention_retry_threshold,
            cache: Mutex::new(HashMap::new()),
            retry_log: Mutex::new(VecDeque::new()),
        }
    }

    /// Atomically replace `path` with the JSON serialisation of `value`.
    ///
    /// Blocks the calling thread through fsync and any retry backoff. Async
    /// callers on a hot path should run it under `tokio::task::spawn_blocking`.
    pub fn write<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> WriteOutcome {
        let json = match serde_json::to_value(value) {
            Ok(json) => json,
            Err(e) => {
                let err = StoreError::Serialize {
                    path: path.to_path_buf(),
                    source: e,
                };
                warn!(path = %path.display(), error = %err, "refusing to write unserialisable document");
                return WriteOutcome {
                    ok: false,
                    retries: 0,
                    latency: Duration::ZERO,
                    last_error: Some(err.to_string()),
                };
            }
        };
        let bytes = match serde_json::to_vec_pretty(&json) {
            Ok(bytes) => bytes,
            Err(e) => {
                return WriteOutcome {
                    ok: false,
                    retries: 0,
                    latency: Duration::ZERO,
                    last_error: Some(e.to_string()),
                }
            }
        };

        let mut last_error: Option<String> = None;
        let report = retry_blocking(
            &self.backoff,
            classify_io,
            |attempt, e| {
                debug!(path = %path.display(), attempt, error = %e, "atomic write conflict, backing off");
                last_error = Some(e.to_string());
                self.note_retry();
            },
            |_| write_atomic(path, &bytes),
        );

        match report.result {
            Ok(()) => {
                self.remember(path, Some(json));
                WriteOutcome {
                    ok: true,
                    retries: report.retries,
                    latency: report.elapsed,
                    last_error,
                }
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    retries = report.retries,
                    latency_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "atomic write failed"
                );
                WriteOutcome {
                    ok: false,
                    retries: report.retries,
                    latency: report.elapsed,
                    last_error: Some(e.to_string()),
                }
            }
        }
    }

    /// Create `path` holding `value` only if it does not already exist.
    ///
    /// The document is fully written before it becomes visible under `path`,
    /// so a contender never reads a half-written file.
    pub fn create_new<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> CreateOutcome {
        let bytes = match serde_json::to_vec_pretty(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                return CreateOutcome::Failed(StoreError::Serialize {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        let outcome = create_exclusive(path, &bytes);
        if matches!(outcome, CreateOutcome::Created) {
            self.forget(path);
        }
        outcome
    }

    /// Read `path` as `T`, returning `default` when missing or malformed.
    ///
    /// Served from the coalescing cache when the same path was read or
    /// written within the read window.
    pub fn read<T: DeserializeOwned>(&self, path: &Path, default: T) -> T {
        match self.read_value(path) {
            Some(value) => decode_or(path, value, default),
            None => default,
        }
    }

    /// Read `path` as raw JSON, `None` when missing or unparsable. Coalesced.
    pub fn read_value(&self, path: &Path) -> Option<serde_json::Value> {
        if let Some(hit) = self.cached(path) {
            return hit;
        }
        let value = load_value(path);
        self.remember(path, value.clone());
        value
    }

    /// Read `path` as `T` straight from disk, `None` when missing or malformed.
    pub fn read_uncached<T: DeserializeOwned>(&self, path: &Path) -> Option<T> {
        match self.try_read_uncached(path) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring malformed state document");
                None
            }
        }
    }

    /// Read `path` as `T` straight from disk, distinguishing missing from malformed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Malformed`] when the file exists but does not
    /// decode, and [`StoreError::Io`] when it cannot be read.
    pub fn try_read_uncached<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StoreError> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| StoreError::Malformed {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Delete `path`. Returns whether a file was removed.
    ///
    /// # Errors
    ///
    /// Returns an error for failures other than the file already being gone.
    pub fn remove(&self, path: &Path) -> Result<bool, StoreError> {
        self.forget(path);
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Run `f` while holding an exclusive OS lock on the sibling `.<name>.guard`.
    ///
    /// Sections for the same `path` exclude each other across threads and
    /// processes. The OS drops the lock when its holder dies, so a crash
    /// inside a section never wedges later callers. Blocks until free.
    ///
    /// # Errors
    ///
    /// Returns an error when the guard file cannot be opened or locked.
    pub fn with_exclusive<R>(&self, path: &Path, f: impl FnOnce() -> R) -> Result<R, StoreError> {
        let guard_path = sibling_path(path, GUARD_SUFFIX, false);
        ensure_parent(path).map_err(|e| StoreError::io(path, e))?;
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&guard_path)
            .map_err(|e| StoreError::io(&guard_path, e))?;
        let mut guard = fd_lock::RwLock::new(file);
        let _held = guard.write().map_err(|e| StoreError::io(&guard_path, e))?;
        Ok(f())
    }

    /// Modification time of `path`, if it exists.
    pub fn modified(&self, path: &Path) -> Option<DateTime<Utc>> {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from)
    }

    /// Retry activity within the contention window.
    pub fn contention(&self) -> ContentionReport {
        let mut log = self.retry_log.lock().unwrap_or_else(PoisonError::into_inner);
        prune_before(&mut log, self.contention_window);
        ContentionReport {
            retries_in_window: u32::try_from(log.len()).unwrap_or(u32::MAX),
            window: self.contention_window,
            threshold: self.contention_threshold,
        }
    }

    /// Remove temp files older than `max_age` left in `dir` by crashed writers.
    ///
    /// Returns the number of files removed. Missing directories count as clean.
    pub fn sweep_orphans(&self, dir: &Path, max_age: Duration) -> usize {
        let Ok(entries) = fs::read_dir(dir) else {
            return 0;
        };
        let now = SystemTime::now();
        let mut removed: usize = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_temp_name(&path) {
                continue;
            }
            let old_enough = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .is_some_and(|age| age >= max_age);
            if old_enough && fs::remove_file(&path).is_ok() {
                debug!(path = %path.display(), "removed orphaned temp file");
                removed = removed.saturating_add(1);
            }
        }
        removed
    }

    fn note_retry(&self) {
        let mut log = self.retry_log.lock().unwrap_or_else(PoisonError::into_inner);
        log.push_back(Instant::now());
        prune_before(&mut log, self.contention_window);
    }

    fn cached(&self, path: &Path) -> Option<Option<serde_json::Value>> {
        if self.coalesce.is_zero() {
            return None;
        }
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache
            .get(path)
            .filter(|hit| hit.at.elapsed() < self.coalesce)
            .map(|hit| hit.value.clone())
    }

    fn remember(&self, path: &Path, value: Option<serde_json::Value>) {
        if self.coalesce.is_zero() {
            return;
        }
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let coalesce = self.coalesce;
        cache.retain(|_, hit| hit.at.elapsed() < coalesce);
        cache.insert(
            path.to_path_buf(),
            CachedRead {
                at: Instant::now(),
                value,
            },
        );
    }

    fn forget(&self, path: &Path) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.remove(path);
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(&StoreConfig::default())
    }
}

fn prune_before(log: &mut VecDeque<Instant>, window: Duration) {
    while log.front().is_some_and(|at| at.elapsed() > window) {
        log.pop_front();
    }
}

fn decode_or<T: DeserializeOwned>(path: &Path, value: serde_json::Value, default: T) -> T {
    match serde_json::from_value(value) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed state document, using default");
            default
        }
    }
}

fn load_value(path: &Path) -> Option<serde_json::Value> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "state document unreadable");
            return None;
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "state document is not valid JSON");
            None
        }
    }
}

/// Unique sibling temp path: `.<name>.<uuid>.tmp`.
fn temp_path_for(path: &Path) -> PathBuf {
    sibling_path(path, TEMP_SUFFIX, true)
}

/// Hidden sibling `.<name>[.<uuid>]<suffix>`.
fn sibling_path(path: &Path, suffix: &str, unique: bool) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_owned());
    let temp_name = if unique {
        format!(".{name}.{}{suffix}", uuid::Uuid::new_v4().simple())
    } else {
        format!(".{name}{suffix}")
    };
    match path.parent() {
        Some(dir) => dir.join(temp_name),
        None => PathBuf::from(temp_name),
    }
}

fn is_temp_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.') && n.ends_with(TEMP_SUFFIX))
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir),
        _ => Ok(()),
    }
}

/// Write `bytes` to a fresh temp file next to `path`, fsynced.
fn write_temp(path: &Path, bytes: &[u8]) -> io::Result<PathBuf> {
    ensure_parent(path)?;
    let temp = temp_path_for(path);
    let result = (|| {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()
    })();
    match result {
        Ok(()) => Ok(temp),
        Err(e) => {
            let _ = fs::remove_file(&temp);
            Err(e)
        }
    }
}

/// Flush directory metadata so the rename survives a crash. Best effort.
#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(dir) = path.parent() {
        if let Ok(handle) = fs::File::open(dir) {
            let _ = handle.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let temp = write_temp(path, bytes)?;
    if let Err(e) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(e);
    }
    sync_parent(path);
    Ok(())
}

fn create_exclusive(path: &Path, bytes: &[u8]) -> CreateOutcome {
    let temp = match write_temp(path, bytes) {
        Ok(temp) => temp,
        Err(e) => return CreateOutcome::Failed(StoreError::io(path, e)),
    };
    // A hard link publishes the complete temp file under the target name and
    // fails if the target already exists.
    let linked = fs::hard_link(&temp, path);
    let _ = fs::remove_file(&temp);
    match linked {
        Ok(()) => {
            sync_parent(path);
            CreateOutcome::Created
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => CreateOutcome::AlreadyExists,
        Err(e) if e.kind() == io::ErrorKind::Unsupported => create_exclusive_in_place(path, bytes),
        Err(e) => CreateOutcome::Failed(StoreError::io(path, e)),
    }
}

/// Fallback for filesystems without hard links: exclusive open then write.
fn create_exclusive_in_place(path: &Path, bytes: &[u8]) -> CreateOutcome {
    let opened = fs::OpenOptions::new().write(true).create_new(true).open(path);
    let mut file = match opened {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return CreateOutcome::AlreadyExists,
        Err(e) => return CreateOutcome::Failed(StoreError::io(path, e)),
    };
    match file.write_all(bytes).and_then(|()| file.sync_all()) {
        Ok(()) => CreateOutcome::Created,
        Err(e) => {
            let _ = fs::remove_file(path);
            CreateOutcome::Failed(StoreError::io(path, e))
        }
    }
}

/// Retry classification exported for callers wrapping their own file moves.
pub fn is_transient(error: &io::Error) -> bool {
    classify_io(error) == ErrorClass::Retryable
}
