//! Cross-process singleton lock with stale-owner detection.
//!
//! One JSON lock file per role under the lock directory. A record is valid
//! only while its owner PID is alive, that process still runs the recorded
//! executable, it lives on this host, and the record is within its TTL.
//! Checks run in that order. Any contender may purge an invalid record and
//! retry once. Purges and releases delete the file only under the store's
//! exclusive guard and only if it still holds the record they checked. Liveness and identity queries go through [`ProcessProbe`] so
//! platform backends can be swapped.

pub mod probe;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::{seconds_between, SharedClock};
use crate::config::LockConfig;
use crate::store::{CreateOutcome, StateStore, StoreError};

pub use self::probe::{current_host, current_identity, normalize_identity, ProcessProbe, SystemProbe};

/// Exit code: lock acquired, no previous owner.
pub const EXIT_FRESH: i32 = 0;
/// Exit code: stale lock purged, then acquired.
pub const EXIT_STALE_PURGED: i32 = 10;
/// Exit code: another live owner holds the lock.
pub const EXIT_ACTIVE_OWNER: i32 = 11;
/// Exit code: the lock file could not be created or purged.
pub const EXIT_PERMISSION_ERROR: i32 = 12;

/// Errors from lock maintenance operations.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lock is not held by this process.
    #[error("lock {role} is not held by pid {pid} on {host}")]
    NotOwner {
        /// Role.
        role: String,
        /// Our PID.
        pid: u32,
        /// Our host.
        host: String,
    },

    /// The lock file could not be read or written.
    #[error("lock {role}: {detail}")]
    Store {
        /// Role.
        role: String,
        /// What failed.
        detail: String,
    },
}

/// Body of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Owner process.
    pub owner_pid: u32,
    /// Owner host name.
    pub owner_host: String,
    /// Owner executable path.
    #[serde(default)]
    pub owner_identity: Option<String>,
    /// When the lock was taken.
    pub acquired_at: DateTime<Utc>,
    /// Validity window from the last renewal.
    pub ttl_seconds: u64,
    /// Last lease renewal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewed_at: Option<DateTime<Utc>>,
}

impl LockRecord {
    /// Seconds since acquisition or last renewal.
    pub fn age_seconds(&self, now: DateTime<Utc>) -> f64 {
        seconds_between(self.renewed_at.unwrap_or(self.acquired_at), now)
    }
}

/// Why an existing record is invalid.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StaleReason {
    /// Owner PID is not running (or is a zombie).
    DeadProcess {
        /// Recorded PID.
        pid: u32,
    },
    /// PID was reused by a different executable, or its identity is unreadable.
    IdentityMismatch {
        /// Identity the owner should have.
        expected: String,
        /// Identity found.
        actual: Option<String>,
    },
    /// Record was written on another host.
    ForeignHost {
        /// Recorded host.
        host: String,
    },
    /// Record is older than its TTL.
    Expired {
        /// Age in seconds.
        age_secs: f64,
        /// TTL in seconds.
        ttl_secs: u64,
    },
    /// File does not decode as a lock record.
    Malformed,
    /// Operator forced the takeover.
    ForceOverride,
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeadProcess { pid } => write!(f, "pid {pid} not running"),
            Self::IdentityMismatch { expected, actual } => write!(
                f,
                "identity={}⇒{expected}",
                actual.as_deref().unwrap_or("unreadable")
            ),
            Self::ForeignHost { host } => write!(f, "owner host {host} is not this host"),
            Self::Expired { age_secs, ttl_secs } => write!(f, "age={age_secs:.0}s⇒{ttl_secs}s"),
            Self::Malformed => f.write_str("malformed lock file"),
            Self::ForceOverride => f.write_str("force override"),
        }
    }
}

/// Whether this process runs as the role's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRole {
    /// Holds the lock.
    Primary,
    /// Another live owner holds it, or it could not be taken.
    Secondary,
}

/// Result of [`SingletonLock::acquire`].
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    /// No previous owner.
    Fresh {
        /// Record written.
        record: LockRecord,
    },
    /// A stale record was purged first.
    StalePurged {
        /// Record written.
        record: LockRecord,
        /// Why the previous record was stale.
        reason: StaleReason,
    },
    /// A valid owner exists.
    ActiveOwner {
        /// Its record, when it could be read.
        owner: Option<LockRecord>,
    },
    /// The lock file could not be created or purged.
    PermissionError {
        /// Underlying error.
        detail: String,
    },
}

impl AcquireOutcome {
    /// Stable exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Fresh { .. } => EXIT_FRESH,
            Self::StalePurged { .. } => EXIT_STALE_PURGED,
            Self::ActiveOwner { .. } => EXIT_ACTIVE_OWNER,
            Self::PermissionError { .. } => EXIT_PERMISSION_ERROR,
        }
    }

    /// Role this process plays after the attempt.
    pub fn role(&self) -> LockRole {
        match self {
            Self::Fresh { .. } | Self::StalePurged { .. } => LockRole::Primary,
            Self::ActiveOwner { .. } | Self::PermissionError { .. } => LockRole::Secondary,
        }
    }

    /// Whether the lock is now held.
    pub fn is_primary(&self) -> bool {
        self.role() == LockRole::Primary
    }
}

impl fmt::Display for AcquireOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fresh { record } => write!(f, "acquired (pid {})", record.owner_pid),
            Self::StalePurged { record, reason } => {
                write!(f, "purged stale lock ({reason}), acquired (pid {})", record.owner_pid)
            }
            Self::ActiveOwner { owner: Some(o) } => {
                write!(f, "held by pid {} on {} since {}", o.owner_pid, o.owner_host, o.acquired_at.to_rfc3339())
            }
            Self::ActiveOwner { owner: None } => f.write_str("held by another owner"),
            Self::PermissionError { detail } => write!(f, "permission error: {detail}"),
        }
    }
}

/// Result of [`SingletonLock::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Our record was removed.
    Released,
    /// No lock file existed.
    NotHeld,
    /// Someone else owns the file now; it was left alone.
    OwnedByOther {
        /// Current owner PID.
        owner_pid: u32,
        /// Current owner host.
        owner_host: String,
    },
    /// The file could not be read or removed.
    Failed(String),
}

/// Diagnostic view of a lock file.
#[derive(Debug, Clone, PartialEq)]
pub enum LockStatus {
    /// No lock file.
    Free,
    /// Valid owner.
    Active(LockRecord),
    /// File exists but is invalid.
    Stale {
        /// Record, when it decodes.
        record: Option<LockRecord>,
        /// Why it is invalid.
        reason: StaleReason,
    },
}

enum Purge {
    Removed,
    /// Another contender wrote a new record after ours was judged stale.
    Superseded(Option<LockRecord>),
}

/// One role's lock.
pub struct SingletonLock {
    role: String,
    path: PathBuf,
    store: Arc<StateStore>,
    probe: Arc<dyn ProcessProbe>,
    clock: SharedClock,
    ttl_secs: u64,
    force_override: bool,
    expected_identity: Option<String>,
    pid: u32,
    host: String,
}

impl fmt::Debug for SingletonLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingletonLock")
            .field("role", &self.role)
            .field("path", &self.path)
            .field("pid", &self.pid)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl SingletonLock {
    /// Lock for `role` stored at `<lock_dir>/<role>.lock`, owned by this process.
    pub fn new(
        role: &str,
        lock_dir: &Path,
        config: &LockConfig,
        store: Arc<StateStore>,
        probe: Arc<dyn ProcessProbe>,
        clock: SharedClock,
    ) -> Self {
        Self {
            role: role.to_owned(),
            path: lock_dir.join(format!("{role}.lock")),
            store,
            probe,
            clock,
            ttl_secs: config.ttl_secs,
            force_override: config.force_override,
            expected_identity: config.expected_identity.clone(),
            pid: std::process::id(),
            host: current_host(),
        }
    }

    /// Contend as a different owner. Used when acquiring on behalf of a child.
    #[must_use]
    pub fn with_owner(mut self, pid: u32, host: impl Into<String>) -> Self {
        self.pid = pid;
        self.host = host.into();
        self
    }

    /// Role name.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn new_record(&self) -> LockRecord {
        LockRecord {
            owner_pid: self.pid,
            owner_host: self.host.clone(),
            owner_identity: if self.pid == std::process::id() {
                current_identity()
            } else {
                self.probe.identity(self.pid)
            },
            acquired_at: self.clock.now(),
            ttl_seconds: self.ttl_secs,
            renewed_at: None,
        }
    }

    /// Check `record` in order: liveness, identity, host, TTL.
    ///
    /// # Errors
    ///
    /// Returns the first reason the record is stale.
    pub fn validate(&self, record: &LockRecord) -> Result<(), StaleReason> {
        if !self.probe.is_alive(record.owner_pid) {
            return Err(StaleReason::DeadProcess {
                pid: record.owner_pid,
            });
        }

        let expected = self
            .expected_identity
            .as_ref()
            .or(record.owner_identity.as_ref());
        if let Some(expected) = expected.filter(|_| self.probe.supports_identity()) {
            let actual = self
                .probe
                .identity(record.owner_pid)
                .map(normalize_identity);
            if actual.as_deref() != Some(expected.as_str()) {
                return Err(StaleReason::IdentityMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        if record.owner_host != self.host {
            return Err(StaleReason::ForeignHost {
                host: record.owner_host.clone(),
            });
        }

        let age_secs = record.age_seconds(self.clock.now());
        #[allow(clippy::cast_precision_loss)]
        let ttl = record.ttl_seconds as f64;
        if age_secs > ttl {
            return Err(StaleReason::Expired {
                age_secs,
                ttl_secs: record.ttl_seconds,
            });
        }
        Ok(())
    }

    /// Read the current file and classify it.
    pub fn inspect(&self) -> LockStatus {
        match self.store.try_read_uncached::<LockRecord>(&self.path) {
            Ok(None) => LockStatus::Free,
            Ok(Some(record)) => match self.validate(&record) {
                Ok(()) => LockStatus::Active(record),
                Err(reason) => LockStatus::Stale {
                    record: Some(record),
                    reason,
                },
            },
            Err(StoreError::Malformed { .. }) => LockStatus::Stale {
                record: None,
                reason: StaleReason::Malformed,
            },
            Err(e) => {
                warn!(role = %self.role, error = %e, "lock file unreadable");
                LockStatus::Stale {
                    record: None,
                    reason: StaleReason::Malformed,
                }
            }
        }
    }

    /// Try to take the lock once, purging a stale record at most once.
    pub fn acquire(&self) -> AcquireOutcome {
        let mut purged: Option<StaleReason> = None;
        let mut retried = false;
        loop {
            let record = self.new_record();
            match self.store.create_new(&self.path, &record) {
                CreateOutcome::Created => {
                    return match purged {
                        Some(reason) => {
                            info!(role = %self.role, pid = record.owner_pid, reason = %reason, "stale lock purged, acquired");
                            AcquireOutcome::StalePurged { record, reason }
                        }
                        None => {
                            info!(role = %self.role, pid = record.owner_pid, "lock acquired");
                            AcquireOutcome::Fresh { record }
                        }
                    };
                }
                CreateOutcome::Failed(e) => {
                    warn!(role = %self.role, error = %e, "cannot create lock file");
                    return AcquireOutcome::PermissionError { detail: e.to_string() };
                }
                CreateOutcome::AlreadyExists => {}
            }

            let (owner, stale) = match self.inspect() {
                LockStatus::Active(owner) if !self.force_override => {
                    info!(
                        role = %self.role,
                        owner_pid = owner.owner_pid,
                        owner_host = %owner.owner_host,
                        "lock held by live owner"
                    );
                    return AcquireOutcome::ActiveOwner { owner: Some(owner) };
                }
                LockStatus::Active(owner) => (Some(owner), Some(StaleReason::ForceOverride)),
                LockStatus::Stale { record, reason } => (record, Some(reason)),
                // Vanished between create and read.
                LockStatus::Free => (None, None),
            };

            if retried {
                return AcquireOutcome::ActiveOwner { owner };
            }
            retried = true;

            if let Some(reason) = stale {
                warn!(
                    role = %self.role,
                    owner_pid = owner.as_ref().map(|o| o.owner_pid),
                    reason = %reason,
                    "purging stale lock"
                );
                match self.purge_if_unchanged(owner.as_ref()) {
                    Ok(Purge::Removed) => purged = Some(reason),
                    Ok(Purge::Superseded(current)) => {
                        info!(
                            role = %self.role,
                            owner_pid = current.as_ref().map(|o| o.owner_pid),
                            "lock replaced by another contender during purge"
                        );
                        return AcquireOutcome::ActiveOwner { owner: current };
                    }
                    Err(e) => return AcquireOutcome::PermissionError { detail: e.to_string() },
                }
            }
        }
    }

    /// Delete the lock file only if it still holds the record judged stale.
    ///
    /// Every removal of the lock file runs under the store's exclusive guard
    /// for this path, so the record cannot change between the re-read and
    /// the delete. A contender that already replaced it wins.
    fn purge_if_unchanged(&self, judged: Option<&LockRecord>) -> Result<Purge, StoreError> {
        self.store.with_exclusive(&self.path, || -> Result<Purge, StoreError> {
            let current = self.store.try_read_uncached::<LockRecord>(&self.path);
            let unchanged = match (&current, judged) {
                // Purged by another contender.
                (Ok(None), _) => return Ok(Purge::Removed),
                (Ok(Some(on_disk)), Some(judged)) => on_disk == judged,
                (Err(_), None) => true,
                _ => false,
            };
            if !unchanged {
                return Ok(Purge::Superseded(current.ok().flatten()));
            }
            self.store.remove(&self.path)?;
            Ok(Purge::Removed)
        })?
    }

    /// Retry [`Self::acquire`] while another owner is active, up to `timeout`.
    pub async fn acquire_within(&self, timeout: Duration, poll: Duration) -> AcquireOutcome {
        let started = tokio::time::Instant::now();
        let deadline = started.checked_add(timeout).unwrap_or(started);
        loop {
            let outcome = self.acquire();
            if !matches!(outcome, AcquireOutcome::ActiveOwner { .. }) {
                return outcome;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return outcome;
            }
            tokio::time::sleep(poll.min(deadline.saturating_duration_since(now))).await;
        }
    }

    fn owned_record(&self) -> Result<LockRecord, LockError> {
        let record = self
            .store
            .try_read_uncached::<LockRecord>(&self.path)
            .map_err(|e| LockError::Store {
                role: self.role.clone(),
                detail: e.to_string(),
            })?;
        match record {
            Some(r) if r.owner_pid == self.pid && r.owner_host == self.host => Ok(r),
            _ => Err(LockError::NotOwner {
                role: self.role.clone(),
                pid: self.pid,
                host: self.host.clone(),
            }),
        }
    }

    /// Extend the lease by stamping `renewed_at`.
    ///
    /// # Errors
    ///
    /// Fails if the lock is not ours or cannot be rewritten.
    pub fn renew(&self) -> Result<LockRecord, LockError> {
        let mut record = self.owned_record()?;
        record.renewed_at = Some(self.clock.now());
        let outcome = self.store.write(&self.path, &record);
        if !outcome.ok {
            return Err(LockError::Store {
                role: self.role.clone(),
                detail: outcome.last_error.unwrap_or_else(|| "write failed".to_owned()),
            });
        }
        Ok(record)
    }

    /// Remove the lock file only if it still names this process.
    pub fn release(&self) -> ReleaseOutcome {
        let record = match self.store.try_read_uncached::<LockRecord>(&self.path) {
            Ok(Some(record)) => record,
            Ok(None) => return ReleaseOutcome::NotHeld,
            Err(e) => return ReleaseOutcome::Failed(e.to_string()),
        };
        if record.owner_pid != self.pid || record.owner_host != self.host {
            warn!(
                role = %self.role,
                owner_pid = record.owner_pid,
                owner_host = %record.owner_host,
                "lock now owned by another process, leaving it"
            );
            return ReleaseOutcome::OwnedByOther {
                owner_pid: record.owner_pid,
                owner_host: record.owner_host,
            };
        }
        let removed = self.store.with_exclusive(&self.path, || -> Result<bool, StoreError> {
            match self.store.try_read_uncached::<LockRecord>(&self.path)? {
                Some(current) if current == record => self.store.remove(&self.path),
                _ => Ok(false),
            }
        });
        match removed.and_then(|inner| inner) {
            Ok(true) => {
                info!(role = %self.role, "lock released");
                ReleaseOutcome::Released
            }
            Ok(false) => ReleaseOutcome::NotHeld,
            Err(e) => ReleaseOutcome::Failed(e.to_string()),
        }
    }

    /// Acquire and wrap in a guard that releases on drop.
    ///
    /// # Errors
    ///
    /// Returns the outcome when this process did not become primary.
    pub fn into_guard(self) -> Result<LockGuard, AcquireOutcome> {
        let outcome = self.acquire();
        if outcome.is_primary() {
            Ok(LockGuard { lock: self, outcome })
        } else {
            Err(outcome)
        }
    }
}

/// Held lock; released when dropped.
#[derive(Debug)]
pub struct LockGuard {
    lock: SingletonLock,
    outcome: AcquireOutcome,
}

impl LockGuard {
    /// How the lock was obtained.
    pub fn outcome(&self) -> &AcquireOutcome {
        &self.outcome
    }

    /// The underlying lock, for renewal.
    pub fn lock(&self) -> &SingletonLock {
        &self.lock
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let ReleaseOutcome::Failed(e) = self.lock.release() {
            warn!(role = %self.lock.role, error = %e, "failed to release lock on drop");
        }
    }
}
