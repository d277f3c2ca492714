//! Versioned health snapshot and legacy-path migration.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::HealthRecord;
use crate::store::StateStore;

/// Current snapshot schema version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Suffix appended to legacy snapshots once the canonical file is authoritative.
const BACKUP_SUFFIX: &str = "migrated";

/// On-disk health snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Schema version.
    pub version: u32,
    /// When the snapshot was taken.
    pub ts: DateTime<Utc>,
    /// Records keyed by component name.
    #[serde(default)]
    pub components: BTreeMap<String, HealthRecord>,
}

/// Read and validate the snapshot at `path`.
///
/// Missing, malformed, and unknown-version files all yield `None`.
pub fn load_snapshot(store: &StateStore, path: &Path) -> Option<HealthSnapshot> {
    let snapshot = match store.try_read_uncached::<HealthSnapshot>(path) {
        Ok(snapshot) => snapshot?,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed health snapshot, starting empty");
            return None;
        }
    };
    if snapshot.version != SNAPSHOT_VERSION {
        warn!(
            path = %path.display(),
            version = snapshot.version,
            expected = SNAPSHOT_VERSION,
            "unsupported health snapshot version, starting empty"
        );
        return None;
    }
    Some(snapshot)
}

/// What [`migrate_legacy`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Canonical was absent and was seeded from this legacy file.
    Migrated {
        /// Legacy file copied.
        from: PathBuf,
    },
    /// Canonical already existed; these legacy files were backed up.
    BackedUp {
        /// Backup files written.
        backups: Vec<PathBuf>,
    },
    /// Nothing to do.
    Nothing,
}

fn backup_path(legacy: &Path) -> PathBuf {
    let mut name = legacy.as_os_str().to_owned();
    name.push(".");
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Reconcile the canonical snapshot with legacy locations.
///
/// When `canonical` is absent it is seeded from the first valid legacy
/// snapshot. When present, each legacy file without a backup is copied to
/// `<legacy>.migrated`. Legacy files are never deleted.
pub fn migrate_legacy(store: &StateStore, canonical: &Path, legacy: &[PathBuf]) -> MigrationOutcome {
    if !canonical.exists() {
        for candidate in legacy {
            let Some(snapshot) = load_snapshot(store, candidate) else {
                continue;
            };
            let outcome = store.write(canonical, &snapshot);
            if outcome.ok {
                info!(
                    from = %candidate.display(),
                    to = %canonical.display(),
                    "migrated legacy health snapshot"
                );
                return MigrationOutcome::Migrated {
                    from: candidate.clone(),
                };
            }
            warn!(
                from = %candidate.display(),
                error = outcome.last_error.as_deref().unwrap_or("unknown"),
                "failed to seed canonical health snapshot"
            );
        }
        return MigrationOutcome::Nothing;
    }

    let mut backups = Vec::new();
    for candidate in legacy.iter().filter(|p| p.as_path() != canonical && p.exists()) {
        let backup = backup_path(candidate);
        if backup.exists() {
            continue;
        }
        match fs::copy(candidate, &backup) {
            Ok(_) => {
                info!(legacy = %candidate.display(), backup = %backup.display(), "backed up legacy health snapshot");
                backups.push(backup);
            }
            Err(e) => warn!(legacy = %candidate.display(), error = %e, "failed to back up legacy health snapshot"),
        }
    }
    if backups.is_empty() {
        MigrationOutcome::Nothing
    } else {
        MigrationOutcome::BackedUp { backups }
    }
}
