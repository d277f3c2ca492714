//! Duplicate-action suppression.
//!
//! An action is fingerprinted from its defining attributes plus a coarse time
//! bucket, hashed with SHA-256. The ledger maps key hashes to the time they
//! were recorded; a key blocks a repeat until its TTL elapses.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::clock::{secs, SharedClock};
use crate::config::IdempotencyConfig;
use crate::store::{StateStore, WriteOutcome};

/// Hex characters kept from the digest.
const KEY_LEN: usize = 32;

/// Deterministic action fingerprint hash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Wrap an existing hash.
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// Hex hash.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Attributes that define one action.
///
/// Attribute order does not matter; values are trimmed, and upper-cased when
/// added with [`ActionFingerprint::symbol`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionFingerprint {
    kind: String,
    attributes: BTreeMap<String, String>,
}

impl ActionFingerprint {
    /// Start a fingerprint for an action kind such as `order`.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Add a trimmed attribute.
    #[must_use]
    pub fn attr(mut self, name: &str, value: impl fmt::Display) -> Self {
        self.attributes
            .insert(name.to_owned(), value.to_string().trim().to_owned());
        self
    }

    /// Add a trimmed, upper-cased attribute (symbols, sides).
    #[must_use]
    pub fn symbol(mut self, name: &str, value: &str) -> Self {
        self.attributes
            .insert(name.to_owned(), value.trim().to_uppercase());
        self
    }

    /// Add a quantity at fixed eight-decimal precision.
    #[must_use]
    pub fn quantity(mut self, name: &str, value: f64) -> Self {
        self.attributes.insert(name.to_owned(), format!("{value:.8}"));
        self
    }

    fn canonical(&self, bucket: i64) -> String {
        let mut out = self.kind.clone();
        for (name, value) in &self.attributes {
            out.push('|');
            out.push_str(name);
            out.push('=');
            out.push_str(value);
        }
        out.push_str("|bucket=");
        out.push_str(&bucket.to_string());
        out
    }

    /// Key for an explicit time bucket.
    pub fn key_for_bucket(&self, bucket: i64) -> IdempotencyKey {
        let digest = Sha256::digest(self.canonical(bucket).as_bytes());
        let mut hash = hex::encode(digest);
        hash.truncate(KEY_LEN);
        IdempotencyKey(hash)
    }
}

/// Index of the `bucket_secs`-wide bucket containing `at`.
pub fn time_bucket(at: DateTime<Utc>, bucket_secs: u64) -> i64 {
    let width = i64::try_from(bucket_secs.max(1)).unwrap_or(i64::MAX);
    at.timestamp().checked_div_euclid(width).unwrap_or(0)
}

/// One ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// When the action ran.
    pub recorded_at: DateTime<Utc>,
    /// How long it blocks repeats.
    #[serde(rename = "ttl")]
    pub ttl_seconds: u64,
}

impl LedgerEntry {
    /// Whether the entry still blocks a repeat at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.recorded_at) < secs(self.ttl_seconds)
    }
}

/// Result of [`IdempotencyLedger::check_and_record`].
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// First occurrence; recorded.
    Admitted {
        /// Key recorded.
        key: IdempotencyKey,
        /// Ledger write result.
        write: WriteOutcome,
    },
    /// Repeat within TTL; must not run.
    Duplicate {
        /// Key that matched.
        key: IdempotencyKey,
        /// When the original ran.
        recorded_at: DateTime<Utc>,
    },
}

impl Admission {
    /// Whether the action may run.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

/// Persistent dedup ledger.
#[derive(Clone)]
pub struct IdempotencyLedger {
    store: Arc<StateStore>,
    path: PathBuf,
    clock: SharedClock,
    ttl_secs: u64,
    bucket_secs: u64,
}

impl fmt::Debug for IdempotencyLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyLedger")
            .field("path", &self.path)
            .field("ttl_secs", &self.ttl_secs)
            .field("bucket_secs", &self.bucket_secs)
            .finish_non_exhaustive()
    }
}

impl IdempotencyLedger {
    /// Ledger persisted at `path`.
    pub fn new(config: &IdempotencyConfig, store: Arc<StateStore>, path: PathBuf, clock: SharedClock) -> Self {
        Self {
            store,
            path,
            clock,
            ttl_secs: config.ttl_secs,
            bucket_secs: config.bucket_secs,
        }
    }

    /// Every entry on disk, expired ones included.
    pub fn entries(&self) -> BTreeMap<IdempotencyKey, LedgerEntry> {
        self.store.read_uncached(&self.path).unwrap_or_default()
    }

    fn live_entry(&self, key: &IdempotencyKey) -> Option<LedgerEntry> {
        let now = self.clock.now();
        self.entries().remove(key).filter(|e| e.is_live(now))
    }

    /// Whether `key` was recorded and its TTL has not elapsed.
    pub fn is_duplicate(&self, key: &IdempotencyKey) -> bool {
        self.live_entry(key).is_some()
    }

    /// Record `key` at the current time, dropping expired entries in the same write.
    pub fn record(&self, key: &IdempotencyKey) -> WriteOutcome {
        let now = self.clock.now();
        let mut entries = self.entries();
        entries.retain(|_, e| e.is_live(now));
        entries.insert(
            key.clone(),
            LedgerEntry {
                recorded_at: now,
                ttl_seconds: self.ttl_secs,
            },
        );
        let outcome = self.store.write(&self.path, &entries);
        if !outcome.ok {
            warn!(
                key = %key,
                error = outcome.last_error.as_deref().unwrap_or("unknown"),
                "failed to record idempotency key"
            );
        }
        outcome
    }

    /// Key for `action` in the current time bucket.
    pub fn key_for(&self, action: &ActionFingerprint) -> IdempotencyKey {
        action.key_for_bucket(time_bucket(self.clock.now(), self.bucket_secs))
    }

    fn matching_entry(&self, action: &ActionFingerprint) -> Option<(IdempotencyKey, LedgerEntry)> {
        let bucket = time_bucket(self.clock.now(), self.bucket_secs);
        let now = self.clock.now();
        let entries = self.entries();
        [bucket, bucket.saturating_sub(1)]
            .into_iter()
            .map(|b| action.key_for_bucket(b))
            .find_map(|key| {
                entries
                    .get(&key)
                    .filter(|e| e.is_live(now))
                    .map(|e| (key.clone(), e.clone()))
            })
    }

    /// Whether `action` was recorded in the current or previous bucket and is still live.
    pub fn is_duplicate_action(&self, action: &ActionFingerprint) -> bool {
        self.matching_entry(action).is_some()
    }

    /// Admit `action` once: record it if new, report the original if not.
    pub fn check_and_record(&self, action: &ActionFingerprint) -> Admission {
        if let Some((key, entry)) = self.matching_entry(action) {
            info!(key = %key, recorded_at = %entry.recorded_at.to_rfc3339(), "duplicate action suppressed");
            return Admission::Duplicate {
                key,
                recorded_at: entry.recorded_at,
            };
        }
        let key = self.key_for(action);
        let write = self.record(&key);
        Admission::Admitted { key, write }
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn compact(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        let removed = before.saturating_sub(entries.len());
        if removed == 0 {
            return 0;
        }
        let outcome = self.store.write(&self.path, &entries);
        if outcome.ok {
            debug!(removed, remaining = entries.len(), "compacted idempotency ledger");
            removed
        } else {
            warn!(
                error = outcome.last_error.as_deref().unwrap_or("unknown"),
                "failed to compact idempotency ledger"
            );
            0
        }
    }
}
