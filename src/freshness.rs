//! Artifact age resolution across candidate locations.
//!
//! An artifact (a price snapshot, a signal file, a heartbeat) may live at
//! several paths across versions. [`FreshnessResolver`] reads every candidate,
//! pulls a timestamp from the first matching field alias, normalises its unit
//! by magnitude, rejects values outside the sanity window, and picks the most
//! recent value. When no candidate declares a usable timestamp the file
//! modification time stands in and the report is flagged `fallback_used`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::{seconds_between, SharedClock};
use crate::config::FreshnessConfig;
use crate::logging::RateLimitedWarn;
use crate::store::StateStore;

/// Field aliases tried when an artifact does not name its own.
pub const DEFAULT_TIMESTAMP_FIELDS: [&str; 5] = ["ts", "timestamp", "updated_at", "last_update", "time"];

/// Above this a raw value is nanoseconds since the epoch.
const NANOS_THRESHOLD: f64 = 1e17;
/// Above this a raw value is microseconds.
const MICROS_THRESHOLD: f64 = 1e14;
/// Above this a raw value is milliseconds.
const MILLIS_THRESHOLD: f64 = 1e11;

/// One logical artifact and where to find it.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactSpec {
    /// Display name used in logs and reasons.
    pub name: String,
    /// Candidate paths, in no particular order.
    pub candidates: Vec<PathBuf>,
    /// Timestamp field aliases; dotted paths descend into objects.
    pub fields: Vec<String>,
    /// Maximum acceptable age.
    pub threshold: Duration,
}

impl ArtifactSpec {
    /// Artifact at a single path using the default field aliases.
    pub fn single(name: impl Into<String>, path: impl Into<PathBuf>, threshold: Duration) -> Self {
        Self {
            name: name.into(),
            candidates: vec![path.into()],
            fields: DEFAULT_TIMESTAMP_FIELDS.iter().map(|f| (*f).to_owned()).collect(),
            threshold,
        }
    }

    /// Add another candidate location.
    #[must_use]
    pub fn with_candidate(mut self, path: impl Into<PathBuf>) -> Self {
        self.candidates.push(path.into());
        self
    }

    /// Replace the timestamp field aliases.
    #[must_use]
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Threshold in seconds.
    pub fn threshold_secs(&self) -> f64 {
        self.threshold.as_secs_f64()
    }
}

/// Evidence gathered from one candidate location. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FreshnessSample {
    /// Candidate path.
    pub source: PathBuf,
    /// Declared timestamp in epoch seconds after normalisation, if valid.
    pub raw_ts: Option<f64>,
    /// Age in seconds, `None` when the candidate does not exist.
    pub age_seconds: Option<f64>,
    /// Whether this candidate alone would be stale.
    pub is_stale: bool,
    /// Whether the age came from the file modification time.
    pub fallback_used: bool,
}

/// Why an artifact is or is not fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessReason {
    /// Age within threshold.
    Fresh,
    /// Age above threshold.
    Stale,
    /// No candidate exists.
    Missing,
}

impl fmt::Display for FreshnessReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Missing => "missing",
        })
    }
}

/// Resolved age of one artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FreshnessReport {
    /// Artifact name.
    pub artifact: String,
    /// Age of the most recent candidate, `None` when nothing was found.
    pub age_seconds: Option<f64>,
    /// Threshold the age was compared against.
    pub threshold_seconds: f64,
    /// Whether the artifact is too old or missing.
    pub is_stale: bool,
    /// Classification behind `is_stale`.
    pub reason: FreshnessReason,
    /// Whether the chosen age came from a modification time.
    pub fallback_used: bool,
    /// Candidate the age was taken from.
    pub source: Option<PathBuf>,
    /// Per-candidate evidence.
    pub samples: Vec<FreshnessSample>,
}

impl fmt::Display for FreshnessReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.age_seconds {
            Some(age) => write!(
                f,
                "{} {}: age={age:.1}s⇒{:.0}s",
                self.artifact, self.reason, self.threshold_seconds
            )?,
            None => write!(
                f,
                "{} missing: age=unknown⇒{:.0}s",
                self.artifact, self.threshold_seconds
            )?,
        }
        if self.fallback_used {
            f.write_str(" (mtime)")?;
        }
        Ok(())
    }
}

/// Normalise an epoch value of unknown unit to seconds.
pub fn normalize_epoch(raw: f64) -> f64 {
    let magnitude = raw.abs();
    if magnitude > NANOS_THRESHOLD {
        raw / 1e9
    } else if magnitude > MICROS_THRESHOLD {
        raw / 1e6
    } else if magnitude > MILLIS_THRESHOLD {
        raw / 1e3
    } else {
        raw
    }
}

/// Interpret a JSON value as epoch seconds.
///
/// Accepts numbers, numeric strings, and RFC 3339 strings.
pub fn parse_timestamp(value: &serde_json::Value) -> Option<f64> {
    let raw = match value {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => {
            let s = s.trim();
            match s.parse::<f64>() {
                Ok(n) => n,
                Err(_) => {
                    let parsed = DateTime::parse_from_rfc3339(s).ok()?;
                    #[allow(clippy::cast_precision_loss)]
                    let millis = parsed.timestamp_millis() as f64;
                    return Some(millis / 1000.0);
                }
            }
        }
        _ => return None,
    };
    raw.is_finite().then(|| normalize_epoch(raw))
}

/// Look up a dotted field path inside a JSON document.
fn lookup<'a>(doc: &'a serde_json::Value, dotted: &str) -> Option<&'a serde_json::Value> {
    dotted
        .split('.')
        .try_fold(doc, |node, key| node.as_object().and_then(|o| o.get(key)))
}

/// First field alias, in order, holding a timestamp that `accept` admits.
///
/// A rejected alias does not hide later ones.
pub fn extract_timestamp(
    doc: &serde_json::Value,
    fields: &[String],
    accept: impl Fn(f64) -> bool,
) -> Option<f64> {
    fields
        .iter()
        .filter_map(|field| lookup(doc, field).map(|value| (field, value)))
        .filter_map(|(field, value)| parse_timestamp(value).map(|ts| (field, ts)))
        .find_map(|(field, ts)| {
            if accept(ts) {
                Some(ts)
            } else {
                debug!(field = %field, ts, "rejecting implausible timestamp");
                None
            }
        })
}

fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let millis = at.timestamp_millis() as f64;
    millis / 1000.0
}

/// Resolves artifact ages against an injected clock.
pub struct FreshnessResolver {
    clock: SharedClock,
    sanity_window_secs: f64,
    fallback_warn: RateLimitedWarn,
}

impl fmt::Debug for FreshnessResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreshnessResolver")
            .field("sanity_window_secs", &self.sanity_window_secs)
            .finish_non_exhaustive()
    }
}

impl FreshnessResolver {
    /// Build a resolver from configuration.
    pub fn new(config: &FreshnessConfig, clock: SharedClock) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let days = config.sanity_window_days as f64;
        Self {
            clock,
            sanity_window_secs: days * 86_400.0,
            fallback_warn: RateLimitedWarn::new(Duration::from_secs(config.fallback_warn_interval_secs)),
        }
    }

    /// Current time according to the injected clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Whether an epoch-seconds value is within the sanity window of now.
    pub fn is_plausible(&self, epoch_secs: f64) -> bool {
        (epoch_secs - epoch_seconds(self.now())).abs() <= self.sanity_window_secs
    }

    /// Inspect one candidate location.
    pub fn sample(&self, store: &StateStore, path: &Path, fields: &[String], threshold: Duration) -> FreshnessSample {
        let now = self.now();
        let Some(mtime) = store.modified(path) else {
            return FreshnessSample {
                source: path.to_path_buf(),
                raw_ts: None,
                age_seconds: None,
                is_stale: true,
                fallback_used: false,
            };
        };

        let declared = store
            .read_value(path)
            .and_then(|doc| extract_timestamp(&doc, fields, |ts| self.is_plausible(ts)));

        let (age, fallback_used) = match declared {
            Some(ts) => (epoch_seconds(now) - ts, false),
            None => (seconds_between(mtime, now), true),
        };
        let age = age.max(0.0);
        FreshnessSample {
            source: path.to_path_buf(),
            raw_ts: declared,
            age_seconds: Some(age),
            is_stale: age > threshold.as_secs_f64(),
            fallback_used,
        }
    }

    /// Resolve the age of `artifact` across all of its candidates.
    ///
    /// Declared timestamps win over modification times; among each kind the
    /// most recent value is chosen regardless of candidate order.
    pub fn resolve(&self, store: &StateStore, artifact: &ArtifactSpec) -> FreshnessReport {
        let threshold_seconds = artifact.threshold_secs();
        let samples: Vec<FreshnessSample> = artifact
            .candidates
            .iter()
            .map(|path| self.sample(store, path, &artifact.fields, artifact.threshold))
            .collect();

        let freshest = |fallback: bool| {
            samples
                .iter()
                .filter(|s| s.fallback_used == fallback)
                .filter_map(|s| s.age_seconds.map(|age| (age, s)))
                .min_by(|a, b| a.0.total_cmp(&b.0))
        };
        let chosen = freshest(false).or_else(|| freshest(true));

        let Some((age, sample)) = chosen else {
            return FreshnessReport {
                artifact: artifact.name.clone(),
                age_seconds: None,
                threshold_seconds,
                is_stale: true,
                reason: FreshnessReason::Missing,
                fallback_used: false,
                source: None,
                samples,
            };
        };

        if sample.fallback_used {
            if self.fallback_warn.should_warn(&artifact.name) {
                warn!(
                    artifact = %artifact.name,
                    source = %sample.source.display(),
                    age_secs = age,
                    "no declared timestamp, using file modification time"
                );
            } else {
                debug!(artifact = %artifact.name, age_secs = age, "mtime fallback");
            }
        }

        let is_stale = age > threshold_seconds;
        FreshnessReport {
            artifact: artifact.name.clone(),
            age_seconds: Some(age),
            threshold_seconds,
            is_stale,
            reason: if is_stale {
                FreshnessReason::Stale
            } else {
                FreshnessReason::Fresh
            },
            fallback_used: sample.fallback_used,
            source: Some(sample.source.clone()),
            samples,
        }
    }
}
