//! Per-component health state with hysteresis.
//!
//! [`HealthRegistry`] owns every [`HealthRecord`]. It is mutated only by the
//! monitor loop that feeds it probe outcomes, so it needs no interior locking.
//! Records survive restarts through the snapshot in [`snapshot`].

pub mod hysteresis;
pub mod snapshot;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::config::HysteresisConfig;
use crate::freshness::{FreshnessReason, FreshnessReport};
use crate::store::{StateStore, WriteOutcome};

pub use self::hysteresis::{Hysteresis, Transition, Trigger};
pub use self::snapshot::{migrate_legacy, HealthSnapshot, MigrationOutcome, SNAPSHOT_VERSION};

/// Component health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Never observed.
    #[default]
    Unknown,
    /// Healthy.
    Green,
    /// Observed but not yet proven either way.
    Yellow,
    /// Failing past the hysteresis thresholds.
    Red,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Unknown => "unknown",
            Self::Green => "green",
            Self::Yellow => "yellow",
            Self::Red => "red",
        })
    }
}

/// One `actual⇒threshold` pair standing between a component and Green.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocker {
    /// Metric name.
    pub metric: String,
    /// Measured value, already formatted.
    pub actual: String,
    /// Value it has to reach.
    pub threshold: String,
}

impl Blocker {
    /// Build a blocker.
    pub fn new(metric: impl Into<String>, actual: impl Into<String>, threshold: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            actual: actual.into(),
            threshold: threshold.into(),
        }
    }
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}⇒{}", self.metric, self.actual, self.threshold)
    }
}

/// Persistent per-component health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    /// Component name.
    pub component_id: String,
    /// Current state.
    #[serde(default)]
    pub state: HealthState,
    /// Last probe time.
    #[serde(default)]
    pub last_check_ts: Option<DateTime<Utc>>,
    /// Current failure streak.
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Current success streak.
    #[serde(default)]
    pub consecutive_successes: u32,
    /// When the component last turned Red.
    #[serde(default)]
    pub red_since_ts: Option<DateTime<Utc>>,
    /// Remediation attempts since the last recovery or reset.
    #[serde(default)]
    pub heal_attempts: u32,
    /// Last remediation attempt.
    #[serde(default)]
    pub last_heal_ts: Option<DateTime<Utc>>,
    /// Start of the current failure streak.
    #[serde(default)]
    pub failing_since_ts: Option<DateTime<Utc>>,
    /// Last state change.
    #[serde(default)]
    pub last_transition_ts: Option<DateTime<Utc>>,
    /// Blockers reported by the most recent failed probe.
    #[serde(default)]
    pub last_blockers: Vec<Blocker>,
}

impl HealthRecord {
    /// A never-observed record.
    pub fn new(component_id: impl Into<String>) -> Self {
        Self {
            component_id: component_id.into(),
            state: HealthState::Unknown,
            last_check_ts: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            red_since_ts: None,
            heal_attempts: 0,
            last_heal_ts: None,
            failing_since_ts: None,
            last_transition_ts: None,
            last_blockers: Vec::new(),
        }
    }
}

/// Result of one probe of one component.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProbeOutcome {
    /// Whether the probe passed.
    pub healthy: bool,
    /// Free-form detail for logs.
    pub detail: Option<String>,
    /// Why the probe failed, as `actual⇒threshold` pairs.
    pub blockers: Vec<Blocker>,
}

impl ProbeOutcome {
    /// A passing probe.
    pub fn pass() -> Self {
        Self {
            healthy: true,
            ..Self::default()
        }
    }

    /// A failing probe with one blocker.
    pub fn fail(blocker: Blocker) -> Self {
        Self {
            healthy: false,
            detail: None,
            blockers: vec![blocker],
        }
    }

    /// Probe outcome derived from an artifact's freshness.
    pub fn from_freshness(report: &FreshnessReport) -> Self {
        if report.reason == FreshnessReason::Fresh {
            return Self::pass();
        }
        let actual = report
            .age_seconds
            .map_or_else(|| "unknown".to_owned(), |age| format!("{age:.1}s"));
        Self::fail(Blocker::new(
            format!("{}.age", report.artifact),
            actual,
            format!("{:.0}s", report.threshold_seconds),
        ))
        .with_detail(report.to_string())
    }

    /// Attach detail text.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Owner of every component's health record.
pub struct HealthRegistry {
    hysteresis: Hysteresis,
    clock: SharedClock,
    records: BTreeMap<String, HealthRecord>,
}

impl fmt::Debug for HealthRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthRegistry")
            .field("hysteresis", &self.hysteresis)
            .field("records", &self.records)
            .finish_non_exhaustive()
    }
}

impl HealthRegistry {
    /// Empty registry.
    pub fn new(config: &HysteresisConfig, clock: SharedClock) -> Self {
        Self {
            hysteresis: Hysteresis::from_config(config),
            clock,
            records: BTreeMap::new(),
        }
    }

    /// Registry seeded from a snapshot.
    pub fn from_snapshot(config: &HysteresisConfig, clock: SharedClock, snapshot: HealthSnapshot) -> Self {
        let mut registry = Self::new(config, clock);
        registry.records = snapshot.components;
        registry
    }

    /// Registry seeded from the snapshot at `path`, empty if absent or malformed.
    pub fn load(config: &HysteresisConfig, clock: SharedClock, store: &StateStore, path: &Path) -> Self {
        match snapshot::load_snapshot(store, path) {
            Some(snap) => {
                info!(path = %path.display(), components = snap.components.len(), "restored health snapshot");
                Self::from_snapshot(config, clock, snap)
            }
            None => Self::new(config, clock),
        }
    }

    /// Hysteresis parameters in force.
    pub fn hysteresis(&self) -> &Hysteresis {
        &self.hysteresis
    }

    /// Current time according to the registry's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Feed one probe outcome. Returns the transition if the state changed.
    pub fn observe(&mut self, component: &str, outcome: ProbeOutcome) -> Option<Transition> {
        let now = self.clock.now();
        let record = self
            .records
            .entry(component.to_owned())
            .or_insert_with(|| HealthRecord::new(component));
        if record.state == HealthState::Unknown {
            record.state = HealthState::Yellow;
        }
        record.last_blockers = if outcome.healthy {
            Vec::new()
        } else {
            outcome.blockers
        };

        let (to, trigger) = self.hysteresis.apply(record, outcome.healthy, now)?;
        let from = record.state;
        record.state = to;
        record.last_transition_ts = Some(now);
        match to {
            HealthState::Red => record.red_since_ts = Some(now),
            HealthState::Green => {
                record.red_since_ts = None;
                record.heal_attempts = 0;
            }
            HealthState::Yellow | HealthState::Unknown => {}
        }

        let transition = Transition {
            component: component.to_owned(),
            from,
            to,
            trigger,
            at: now,
        };
        if to == HealthState::Red {
            warn!(
                component,
                from = %from,
                to = %to,
                trigger = %trigger,
                detail = outcome.detail.as_deref().unwrap_or(""),
                "health transition"
            );
        } else {
            info!(component, from = %from, to = %to, trigger = %trigger, "health transition");
        }
        Some(transition)
    }

    /// State of `component`, [`HealthState::Unknown`] if never observed.
    pub fn state(&self, component: &str) -> HealthState {
        self.records
            .get(component)
            .map_or(HealthState::Unknown, |r| r.state)
    }

    /// Record for `component`.
    pub fn record(&self, component: &str) -> Option<&HealthRecord> {
        self.records.get(component)
    }

    /// All records, ordered by component name.
    pub fn records(&self) -> impl Iterator<Item = &HealthRecord> {
        self.records.values()
    }

    /// Blockers keeping `component` from Green. Empty when Green.
    pub fn why_not_green(&self, component: &str) -> Vec<Blocker> {
        match self.records.get(component) {
            Some(record) => self.hysteresis.blockers(record, self.clock.now()),
            None => vec![Blocker::new("observations", "0", "1")],
        }
    }

    /// [`Self::why_not_green`] rendered as one line, empty when Green.
    pub fn why_not_green_line(&self, component: &str) -> String {
        self.why_not_green(component)
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Count a remediation attempt. Returns the new attempt count.
    pub fn note_heal_attempt(&mut self, component: &str) -> u32 {
        let now = self.clock.now();
        let record = self
            .records
            .entry(component.to_owned())
            .or_insert_with(|| HealthRecord::new(component));
        record.heal_attempts = record.heal_attempts.saturating_add(1);
        record.last_heal_ts = Some(now);
        record.heal_attempts
    }

    /// Operator reset of the remediation budget. Returns whether the component exists.
    pub fn reset_heal(&mut self, component: &str) -> bool {
        match self.records.get_mut(component) {
            Some(record) => {
                info!(component, previous_attempts = record.heal_attempts, "heal attempts reset");
                record.heal_attempts = 0;
                record.last_heal_ts = None;
                true
            }
            None => false,
        }
    }

    /// Versioned snapshot of every record.
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            version: SNAPSHOT_VERSION,
            ts: self.clock.now(),
            components: self.records.clone(),
        }
    }

    /// Write the snapshot to `path`.
    pub fn persist(&self, store: &StateStore, path: &Path) -> WriteOutcome {
        let outcome = store.write(path, &self.snapshot());
        if !outcome.ok {
            warn!(
                path = %path.display(),
                error = outcome.last_error.as_deref().unwrap_or("unknown"),
                "failed to persist health snapshot"
            );
        }
        outcome
    }
}
