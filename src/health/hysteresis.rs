//! Flap-suppressing state transitions.
//!
//! A non-Red component turns Red once it has failed K consecutive probes or
//! has been failing continuously for T, whichever comes first. Any success
//! ends the failure streak. A non-Green component turns Green after N
//! consecutive successes.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::{Blocker, HealthRecord, HealthState};
use crate::clock::{seconds_between, secs};
use crate::config::HysteresisConfig;

/// Metric that caused a state change.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// K consecutive failed probes.
    ConsecutiveFailures {
        /// Observed streak.
        count: u32,
        /// Configured K.
        k: u32,
    },
    /// Continuous failure for at least T.
    FailingDuration {
        /// Observed failing time in seconds.
        secs: f64,
        /// Configured T in seconds.
        t: u64,
    },
    /// Enough consecutive successes to recover.
    Recovered {
        /// Observed streak.
        successes: u32,
        /// Required streak.
        required: u32,
    },
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConsecutiveFailures { count, k } => write!(f, "consecutive_failures={count}⇒{k}"),
            Self::FailingDuration { secs, t } => write!(f, "red_duration={secs:.1}s⇒{t}s"),
            Self::Recovered { successes, required } => {
                write!(f, "consecutive_successes={successes}⇒{required}")
            }
        }
    }
}

/// A state change produced by one observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    /// Component that changed.
    pub component: String,
    /// Previous state.
    pub from: HealthState,
    /// New state.
    pub to: HealthState,
    /// What caused it.
    pub trigger: Trigger,
    /// When it happened.
    pub at: DateTime<Utc>,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}→{} ({})", self.component, self.from, self.to, self.trigger)
    }
}

/// Hysteresis parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hysteresis {
    failure_threshold: u32,
    failing_duration_secs: u64,
    recovery_successes: u32,
}

impl Hysteresis {
    /// Build from configuration.
    pub fn from_config(config: &HysteresisConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            failing_duration_secs: config.failing_duration_secs,
            recovery_successes: config.recovery_successes,
        }
    }

    /// K.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// T.
    pub fn failing_duration(&self) -> Duration {
        secs(self.failing_duration_secs)
    }

    /// Apply one probe result to `record`, returning the new state and trigger
    /// when the state changed.
    pub fn apply(
        &self,
        record: &mut HealthRecord,
        healthy: bool,
        now: DateTime<Utc>,
    ) -> Option<(HealthState, Trigger)> {
        record.last_check_ts = Some(now);
        if healthy {
            record.consecutive_successes = record.consecutive_successes.saturating_add(1);
            record.consecutive_failures = 0;
            record.failing_since_ts = None;
            if record.state != HealthState::Green && record.consecutive_successes >= self.recovery_successes {
                return Some((
                    HealthState::Green,
                    Trigger::Recovered {
                        successes: record.consecutive_successes,
                        required: self.recovery_successes,
                    },
                ));
            }
            return None;
        }

        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        record.consecutive_successes = 0;
        let failing_since = *record.failing_since_ts.get_or_insert(now);
        if record.state == HealthState::Red {
            return None;
        }

        if record.consecutive_failures >= self.failure_threshold {
            return Some((
                HealthState::Red,
                Trigger::ConsecutiveFailures {
                    count: record.consecutive_failures,
                    k: self.failure_threshold,
                },
            ));
        }
        if now.signed_duration_since(failing_since) >= self.failing_duration() {
            return Some((
                HealthState::Red,
                Trigger::FailingDuration {
                    secs: seconds_between(failing_since, now),
                    t: self.failing_duration_secs,
                },
            ));
        }
        None
    }

    /// The `actual⇒threshold` pairs keeping `record` from Green. Empty when Green.
    pub fn blockers(&self, record: &HealthRecord, now: DateTime<Utc>) -> Vec<Blocker> {
        if record.state == HealthState::Green {
            return Vec::new();
        }
        let mut out = Vec::new();
        if record.consecutive_failures > 0 {
            out.push(Blocker::new(
                "consecutive_failures",
                record.consecutive_failures.to_string(),
                self.failure_threshold.to_string(),
            ));
        }
        if let Some(since) = record.failing_since_ts.or(record.red_since_ts) {
            out.push(Blocker::new(
                "red_duration",
                format!("{:.1}s", seconds_between(since, now).max(0.0)),
                format!("{}s", self.failing_duration_secs),
            ));
        }
        out.push(Blocker::new(
            "consecutive_successes",
            record.consecutive_successes.to_string(),
            self.recovery_successes.to_string(),
        ));
        out.extend(record.last_blockers.iter().cloned());
        out
    }
}

impl Default for Hysteresis {
    fn default() -> Self {
        Self::from_config(&HysteresisConfig::default())
    }
}
