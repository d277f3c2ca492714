//! Dependency readiness decisions.
//!
//! A dependent may start only when its dependency has been started, is Green,
//! and its artifact is no older than the edge's threshold. Checks run in that
//! order and the first failing one names the reason.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::freshness::{ArtifactSpec, FreshnessReport, FreshnessResolver};
use crate::health::{HealthRegistry, HealthState};
use crate::store::StateStore;

/// An edge from a dependent to one dependency, with its own freshness bound.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyEdge {
    /// Upstream service name.
    pub dependency: String,
    /// Upstream artifact whose age gates the edge; its threshold applies.
    pub artifact: ArtifactSpec,
}

impl DependencyEdge {
    /// Build an edge.
    pub fn new(dependency: impl Into<String>, artifact: ArtifactSpec) -> Self {
        Self {
            dependency: dependency.into(),
            artifact,
        }
    }
}

/// Machine-readable outcome of a readiness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// All conditions hold.
    Ready,
    /// Upstream has not been started.
    NotStarted,
    /// Upstream health is not Green.
    NotGreen,
    /// Upstream artifact is older than the threshold.
    Stale,
    /// Upstream artifact age could not be determined.
    AgeUnknown,
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ready => "ready",
            Self::NotStarted => "not_started",
            Self::NotGreen => "not_green",
            Self::Stale => "stale",
            Self::AgeUnknown => "age_unknown",
        })
    }
}

/// Result of a readiness check. Logged, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadinessDecision {
    /// Upstream service.
    pub dependency: String,
    /// Whether the dependent may start.
    pub ok: bool,
    /// First failing condition, or [`ReasonCode::Ready`].
    pub reason_code: ReasonCode,
    /// Upstream health at decision time.
    pub state: HealthState,
    /// Measured artifact age.
    pub age_seconds: Option<f64>,
    /// Edge threshold.
    pub threshold_seconds: f64,
}

impl fmt::Display for ReadinessDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.dependency, self.reason_code)?;
        match self.reason_code {
            ReasonCode::NotGreen => write!(f, ": state={}⇒green", self.state),
            ReasonCode::NotStarted => f.write_str(": started=false⇒true"),
            _ => match self.age_seconds {
                Some(age) => write!(f, ": age={age:.1}s⇒{:.0}s", self.threshold_seconds),
                None => write!(f, ": age=unknown⇒{:.0}s", self.threshold_seconds),
            },
        }
    }
}

/// Decide readiness from already-gathered facts.
pub fn decide(dependency: &str, started: bool, state: HealthState, freshness: &FreshnessReport) -> ReadinessDecision {
    let reason_code = if !started {
        ReasonCode::NotStarted
    } else if state != HealthState::Green {
        ReasonCode::NotGreen
    } else {
        match freshness.age_seconds {
            None => ReasonCode::AgeUnknown,
            Some(age) if age > freshness.threshold_seconds => ReasonCode::Stale,
            Some(_) => ReasonCode::Ready,
        }
    };
    ReadinessDecision {
        dependency: dependency.to_owned(),
        ok: reason_code == ReasonCode::Ready,
        reason_code,
        state,
        age_seconds: freshness.age_seconds,
        threshold_seconds: freshness.threshold_seconds,
    }
}

/// Evaluates dependency edges against live state.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    resolver: Arc<FreshnessResolver>,
    store: Arc<StateStore>,
}

impl ReadinessGate {
    /// Build a gate.
    pub fn new(resolver: Arc<FreshnessResolver>, store: Arc<StateStore>) -> Self {
        Self { resolver, store }
    }

    /// Resolve the edge's artifact and decide.
    pub fn check(&self, edge: &DependencyEdge, started: bool, registry: &HealthRegistry) -> ReadinessDecision {
        let freshness = self.resolver.resolve(&self.store, &edge.artifact);
        let decision = decide(&edge.dependency, started, registry.state(&edge.dependency), &freshness);
        debug!(
            dependency = %edge.dependency,
            ok = decision.ok,
            reason = %decision.reason_code,
            age_secs = decision.age_seconds,
            threshold_secs = decision.threshold_seconds,
            "readiness check"
        );
        decision
    }
}
