//! Bounded auto-remediation.
//!
//! Each cycle looks at components that are Red, or Yellow with a failing
//! probe. A component is remediated at most once per cooldown and at most
//! `max_attempts` times until it recovers to Green or an operator resets it.
//! Past the cap it is reported as a standing warning and never retried.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::clock::{secs, SharedClock};
use crate::config::HealConfig;
use crate::health::{HealthRegistry, HealthState};
use crate::logging::RateLimitedWarn;
use crate::store::StateStore;

/// A component-specific corrective action.
#[async_trait]
pub trait Remediation: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Whether this remediation applies to `component`.
    fn handles(&self, component: &str) -> bool;

    /// Perform the action, returning a one-line description of what was done.
    async fn remediate(&self, component: &str) -> anyhow::Result<String>;
}

/// Removes a component's marker file so its supervisor restarts it.
#[derive(Debug)]
pub struct MarkerRemoval {
    markers: BTreeMap<String, PathBuf>,
    store: Arc<StateStore>,
}

impl MarkerRemoval {
    /// Remediation over the given component → marker map.
    pub fn new(store: Arc<StateStore>, markers: BTreeMap<String, PathBuf>) -> Self {
        Self { markers, store }
    }
}

#[async_trait]
impl Remediation for MarkerRemoval {
    fn name(&self) -> &str {
        "marker_removal"
    }

    fn handles(&self, component: &str) -> bool {
        self.markers.contains_key(component)
    }

    async fn remediate(&self, component: &str) -> anyhow::Result<String> {
        let marker = self
            .markers
            .get(component)
            .ok_or_else(|| anyhow::anyhow!("no marker registered for {component}"))?;
        let removed = self.store.remove(marker)?;
        Ok(if removed {
            format!("removed marker {}", marker.display())
        } else {
            format!("marker {} already absent", marker.display())
        })
    }
}

/// What the healer did for one component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealAction {
    /// Last attempt is still within the cooldown.
    CoolingDown {
        /// When the next attempt becomes eligible.
        next_eligible_at: DateTime<Utc>,
    },
    /// The attempt cap is reached; operator action needed.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Cap.
        max_attempts: u32,
    },
    /// No registered remediation handles this component.
    NoRemediation,
    /// Remediation ran.
    Remediated {
        /// Attempt number.
        attempt: u32,
        /// What was done.
        detail: String,
    },
    /// Remediation ran and failed. Still counts as an attempt.
    Failed {
        /// Attempt number.
        attempt: u32,
        /// Error text.
        error: String,
    },
}

/// Per-component result of a healing cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealDecision {
    /// Component.
    pub component: String,
    /// State that made it a candidate.
    pub state: HealthState,
    /// Outcome.
    pub action: HealAction,
}

impl fmt::Display for HealDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): ", self.component, self.state)?;
        match &self.action {
            HealAction::CoolingDown { next_eligible_at } => {
                write!(f, "cooling down until {}", next_eligible_at.to_rfc3339())
            }
            HealAction::Exhausted { attempts, max_attempts } => {
                write!(f, "heal_attempts={attempts}⇒{max_attempts}, operator reset required")
            }
            HealAction::NoRemediation => f.write_str("no remediation registered"),
            HealAction::Remediated { attempt, detail } => write!(f, "attempt {attempt}: {detail}"),
            HealAction::Failed { attempt, error } => write!(f, "attempt {attempt} failed: {error}"),
        }
    }
}

/// Runs remediations against unhealthy components.
pub struct AutoHealer {
    remediations: Vec<Arc<dyn Remediation>>,
    clock: SharedClock,
    cooldown: chrono::Duration,
    max_attempts: u32,
    exhausted_warn: RateLimitedWarn,
}

impl fmt::Debug for AutoHealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoHealer")
            .field(
                "remediations",
                &self.remediations.iter().map(|r| r.name()).collect::<Vec<_>>(),
            )
            .field("cooldown", &self.cooldown)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl AutoHealer {
    /// Healer with no remediations registered.
    pub fn new(config: &HealConfig, clock: SharedClock) -> Self {
        Self {
            remediations: Vec::new(),
            clock,
            cooldown: secs(config.cooldown_secs),
            max_attempts: config.max_attempts,
            exhausted_warn: RateLimitedWarn::new(Duration::from_secs(config.cooldown_secs)),
        }
    }

    /// Register a remediation. Earlier registrations take precedence.
    #[must_use]
    pub fn with_remediation(mut self, remediation: Arc<dyn Remediation>) -> Self {
        self.remediations.push(remediation);
        self
    }

    fn remediation_for(&self, component: &str) -> Option<&Arc<dyn Remediation>> {
        self.remediations.iter().find(|r| r.handles(component))
    }

    /// One pass over every unhealthy component.
    pub async fn run_cycle(&self, registry: &mut HealthRegistry) -> Vec<HealDecision> {
        let now = self.clock.now();
        let candidates: Vec<(String, HealthState, u32, Option<DateTime<Utc>>)> = registry
            .records()
            .filter(|r| {
                r.state == HealthState::Red || (r.state == HealthState::Yellow && r.consecutive_failures > 0)
            })
            .map(|r| (r.component_id.clone(), r.state, r.heal_attempts, r.last_heal_ts))
            .collect();

        let mut decisions = Vec::with_capacity(candidates.len());
        for (component, state, attempts, last_heal) in candidates {
            let action = self
                .decide(registry, &component, attempts, last_heal, now)
                .await;
            decisions.push(HealDecision {
                component,
                state,
                action,
            });
        }
        decisions
    }

    async fn decide(
        &self,
        registry: &mut HealthRegistry,
        component: &str,
        attempts: u32,
        last_heal: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> HealAction {
        if attempts >= self.max_attempts {
            if self.exhausted_warn.should_warn(component) {
                warn!(
                    component,
                    heal_attempts = attempts,
                    max_attempts = self.max_attempts,
                    why_not_green = %registry.why_not_green_line(component),
                    "remediation exhausted, operator reset required"
                );
            }
            return HealAction::Exhausted {
                attempts,
                max_attempts: self.max_attempts,
            };
        }

        if let Some(next_eligible_at) = last_heal
            .and_then(|at| at.checked_add_signed(self.cooldown))
            .filter(|at| now < *at)
        {
            debug!(component, next_eligible_at = %next_eligible_at.to_rfc3339(), "heal cooldown active");
            return HealAction::CoolingDown { next_eligible_at };
        }

        let Some(remediation) = self.remediation_for(component) else {
            debug!(component, "no remediation registered");
            return HealAction::NoRemediation;
        };

        let attempt = registry.note_heal_attempt(component);
        match remediation.remediate(component).await {
            Ok(detail) => {
                info!(
                    component,
                    remediation = remediation.name(),
                    attempt,
                    max_attempts = self.max_attempts,
                    detail = %detail,
                    "remediation applied"
                );
                HealAction::Remediated { attempt, detail }
            }
            Err(e) => {
                warn!(
                    component,
                    remediation = remediation.name(),
                    attempt,
                    max_attempts = self.max_attempts,
                    error = %e,
                    "remediation failed"
                );
                HealAction::Failed {
                    attempt,
                    error: e.to_string(),
                }
            }
        }
    }
}
