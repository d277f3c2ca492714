//! Dependency-ordered service startup.
//!
//! [`StartupOrchestrator::start_chain`] walks services in declaration order.
//! Services that are already running count as started. The first service
//! that cannot start (gate closed, cooldown, spawn failure) aborts the rest of
//! the chain so nothing downstream starts out of order. The orchestrator
//! decides when to spawn; how is left to a [`Spawner`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::ack::{AckBoard, AckKind};
use crate::clock::{secs, SharedClock};
use crate::config::OrchestratorConfig;
use crate::freshness::{ArtifactSpec, FreshnessResolver};
use crate::health::{HealthRegistry, HealthState, ProbeOutcome};
use crate::readiness::{DependencyEdge, ReadinessGate, ReasonCode};
use crate::store::StateStore;

/// A service in the startup chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSpec {
    /// Unique name; also the health component id.
    pub name: String,
    /// Upstream edges, all of which must be ready.
    pub depends_on: Vec<DependencyEdge>,
    /// Artifact the service itself produces; its freshness is its health.
    pub own_artifact: ArtifactSpec,
}

/// Launches services. Implementations own the mechanics.
#[async_trait]
pub trait Spawner: Send + Sync {
    /// Start `service` detached, returning its PID.
    async fn spawn(&self, service: &ServiceSpec) -> anyhow::Result<u32>;

    /// Whether `service` currently has a live process.
    fn is_running(&self, service: &ServiceSpec) -> bool;
}

/// Structured record of a refused start.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkipStart {
    /// Service that was not started.
    pub service: String,
    /// Dependency that blocked it.
    pub dependency: String,
    /// Why the dependency blocked it.
    pub reason_code: ReasonCode,
    /// Dependency health at decision time.
    pub state: HealthState,
    /// Measured dependency artifact age.
    pub measured_age: Option<f64>,
    /// Edge threshold.
    pub threshold: f64,
    /// Earliest next attempt.
    pub next_retry_at: DateTime<Utc>,
}

impl fmt::Display for SkipStart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let age = self
            .measured_age
            .map_or_else(|| "unknown".to_owned(), |a| format!("{a:.0}"));
        write!(
            f,
            "skip-start{{service={}, dep={}, reason={}, age={age}, threshold={:.0}, next_retry={}}}",
            self.service,
            self.dependency,
            self.reason_code,
            self.threshold,
            self.next_retry_at.to_rfc3339()
        )
    }
}

/// How the post-spawn readiness wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyWait {
    /// The service turned Green.
    Green {
        /// Time waited.
        waited: Duration,
    },
    /// The bounded wait elapsed first. The process is left running.
    TimedOut {
        /// Time waited.
        waited: Duration,
    },
}

/// What happened to one service during a pass.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceOutcome {
    /// A live process already exists.
    AlreadyRunning,
    /// Spawned in this pass.
    Started {
        /// New PID.
        pid: u32,
        /// Readiness wait result.
        ready: ReadyWait,
    },
    /// A dependency gate refused the start.
    Skipped(SkipStart),
    /// A previous attempt is still within the cooldown window.
    CoolingDown {
        /// Earliest next attempt.
        next_retry_at: DateTime<Utc>,
    },
    /// The spawner returned an error.
    SpawnFailed {
        /// Error text.
        error: String,
    },
}

/// Result of one [`StartupOrchestrator::start_chain`] pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartupReport {
    /// Per-service outcomes in chain order, up to and including the abort point.
    pub outcomes: Vec<(String, ServiceOutcome)>,
    /// Service at which the chain stopped, if any.
    pub aborted_at: Option<String>,
}

impl StartupReport {
    /// The skip event that aborted the chain, if that is why it stopped.
    pub fn skip(&self) -> Option<&SkipStart> {
        self.outcomes.iter().find_map(|(_, o)| match o {
            ServiceOutcome::Skipped(skip) => Some(skip),
            _ => None,
        })
    }

    /// Names of services spawned in this pass.
    pub fn spawned(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, ServiceOutcome::Started { .. }))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Whether every service is running or was started.
    pub fn is_complete(&self) -> bool {
        self.aborted_at.is_none()
    }
}

/// Drives ordered startup with readiness gating and restart cooldown.
pub struct StartupOrchestrator {
    gate: ReadinessGate,
    resolver: Arc<FreshnessResolver>,
    store: Arc<StateStore>,
    spawner: Arc<dyn Spawner>,
    acks: Option<AckBoard>,
    clock: SharedClock,
    cooldown: chrono::Duration,
    ready_timeout: Duration,
    ready_poll: Duration,
    started: BTreeSet<String>,
    next_retry_at: BTreeMap<String, DateTime<Utc>>,
}

impl fmt::Debug for StartupOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartupOrchestrator")
            .field("cooldown", &self.cooldown)
            .field("started", &self.started)
            .field("next_retry_at", &self.next_retry_at)
            .finish_non_exhaustive()
    }
}

impl StartupOrchestrator {
    /// Build an orchestrator.
    pub fn new(
        config: &OrchestratorConfig,
        resolver: Arc<FreshnessResolver>,
        store: Arc<StateStore>,
        spawner: Arc<dyn Spawner>,
        clock: SharedClock,
    ) -> Self {
        Self {
            gate: ReadinessGate::new(Arc::clone(&resolver), Arc::clone(&store)),
            resolver,
            store,
            spawner,
            acks: None,
            clock,
            cooldown: secs(config.restart_cooldown_secs),
            ready_timeout: Duration::from_secs(config.ready_timeout_secs),
            ready_poll: Duration::from_secs(config.ready_poll_secs),
            started: BTreeSet::new(),
            next_retry_at: BTreeMap::new(),
        }
    }

    /// Record launch requests on `acks`.
    #[must_use]
    pub fn with_acks(mut self, acks: AckBoard) -> Self {
        self.acks = Some(acks);
        self
    }

    /// Gate used for dependency checks.
    pub fn gate(&self) -> &ReadinessGate {
        &self.gate
    }

    /// Whether `service` is known to be started.
    pub fn is_started(&self, service: &str) -> bool {
        self.started.contains(service)
    }

    /// Earliest next start attempt for `service`, if one is scheduled.
    pub fn next_retry_at(&self, service: &str) -> Option<DateTime<Utc>> {
        self.next_retry_at.get(service).copied()
    }

    fn schedule_retry(&mut self, service: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        let at = now.checked_add_signed(self.cooldown).unwrap_or(now);
        self.next_retry_at.insert(service.to_owned(), at);
        at
    }

    /// Bring every service up in order, stopping at the first that cannot start.
    pub async fn start_chain(&mut self, registry: &mut HealthRegistry, services: &[ServiceSpec]) -> StartupReport {
        let mut report = StartupReport::default();
        for service in services {
            let outcome = self.start_one(registry, service).await;
            let proceed = matches!(
                outcome,
                ServiceOutcome::AlreadyRunning | ServiceOutcome::Started { .. }
            );
            report.outcomes.push((service.name.clone(), outcome));
            if !proceed {
                report.aborted_at = Some(service.name.clone());
                break;
            }
        }
        report
    }

    async fn start_one(&mut self, registry: &mut HealthRegistry, service: &ServiceSpec) -> ServiceOutcome {
        if self.spawner.is_running(service) {
            self.started.insert(service.name.clone());
            return ServiceOutcome::AlreadyRunning;
        }
        if self.started.remove(&service.name) {
            warn!(service = %service.name, "service no longer running");
        }

        let now = self.clock.now();
        if let Some(next_retry_at) = self.next_retry_at(&service.name).filter(|at| now < *at) {
            info!(
                service = %service.name,
                next_retry_at = %next_retry_at.to_rfc3339(),
                "start attempt within cooldown, deferring"
            );
            return ServiceOutcome::CoolingDown { next_retry_at };
        }

        for edge in &service.depends_on {
            let started = self.started.contains(&edge.dependency);
            let decision = self.gate.check(edge, started, registry);
            if decision.ok {
                continue;
            }
            let next_retry_at = self.schedule_retry(&service.name, now);
            let skip = SkipStart {
                service: service.name.clone(),
                dependency: decision.dependency,
                reason_code: decision.reason_code,
                state: decision.state,
                measured_age: decision.age_seconds,
                threshold: decision.threshold_seconds,
                next_retry_at,
            };
            warn!(
                event = "skip_start",
                service = %skip.service,
                dependency = %skip.dependency,
                reason = %skip.reason_code,
                state = %skip.state,
                age_secs = skip.measured_age,
                threshold_secs = skip.threshold,
                next_retry_at = %skip.next_retry_at.to_rfc3339(),
                "{skip}"
            );
            return ServiceOutcome::Skipped(skip);
        }

        self.schedule_retry(&service.name, now);
        if let Some(acks) = &self.acks {
            acks.mark(&service.name, AckKind::LaunchRequest);
        }
        let pid = match self.spawner.spawn(service).await {
            Ok(pid) => pid,
            Err(e) => {
                warn!(service = %service.name, error = %e, "spawn failed");
                if let Some(acks) = &self.acks {
                    acks.mark_error(&service.name, e.to_string());
                }
                return ServiceOutcome::SpawnFailed { error: e.to_string() };
            }
        };
        info!(service = %service.name, pid, "service spawned");
        self.started.insert(service.name.clone());

        let ready = self.wait_ready(registry, service).await;
        match ready {
            ReadyWait::Green { waited } => info!(
                service = %service.name,
                waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                "service ready"
            ),
            ReadyWait::TimedOut { waited } => warn!(
                service = %service.name,
                waited_secs = waited.as_secs(),
                timeout_secs = self.ready_timeout.as_secs(),
                why_not_green = %registry.why_not_green_line(&service.name),
                "service did not turn green within the readiness window"
            ),
        }
        ServiceOutcome::Started { pid, ready }
    }

    /// Probe the service's own artifact until it is Green or the wait times out.
    pub async fn wait_ready(&self, registry: &mut HealthRegistry, service: &ServiceSpec) -> ReadyWait {
        let started = tokio::time::Instant::now();
        let deadline = started.checked_add(self.ready_timeout).unwrap_or(started);
        loop {
            let freshness = self.resolver.resolve(&self.store, &service.own_artifact);
            registry.observe(&service.name, ProbeOutcome::from_freshness(&freshness));
            let now = tokio::time::Instant::now();
            let waited = now.saturating_duration_since(started);
            if registry.state(&service.name) == HealthState::Green {
                return ReadyWait::Green { waited };
            }
            if now >= deadline {
                return ReadyWait::TimedOut { waited };
            }
            tokio::time::sleep(self.ready_poll.min(deadline.saturating_duration_since(now))).await;
        }
    }
}
