//! The supervision loop.
//!
//! Everything runs on one sequential loop: probes, remediation, startup, and
//! persistence all mutate the registry from the same task, so it needs no
//! locking. A failing tick is logged and followed by an extended backoff; it
//! never ends the loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use steward::coordinator::Coordinator;
use steward::heal::{AutoHealer, HealDecision};
use steward::health::Transition;
use steward::lock::LockGuard;
use steward::orchestrator::{ServiceSpec, StartupOrchestrator, StartupReport};

use crate::config::ChecksConfig;
use crate::probes::{probe_service, probe_store, STATE_STORE_COMPONENT};

/// Temp files older than this are treated as abandoned by a crashed writer.
const ORPHAN_MAX_AGE: Duration = Duration::from_secs(300);

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    /// State transitions observed.
    pub transitions: Vec<Transition>,
    /// Operator heal resets applied.
    pub heal_resets: Vec<String>,
    /// Remediation decisions.
    pub heals: Vec<HealDecision>,
    /// Startup chain outcome.
    pub startup: StartupReport,
    /// Whether the snapshot was written.
    pub snapshot_written: bool,
    /// Expired ledger entries dropped.
    pub compacted: usize,
}

/// Long-running supervisor state.
pub struct Monitor {
    coordinator: Coordinator,
    services: Vec<ServiceSpec>,
    orchestrator: StartupOrchestrator,
    healer: AutoHealer,
    checks: ChecksConfig,
    lock: Option<LockGuard>,
    last_snapshot: Option<Instant>,
    last_compaction: Option<Instant>,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("services", &self.services.iter().map(|s| &s.name).collect::<Vec<_>>())
            .field("checks", &self.checks)
            .finish_non_exhaustive()
    }
}

fn due(last: Option<Instant>, every: Duration, now: Instant) -> bool {
    last.map_or(true, |at| now.saturating_duration_since(at) >= every)
}

impl Monitor {
    /// Assemble a monitor.
    pub fn new(
        coordinator: Coordinator,
        services: Vec<ServiceSpec>,
        orchestrator: StartupOrchestrator,
        healer: AutoHealer,
        checks: ChecksConfig,
    ) -> Self {
        Self {
            coordinator,
            services,
            orchestrator,
            healer,
            checks,
            lock: None,
            last_snapshot: None,
            last_compaction: None,
        }
    }

    /// Hold `guard` for the monitor's lifetime and renew it each tick.
    #[must_use]
    pub fn with_lock(mut self, guard: LockGuard) -> Self {
        self.lock = Some(guard);
        self
    }

    /// Coordination context.
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// One supervision pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock lease could not be renewed.
    pub async fn tick(&mut self) -> anyhow::Result<TickReport> {
        let mut report = TickReport::default();

        if let Some(guard) = &self.lock {
            guard.lock().renew()?;
        }

        let resolver = self.coordinator.resolver();
        let store = self.coordinator.store();
        for service in &self.services {
            let (freshness, outcome) = probe_service(&resolver, &store, service);
            debug!(service = %service.name, freshness = %freshness, "probed");
            if let Some(t) = self.coordinator.registry_mut().observe(&service.name, outcome) {
                report.transitions.push(t);
            }
        }

        let contention = probe_store(&store);
        if !contention.healthy {
            warn!(
                component = STATE_STORE_COMPONENT,
                detail = contention.detail.as_deref().unwrap_or(""),
                "state store contention"
            );
        }
        if let Some(t) = self
            .coordinator
            .registry_mut()
            .observe(STATE_STORE_COMPONENT, contention)
        {
            report.transitions.push(t);
        }

        report.heal_resets = self.coordinator.apply_heal_resets();
        report.heals = self.healer.run_cycle(self.coordinator.registry_mut()).await;
        report.startup = self
            .orchestrator
            .start_chain(self.coordinator.registry_mut(), &self.services)
            .await;

        // Store writes block on fsync and retry backoff, so persistence runs
        // on the blocking pool rather than on this task's worker.
        let now = Instant::now();
        if due(self.last_snapshot, Duration::from_secs(self.checks.snapshot_interval_secs), now) {
            let snapshot = self.coordinator.registry().snapshot();
            let path = self.coordinator.paths().health_snapshot.clone();
            let writer = Arc::clone(&store);
            let outcome = tokio::task::spawn_blocking(move || writer.write(&path, &snapshot)).await?;
            if !outcome.ok {
                warn!(
                    error = outcome.last_error.as_deref().unwrap_or("unknown"),
                    "failed to persist health snapshot"
                );
            }
            report.snapshot_written = outcome.ok;
            self.last_snapshot = Some(now);
        }
        if due(self.last_compaction, Duration::from_secs(self.checks.compaction_interval_secs), now) {
            let ledger = self.coordinator.ledger().clone();
            let state_dir = self.coordinator.paths().state_dir.clone();
            let (compacted, swept) = tokio::task::spawn_blocking(move || {
                (ledger.compact(), store.sweep_orphans(&state_dir, ORPHAN_MAX_AGE))
            })
            .await?;
            if swept > 0 {
                info!(swept, "removed orphaned temp files");
            }
            report.compacted = compacted;
            self.last_compaction = Some(now);
        }
        Ok(report)
    }

    /// Tick until `shutdown` resolves, then flush and release.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.checks.interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let error_backoff = Duration::from_secs(self.checks.error_backoff_secs);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = interval.tick() => {}
            }
            match self.tick().await {
                Ok(report) => debug!(
                    transitions = report.transitions.len(),
                    heals = report.heals.len(),
                    startup_complete = report.startup.is_complete(),
                    "tick complete"
                ),
                Err(e) => {
                    warn!(error = %e, backoff_secs = error_backoff.as_secs(), "tick failed, backing off");
                    tokio::select! {
                        () = &mut shutdown => break,
                        () = tokio::time::sleep(error_backoff) => {}
                    }
                }
            }
        }

        info!("overseer shutting down");
        self.shutdown();
    }

    /// Flush the snapshot and release the lock.
    pub fn shutdown(self) {
        let Self { coordinator, lock, .. } = self;
        let outcome = coordinator.shutdown();
        if !outcome.ok {
            warn!(error = outcome.last_error.as_deref().unwrap_or("unknown"), "final snapshot failed");
        }
        drop(lock);
    }
}
