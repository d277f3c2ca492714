//! Explicit coordination context.
//!
//! [`Coordinator`] owns the store, the health registry, and the policy
//! objects built from one configuration. It is created once per process,
//! handed to whoever needs it, and flushes the health snapshot when shut down
//! or dropped.

use std::fs;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ack::AckBoard;
use crate::clock::{self, SharedClock};
use crate::config::{StatePaths, StewardConfig};
use crate::freshness::FreshnessResolver;
use crate::heal::AutoHealer;
use crate::health::{migrate_legacy, HealthRegistry, MigrationOutcome};
use crate::idempotency::IdempotencyLedger;
use crate::lock::{ProcessProbe, SingletonLock, SystemProbe};
use crate::orchestrator::{Spawner, StartupOrchestrator};
use crate::readiness::ReadinessGate;
use crate::store::{StateStore, WriteOutcome};

/// Body of a `heal_reset/<component>` request file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealResetRequest {
    /// When the reset was requested.
    pub requested_at: DateTime<Utc>,
}

/// Ask the running daemon to reset `component`'s heal attempts.
///
/// # Errors
///
/// Returns an error if the request file cannot be written.
pub fn request_heal_reset(store: &StateStore, paths: &StatePaths, component: &str) -> anyhow::Result<()> {
    anyhow::ensure!(
        !component.is_empty() && !component.contains(['/', '\\']) && component != "..",
        "invalid component name {component:?}"
    );
    let path = paths.heal_reset_dir.join(component);
    let outcome = store.write(
        &path,
        &HealResetRequest {
            requested_at: Utc::now(),
        },
    );
    anyhow::ensure!(
        outcome.ok,
        "failed to write heal reset request {}: {}",
        path.display(),
        outcome.last_error.unwrap_or_default()
    );
    Ok(())
}

/// Process-wide coordination state.
pub struct Coordinator {
    config: StewardConfig,
    paths: StatePaths,
    clock: SharedClock,
    probe: Arc<dyn ProcessProbe>,
    store: Arc<StateStore>,
    resolver: Arc<FreshnessResolver>,
    registry: HealthRegistry,
    ledger: IdempotencyLedger,
    acks: AckBoard,
    migration: MigrationOutcome,
    closed: bool,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("paths", &self.paths)
            .field("registry", &self.registry)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Open with the system clock and OS process probe.
    ///
    /// # Errors
    ///
    /// Returns an error if paths cannot be resolved or the state directory
    /// cannot be created.
    pub fn open(config: StewardConfig) -> anyhow::Result<Self> {
        Self::open_with(config, clock::system(), Arc::new(SystemProbe))
    }

    /// Open with an explicit clock and process probe.
    ///
    /// # Errors
    ///
    /// Returns an error if paths cannot be resolved or the state directory
    /// cannot be created.
    pub fn open_with(config: StewardConfig, clock: SharedClock, probe: Arc<dyn ProcessProbe>) -> anyhow::Result<Self> {
        let paths = config.resolve_paths()?;
        for dir in [&paths.state_dir, &paths.lock_dir, &paths.heal_reset_dir] {
            fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let store = Arc::new(StateStore::new(&config.store));
        let migration = migrate_legacy(&store, &paths.health_snapshot, &paths.legacy_health_snapshots);
        let registry = HealthRegistry::load(
            &config.hysteresis,
            Arc::clone(&clock),
            &store,
            &paths.health_snapshot,
        );
        let resolver = Arc::new(FreshnessResolver::new(&config.freshness, Arc::clone(&clock)));
        let ledger = IdempotencyLedger::new(
            &config.idempotency,
            Arc::clone(&store),
            paths.idempotency_ledger.clone(),
            Arc::clone(&clock),
        );
        let acks = AckBoard::new(Arc::clone(&store), paths.acks.clone(), Arc::clone(&clock));

        info!(state_dir = %paths.state_dir.display(), migration = ?migration, "coordinator opened");
        Ok(Self {
            config,
            paths,
            clock,
            probe,
            store,
            resolver,
            registry,
            ledger,
            acks,
            migration,
            closed: false,
        })
    }

    /// Configuration in force.
    pub fn config(&self) -> &StewardConfig {
        &self.config
    }

    /// Resolved state paths.
    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    /// Shared clock.
    pub fn clock(&self) -> SharedClock {
        Arc::clone(&self.clock)
    }

    /// Shared store.
    pub fn store(&self) -> Arc<StateStore> {
        Arc::clone(&self.store)
    }

    /// Shared freshness resolver.
    pub fn resolver(&self) -> Arc<FreshnessResolver> {
        Arc::clone(&self.resolver)
    }

    /// Health registry.
    pub fn registry(&self) -> &HealthRegistry {
        &self.registry
    }

    /// Health registry, mutably.
    pub fn registry_mut(&mut self) -> &mut HealthRegistry {
        &mut self.registry
    }

    /// Idempotency ledger.
    pub fn ledger(&self) -> &IdempotencyLedger {
        &self.ledger
    }

    /// Service acknowledgement board.
    pub fn acks(&self) -> &AckBoard {
        &self.acks
    }

    /// What legacy snapshot migration did at open.
    pub fn migration(&self) -> &MigrationOutcome {
        &self.migration
    }

    /// Readiness gate over this context's resolver and store.
    pub fn gate(&self) -> ReadinessGate {
        ReadinessGate::new(self.resolver(), self.store())
    }

    /// Singleton lock for `role`.
    pub fn lock(&self, role: &str) -> SingletonLock {
        SingletonLock::new(
            role,
            &self.paths.lock_dir,
            &self.config.lock,
            self.store(),
            Arc::clone(&self.probe),
            self.clock(),
        )
    }

    /// Healer configured from this context, with no remediations registered.
    pub fn healer(&self) -> AutoHealer {
        AutoHealer::new(&self.config.heal, self.clock())
    }

    /// Orchestrator that records launch requests on this context's ack board.
    pub fn orchestrator(&self, spawner: Arc<dyn Spawner>) -> StartupOrchestrator {
        StartupOrchestrator::new(
            &self.config.orchestrator,
            self.resolver(),
            self.store(),
            spawner,
            self.clock(),
        )
        .with_acks(self.acks.clone())
    }

    /// Apply and consume pending operator heal resets. Returns the components reset.
    pub fn apply_heal_resets(&mut self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.paths.heal_reset_dir) else {
            return Vec::new();
        };
        let mut reset = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(component) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
                continue;
            };
            if component.starts_with('.') {
                continue;
            }
            if self.registry.reset_heal(&component) {
                reset.push(component.clone());
            } else {
                debug!(component = %component, "heal reset for unknown component");
            }
            if let Err(e) = self.store.remove(&path) {
                warn!(path = %path.display(), error = %e, "failed to consume heal reset request");
            }
        }
        reset
    }

    /// Persist the health snapshot.
    pub fn flush(&self) -> WriteOutcome {
        self.registry.persist(&self.store, &self.paths.health_snapshot)
    }

    /// Flush and close.
    pub fn shutdown(mut self) -> WriteOutcome {
        let outcome = self.flush();
        self.closed = true;
        info!(ok = outcome.ok, "coordinator shut down");
        outcome
    }

    /// Close without writing the snapshot, for read-only and non-primary callers.
    pub fn discard(mut self) {
        self.closed = true;
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if !self.closed {
            let outcome = self.flush();
            debug!(ok = outcome.ok, "coordinator flushed on drop");
        }
    }
}
