//! Ordered startup with readiness gating and restart cooldown.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use steward::ack::AckBoard;
use steward::clock::{secs, Clock, ManualClock};
use steward::config::{FreshnessConfig, HysteresisConfig, OrchestratorConfig, StoreConfig};
use steward::freshness::{ArtifactSpec, FreshnessReason, FreshnessReport, FreshnessResolver};
use steward::health::{HealthRegistry, HealthState, ProbeOutcome};
use steward::orchestrator::{ReadyWait, ServiceOutcome, ServiceSpec, Spawner, StartupOrchestrator};
use steward::readiness::{decide, DependencyEdge, ReasonCode};
use steward::store::StateStore;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeSpawner {
    running: Mutex<BTreeSet<String>>,
    failing: BTreeSet<String>,
    /// Services that write a fresh artifact when spawned.
    writers: Vec<(String, PathBuf)>,
    store: Option<Arc<StateStore>>,
    clock: Option<ManualClock>,
    spawned: Mutex<Vec<String>>,
}

impl FakeSpawner {
    fn spawned(&self) -> Vec<String> {
        self.spawned.lock().expect("lock").clone()
    }
}

#[async_trait]
impl Spawner for FakeSpawner {
    async fn spawn(&self, service: &ServiceSpec) -> anyhow::Result<u32> {
        if self.failing.contains(&service.name) {
            anyhow::bail!("exec format error");
        }
        if let (Some(store), Some(clock)) = (&self.store, &self.clock) {
            for (name, path) in &self.writers {
                if *name == service.name {
                    assert!(store.write(path, &json!({ "ts": clock.now().timestamp() })).ok);
                }
            }
        }
        self.running.lock().expect("lock").insert(service.name.clone());
        self.spawned.lock().expect("lock").push(service.name.clone());
        Ok(31337)
    }

    fn is_running(&self, service: &ServiceSpec) -> bool {
        self.running.lock().expect("lock").contains(&service.name)
    }
}

struct Fleet {
    _dir: tempfile::TempDir,
    root: PathBuf,
    clock: ManualClock,
    store: Arc<StateStore>,
    resolver: Arc<FreshnessResolver>,
    registry: HealthRegistry,
}

impl Fleet {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        // Whole seconds so declared timestamps give exact ages.
        let start = chrono::DateTime::from_timestamp(chrono::Utc::now().timestamp(), 0).expect("instant");
        let clock = ManualClock::new(start);
        let store = Arc::new(StateStore::new(&StoreConfig {
            read_coalesce_ms: 0,
            ..StoreConfig::default()
        }));
        let resolver = Arc::new(FreshnessResolver::new(&FreshnessConfig::default(), Arc::new(clock.clone())));
        let registry = HealthRegistry::new(&HysteresisConfig::default(), Arc::new(clock.clone()));
        Self {
            _dir: dir,
            root,
            clock,
            store,
            resolver,
            registry,
        }
    }

    fn artifact(&self, name: &str, threshold: u64) -> ArtifactSpec {
        ArtifactSpec::single(name, self.root.join(format!("{name}.json")), Duration::from_secs(threshold))
    }

    fn write_age(&self, name: &str, age_secs: i64) {
        let ts = self.clock.now().timestamp() - age_secs;
        assert!(self
            .store
            .write(&self.root.join(format!("{name}.json")), &json!({ "ts": ts }))
            .ok);
    }

    fn green(&mut self, name: &str) {
        self.registry.observe(name, ProbeOutcome::pass());
        self.registry.observe(name, ProbeOutcome::pass());
        assert_eq!(self.registry.state(name), HealthState::Green);
    }

    fn orchestrator(&self, spawner: Arc<FakeSpawner>) -> StartupOrchestrator {
        let config = OrchestratorConfig {
            restart_cooldown_secs: 120,
            ready_timeout_secs: 20,
            ready_poll_secs: 2,
        };
        StartupOrchestrator::new(
            &config,
            Arc::clone(&self.resolver),
            Arc::clone(&self.store),
            spawner,
            Arc::new(self.clock.clone()),
        )
    }

    /// feeder → ares → trader, with edge thresholds 30s and 75s.
    fn chain(&self) -> Vec<ServiceSpec> {
        vec![
            ServiceSpec {
                name: "feeder".to_owned(),
                depends_on: Vec::new(),
                own_artifact: self.artifact("feeder", 30),
            },
            ServiceSpec {
                name: "ares".to_owned(),
                depends_on: vec![DependencyEdge::new("feeder", self.artifact("feeder", 30))],
                own_artifact: self.artifact("ares", 75),
            },
            ServiceSpec {
                name: "trader".to_owned(),
                depends_on: vec![
                    DependencyEdge::new("feeder", self.artifact("feeder", 30)),
                    DependencyEdge::new("ares", self.artifact("ares", 75)),
                ],
                own_artifact: self.artifact("trader", 30),
            },
        ]
    }
}

fn running(names: &[&str]) -> Mutex<BTreeSet<String>> {
    Mutex::new(names.iter().map(|n| (*n).to_owned()).collect())
}

// ---------------------------------------------------------------------------
// Readiness decisions
// ---------------------------------------------------------------------------

fn report(age: Option<f64>, threshold: f64) -> FreshnessReport {
    FreshnessReport {
        artifact: "ares".to_owned(),
        age_seconds: age,
        threshold_seconds: threshold,
        is_stale: age.map_or(true, |a| a > threshold),
        reason: FreshnessReason::Fresh,
        fallback_used: false,
        source: None,
        samples: Vec::new(),
    }
}

#[test]
fn readiness_checks_run_in_order() {
    let fresh = report(Some(10.0), 30.0);
    assert_eq!(decide("ares", false, HealthState::Green, &fresh).reason_code, ReasonCode::NotStarted);
    assert_eq!(decide("ares", true, HealthState::Yellow, &fresh).reason_code, ReasonCode::NotGreen);
    assert_eq!(
        decide("ares", true, HealthState::Green, &report(None, 30.0)).reason_code,
        ReasonCode::AgeUnknown
    );
    assert_eq!(
        decide("ares", true, HealthState::Green, &report(Some(31.0), 30.0)).reason_code,
        ReasonCode::Stale
    );
    let ok = decide("ares", true, HealthState::Green, &report(Some(30.0), 30.0));
    assert!(ok.ok);
    assert_eq!(ok.reason_code, ReasonCode::Ready);
}

#[test]
fn readiness_decision_renders_actual_and_threshold() {
    let d = decide("ares", true, HealthState::Green, &report(Some(80.0), 75.0));
    assert_eq!(d.to_string(), "ares stale: age=80.0s⇒75s");
    let d = decide("ares", true, HealthState::Red, &report(Some(1.0), 75.0));
    assert_eq!(d.to_string(), "ares not_green: state=red⇒green");
}

// ---------------------------------------------------------------------------
// Startup chain
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn stale_dependency_skips_start_with_next_retry() {
    let mut fleet = Fleet::new();
    fleet.write_age("feeder", 10);
    fleet.write_age("ares", 80);
    fleet.green("feeder");
    fleet.green("ares");
    let spawner = Arc::new(FakeSpawner {
        running: running(&["feeder", "ares"]),
        ..FakeSpawner::default()
    });
    let mut orch = fleet.orchestrator(Arc::clone(&spawner));

    let services = fleet.chain();
    let report = orch.start_chain(&mut fleet.registry, &services).await;
    assert_eq!(report.aborted_at.as_deref(), Some("trader"));
    let skip = report.skip().expect("skip event");
    assert_eq!(skip.service, "trader");
    assert_eq!(skip.dependency, "ares");
    assert_eq!(skip.reason_code, ReasonCode::Stale);
    assert_eq!(skip.state, HealthState::Green);
    assert_eq!(skip.measured_age, Some(80.0));
    assert!((skip.threshold - 75.0).abs() < f64::EPSILON);
    let expected = fleet.clock.now().checked_add_signed(secs(120)).expect("instant");
    assert_eq!(skip.next_retry_at, expected);
    assert_eq!(orch.next_retry_at("trader"), Some(expected));
    assert!(skip
        .to_string()
        .starts_with("skip-start{service=trader, dep=ares, reason=stale, age=80, threshold=75, next_retry="));
    assert!(spawner.spawned().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cooldown_defers_retry_until_window_passes() {
    let mut fleet = Fleet::new();
    fleet.write_age("feeder", 10);
    fleet.write_age("ares", 80);
    fleet.green("feeder");
    fleet.green("ares");
    let spawner = Arc::new(FakeSpawner {
        running: running(&["feeder", "ares"]),
        writers: vec![("trader".to_owned(), fleet.root.join("trader.json"))],
        store: Some(Arc::clone(&fleet.store)),
        clock: Some(fleet.clock.clone()),
        ..FakeSpawner::default()
    });
    let mut orch = fleet.orchestrator(Arc::clone(&spawner));
    let services = fleet.chain();

    orch.start_chain(&mut fleet.registry, &services).await;

    // ares catches up, but trader is still inside its cooldown.
    fleet.write_age("ares", 5);
    fleet.clock.advance(chrono::Duration::seconds(60));
    let report = orch.start_chain(&mut fleet.registry, &services).await;
    assert!(matches!(report.outcomes.last(), Some((_, ServiceOutcome::CoolingDown { .. }))));
    assert!(spawner.spawned().is_empty());

    fleet.clock.advance(chrono::Duration::seconds(61));
    fleet.write_age("feeder", 1);
    fleet.write_age("ares", 1);
    let report = orch.start_chain(&mut fleet.registry, &services).await;
    assert!(report.is_complete(), "{report:?}");
    assert_eq!(spawner.spawned(), vec!["trader".to_owned()]);
    assert!(orch.is_started("trader"));
}

#[tokio::test(start_paused = true)]
async fn spawned_service_waits_until_green() {
    let mut fleet = Fleet::new();
    let spawner = Arc::new(FakeSpawner {
        writers: vec![("feeder".to_owned(), fleet.root.join("feeder.json"))],
        store: Some(Arc::clone(&fleet.store)),
        clock: Some(fleet.clock.clone()),
        ..FakeSpawner::default()
    });
    let mut orch = fleet.orchestrator(Arc::clone(&spawner));
    let services = fleet.chain();

    let report = orch.start_chain(&mut fleet.registry, &services[..1]).await;
    match &report.outcomes[0].1 {
        ServiceOutcome::Started {
            pid: 31337,
            ready: ReadyWait::Green { waited },
        } => assert_eq!(*waited, Duration::from_secs(2)),
        other => panic!("expected green start, got {other:?}"),
    }
    assert_eq!(fleet.registry.state("feeder"), HealthState::Green);
}

#[tokio::test(start_paused = true)]
async fn readiness_timeout_is_reported_and_chain_continues() {
    let mut fleet = Fleet::new();
    // feeder never writes its artifact.
    let spawner = Arc::new(FakeSpawner::default());
    let mut orch = fleet.orchestrator(Arc::clone(&spawner));
    let services = fleet.chain();

    let started = tokio::time::Instant::now();
    let report = orch.start_chain(&mut fleet.registry, &services[..1]).await;
    assert!(matches!(
        report.outcomes[0].1,
        ServiceOutcome::Started {
            ready: ReadyWait::TimedOut { .. },
            ..
        }
    ));
    assert!(report.is_complete());
    assert_eq!(started.elapsed(), Duration::from_secs(20));
    assert_ne!(fleet.registry.state("feeder"), HealthState::Green);
}

#[tokio::test(start_paused = true)]
async fn spawn_failure_aborts_chain_and_records_error() {
    let mut fleet = Fleet::new();
    let spawner = Arc::new(FakeSpawner {
        failing: BTreeSet::from(["feeder".to_owned()]),
        ..FakeSpawner::default()
    });
    let acks = AckBoard::new(
        Arc::clone(&fleet.store),
        fleet.root.join("acks.json"),
        Arc::new(fleet.clock.clone()),
    );
    let mut orch = fleet.orchestrator(Arc::clone(&spawner)).with_acks(acks.clone());
    let services = fleet.chain();

    let report = orch.start_chain(&mut fleet.registry, &services).await;
    assert_eq!(report.aborted_at.as_deref(), Some("feeder"));
    assert_eq!(report.outcomes.len(), 1);
    assert!(matches!(&report.outcomes[0].1, ServiceOutcome::SpawnFailed { error } if error.contains("exec format")));

    let ack = acks.get("feeder");
    assert_eq!(ack.launch_request_ts, Some(fleet.clock.now()));
    assert_eq!(ack.last_error.as_deref(), Some("exec format error"));
    assert!(orch.next_retry_at("feeder").is_some());
}

#[tokio::test(start_paused = true)]
async fn failed_spawn_cools_down_before_retry() {
    let mut fleet = Fleet::new();
    let spawner = Arc::new(FakeSpawner {
        failing: BTreeSet::from(["feeder".to_owned()]),
        ..FakeSpawner::default()
    });
    let mut orch = fleet.orchestrator(Arc::clone(&spawner));
    let services = fleet.chain();

    orch.start_chain(&mut fleet.registry, &services).await;
    let report = orch.start_chain(&mut fleet.registry, &services).await;
    assert_eq!(report.aborted_at.as_deref(), Some("feeder"));
    assert!(matches!(report.outcomes[0].1, ServiceOutcome::CoolingDown { .. }));
    assert!(!orch.is_started("ares"));
}
