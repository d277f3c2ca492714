//! Singleton lock acquisition, stale purging, and ownership-checked release.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

use steward::clock::{Clock, ManualClock};
use steward::config::LockConfig;
use steward::lock::{
    current_host, AcquireOutcome, LockError, LockRecord, LockRole, LockStatus, ProcessProbe, ReleaseOutcome,
    SingletonLock, StaleReason, EXIT_ACTIVE_OWNER, EXIT_FRESH, EXIT_STALE_PURGED,
};
use steward::store::StateStore;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeProbe {
    alive: Mutex<BTreeSet<u32>>,
    identities: BTreeMap<u32, String>,
    supports_identity: bool,
}

impl FakeProbe {
    fn alive(pids: &[u32]) -> Self {
        Self {
            alive: Mutex::new(pids.iter().copied().collect()),
            ..Self::default()
        }
    }

    fn with_identity(mut self, pid: u32, identity: &str) -> Self {
        self.identities.insert(pid, identity.to_owned());
        self.supports_identity = true;
        self
    }
}

impl ProcessProbe for FakeProbe {
    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().expect("lock").contains(&pid)
    }

    fn identity(&self, pid: u32) -> Option<String> {
        self.identities.get(&pid).cloned()
    }

    fn supports_identity(&self) -> bool {
        self.supports_identity
    }
}

type Hook = Box<dyn FnOnce() + Send>;

/// Runs `hook` the first time `watched` is checked, before answering.
struct InterleavedProcesses {
    inner: FakeProbe,
    watched: u32,
    hook: Mutex<Option<Hook>>,
}

impl ProcessProbe for InterleavedProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == self.watched {
            let hook = self.hook.lock().expect("lock").take();
            if let Some(hook) = hook {
                hook();
            }
        }
        self.inner.is_alive(pid)
    }

    fn identity(&self, pid: u32) -> Option<String> {
        self.inner.identity(pid)
    }

    fn supports_identity(&self) -> bool {
        self.inner.supports_identity()
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    store: Arc<StateStore>,
    clock: ManualClock,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
            store: Arc::new(StateStore::default()),
            clock: ManualClock::starting_now(),
        }
    }

    fn lock_dir(&self) -> &Path {
        self.dir.path()
    }

    fn lock(&self, probe: FakeProbe, config: &LockConfig, pid: u32) -> SingletonLock {
        self.lock_with(Arc::new(probe), config, pid)
    }

    fn lock_with(&self, processes: Arc<dyn ProcessProbe>, config: &LockConfig, pid: u32) -> SingletonLock {
        SingletonLock::new(
            "trader",
            self.lock_dir(),
            config,
            Arc::clone(&self.store),
            processes,
            Arc::new(self.clock.clone()),
        )
        .with_owner(pid, current_host())
    }

    fn plant(&self, record: &LockRecord) {
        let path = self.lock_dir().join("trader.lock");
        std::fs::write(path, serde_json::to_string(record).expect("json")).expect("plant lock");
    }

    fn record(&self, pid: u32, host: &str) -> LockRecord {
        LockRecord {
            owner_pid: pid,
            owner_host: host.to_owned(),
            owner_identity: None,
            acquired_at: self.clock.now(),
            ttl_seconds: 120,
            renewed_at: None,
        }
    }

    fn on_disk(&self) -> Option<LockRecord> {
        self.store.read_uncached(&self.lock_dir().join("trader.lock"))
    }
}

// ---------------------------------------------------------------------------
// Acquire
// ---------------------------------------------------------------------------

#[test]
fn fresh_acquire_writes_record() {
    let fx = Fixture::new();
    let lock = fx.lock(FakeProbe::alive(&[5000]), &LockConfig::default(), 5000);

    let outcome = lock.acquire();
    assert!(matches!(outcome, AcquireOutcome::Fresh { .. }), "{outcome}");
    assert_eq!(outcome.exit_code(), EXIT_FRESH);
    assert_eq!(outcome.role(), LockRole::Primary);
    assert_eq!(fx.on_disk().map(|r| r.owner_pid), Some(5000));
}

#[test]
fn dead_owner_is_purged_and_replaced() {
    let fx = Fixture::new();
    fx.plant(&fx.record(4821, &current_host()));
    let lock = fx.lock(FakeProbe::alive(&[5000]), &LockConfig::default(), 5000);

    let outcome = lock.acquire();
    match &outcome {
        AcquireOutcome::StalePurged { record, reason } => {
            assert_eq!(*reason, StaleReason::DeadProcess { pid: 4821 });
            assert_eq!(record.owner_pid, 5000);
        }
        other => panic!("expected stale purge, got {other}"),
    }
    assert_eq!(outcome.exit_code(), EXIT_STALE_PURGED);
    assert_eq!(fx.on_disk().map(|r| r.owner_pid), Some(5000));
}

#[test]
fn live_owner_blocks_acquire() {
    let fx = Fixture::new();
    let owner = fx.record(4821, &current_host());
    fx.plant(&owner);
    let lock = fx.lock(FakeProbe::alive(&[4821, 5000]), &LockConfig::default(), 5000);

    let outcome = lock.acquire();
    assert_eq!(outcome, AcquireOutcome::ActiveOwner { owner: Some(owner.clone()) });
    assert_eq!(outcome.exit_code(), EXIT_ACTIVE_OWNER);
    assert_eq!(outcome.role(), LockRole::Secondary);
    assert_eq!(fx.on_disk(), Some(owner));
}

#[test]
fn foreign_host_record_is_stale_even_if_pid_alive() {
    let fx = Fixture::new();
    fx.plant(&fx.record(4821, "some-other-host"));
    let lock = fx.lock(FakeProbe::alive(&[4821, 5000]), &LockConfig::default(), 5000);

    let outcome = lock.acquire();
    assert!(
        matches!(&outcome, AcquireOutcome::StalePurged { reason: StaleReason::ForeignHost { host }, .. } if host == "some-other-host"),
        "{outcome}"
    );
}

#[test]
fn reused_pid_with_different_executable_is_stale() {
    let fx = Fixture::new();
    let mut owner = fx.record(4821, &current_host());
    owner.owner_identity = Some("/opt/fleet/trader".to_owned());
    fx.plant(&owner);
    let probe = FakeProbe::alive(&[4821, 5000]).with_identity(4821, "/usr/bin/python3");
    let lock = fx.lock(probe, &LockConfig::default(), 5000);

    match lock.acquire() {
        AcquireOutcome::StalePurged {
            reason: StaleReason::IdentityMismatch { expected, actual },
            ..
        } => {
            assert_eq!(expected, "/opt/fleet/trader");
            assert_eq!(actual.as_deref(), Some("/usr/bin/python3"));
        }
        other => panic!("expected identity mismatch, got {other}"),
    }
}

#[test]
fn replaced_binary_still_matches_identity() {
    let fx = Fixture::new();
    let mut owner = fx.record(4821, &current_host());
    owner.owner_identity = Some("/opt/fleet/trader".to_owned());
    let probe = FakeProbe::alive(&[4821]).with_identity(4821, "/opt/fleet/trader (deleted)");
    let lock = fx.lock(probe, &LockConfig::default(), 5000);
    assert_eq!(lock.validate(&owner), Ok(()));
}

#[test]
fn configured_identity_overrides_recorded_one() {
    let fx = Fixture::new();
    let owner = fx.record(4821, &current_host());
    let config = LockConfig {
        expected_identity: Some("/opt/fleet/trader".to_owned()),
        ..LockConfig::default()
    };
    let probe = FakeProbe::alive(&[4821]).with_identity(4821, "/bin/sleep");
    let lock = fx.lock(probe, &config, 5000);
    assert!(matches!(lock.validate(&owner), Err(StaleReason::IdentityMismatch { .. })));
}

#[test]
fn expired_record_is_stale_and_renewal_extends_it() {
    let fx = Fixture::new();
    let lock = fx.lock(FakeProbe::alive(&[4821]), &LockConfig::default(), 5000);
    let mut owner = fx.record(4821, &current_host());

    fx.clock.advance(chrono::Duration::seconds(121));
    assert!(matches!(
        lock.validate(&owner),
        Err(StaleReason::Expired { ttl_secs: 120, .. })
    ));

    owner.renewed_at = Some(fx.clock.now());
    assert_eq!(lock.validate(&owner), Ok(()));
}

#[test]
fn validation_checks_liveness_before_host() {
    let fx = Fixture::new();
    let lock = fx.lock(FakeProbe::alive(&[]), &LockConfig::default(), 5000);
    let owner = fx.record(4821, "elsewhere");
    assert_eq!(lock.validate(&owner), Err(StaleReason::DeadProcess { pid: 4821 }));
}

#[test]
fn malformed_lock_file_is_purged() {
    let fx = Fixture::new();
    std::fs::write(fx.lock_dir().join("trader.lock"), "{ half a record").expect("write");
    let lock = fx.lock(FakeProbe::alive(&[5000]), &LockConfig::default(), 5000);

    let outcome = lock.acquire();
    assert!(
        matches!(outcome, AcquireOutcome::StalePurged { reason: StaleReason::Malformed, .. }),
        "{outcome}"
    );
}

#[test]
fn force_override_takes_a_live_lock() {
    let fx = Fixture::new();
    fx.plant(&fx.record(4821, &current_host()));
    let config = LockConfig {
        force_override: true,
        ..LockConfig::default()
    };
    let lock = fx.lock(FakeProbe::alive(&[4821, 5000]), &config, 5000);

    let outcome = lock.acquire();
    assert!(
        matches!(outcome, AcquireOutcome::StalePurged { reason: StaleReason::ForceOverride, .. }),
        "{outcome}"
    );
    assert_eq!(fx.on_disk().map(|r| r.owner_pid), Some(5000));
}

#[test]
fn concurrent_contenders_yield_one_primary() {
    let fx = Fixture::new();
    let pids: Vec<u32> = (6000..6008).collect();
    let primaries = std::thread::scope(|scope| {
        let handles: Vec<_> = pids
            .iter()
            .map(|&pid| {
                let lock = fx.lock(FakeProbe::alive(&pids), &LockConfig::default(), pid);
                scope.spawn(move || lock.acquire().is_primary())
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(|primary| *primary)
            .count()
    });
    assert_eq!(primaries, 1);
}

#[test]
fn purge_spares_record_written_after_stale_judgement() {
    let fx = Fixture::new();
    fx.plant(&fx.record(4821, &current_host()));

    // The rival takes over the dead owner's lock after the late contender has
    // judged that owner dead but before it purges.
    let rival = fx.lock(FakeProbe::alive(&[5000]), &LockConfig::default(), 5000);
    let rival_outcome = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&rival_outcome);
    let processes = InterleavedProcesses {
        inner: FakeProbe::alive(&[5000, 6000]),
        watched: 4821,
        hook: Mutex::new(Some(Box::new(move || {
            *slot.lock().expect("lock") = Some(rival.acquire());
        }))),
    };
    let late = fx.lock_with(Arc::new(processes), &LockConfig::default(), 6000);

    let outcome = late.acquire();
    let rival_outcome = rival_outcome.lock().expect("lock").take().expect("rival ran");
    assert!(
        matches!(rival_outcome, AcquireOutcome::StalePurged { reason: StaleReason::DeadProcess { pid: 4821 }, .. }),
        "{rival_outcome}"
    );
    match &outcome {
        AcquireOutcome::ActiveOwner { owner: Some(owner) } => assert_eq!(owner.owner_pid, 5000),
        other => panic!("expected rival to stay owner, got {other}"),
    }
    assert_eq!(outcome.exit_code(), EXIT_ACTIVE_OWNER);
    assert_eq!(fx.on_disk().map(|r| r.owner_pid), Some(5000));
}

#[test]
fn contenders_purging_one_dead_owner_yield_one_primary() {
    let pids: Vec<u32> = (6000..6008).collect();
    for _ in 0..25 {
        let fx = Fixture::new();
        fx.plant(&fx.record(4821, &current_host()));
        let barrier = Barrier::new(pids.len());
        let outcomes: Vec<(u32, AcquireOutcome)> = std::thread::scope(|scope| {
            let handles: Vec<_> = pids
                .iter()
                .map(|&pid| {
                    let lock = fx.lock(FakeProbe::alive(&pids), &LockConfig::default(), pid);
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        (pid, lock.acquire())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("join")).collect()
        });

        let primaries: Vec<u32> = outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_primary())
            .map(|(pid, _)| *pid)
            .collect();
        assert_eq!(primaries.len(), 1, "{outcomes:?}");
        assert!(
            outcomes
                .iter()
                .all(|(_, o)| !matches!(o, AcquireOutcome::PermissionError { .. })),
            "{outcomes:?}"
        );
        assert_eq!(fx.on_disk().map(|r| r.owner_pid), primaries.first().copied());
    }
}

#[tokio::test(start_paused = true)]
async fn acquire_within_gives_up_after_timeout() {
    let fx = Fixture::new();
    fx.plant(&fx.record(4821, &current_host()));
    let lock = fx.lock(FakeProbe::alive(&[4821]), &LockConfig::default(), 5000);

    let started = tokio::time::Instant::now();
    let outcome = lock
        .acquire_within(Duration::from_secs(10), Duration::from_secs(1))
        .await;
    assert!(matches!(outcome, AcquireOutcome::ActiveOwner { .. }));
    assert!(started.elapsed() >= Duration::from_secs(10));
}

// ---------------------------------------------------------------------------
// Inspect, renew, release
// ---------------------------------------------------------------------------

#[test]
fn inspect_classifies_lock_file() {
    let fx = Fixture::new();
    let lock = fx.lock(FakeProbe::alive(&[4821]), &LockConfig::default(), 5000);
    assert_eq!(lock.inspect(), LockStatus::Free);

    let owner = fx.record(4821, &current_host());
    fx.plant(&owner);
    assert_eq!(lock.inspect(), LockStatus::Active(owner));

    fx.plant(&fx.record(9999, &current_host()));
    assert!(matches!(
        lock.inspect(),
        LockStatus::Stale {
            reason: StaleReason::DeadProcess { pid: 9999 },
            ..
        }
    ));
}

#[test]
fn renew_requires_ownership() {
    let fx = Fixture::new();
    let lock = fx.lock(FakeProbe::alive(&[5000]), &LockConfig::default(), 5000);
    assert!(matches!(lock.renew(), Err(LockError::NotOwner { pid: 5000, .. })));

    assert!(lock.acquire().is_primary());
    fx.clock.advance(chrono::Duration::seconds(90));
    let renewed = lock.renew().expect("renew");
    assert_eq!(renewed.renewed_at, Some(fx.clock.now()));
    assert_eq!(fx.on_disk().and_then(|r| r.renewed_at), Some(fx.clock.now()));
}

#[test]
fn release_only_removes_own_record() {
    let fx = Fixture::new();
    let lock = fx.lock(FakeProbe::alive(&[4821, 5000]), &LockConfig::default(), 5000);
    assert_eq!(lock.release(), ReleaseOutcome::NotHeld);

    let other = fx.record(4821, &current_host());
    fx.plant(&other);
    assert_eq!(
        lock.release(),
        ReleaseOutcome::OwnedByOther {
            owner_pid: 4821,
            owner_host: current_host(),
        }
    );
    assert_eq!(fx.on_disk(), Some(other));

    std::fs::remove_file(fx.lock_dir().join("trader.lock")).expect("remove");
    assert!(lock.acquire().is_primary());
    assert_eq!(lock.release(), ReleaseOutcome::Released);
    assert!(fx.on_disk().is_none());
}

#[test]
fn guard_releases_on_drop() {
    let fx = Fixture::new();
    let lock = fx.lock(FakeProbe::alive(&[5000]), &LockConfig::default(), 5000);
    let guard = lock.into_guard().expect("primary");
    assert!(guard.outcome().is_primary());
    assert!(fx.on_disk().is_some());
    drop(guard);
    assert!(fx.on_disk().is_none());
}

#[test]
fn into_guard_returns_outcome_for_secondary() {
    let fx = Fixture::new();
    fx.plant(&fx.record(4821, &current_host()));
    let lock = fx.lock(FakeProbe::alive(&[4821]), &LockConfig::default(), 5000);
    let outcome = lock.into_guard().expect_err("secondary");
    assert_eq!(outcome.exit_code(), EXIT_ACTIVE_OWNER);
    assert!(fx.on_disk().is_some());
}
