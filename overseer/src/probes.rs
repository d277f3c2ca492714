//! Health probes fed into the registry each tick.

use steward::freshness::{FreshnessReport, FreshnessResolver};
use steward::health::{Blocker, ProbeOutcome};
use steward::orchestrator::ServiceSpec;
use steward::store::StateStore;

/// Component id under which store contention is tracked.
pub const STATE_STORE_COMPONENT: &str = "state_store";

/// Probe a service through the freshness of its own artifact.
pub fn probe_service(
    resolver: &FreshnessResolver,
    store: &StateStore,
    service: &ServiceSpec,
) -> (FreshnessReport, ProbeOutcome) {
    let report = resolver.resolve(store, &service.own_artifact);
    let outcome = ProbeOutcome::from_freshness(&report);
    (report, outcome)
}

/// Probe the store for systemic write contention.
pub fn probe_store(store: &StateStore) -> ProbeOutcome {
    let contention = store.contention();
    if !contention.is_contended() {
        return ProbeOutcome::pass();
    }
    ProbeOutcome::fail(Blocker::new(
        "write_retries",
        format!("{}/{}s", contention.retries_in_window, contention.window.as_secs()),
        format!("<{}", contention.threshold),
    ))
    .with_detail("atomic writes are retrying; another process may be holding state files open")
}
