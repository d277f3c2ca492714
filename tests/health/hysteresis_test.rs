//! Property tests for flap suppression with K=3 and T=30s.

use std::sync::Arc;

use proptest::prelude::*;
use steward::clock::ManualClock;
use steward::config::HysteresisConfig;
use steward::health::{Blocker, HealthRegistry, HealthState, ProbeOutcome, Trigger};

const K: u32 = 3;
const T_SECS: i64 = 30;
const N: u32 = 2;

fn registry(clock: &ManualClock) -> HealthRegistry {
    let config = HysteresisConfig {
        failure_threshold: K,
        failing_duration_secs: 30,
        recovery_successes: N,
    };
    HealthRegistry::new(&config, Arc::new(clock.clone()))
}

fn outcome(healthy: bool) -> ProbeOutcome {
    if healthy {
        ProbeOutcome::pass()
    } else {
        ProbeOutcome::fail(Blocker::new("age", "99", "30"))
    }
}

/// Bring `component` to Green.
fn warm_up(reg: &mut HealthRegistry, component: &str) {
    for _ in 0..N {
        reg.observe(component, outcome(true));
    }
    assert_eq!(reg.state(component), HealthState::Green);
}

proptest! {
    #[test]
    fn red_only_after_k_failures_or_t_seconds(
        steps in proptest::collection::vec((any::<bool>(), 0i64..20), 1..60)
    ) {
        let clock = ManualClock::starting_now();
        let mut reg = registry(&clock);
        warm_up(&mut reg, "feeder");

        let mut streak: u32 = 0;
        let mut failing_for: i64 = 0;
        for (healthy, gap) in steps {
            clock.advance(chrono::Duration::seconds(gap));
            if healthy {
                streak = 0;
                failing_for = 0;
            } else {
                if streak > 0 {
                    failing_for += gap;
                }
                streak += 1;
            }
            let before = reg.state("feeder");
            let transition = reg.observe("feeder", outcome(healthy));

            if let Some(t) = transition.filter(|t| t.to == HealthState::Red) {
                prop_assert_ne!(before, HealthState::Red);
                prop_assert!(streak >= K || failing_for >= T_SECS, "red at streak {streak}, {failing_for}s");
                match t.trigger {
                    Trigger::ConsecutiveFailures { count, k } => prop_assert!(count >= k),
                    Trigger::FailingDuration { secs, t } => prop_assert!(secs >= t as f64),
                    Trigger::Recovered { .. } => prop_assert!(false, "recovery trigger on red"),
                }
            }
            if before != HealthState::Red && (streak >= K || failing_for >= T_SECS) {
                prop_assert_eq!(reg.state("feeder"), HealthState::Red);
            }
        }
    }

    #[test]
    fn isolated_failures_never_turn_red(
        pattern in proptest::collection::vec(1u32..3, 1..30)
    ) {
        // Bursts shorter than K separated by enough successes to recover, one
        // second apart, never reach Red.
        let clock = ManualClock::starting_now();
        let mut reg = registry(&clock);
        warm_up(&mut reg, "ares");

        for burst in pattern {
            for _ in 0..burst {
                clock.advance(chrono::Duration::seconds(1));
                reg.observe("ares", outcome(false));
                prop_assert_ne!(reg.state("ares"), HealthState::Red);
            }
            for _ in 0..N {
                clock.advance(chrono::Duration::seconds(1));
                reg.observe("ares", outcome(true));
            }
        }
    }

    #[test]
    fn red_holds_until_n_consecutive_successes(
        interleave in proptest::collection::vec(any::<bool>(), 0..20)
    ) {
        let clock = ManualClock::starting_now();
        let mut reg = registry(&clock);
        for _ in 0..K {
            reg.observe("trader", outcome(false));
        }
        prop_assert_eq!(reg.state("trader"), HealthState::Red);

        let mut successes: u32 = 0;
        for healthy in interleave {
            successes = if healthy { successes + 1 } else { 0 };
            reg.observe("trader", outcome(healthy));
            if successes >= N {
                prop_assert_eq!(reg.state("trader"), HealthState::Green);
                break;
            }
            prop_assert_eq!(reg.state("trader"), HealthState::Red);
        }
    }
}

#[test]
fn duration_trigger_fires_before_k_with_slow_probes() {
    let clock = ManualClock::starting_now();
    let mut reg = registry(&clock);
    warm_up(&mut reg, "feeder");

    assert!(reg.observe("feeder", outcome(false)).is_none());
    clock.advance(chrono::Duration::seconds(31));
    let t = reg.observe("feeder", outcome(false)).expect("transition");
    assert_eq!(t.from, HealthState::Green);
    assert_eq!(t.to, HealthState::Red);
    assert!(matches!(t.trigger, Trigger::FailingDuration { t: 30, .. }));
    assert_eq!(t.to_string().split_whitespace().next(), Some("feeder:"));
}
