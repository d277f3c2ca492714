//! Service acknowledgement board.

use std::sync::Arc;
use std::time::Duration;

use steward::ack::{AckBoard, AckKind, AckWait};
use steward::clock::{Clock, ManualClock};
use steward::config::StoreConfig;
use steward::store::StateStore;

fn board(dir: &std::path::Path) -> (ManualClock, AckBoard) {
    let clock = ManualClock::starting_now();
    let store = Arc::new(StateStore::new(&StoreConfig::default()));
    let board = AckBoard::new(store, dir.join("service_acks.json"), Arc::new(clock.clone()));
    (clock, board)
}

#[test]
fn unknown_service_is_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_clock, board) = board(dir.path());
    let ack = board.get("feeder");
    assert!(ack.launch_request_ts.is_none());
    assert!(ack.last_error.is_none());
    assert!(board.load().is_empty());
}

#[test]
fn marks_are_kept_per_service_and_kind() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (clock, board) = board(dir.path());
    assert!(board.mark("feeder", AckKind::LaunchRequest).ok);
    let launched = clock.now();
    clock.advance(chrono::Duration::seconds(5));
    assert!(board.mark("feeder", AckKind::Ready).ok);
    assert!(board.mark_error("ares", "config missing").ok);

    let feeder = board.get("feeder");
    assert_eq!(feeder.get(AckKind::LaunchRequest), Some(launched));
    assert_eq!(feeder.get(AckKind::Ready), Some(clock.now()));
    assert_eq!(feeder.get(AckKind::Stopped), None);

    let ares = board.get("ares");
    assert_eq!(ares.last_error.as_deref(), Some("config missing"));
    assert_eq!(board.load().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn wait_returns_once_service_acknowledges() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (clock, board) = board(dir.path());
    let since = clock.now();

    let writer = board.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        writer.mark("feeder", AckKind::Ready);
    });

    let started = tokio::time::Instant::now();
    let wait = board
        .wait_for("feeder", AckKind::Ready, since, Duration::from_secs(30), Duration::from_secs(1))
        .await;
    assert_eq!(wait, AckWait::Acknowledged { at: since });
    assert!(started.elapsed() <= Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn earlier_acknowledgement_does_not_count() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (clock, board) = board(dir.path());
    assert!(board.mark("feeder", AckKind::Ready).ok);
    clock.advance(chrono::Duration::seconds(1));

    let wait = board
        .wait_for(
            "feeder",
            AckKind::Ready,
            clock.now(),
            Duration::from_secs(10),
            Duration::from_secs(3),
        )
        .await;
    assert_eq!(
        wait,
        AckWait::TimedOut {
            waited: Duration::from_secs(10)
        }
    );
}
