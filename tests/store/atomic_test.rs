//! Atomic write, exclusive create, and orphan sweep behaviour.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use steward::config::StoreConfig;
use steward::store::{CreateOutcome, StateStore, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Doc {
    writer: u32,
    seq: u32,
    payload: String,
}

fn uncoalesced() -> StateStore {
    StateStore::new(&StoreConfig {
        read_coalesce_ms: 0,
        ..StoreConfig::default()
    })
}

#[test]
fn write_then_read_roundtrips_and_leaves_no_temp_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("state.json");
    let store = uncoalesced();

    let doc = Doc {
        writer: 1,
        seq: 7,
        payload: "x".repeat(64),
    };
    let outcome = store.write(&path, &doc);
    assert!(outcome.ok, "{outcome:?}");
    assert_eq!(outcome.retries, 0);
    assert_eq!(store.read_uncached::<Doc>(&path), Some(doc));

    let names: Vec<String> = std::fs::read_dir(path.parent().expect("parent"))
        .expect("read dir")
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["state.json".to_owned()]);
}

#[test]
fn concurrent_writers_never_expose_torn_documents() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("shared.json");
    let store = Arc::new(uncoalesced());
    assert!(store.write(&path, &Doc { writer: 0, seq: 0, payload: String::new() }).ok);

    std::thread::scope(|scope| {
        for writer in 1..=4u32 {
            let store = Arc::clone(&store);
            let path = path.clone();
            scope.spawn(move || {
                for seq in 0..50u32 {
                    let doc = Doc {
                        writer,
                        seq,
                        payload: format!("{writer}-{seq}-").repeat(200),
                    };
                    assert!(store.write(&path, &doc).ok);
                }
            });
        }
        for _ in 0..2 {
            let store = Arc::clone(&store);
            let path = path.clone();
            scope.spawn(move || {
                for _ in 0..200 {
                    match store.try_read_uncached::<Doc>(&path) {
                        Ok(Some(doc)) => {
                            let expected = format!("{}-{}-", doc.writer, doc.seq);
                            assert!(doc.payload.is_empty() || doc.payload.starts_with(&expected));
                        }
                        Ok(None) => panic!("target vanished during concurrent writes"),
                        Err(e) => panic!("torn read: {e}"),
                    }
                }
            });
        }
    });

    assert!(store.read_uncached::<Doc>(&path).is_some());
}

#[test]
fn read_returns_default_for_missing_and_malformed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = uncoalesced();
    let missing = dir.path().join("missing.json");
    assert_eq!(store.read(&missing, 5u32), 5);

    let garbled = dir.path().join("garbled.json");
    std::fs::write(&garbled, "{ not json").expect("write");
    assert_eq!(store.read(&garbled, 9u32), 9);
    assert!(matches!(
        store.try_read_uncached::<u32>(&garbled),
        Err(StoreError::Malformed { .. })
    ));

    let wrong_shape = dir.path().join("shape.json");
    std::fs::write(&wrong_shape, "\"text\"").expect("write");
    assert_eq!(store.read(&wrong_shape, 3u32), 3);
}

#[test]
fn coalesced_reads_see_own_writes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("doc.json");
    let store = StateStore::default();

    assert!(store.write(&path, &1u32).ok);
    assert_eq!(store.read(&path, 0u32), 1);
    assert!(store.write(&path, &2u32).ok);
    assert_eq!(store.read(&path, 0u32), 2);
    assert!(store.remove(&path).expect("remove"));
    assert_eq!(store.read(&path, 0u32), 0);
}

#[test]
fn create_new_only_succeeds_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("once.json");
    let store = uncoalesced();

    assert!(matches!(store.create_new(&path, &1u32), CreateOutcome::Created));
    assert!(matches!(store.create_new(&path, &2u32), CreateOutcome::AlreadyExists));
    assert_eq!(store.read_uncached::<u32>(&path), Some(1));
}

#[test]
fn racing_creators_produce_exactly_one_winner() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("race.json");
    let store = Arc::new(uncoalesced());

    let winners: usize = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8u32)
            .map(|i| {
                let store = Arc::clone(&store);
                let path = path.clone();
                scope.spawn(move || matches!(store.create_new(&path, &i), CreateOutcome::Created))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(|won| *won)
            .count()
    });
    assert_eq!(winners, 1);
}

#[test]
fn remove_reports_whether_a_file_existed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("gone.json");
    let store = uncoalesced();
    assert!(!store.remove(&path).expect("remove missing"));
    assert!(store.write(&path, &true).ok);
    assert!(store.remove(&path).expect("remove present"));
}

#[test]
fn sweep_removes_only_old_temp_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = uncoalesced();
    let old_temp = dir.path().join(".health.json.abc.tmp");
    let new_temp = dir.path().join(".health.json.def.tmp");
    let real = dir.path().join("health.json");
    for p in [&old_temp, &new_temp, &real] {
        std::fs::write(p, "{}").expect("write");
    }
    let an_hour_ago = filetime::FileTime::from_system_time(
        std::time::SystemTime::now() - Duration::from_secs(3_600),
    );
    filetime::set_file_mtime(&old_temp, an_hour_ago).expect("set mtime");
    filetime::set_file_mtime(&real, an_hour_ago).expect("set mtime");

    assert_eq!(store.sweep_orphans(dir.path(), Duration::from_secs(300)), 1);
    assert!(!old_temp.exists());
    assert!(new_temp.exists());
    assert!(real.exists());
    assert_eq!(store.sweep_orphans(&dir.path().join("absent"), Duration::ZERO), 0);
}

#[test]
fn quiet_store_reports_no_contention() {
    let store = uncoalesced();
    let report = store.contention();
    assert_eq!(report.retries_in_window, 0);
    assert!(!report.is_contended());
}

#[cfg(unix)]
#[test]
fn write_into_read_only_directory_fails_without_panicking() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let locked = dir.path().join("ro");
    std::fs::create_dir(&locked).expect("mkdir");
    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o500)).expect("chmod");

    let store = StateStore::new(&StoreConfig {
        max_retries: 1,
        base_backoff_ms: 1,
        max_backoff_ms: 2,
        read_coalesce_ms: 0,
        ..StoreConfig::default()
    });
    let outcome = store.write(&locked.join("doc.json"), &1u32);

    std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o700)).expect("chmod back");
    // Running as root bypasses directory permissions.
    if outcome.ok {
        return;
    }
    assert!(outcome.last_error.is_some());
}
