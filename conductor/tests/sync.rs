//! Two clones of one repository syncing work items through a bare remote.

use std::path::Path;

use conductor::core::types::{Actor, EventKind, HistoryEvent};
use conductor::io::config::SyncConfig;
use conductor::io::git::Git;
use conductor::io::paths::{ConductorPaths, init_conductor};
use conductor::io::store::{FsStore, StateStore, StoreError};
use conductor::test_support::{bare_with_clones, work_item};

fn open(clone: &Path) -> FsStore {
    init_conductor(clone, false).expect("init");
    let sync = SyncConfig {
        remote: Some("origin".to_string()),
        branch: "main".to_string(),
        max_attempts: 3,
        backoff_ms: 1,
    };
    FsStore::open(ConductorPaths::new(clone), Some(Git::new(clone)), sync).expect("open")
}

fn relabel(store: &FsStore, id: &str, label: &str) {
    let item = store.read(id).expect("read");
    let event = HistoryEvent::in_place(EventKind::Update, &item.position(), Actor::Human)
        .with_note(format!("label {label}"));
    let mut next = item.clone();
    next.labels.push(label.to_string());
    store.write(next, item.version, event).expect("write");
}

#[test]
fn items_propagate_between_clones() {
    let clones = bare_with_clones();
    let store_a = open(&clones.a);
    let store_b = open(&clones.b);

    store_a.create(work_item("1", "plan")).expect("create");
    let report = store_a.sync().expect("sync a");
    assert!(report.pushed);

    store_b.sync().expect("sync b");
    let seen = store_b.read("1").expect("read on b");
    assert_eq!(seen, store_a.read("1").expect("read on a"));

    relabel(&store_b, "1", "from-b");
    store_b.sync().expect("sync b");
    store_a.sync().expect("sync a");
    let item = store_a.read("1").expect("read");
    assert_eq!(item.version, 2);
    assert_eq!(item.labels, vec!["from-b".to_string()]);
}

#[test]
fn exhausted_rebase_retries_block_the_item() {
    let clones = bare_with_clones();
    let store_a = open(&clones.a);
    let store_b = open(&clones.b);

    store_a.create(work_item("1", "plan")).expect("create");
    store_a.sync().expect("sync a");
    store_b.sync().expect("sync b");

    relabel(&store_a, "1", "from-a");
    store_a.sync().expect("sync a");
    relabel(&store_b, "1", "from-b");

    let err = store_b.sync().expect_err("conflict");
    assert!(matches!(
        err,
        StoreError::SyncConflict { ref ids, attempts: 3 } if ids == &vec!["1".to_string()]
    ));
    assert!(store_b.is_blocked("1").expect("blocked"));

    // local document kept intact, further writes refused
    let local = store_b.read("1").expect("read");
    assert_eq!(local.labels, vec!["from-b".to_string()]);
    let event = HistoryEvent::in_place(EventKind::Update, &local.position(), Actor::Human);
    assert!(matches!(
        store_b.write(local.clone(), local.version, event),
        Err(StoreError::Blocked(_))
    ));

    store_b.unblock("1").expect("unblock");
    assert!(!store_b.is_blocked("1").expect("blocked"));
}

#[cfg(unix)]
#[test]
fn rejected_pushes_exhaust_retries_without_blocking() {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    let clones = bare_with_clones();
    let store_a = open(&clones.a);
    store_a.create(work_item("1", "plan")).expect("create");

    let remote = clones.a.parent().expect("parent").join("remote.git");
    let hook = remote.join("hooks/pre-receive");
    fs::create_dir_all(hook.parent().expect("hooks dir")).expect("mkdir hooks");
    fs::write(&hook, "#!/bin/sh\necho 'branch frozen' >&2\nexit 1\n").expect("write hook");
    fs::set_permissions(&hook, fs::Permissions::from_mode(0o755)).expect("chmod hook");

    let err = store_a.sync().expect_err("rejected");
    assert!(matches!(
        err,
        StoreError::SyncConflict { ref ids, attempts: 3 } if ids.is_empty()
    ));
    assert!(!store_a.is_blocked("1").expect("blocked"));
    assert_eq!(store_a.read("1").expect("read").version, 1);
}
