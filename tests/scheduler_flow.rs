//! Cross-store lease behaviour: the handoff contract two cooperating
//! processes rely on, exercised with literal timings.

use std::time::Duration;

use claude_tasks::db::Store;
use tempfile::TempDir;

#[test]
fn lease_hands_off_between_two_stores_on_the_same_file() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("tasks.db");

    let store_a = Store::open(&db_path).unwrap();
    let store_b = Store::open(&db_path).unwrap();

    let (acquired, lease) = store_a
        .try_acquire_lease("A", Duration::from_secs(2))
        .unwrap();
    assert!(acquired, "first contender should take the lease");
    assert_eq!(lease.unwrap().holder_id, "A");

    let (acquired, lease) = store_b
        .try_acquire_lease("B", Duration::from_secs(2))
        .unwrap();
    assert!(!acquired, "second contender must lose while the lease is live");
    assert_eq!(lease.unwrap().holder_id, "A");

    std::thread::sleep(Duration::from_millis(2100));

    let (acquired, lease) = store_b
        .try_acquire_lease("B", Duration::from_secs(2))
        .unwrap();
    assert!(acquired, "expired lease should be claimable");
    assert_eq!(lease.unwrap().holder_id, "B");
}

#[test]
fn at_most_one_unexpired_holder_exists_under_contention() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("tasks.db");

    let holders = ["p1", "p2", "p3", "p4"];
    let mut wins = 0;
    let mut threads = Vec::new();

    for holder in holders {
        let db_path = db_path.clone();
        threads.push(std::thread::spawn(move || {
            let store = Store::open(&db_path).unwrap();
            let (acquired, _) = store
                .try_acquire_lease(holder, Duration::from_secs(5))
                .unwrap();
            acquired
        }));
    }

    for thread in threads {
        if thread.join().unwrap() {
            wins += 1;
        }
    }

    assert_eq!(wins, 1, "exactly one contender may hold an unexpired lease");
}
