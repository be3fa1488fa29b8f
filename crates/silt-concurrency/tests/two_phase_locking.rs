//! Cross-thread lock manager scenarios: blocking, grant order, upgrades.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use silt_concurrency::{
    AbortReason, IsolationLevel, LockManager, LockManagerConfig, TransactionManager,
    TransactionState,
};
use silt_types::{PageId, Rid, TxnId};

fn setup() -> (Arc<LockManager>, TransactionManager) {
    let lm = Arc::new(LockManager::new(LockManagerConfig {
        enable_cycle_detection: false,
        ..LockManagerConfig::default()
    }));
    let tm = TransactionManager::new(Arc::clone(&lm));
    (lm, tm)
}

fn rid(page: u64, slot: u32) -> Rid {
    Rid::new(PageId::new(page), slot)
}

const BLOCKED_CHECK: Duration = Duration::from_millis(150);
const COMPLETION: Duration = Duration::from_secs(5);

#[test]
fn test_simple_shared_lock_lifecycle() {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let r = rid(0, 0);

    assert!(lm.lock_shared(&t1, r));
    assert!(t1.holds_shared(r));

    assert!(lm.unlock(&t1, r));
    assert!(!t1.holds_shared(r));
    assert_eq!(t1.state(), TransactionState::Shrinking);
}

#[test]
fn test_exclusive_blocks_until_shared_released() {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);
    let r = rid(0, 1);

    assert!(lm.lock_shared(&t1, r));

    let (done_tx, done_rx) = mpsc::channel();
    let writer = {
        let lm = Arc::clone(&lm);
        let t2 = Arc::clone(&t2);
        std::thread::spawn(move || {
            let granted = lm.lock_exclusive(&t2, r);
            done_tx.send(granted).unwrap();
        })
    };

    // The writer must still be parked while the shared lock is held.
    assert!(done_rx.recv_timeout(BLOCKED_CHECK).is_err());

    assert!(lm.unlock(&t1, r));
    assert_eq!(done_rx.recv_timeout(COMPLETION), Ok(true));
    writer.join().unwrap();

    assert!(t2.holds_exclusive(r));
    tm.commit(&t2);
}

#[test]
fn test_grant_order_follows_arrival() {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);
    let t3 = tm.begin(IsolationLevel::RepeatableRead);
    let r = rid(0, 2);

    assert!(lm.lock_shared(&t1, r));

    let (order_tx, order_rx) = mpsc::channel();

    let writer = {
        let (lm, t2, order_tx) = (Arc::clone(&lm), Arc::clone(&t2), order_tx.clone());
        std::thread::spawn(move || {
            assert!(lm.lock_exclusive(&t2, r));
            order_tx.send("x2").unwrap();
            std::thread::sleep(Duration::from_millis(50));
            assert!(lm.unlock(&t2, r));
        })
    };
    // Make sure the exclusive request is queued before the next reader
    // arrives; a later shared request must not jump it.
    std::thread::sleep(Duration::from_millis(100));

    let reader = {
        let (lm, t3, order_tx) = (Arc::clone(&lm), Arc::clone(&t3), order_tx);
        std::thread::spawn(move || {
            assert!(lm.lock_shared(&t3, r));
            order_tx.send("s3").unwrap();
            assert!(lm.unlock(&t3, r));
        })
    };
    std::thread::sleep(Duration::from_millis(100));

    assert!(lm.unlock(&t1, r));

    assert_eq!(order_rx.recv_timeout(COMPLETION), Ok("x2"));
    assert_eq!(order_rx.recv_timeout(COMPLETION), Ok("s3"));
    writer.join().unwrap();
    reader.join().unwrap();
}

#[test]
fn test_upgrade_waits_for_other_shared_holder() {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);
    let r = rid(1, 0);

    assert!(lm.lock_shared(&t1, r));
    assert!(lm.lock_shared(&t2, r));

    let (done_tx, done_rx) = mpsc::channel();
    let upgrader = {
        let lm = Arc::clone(&lm);
        let t1 = Arc::clone(&t1);
        std::thread::spawn(move || {
            let granted = lm.lock_upgrade(&t1, r);
            done_tx.send(granted).unwrap();
        })
    };

    assert!(done_rx.recv_timeout(BLOCKED_CHECK).is_err());

    assert!(lm.unlock(&t2, r));
    assert_eq!(done_rx.recv_timeout(COMPLETION), Ok(true));
    upgrader.join().unwrap();

    assert!(t1.holds_exclusive(r));
    assert!(!t1.holds_shared(r));
}

#[test]
fn test_second_upgrader_aborts_and_first_completes() {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);
    let r = rid(1, 1);

    assert!(lm.lock_shared(&t1, r));
    assert!(lm.lock_shared(&t2, r));

    let (done_tx, done_rx) = mpsc::channel();
    let upgrader = {
        let lm = Arc::clone(&lm);
        let t1 = Arc::clone(&t1);
        std::thread::spawn(move || {
            let granted = lm.lock_upgrade(&t1, r);
            done_tx.send(granted).unwrap();
        })
    };

    // Let the first upgrade park before contesting it.
    std::thread::sleep(Duration::from_millis(150));

    assert!(!lm.lock_upgrade(&t2, r));
    assert_eq!(t2.state(), TransactionState::Aborted);
    assert_eq!(t2.abort_reason(), Some(AbortReason::UpgradeConflict));

    // Rolling back the loser releases its shared lock, unblocking the
    // winner.
    tm.abort(&t2);
    assert_eq!(done_rx.recv_timeout(COMPLETION), Ok(true));
    upgrader.join().unwrap();

    assert!(t1.holds_exclusive(r));
    assert!(lm.unlock(&t1, r));
}

#[test]
fn test_ids_order_transactions_by_age() {
    let (_lm, tm) = setup();
    let ids: Vec<TxnId> = (0..5)
        .map(|_| tm.begin(IsolationLevel::RepeatableRead).id())
        .collect();
    for pair in ids.windows(2) {
        assert!(pair[0] < pair[1]);
    }
}

#[test]
fn test_writer_waits_for_many_readers() {
    let (lm, tm) = setup();
    let readers: Vec<_> = (0..3)
        .map(|_| tm.begin(IsolationLevel::RepeatableRead))
        .collect();
    let writer_txn = tm.begin(IsolationLevel::RepeatableRead);
    let r = rid(2, 0);

    for t in &readers {
        assert!(lm.lock_shared(t, r));
    }

    let (done_tx, done_rx) = mpsc::channel();
    let writer = {
        let lm = Arc::clone(&lm);
        let t = Arc::clone(&writer_txn);
        std::thread::spawn(move || {
            let granted = lm.lock_exclusive(&t, r);
            done_tx.send(granted).unwrap();
        })
    };

    // Still blocked after each of the first two readers leaves.
    assert!(lm.unlock(&readers[0], r));
    assert!(done_rx.recv_timeout(BLOCKED_CHECK).is_err());
    assert!(lm.unlock(&readers[1], r));
    assert!(done_rx.recv_timeout(BLOCKED_CHECK).is_err());

    assert!(lm.unlock(&readers[2], r));
    assert_eq!(done_rx.recv_timeout(COMPLETION), Ok(true));
    writer.join().unwrap();
}
