use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mailredo::error::RedoError;
use mailredo::lock::scripts;
use mailredo::lock::{DistributedLock, LockConfig, LockManager, LockMode};
use mailredo::store::MemoryStore;

fn worker(store: &Arc<MemoryStore>, name: &str, config: LockConfig) -> Arc<LockManager> {
    LockManager::new(store.clone(), config, name).unwrap()
}

#[test]
fn test_reader_waits_for_writer_on_other_worker() {
    let store = Arc::new(MemoryStore::new());
    let pod_a = worker(&store, "pod-a", LockConfig::short_lease());
    let pod_b = worker(&store, "pod-b", LockConfig::short_lease());

    let write = pod_a.mailbox_lock("acct").lock(LockMode::Write).unwrap();

    let acquired = Arc::new(AtomicBool::new(false));
    let reader = {
        let pod_b = pod_b.clone();
        let acquired = acquired.clone();
        thread::spawn(move || {
            let guard = pod_b.mailbox_lock("acct").lock(LockMode::Read).unwrap();
            acquired.store(true, Ordering::SeqCst);
            let granted_at = Instant::now();
            guard.release().unwrap();
            granted_at
        })
    };

    thread::sleep(Duration::from_millis(200));
    assert!(!acquired.load(Ordering::SeqCst), "read granted while write held");

    let released_at = Instant::now();
    write.release().unwrap();
    let granted_at = reader.join().unwrap();
    assert!(acquired.load(Ordering::SeqCst));
    // Woken by the unlock message, not by the 2s lease fallback
    assert!(granted_at.duration_since(released_at) < Duration::from_millis(1_500));
}

#[test]
fn test_readers_share_across_workers() {
    let store = Arc::new(MemoryStore::new());
    let pod_a = worker(&store, "pod-a", LockConfig::short_lease());
    let pod_b = worker(&store, "pod-b", LockConfig::short_lease());

    let start = Instant::now();
    let a = pod_a.mailbox_lock("acct").lock(LockMode::Read).unwrap();
    let b = pod_b.mailbox_lock("acct").lock(LockMode::Read).unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    a.release().unwrap();
    b.release().unwrap();
}

#[test]
fn test_writers_are_mutually_exclusive() {
    let store = Arc::new(MemoryStore::new());
    let managers = vec![
        worker(&store, "pod-a", LockConfig::short_lease()),
        worker(&store, "pod-b", LockConfig::short_lease()),
    ];
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..6 {
        let manager = managers[i % 2].clone();
        let inside = inside.clone();
        let max_inside = max_inside.clone();
        let completed = completed.clone();
        handles.push(thread::spawn(move || {
            let lock = manager.mailbox_lock("shared");
            for _ in 0..5 {
                let guard = lock.lock(LockMode::Write).unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(2));
                inside.fetch_sub(1, Ordering::SeqCst);
                guard.release().unwrap();
                completed.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(completed.load(Ordering::SeqCst), 30);
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
}

#[test]
fn test_lock_times_out() {
    let store = Arc::new(MemoryStore::new());
    let pod_a = worker(&store, "pod-a", LockConfig::short_lease());
    let pod_b = worker(
        &store,
        "pod-b",
        LockConfig {
            timeout_ms: 200,
            ..LockConfig::short_lease()
        },
    );

    let _write = pod_a.mailbox_lock("acct").lock(LockMode::Write).unwrap();
    let start = Instant::now();
    let err = pod_b.mailbox_lock("acct").lock(LockMode::Read).err().unwrap();
    assert!(matches!(err, RedoError::LockTimeout(_)));
    assert!(err.is_retryable());
    assert!(start.elapsed() >= Duration::from_millis(200));
}

#[test]
fn test_too_many_waiters_rejected() {
    let store = Arc::new(MemoryStore::new());
    let pod_a = worker(&store, "pod-a", LockConfig::short_lease());
    let pod_b = worker(
        &store,
        "pod-b",
        LockConfig {
            max_waiting_threads: 1,
            ..LockConfig::short_lease()
        },
    );

    let write = pod_a.mailbox_lock("acct").lock(LockMode::Write).unwrap();
    let waiter = {
        let pod_b = pod_b.clone();
        thread::spawn(move || pod_b.mailbox_lock("acct").lock(LockMode::Write).map(|g| g.release()))
    };
    thread::sleep(Duration::from_millis(200));

    let err = pod_b.mailbox_lock("acct").lock(LockMode::Write).err().unwrap();
    match err {
        RedoError::LockFailed(msg) => assert!(msg.contains("too many waiting")),
        other => panic!("expected LockFailed, got {}", other),
    }

    write.release().unwrap();
    waiter.join().unwrap().unwrap().unwrap();
}

#[test]
fn test_expired_lease_unblocks_waiter_without_notification() {
    let store = Arc::new(MemoryStore::new());
    let config = LockConfig::short_lease();
    let pod_b = worker(&store, "pod-b", config.clone());

    // A holder that dies without releasing
    let bucket = scripts::bucket_for("acct", config.num_channels);
    let crashed = DistributedLock::new(
        store.clone(),
        "acct",
        LockMode::Write,
        bucket,
        "pod-a:dead",
        "pod-a",
        300,
    );
    assert!(crashed.try_acquire().unwrap().acquired);

    let start = Instant::now();
    let guard = pod_b.mailbox_lock("acct").lock(LockMode::Write).unwrap();
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(200));
    assert!(waited < Duration::from_secs(2));
    guard.release().unwrap();
}

#[test]
fn test_shutdown_release_wakes_other_workers() {
    let store = Arc::new(MemoryStore::new());
    let pod_a = worker(&store, "pod-a", LockConfig::default());
    let pod_b = worker(&store, "pod-b", LockConfig::default());

    let held = pod_a.mailbox_lock("acct").lock(LockMode::Write).unwrap();
    let waiter = {
        let pod_b = pod_b.clone();
        thread::spawn(move || {
            let start = Instant::now();
            let guard = pod_b.mailbox_lock("acct").lock(LockMode::Write).unwrap();
            let waited = start.elapsed();
            guard.release().unwrap();
            waited
        })
    };
    thread::sleep(Duration::from_millis(200));

    assert_eq!(pod_a.release_all_on_shutdown().unwrap(), 1);
    // 60s lease: only the shutdown message can have woken the waiter
    assert!(waiter.join().unwrap() < Duration::from_secs(5));
    assert!(held.release().is_err());
}

#[test]
fn test_lock_state_cleared_after_release() {
    let store = Arc::new(MemoryStore::new());
    let pod_a = worker(&store, "pod-a", LockConfig::short_lease());
    let lock = pod_a.mailbox_lock("acct");

    let r1 = lock.lock(LockMode::Read).unwrap();
    let w = lock.lock(LockMode::Write).unwrap();
    let r2 = lock.lock(LockMode::Read).unwrap();
    assert_eq!(lock.hold_count(LockMode::Read), 2);
    w.release().unwrap();
    r2.release().unwrap();
    r1.release().unwrap();

    let bucket = scripts::bucket_for("acct", pod_a.config().num_channels);
    assert!(store.hgetall(&scripts::lock_key(bucket, "acct")).unwrap().is_empty());
}
