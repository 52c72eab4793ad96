use super::*;
use crate::redolog::op::OpKind;
use crate::redolog::types::MailboxOperation;
use crate::store::MemoryStore;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

#[derive(Default)]
struct RecordingFatal(Mutex<Vec<String>>);

impl FatalErrorHandler for RecordingFatal {
    fn on_fatal(&self, context: &str, _error: &RedoError) {
        self.0.lock().unwrap().push(context.to_string());
    }
}

struct FailingDurability;

impl DurabilityStore for FailingDurability {
    fn flush_to_disk(&self) -> Result<()> {
        Err(RedoError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk gone")))
    }
}

#[derive(Default)]
struct RecordingRedo {
    redone: Mutex<Vec<TransactionId>>,
    fail_mailbox: Option<MailboxId>,
}

impl RedoHandler for RecordingRedo {
    fn redo(&self, op: &RedoableOp) -> Result<()> {
        if Some(op.mailbox_id) == self.fail_mailbox {
            return Err(RedoError::Internal("mailbox unavailable".into()));
        }
        self.redone.lock().unwrap().push(op.txn_id);
        Ok(())
    }
}

fn start_manager(config: RedoConfig) -> (Arc<RedoLogManager>, Arc<RecordingFatal>) {
    let fatal = Arc::new(RecordingFatal::default());
    let mgr = RedoLogManager::from_config(config, None, Arc::new(NoopDurability))
        .unwrap()
        .with_fatal_handler(fatal.clone());
    let mgr = Arc::new(mgr);
    mgr.start().unwrap();
    (mgr, fatal)
}

fn new_op(mgr: &RedoLogManager, mailbox: MailboxId) -> RedoableOp {
    RedoableOp::new(
        mgr.new_txn_id().unwrap(),
        mailbox,
        MailboxOperation::CreateMessage,
        vec![mailbox as u8; 32],
    )
}

/// Log `op` and return the copy the caller keeps for commit/abort
fn log_op(mgr: &RedoLogManager, mut op: RedoableOp) -> RedoableOp {
    let kept = op.clone();
    mgr.log(&mut op, false).unwrap();
    kept
}

fn read_log(path: &Path) -> Vec<RedoableOp> {
    let mut reader = FileLogReader::open(path).unwrap();
    let mut ops = Vec::new();
    while let Some(op) = reader.next_op().unwrap() {
        ops.push(op);
    }
    ops
}

/// Every record in archive order followed by the active log
fn read_all_logs(mgr: &RedoLogManager) -> Vec<RedoableOp> {
    let mut ops = Vec::new();
    for path in mgr.archived_logs().unwrap() {
        ops.extend(read_log(&path));
    }
    ops.extend(read_log(mgr.log_path()));
    ops
}

fn checkpoints(ops: &[RedoableOp]) -> Vec<Vec<TransactionId>> {
    ops.iter()
        .filter_map(|op| match &op.kind {
            OpKind::Checkpoint { active_txns } => Some(active_txns.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_log_tracks_active_transactions() {
    let dir = tempdir().unwrap();
    let (mgr, _) = start_manager(RedoConfig::synchronous(dir.path()));

    let a = log_op(&mgr, new_op(&mgr, 1));
    let b = log_op(&mgr, new_op(&mgr, 2));
    assert_eq!(mgr.active_txn_ids().unwrap(), vec![a.txn_id, b.txn_id]);

    mgr.commit(&a).unwrap();
    mgr.abort(&b).unwrap();
    assert!(mgr.active_txn_ids().unwrap().is_empty());

    let ops = read_log(mgr.log_path());
    assert_eq!(ops.len(), 4);
    assert!(ops[2].is_commit());
    assert!(matches!(ops[3].kind, OpKind::AbortTxn { .. }));
    mgr.stop();
}

#[test]
fn test_log_releases_payload() {
    let dir = tempdir().unwrap();
    let (mgr, _) = start_manager(RedoConfig::synchronous(dir.path()));
    let mut op = new_op(&mgr, 3);
    mgr.log(&mut op, true).unwrap();
    assert!(op.payload.is_empty());
    // the log itself keeps the payload
    assert_eq!(read_log(mgr.log_path())[0].payload, vec![3u8; 32]);
    mgr.stop();
}

#[test]
fn test_checkpoint_lists_exactly_active_txns() {
    let dir = tempdir().unwrap();
    let (mgr, _) = start_manager(RedoConfig::synchronous(dir.path()));

    let a = log_op(&mgr, new_op(&mgr, 1));
    let b = log_op(&mgr, new_op(&mgr, 2));
    mgr.force_rollover().unwrap().unwrap();

    mgr.commit(&a).unwrap();
    let c = log_op(&mgr, new_op(&mgr, 3));
    mgr.force_rollover().unwrap().unwrap();

    let ops = read_all_logs(&mgr);
    assert_eq!(
        checkpoints(&ops),
        vec![vec![a.txn_id, b.txn_id], vec![b.txn_id, c.txn_id]]
    );
    mgr.stop();
}

#[test]
fn test_rollover_skips_empty_log() {
    let dir = tempdir().unwrap();
    let (mgr, _) = start_manager(RedoConfig::synchronous(dir.path()));
    assert!(!mgr.is_rollover_needed(true));
    assert_eq!(mgr.force_rollover().unwrap(), None);
    assert!(mgr.archived_logs().unwrap().is_empty());
    mgr.stop();
}

#[test]
fn test_rollover_loses_nothing() {
    let dir = tempdir().unwrap();
    let (mgr, _) = start_manager(RedoConfig::synchronous(dir.path()));

    let mut committed = Vec::new();
    for round in 0..3 {
        for m in 1..=4 {
            let op = log_op(&mgr, new_op(&mgr, round * 10 + m));
            mgr.commit(&op).unwrap();
            committed.push(op.txn_id);
        }
        let archived = mgr.force_rollover().unwrap().unwrap();
        assert!(archived.starts_with(mgr.archive_dir()));
    }
    let last = log_op(&mgr, new_op(&mgr, 99));
    mgr.commit(&last).unwrap();
    committed.push(last.txn_id);

    assert_eq!(mgr.current_log_sequence(), 3);
    let seen: Vec<TransactionId> = read_all_logs(&mgr)
        .iter()
        .filter(|op| op.is_commit())
        .map(|op| op.txn_id)
        .collect();
    assert_eq!(seen, committed);
    mgr.stop();
}

#[test]
fn test_uncommitted_op_survives_rollover() {
    let dir = tempdir().unwrap();
    let (mgr, _) = start_manager(RedoConfig::synchronous(dir.path()));
    let pending = log_op(&mgr, new_op(&mgr, 5));
    mgr.force_rollover().unwrap().unwrap();

    let active = read_log(mgr.log_path());
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].txn_id, pending.txn_id);
    assert_eq!(active[0].payload, pending.payload);
    mgr.stop();
}

#[test]
fn test_size_limit_triggers_background_rollover() {
    let dir = tempdir().unwrap();
    let config = RedoConfig {
        rollover_soft_max_bytes: 256,
        rollover_hard_max_bytes: 512,
        ..RedoConfig::synchronous(dir.path())
    };
    let (mgr, _) = start_manager(config);

    for m in 1..=10 {
        let op = log_op(&mgr, new_op(&mgr, m));
        mgr.commit(&op).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while mgr.archived_logs().unwrap().is_empty() {
        assert!(Instant::now() < deadline, "background rollover never happened");
        thread::sleep(Duration::from_millis(10));
    }
    assert!(mgr.current_log_sequence() >= 1);
    mgr.stop();
}

#[test]
fn test_stop_rolls_over_and_reports() {
    let dir = tempdir().unwrap();
    let (mgr, fatal) = start_manager(RedoConfig::synchronous(dir.path()));
    let op = log_op(&mgr, new_op(&mgr, 1));
    mgr.commit(&op).unwrap();
    mgr.stop();

    assert_eq!(mgr.archived_logs().unwrap().len(), 1);
    // logging after stop is a no-op
    let mut late = new_op(&mgr, 2);
    assert!(mgr.log(&mut late, true).is_ok());
    assert!(fatal.0.lock().unwrap().is_empty());
}

#[test]
fn test_restart_continues_sequence() {
    let dir = tempdir().unwrap();
    {
        let (mgr, _) = start_manager(RedoConfig::synchronous(dir.path()));
        let op = log_op(&mgr, new_op(&mgr, 1));
        mgr.commit(&op).unwrap();
        mgr.stop();
    }
    let (mgr, _) = start_manager(RedoConfig::synchronous(dir.path()));
    assert_eq!(mgr.current_log_sequence(), 1);
    mgr.stop();
}

#[test]
fn test_disabled_log_is_noop() {
    let dir = tempdir().unwrap();
    let config = RedoConfig {
        enabled: false,
        ..RedoConfig::synchronous(dir.path())
    };
    let (mgr, _) = start_manager(config);
    let mut op = new_op(&mgr, 1);
    mgr.log(&mut op, true).unwrap();
    mgr.commit(&op).unwrap();
    assert!(!mgr.log_path().exists());
    assert_eq!(mgr.force_rollover().unwrap(), None);
}

#[test]
fn test_rollover_failure_is_fatal() {
    let dir = tempdir().unwrap();
    let fatal = Arc::new(RecordingFatal::default());
    let mgr = Arc::new(
        RedoLogManager::from_config(
            RedoConfig::synchronous(dir.path()),
            None,
            Arc::new(FailingDurability),
        )
        .unwrap()
        .with_fatal_handler(fatal.clone()),
    );
    mgr.start().unwrap();
    log_op(&mgr, new_op(&mgr, 1));

    assert!(mgr.force_rollover().is_err());
    assert_eq!(*fatal.0.lock().unwrap(), vec!["rolling over the redo log".to_string()]);
}

#[test]
fn test_exclusive_lock_quiesces_logging() {
    let dir = tempdir().unwrap();
    let (mgr, _) = start_manager(RedoConfig::synchronous(dir.path()));
    let done = Arc::new(AtomicBool::new(false));

    let exclusive = mgr.acquire_exclusive_lock().unwrap();
    let logger = {
        let mgr = Arc::clone(&mgr);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut op = new_op(&mgr, 1);
            mgr.log(&mut op, true).unwrap();
            done.store(true, Ordering::SeqCst);
        })
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!done.load(Ordering::SeqCst));

    drop(exclusive);
    logger.join().unwrap();
    assert!(done.load(Ordering::SeqCst));
    mgr.stop();
}

#[test]
fn test_concurrent_logging_with_rollovers() {
    let dir = tempdir().unwrap();
    let (mgr, _) = start_manager(RedoConfig::in_dir(dir.path()));

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let mgr = Arc::clone(&mgr);
            thread::spawn(move || {
                for i in 0..25 {
                    let op = log_op(&mgr, new_op(&mgr, t * 100 + i + 1));
                    mgr.commit(&op).unwrap();
                }
            })
        })
        .collect();
    for _ in 0..5 {
        mgr.force_rollover().unwrap();
        thread::sleep(Duration::from_millis(5));
    }
    for w in writers {
        w.join().unwrap();
    }
    mgr.flush().unwrap();

    let ops = read_all_logs(&mgr);
    assert_eq!(ops.iter().filter(|op| op.is_commit()).count(), 100);
    assert!(mgr.active_txn_ids().unwrap().is_empty());
    mgr.stop();
}

#[test]
fn test_changed_mailboxes_since() {
    let dir = tempdir().unwrap();
    let (mgr, _) = start_manager(RedoConfig::synchronous(dir.path()));

    let marker = log_op(&mgr, new_op(&mgr, 1));
    mgr.commit(&marker).unwrap();
    let cid = CommitId::new(mgr.current_log_sequence(), marker.txn_id);

    for m in [2, 3, 0] {
        let op = log_op(&mgr, new_op(&mgr, m));
        mgr.commit(&op).unwrap();
    }
    mgr.force_rollover().unwrap().unwrap();
    let last = log_op(&mgr, new_op(&mgr, 4));
    mgr.commit(&last).unwrap();
    // started but never committed
    log_op(&mgr, new_op(&mgr, 5));

    let (changed, last_cid) = mgr.changed_mailboxes_since(&cid).unwrap();
    assert_eq!(changed, HashSet::from([2, 3, 4]));
    assert_eq!(last_cid, CommitId::new(1, last.txn_id));

    // resuming from the returned id sees nothing new
    let (changed, again) = mgr.changed_mailboxes_since(&last_cid).unwrap();
    assert!(changed.is_empty());
    assert_eq!(again, last_cid);

    let leftovers = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("tmp-scan-"))
        .count();
    assert_eq!(leftovers, 0);
    mgr.stop();
}

#[test]
fn test_changed_mailboxes_invalid_commit_id() {
    let dir = tempdir().unwrap();
    let (mgr, _) = start_manager(RedoConfig::synchronous(dir.path()));
    let op = log_op(&mgr, new_op(&mgr, 1));
    mgr.commit(&op).unwrap();

    // no log carries this sequence
    let err = mgr
        .changed_mailboxes_since(&CommitId::new(7, op.txn_id))
        .unwrap_err();
    assert!(matches!(err, RedoError::InvalidCommitId(_)));

    // right sequence, but the commit record is not there
    let err = mgr
        .changed_mailboxes_since(&CommitId::new(0, TransactionId::new(1, 1)))
        .unwrap_err();
    assert!(matches!(err, RedoError::InvalidCommitId(_)));
    mgr.stop();
}

#[test]
fn test_crash_recovery_replays_uncommitted() {
    let dir = tempdir().unwrap();
    let (committed, pending, failing) = {
        let (mgr, _) = start_manager(RedoConfig::synchronous(dir.path()));
        let committed = log_op(&mgr, new_op(&mgr, 1));
        mgr.commit(&committed).unwrap();
        let pending = log_op(&mgr, new_op(&mgr, 2));
        let failing = log_op(&mgr, new_op(&mgr, 3));
        mgr.flush().unwrap();
        // no stop(): simulate a crash
        (committed, pending, failing)
    };

    let fatal = Arc::new(RecordingFatal::default());
    let mgr = Arc::new(
        RedoLogManager::from_config(RedoConfig::synchronous(dir.path()), None, Arc::new(NoopDurability))
            .unwrap()
            .with_fatal_handler(fatal),
    );
    let handler = RecordingRedo {
        fail_mailbox: Some(failing.mailbox_id),
        ..Default::default()
    };
    let replayed = mgr.start_with_recovery(&handler).unwrap();

    assert_eq!(replayed, 1);
    assert_eq!(*handler.redone.lock().unwrap(), vec![pending.txn_id]);
    assert!(!handler.redone.lock().unwrap().contains(&committed.txn_id));
    assert!(!mgr.in_crash_recovery());
    // the crashed log was archived without a checkpoint
    let archived = mgr.archived_logs().unwrap();
    assert_eq!(archived.len(), 1);
    assert!(checkpoints(&read_log(&archived[0])).is_empty());
    mgr.stop();
}

#[test]
fn test_forwarding_node_appends_to_stream() {
    let dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let config = RedoConfig {
        writer_role: WriterRole::Forwarding,
        ..RedoConfig::synchronous(dir.path())
    };
    let mgr = Arc::new(
        RedoLogManager::from_config(config, Some(store.clone()), Arc::new(NoopDurability)).unwrap(),
    );
    mgr.start().unwrap();

    let op = log_op(&mgr, new_op(&mgr, 8));
    mgr.commit(&op).unwrap();
    assert_eq!(
        store
            .stream_entries(crate::redolog::distributed::REDO_STREAM_KEY)
            .len(),
        2
    );
    assert!(!mgr.log_path().exists());
    mgr.stop();
}

#[test]
fn test_forwarding_node_needs_store() {
    let dir = tempdir().unwrap();
    let config = RedoConfig {
        writer_role: WriterRole::Forwarding,
        ..RedoConfig::synchronous(dir.path())
    };
    assert!(matches!(
        RedoLogManager::from_config(config, None, Arc::new(NoopDurability)),
        Err(RedoError::Config(_))
    ));
}

#[test]
fn test_oversized_record_is_fatal_and_log_stays_readable() {
    let dir = tempdir().unwrap();
    let (mgr, fatal) = start_manager(RedoConfig::synchronous(dir.path()));

    let mut huge = RedoableOp::new(
        mgr.new_txn_id().unwrap(),
        1,
        MailboxOperation::CreateMessage,
        vec![0u8; crate::redolog::op::MAX_FRAME_LEN + 16],
    );
    assert!(matches!(mgr.log(&mut huge, true), Err(RedoError::Serialization(_))));
    assert_eq!(*fatal.0.lock().unwrap(), vec!["serializing a redo record".to_string()]);
    assert!(mgr.active_txn_ids().unwrap().is_empty());

    let op = log_op(&mgr, new_op(&mgr, 2));
    mgr.commit(&op).unwrap();

    mgr.flush().unwrap();

    let ops = read_log(mgr.log_path());
    assert_eq!(ops.len(), 2);
    assert!(ops.iter().all(|o| o.mailbox_id == 2));
    assert!(ops[1].is_commit());
}

#[test]
fn test_shutting_down_flag_follows_lifecycle() {
    let dir = tempdir().unwrap();
    let (mgr, fatal) = start_manager(RedoConfig::synchronous(dir.path()));
    assert!(!mgr.is_shutting_down());

    mgr.stop();
    assert!(mgr.is_shutting_down());
    let mut late = new_op(&mgr, 1);
    assert!(mgr.log(&mut late, true).is_ok());
    assert!(fatal.0.lock().unwrap().is_empty());
}
