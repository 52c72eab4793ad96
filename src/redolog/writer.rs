//! Log writers and the on-disk file format
//!
//! Every log file starts with a [`FileHeader`] frame followed by one frame per
//! record. A frame is a 4-byte little-endian length prefix and a bincode body.
//!
//! ## Deferred Fsync with Commit Latches
//!
//! [`FileLogWriter`] appends to the OS buffer immediately and leaves the fsync
//! to a background flusher that runs every `fsync_interval_ms`. A synchronous
//! write blocks on a commit latch until the flusher has made its frame
//! durable, so many synchronous writers share one fsync. With an interval of
//! 0 the writer fsyncs inline instead.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{RedoError, Result};
use super::op::{encode_frame, now_millis, RedoableOp};
use super::reader::FileLogReader;
use super::rollover::RolloverManager;
use super::types::TransactionId;

/// "RDOL"
pub const LOG_MAGIC: u32 = 0x5244_4F4C;
pub const LOG_VERSION: u16 = 1;

/// How long a synchronous write waits for the flusher before giving up
const DURABLE_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// First frame of every log file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub magic: u32,
    pub version: u16,
    pub sequence: u64,
    /// Unix epoch millis when the file was started
    pub create_time: u64,
}

impl FileHeader {
    pub fn new(sequence: u64, create_time: u64) -> Self {
        Self {
            magic: LOG_MAGIC,
            version: LOG_VERSION,
            sequence,
            create_time,
        }
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let header: FileHeader = bincode::deserialize(body)?;
        if header.magic != LOG_MAGIC {
            return Err(RedoError::Serialization(format!(
                "bad redo log magic {:#x}",
                header.magic
            )));
        }
        Ok(header)
    }
}

/// Operations between their start marker and their commit/abort record,
/// in the order they started.
#[derive(Debug, Default)]
pub struct ActiveOps {
    next_slot: u64,
    order: BTreeMap<u64, TransactionId>,
    ops: HashMap<TransactionId, (u64, RedoableOp)>,
}

impl ActiveOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `op`; a second start for the same transaction keeps its original position
    pub fn insert(&mut self, op: RedoableOp) {
        let txn_id = op.txn_id;
        if let Some(entry) = self.ops.get_mut(&txn_id) {
            entry.1 = op;
            return;
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        self.order.insert(slot, txn_id);
        self.ops.insert(txn_id, (slot, op));
    }

    pub fn remove(&mut self, txn_id: &TransactionId) -> Option<RedoableOp> {
        let (slot, op) = self.ops.remove(txn_id)?;
        self.order.remove(&slot);
        Some(op)
    }

    pub fn contains(&self, txn_id: &TransactionId) -> bool {
        self.ops.contains_key(txn_id)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Active transaction ids in start order
    pub fn txn_ids(&self) -> Vec<TransactionId> {
        self.order.values().copied().collect()
    }

    /// Active operations in start order
    pub fn iter(&self) -> impl Iterator<Item = &RedoableOp> + '_ {
        self.order
            .values()
            .filter_map(move |txn| self.ops.get(txn).map(|(_, op)| op))
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.ops.clear();
    }
}

/// Destination for serialized redo records.
///
/// The manager serializes each record once and hands the frame to whichever
/// writer is configured; it never needs to know which one that is.
pub trait LogWriter: Send + Sync {
    fn open(&self) -> Result<()>;

    /// Append one frame; `synchronous` returns only once it is durable
    fn log(&self, op: &RedoableOp, frame: &[u8], synchronous: bool) -> Result<()>;

    /// Make everything written so far durable
    fn flush(&self) -> Result<()>;

    fn close(&self) -> Result<()>;

    /// True if the active log holds no records
    fn is_empty(&self) -> bool;

    /// Bytes in the active log, header included
    fn size(&self) -> u64;

    /// Unix epoch millis when the active log was started
    fn create_time(&self) -> u64;

    /// Archive the active log and start a new one holding `active_ops`.
    /// Returns the archived file, or `None` if this writer does not roll over.
    fn rollover(&self, active_ops: &ActiveOps) -> Result<Option<PathBuf>>;

    /// Sequence number of the active log
    fn sequence(&self) -> u64;
}

fn latch_error(msg: impl Into<String>) -> RedoError {
    RedoError::Io(std::io::Error::new(std::io::ErrorKind::Other, msg.into()))
}

/// Shared state for commit latches - lets synchronous writers wait for durability
pub struct FsyncState {
    /// Highest LSN known to be on disk
    durable_lsn: AtomicU64,
    /// Highest LSN handed to the OS
    written_lsn: AtomicU64,
    condvar: Condvar,
    mutex: Mutex<()>,
    /// Set once an fsync has failed; nothing after that point is durable
    failed: AtomicBool,
}

impl FsyncState {
    fn new() -> Self {
        Self {
            durable_lsn: AtomicU64::new(0),
            written_lsn: AtomicU64::new(0),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
            failed: AtomicBool::new(false),
        }
    }

    pub fn durable_lsn(&self) -> u64 {
        self.durable_lsn.load(Ordering::Acquire)
    }

    pub fn written_lsn(&self) -> u64 {
        self.written_lsn.load(Ordering::Acquire)
    }

    /// Wait until `target_lsn` is durable.
    /// Fails on timeout or once an fsync has failed.
    pub fn wait_for_durable(&self, target_lsn: u64, timeout: Duration) -> Result<()> {
        if self.durable_lsn() >= target_lsn {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self
            .mutex
            .lock()
            .map_err(|_| latch_error("FsyncState mutex poisoned"))?;

        loop {
            if self.durable_lsn() >= target_lsn {
                return Ok(());
            }
            if self.failed.load(Ordering::Acquire) {
                return Err(latch_error(format!(
                    "redo log fsync failed before LSN {} became durable",
                    target_lsn
                )));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RedoError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!(
                        "Timeout waiting for LSN {} to become durable (current: {})",
                        target_lsn,
                        self.durable_lsn()
                    ),
                )));
            }

            guard = self
                .condvar
                .wait_timeout(guard, remaining)
                .map_err(|_| latch_error("FsyncState condvar wait failed"))?
                .0;
        }
    }

    fn signal_durable(&self, lsn: u64) {
        self.durable_lsn.fetch_max(lsn, Ordering::AcqRel);
        // Taking the mutex orders this wake-up after any waiter's last check
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }

    fn update_written(&self, lsn: u64) {
        self.written_lsn.fetch_max(lsn, Ordering::AcqRel);
    }

    fn signal_failure(&self) {
        self.failed.store(true, Ordering::Release);
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }
}

struct ActiveFile {
    file: File,
    size: u64,
    header_len: u64,
    create_time: u64,
}

struct WriterShared {
    path: PathBuf,
    active: Mutex<Option<ActiveFile>>,
    fsync: FsyncState,
}

impl WriterShared {
    fn lock_active(&self) -> Result<MutexGuard<'_, Option<ActiveFile>>> {
        self.active
            .lock()
            .map_err(|_| RedoError::Internal("redo log writer lock poisoned".into()))
    }

    /// Fsync whatever has been written and release the latches waiting on it
    fn sync_pending(&self) -> Result<()> {
        let guard = self.lock_active()?;
        let written = self.fsync.written_lsn();
        if written <= self.fsync.durable_lsn() {
            return Ok(());
        }
        if let Some(active) = guard.as_ref() {
            if let Err(e) = active.file.sync_data() {
                log::error!("Redo log fsync failed for {}: {}", self.path.display(), e);
                self.fsync.signal_failure();
                return Err(e.into());
            }
        }
        drop(guard);
        self.fsync.signal_durable(written);
        Ok(())
    }
}

fn flusher_thread(shared: Arc<WriterShared>, interval: Duration, stop: mpsc::Receiver<()>) {
    loop {
        let stopping = match stop.recv_timeout(interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => true,
        };
        if let Err(e) = shared.sync_pending() {
            log::error!("Redo log flusher stopping after fsync failure: {}", e);
            break;
        }
        if stopping {
            log::debug!("Redo log flusher shutting down");
            break;
        }
    }
}

/// Create a fresh log file at `path` holding only its header
fn create_log_file(path: &Path, sequence: u64) -> Result<ActiveFile> {
    let create_time = now_millis();
    let header = encode_frame(&FileHeader::new(sequence, create_time))?;
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(&header)?;
    file.sync_all()?;
    // Reopen for append so every later write lands at the end
    let file = OpenOptions::new().append(true).open(path)?;
    Ok(ActiveFile {
        file,
        size: header.len() as u64,
        header_len: header.len() as u64,
        create_time,
    })
}

/// Writer for the local active log file
pub struct FileLogWriter {
    shared: Arc<WriterShared>,
    rollover_mgr: Arc<RolloverManager>,
    fsync_interval: Duration,
    next_lsn: AtomicU64,
    flusher: Mutex<Option<(mpsc::Sender<()>, JoinHandle<()>)>>,
}

impl FileLogWriter {
    pub fn new(path: PathBuf, rollover_mgr: Arc<RolloverManager>, fsync_interval_ms: u64) -> Self {
        Self {
            shared: Arc::new(WriterShared {
                path,
                active: Mutex::new(None),
                fsync: FsyncState::new(),
            }),
            rollover_mgr,
            fsync_interval: Duration::from_millis(fsync_interval_ms),
            next_lsn: AtomicU64::new(1),
            flusher: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    fn deferred_fsync(&self) -> bool {
        !self.fsync_interval.is_zero()
    }

    #[cfg(test)]
    fn fsync_state(&self) -> &FsyncState {
        &self.shared.fsync
    }

    fn start_flusher(&self) -> Result<()> {
        let mut flusher = self
            .flusher
            .lock()
            .map_err(|_| RedoError::Internal("redo log flusher lock poisoned".into()))?;
        if flusher.is_some() || !self.deferred_fsync() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let interval = self.fsync_interval;
        let handle = std::thread::Builder::new()
            .name("redolog-flusher".into())
            .spawn(move || flusher_thread(shared, interval, rx))?;
        *flusher = Some((tx, handle));
        Ok(())
    }

    fn stop_flusher(&self) {
        let stopped = match self.flusher.lock() {
            Ok(mut flusher) => flusher.take(),
            Err(_) => None,
        };
        if let Some((tx, handle)) = stopped {
            let _ = tx.send(());
            if handle.join().is_err() {
                log::error!("Redo log flusher thread panicked");
            }
        }
    }

    /// Open the existing active file, or create one if there is none yet
    fn open_active(&self) -> Result<ActiveFile> {
        let path = &self.shared.path;
        let existing_len = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        if existing_len == 0 {
            let seq = self.rollover_mgr.next_sequence_from_archive()?;
            self.rollover_mgr.init_sequence(seq);
            return create_log_file(path, seq);
        }

        let header = FileLogReader::open(path)?.header().clone();
        self.rollover_mgr.init_sequence(header.sequence);
        let header_len = encode_frame(&header)?.len() as u64;
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(ActiveFile {
            file,
            size: existing_len,
            header_len,
            create_time: header.create_time,
        })
    }

    fn with_active<T>(&self, f: impl FnOnce(&ActiveFile) -> T) -> Option<T> {
        match self.shared.active.lock() {
            Ok(guard) => guard.as_ref().map(f),
            Err(_) => None,
        }
    }
}

impl LogWriter for FileLogWriter {
    fn open(&self) -> Result<()> {
        if let Some(parent) = self.shared.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::create_dir_all(self.rollover_mgr.archive_dir())?;

        {
            let mut active = self.shared.lock_active()?;
            if active.is_none() {
                let opened = self.open_active()?;
                log::info!(
                    "Opened redo log {} (sequence {}, {} bytes)",
                    self.shared.path.display(),
                    self.rollover_mgr.current_sequence(),
                    opened.size
                );
                *active = Some(opened);
            }
        }
        self.start_flusher()
    }

    fn log(&self, _op: &RedoableOp, frame: &[u8], synchronous: bool) -> Result<()> {
        let lsn = {
            let mut guard = self.shared.lock_active()?;
            let active = guard
                .as_mut()
                .ok_or_else(|| RedoError::Internal("redo log is not open".into()))?;
            active.file.write_all(frame)?;
            active.size += frame.len() as u64;
            // Assigned under the file lock so LSN order is file order
            let lsn = self.next_lsn.fetch_add(1, Ordering::AcqRel);
            self.shared.fsync.update_written(lsn);
            lsn
        };

        if synchronous {
            if self.deferred_fsync() {
                self.shared.fsync.wait_for_durable(lsn, DURABLE_WAIT_TIMEOUT)?;
            } else {
                self.shared.sync_pending()?;
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.shared.sync_pending()
    }

    fn close(&self) -> Result<()> {
        self.stop_flusher();
        self.shared.sync_pending()?;
        let closed = self.shared.lock_active()?.take();
        if closed.is_some() {
            log::info!("Closed redo log {}", self.shared.path.display());
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.with_active(|a| a.size <= a.header_len).unwrap_or(true)
    }

    fn size(&self) -> u64 {
        self.with_active(|a| a.size).unwrap_or(0)
    }

    fn create_time(&self) -> u64 {
        self.with_active(|a| a.create_time).unwrap_or(0)
    }

    fn rollover(&self, active_ops: &ActiveOps) -> Result<Option<PathBuf>> {
        let mut guard = self.shared.lock_active()?;
        let old = guard
            .take()
            .ok_or_else(|| RedoError::Internal("redo log is not open".into()))?;

        old.file.sync_all()?;
        let written = self.shared.fsync.written_lsn();
        let old_seq = self.rollover_mgr.current_sequence();
        let archived = self.rollover_mgr.archive_path(old.create_time, old_seq);
        drop(old);
        fs::rename(&self.shared.path, &archived)?;

        let new_seq = self.rollover_mgr.increment_sequence();
        let mut fresh = create_log_file(&self.shared.path, new_seq)?;
        for op in active_ops.iter() {
            let frame = op.serialize()?;
            fresh.file.write_all(&frame)?;
            fresh.size += frame.len() as u64;
        }
        fresh.file.sync_data()?;
        *guard = Some(fresh);
        drop(guard);
        self.shared.fsync.signal_durable(written);

        log::info!(
            "Rolled over redo log: archived sequence {} to {}, carried {} active op(s) into sequence {}",
            old_seq,
            archived.display(),
            active_ops.len(),
            new_seq
        );
        Ok(Some(archived))
    }

    fn sequence(&self) -> u64 {
        self.rollover_mgr.current_sequence()
    }
}

impl Drop for FileLogWriter {
    fn drop(&mut self) {
        self.stop_flusher();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redolog::types::MailboxOperation;
    use std::thread;
    use tempfile::tempdir;

    fn op(counter: i32, mailbox: i32) -> RedoableOp {
        RedoableOp::new(
            TransactionId::new(100, counter),
            mailbox,
            MailboxOperation::CreateMessage,
            vec![counter as u8; 16],
        )
    }

    fn writer_in(dir: &Path, fsync_interval_ms: u64) -> FileLogWriter {
        let mgr = Arc::new(RolloverManager::new(dir.join("archive")));
        FileLogWriter::new(dir.join("redo.log"), mgr, fsync_interval_ms)
    }

    fn read_all(path: &Path) -> (FileHeader, Vec<RedoableOp>) {
        let mut reader = FileLogReader::open(path).unwrap();
        let header = reader.header().clone();
        let mut ops = Vec::new();
        while let Some(op) = reader.next_op().unwrap() {
            ops.push(op);
        }
        (header, ops)
    }

    #[test]
    fn test_fsync_state_initial_values() {
        let state = FsyncState::new();
        assert_eq!(state.durable_lsn(), 0);
        assert_eq!(state.written_lsn(), 0);
    }

    #[test]
    fn test_fsync_state_never_moves_backwards() {
        let state = FsyncState::new();
        state.signal_durable(10);
        state.signal_durable(5);
        assert_eq!(state.durable_lsn(), 10);
        state.update_written(7);
        state.update_written(3);
        assert_eq!(state.written_lsn(), 7);
    }

    #[test]
    fn test_fsync_state_wait_timeout() {
        let state = FsyncState::new();
        let start = Instant::now();
        let result = state.wait_for_durable(1, Duration::from_millis(50));
        assert!(result.is_err());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_fsync_state_wait_signaled() {
        let state = Arc::new(FsyncState::new());
        let waiter = {
            let state = Arc::clone(&state);
            thread::spawn(move || state.wait_for_durable(3, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        state.signal_durable(3);
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_fsync_state_failure_releases_waiters() {
        let state = Arc::new(FsyncState::new());
        let waiter = {
            let state = Arc::clone(&state);
            thread::spawn(move || state.wait_for_durable(3, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        state.signal_failure();
        assert!(waiter.join().unwrap().is_err());
    }

    #[test]
    fn test_active_ops_keep_start_order() {
        let mut active = ActiveOps::new();
        active.insert(op(3, 1));
        active.insert(op(1, 1));
        active.insert(op(2, 1));
        active.remove(&TransactionId::new(100, 1));
        assert_eq!(
            active.txn_ids(),
            vec![TransactionId::new(100, 3), TransactionId::new(100, 2)]
        );
        // re-inserting an active txn does not move it
        active.insert(op(3, 9));
        assert_eq!(active.txn_ids()[0], TransactionId::new(100, 3));
        assert_eq!(active.iter().next().unwrap().mailbox_id, 9);
        assert_eq!(active.len(), 2);
        assert!(active.remove(&TransactionId::new(100, 42)).is_none());
    }

    #[test]
    fn test_new_log_has_only_header() {
        let dir = tempdir().unwrap();
        let writer = writer_in(dir.path(), 0);
        writer.open().unwrap();
        assert!(writer.is_empty());
        assert_eq!(writer.sequence(), 0);
        assert!(writer.size() > 0);
        assert!(writer.create_time() > 0);
        writer.close().unwrap();

        let (header, ops) = read_all(&dir.path().join("redo.log"));
        assert_eq!(header.sequence, 0);
        assert!(ops.is_empty());
    }

    #[test]
    fn test_synchronous_mode_writes_are_durable() {
        let dir = tempdir().unwrap();
        let writer = writer_in(dir.path(), 0);
        writer.open().unwrap();
        for i in 1..=3 {
            let o = op(i, i);
            writer.log(&o, &o.serialize().unwrap(), true).unwrap();
        }
        assert_eq!(writer.fsync_state().durable_lsn(), 3);
        assert!(!writer.is_empty());

        let (_, ops) = read_all(writer.path());
        assert_eq!(ops.len(), 3);
    }

    #[test]
    fn test_deferred_mode_waits_for_flusher() {
        let dir = tempdir().unwrap();
        let writer = Arc::new(writer_in(dir.path(), 20));
        writer.open().unwrap();

        let handles: Vec<_> = (1..=8)
            .map(|i| {
                let writer = Arc::clone(&writer);
                thread::spawn(move || {
                    let o = op(i, i);
                    writer.log(&o, &o.serialize().unwrap(), true)
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }
        assert_eq!(writer.fsync_state().durable_lsn(), 8);

        // asynchronous writes become durable on flush
        let o = op(9, 9);
        writer.log(&o, &o.serialize().unwrap(), false).unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.fsync_state().durable_lsn(), 9);
        writer.close().unwrap();
    }

    #[test]
    fn test_reopen_keeps_sequence_and_records() {
        let dir = tempdir().unwrap();
        {
            let writer = writer_in(dir.path(), 0);
            writer.open().unwrap();
            writer.rollover(&ActiveOps::new()).unwrap();
            let o = op(1, 5);
            writer.log(&o, &o.serialize().unwrap(), true).unwrap();
            writer.close().unwrap();
        }

        let writer = writer_in(dir.path(), 0);
        writer.open().unwrap();
        assert_eq!(writer.sequence(), 1);
        assert!(!writer.is_empty());
        let o = op(2, 6);
        writer.log(&o, &o.serialize().unwrap(), true).unwrap();
        writer.close().unwrap();

        let (_, ops) = read_all(&dir.path().join("redo.log"));
        let mailboxes: Vec<i32> = ops.iter().map(|o| o.mailbox_id).collect();
        assert_eq!(mailboxes, vec![5, 6]);
    }

    #[test]
    fn test_rollover_archives_and_carries_active_ops() {
        let dir = tempdir().unwrap();
        let writer = writer_in(dir.path(), 0);
        writer.open().unwrap();

        let committed = op(1, 10);
        let pending = op(2, 20);
        for o in [&committed, &pending] {
            writer.log(o, &o.serialize().unwrap(), false).unwrap();
        }
        let commit = RedoableOp::commit_of(&committed);
        writer.log(&commit, &commit.serialize().unwrap(), false).unwrap();

        let mut active = ActiveOps::new();
        active.insert(pending.clone());
        let archived = writer.rollover(&active).unwrap().unwrap();

        assert_eq!(
            RolloverManager::parse_sequence(archived.file_name().unwrap().to_str().unwrap()),
            Some(0)
        );
        assert_eq!(writer.sequence(), 1);

        let (old_header, old_ops) = read_all(&archived);
        assert_eq!(old_header.sequence, 0);
        assert_eq!(old_ops.len(), 3);

        let (new_header, new_ops) = read_all(writer.path());
        assert_eq!(new_header.sequence, 1);
        assert_eq!(new_ops, vec![pending]);
        assert!(!writer.is_empty());
    }

    #[test]
    fn test_new_log_continues_archive_sequence() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("archive");
        fs::create_dir_all(&archive).unwrap();
        fs::write(archive.join(RolloverManager::archive_file_name(1, 4)), b"").unwrap();

        let writer = writer_in(dir.path(), 0);
        writer.open().unwrap();
        assert_eq!(writer.sequence(), 5);
    }

    #[test]
    fn test_log_after_close_fails() {
        let dir = tempdir().unwrap();
        let writer = writer_in(dir.path(), 10);
        writer.open().unwrap();
        writer.close().unwrap();
        let o = op(1, 1);
        assert!(writer.log(&o, &o.serialize().unwrap(), false).is_err());
    }
}
