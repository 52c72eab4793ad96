//! Redo Log Manager
//!
//! Owns the one active redo log, the set of in-flight transactions, and the
//! rollover of the active log into the archive.
//!
//! ## Locking
//!
//! A read/write lock gates appends against rollover:
//! - `log()` holds the read lock while it updates the active-ops map and
//!   writes the record, so a rollover can never land between the two.
//! - `rollover()` and `acquire_exclusive_lock()` hold the write lock, which
//!   quiesces every logger.
//! - The active-ops mutex is only ever taken while the read or write lock is
//!   already held. Always read/write lock first, then the map.
//!
//! The lock is not reentrant: a thread holding the exclusive lock must not
//! call `log()`.
//!
//! ## Failure
//!
//! A failed append or rollover means the log can no longer vouch for what it
//! holds, so those errors go to the [`FatalErrorHandler`], which by default
//! halts the process.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::error::{RedoError, Result};
use crate::store::SharedStore;
use super::config::{RedoConfig, WriterRole};
use super::distributed::DistributedLogWriter;
use super::op::{now_millis, RedoableOp};
use super::reader::FileLogReader;
use super::recovery::{RecoveryScan, RedoHandler};
use super::rollover::{RolloverLimits, RolloverManager};
use super::txn_id::{create_generator, TxnIdGenerator};
use super::types::{CommitId, MailboxId, TransactionId};
use super::writer::{ActiveOps, FileLogWriter, LogWriter};

/// Backing store whose durability the redo log stands in for.
/// Flushed before every checkpoint.
pub trait DurabilityStore: Send + Sync {
    fn flush_to_disk(&self) -> Result<()>;
}

/// Durability hook for deployments with nothing to flush
pub struct NoopDurability;

impl DurabilityStore for NoopDurability {
    fn flush_to_disk(&self) -> Result<()> {
        Ok(())
    }
}

/// Receives errors after which the redo log can no longer be trusted
pub trait FatalErrorHandler: Send + Sync {
    fn on_fatal(&self, context: &str, error: &RedoError);
}

/// Default handler: log and halt the process
pub struct HaltOnFatal;

impl FatalErrorHandler for HaltOnFatal {
    fn on_fatal(&self, context: &str, error: &RedoError) {
        log::error!("Fatal redo log error while {}: {}; aborting process", context, error);
        std::process::exit(1);
    }
}

/// Holds the log quiesced: no thread is logging or rolling over until dropped
pub struct ExclusiveLock<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

struct RolloverWorker {
    requests: mpsc::SyncSender<()>,
    handle: JoinHandle<()>,
}

fn rollover_worker_thread(manager: Weak<RedoLogManager>, requests: mpsc::Receiver<()>) {
    while requests.recv().is_ok() {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        if let Err(e) = manager.rollover(false, false) {
            log::error!("Background redo log rollover failed: {}", e);
        }
    }
    log::debug!("Redo log rollover worker shutting down");
}

/// The Redo Log Manager
pub struct RedoLogManager {
    config: RedoConfig,
    limits: RolloverLimits,
    txn_ids: Arc<dyn TxnIdGenerator>,
    writer: Arc<dyn LogWriter>,
    rollover_mgr: Arc<RolloverManager>,
    durability: Arc<dyn DurabilityStore>,
    fatal: Arc<dyn FatalErrorHandler>,
    rw_lock: RwLock<()>,
    active_ops: Mutex<ActiveOps>,
    /// Active log size right after the last open/rollover
    initial_size: AtomicU64,
    enabled: AtomicBool,
    /// Replaying the log; `log()` is a no-op
    recovery_mode: AtomicBool,
    in_crash_recovery: AtomicBool,
    shutting_down: AtomicBool,
    closed: AtomicBool,
    logged_count: AtomicU64,
    logged_micros: AtomicU64,
    rollover_worker: Mutex<Option<RolloverWorker>>,
}

impl RedoLogManager {
    /// Create a manager with an explicit transaction id generator.
    ///
    /// `store` is required only when this node forwards its records
    /// (`WriterRole::Forwarding`).
    pub fn new(
        config: RedoConfig,
        txn_ids: Arc<dyn TxnIdGenerator>,
        store: Option<Arc<dyn SharedStore>>,
        durability: Arc<dyn DurabilityStore>,
    ) -> Result<Self> {
        config.validate()?;
        let rollover_mgr = Arc::new(RolloverManager::new(config.archive_dir.clone()));
        let writer: Arc<dyn LogWriter> = match config.writer_role {
            WriterRole::Authoritative => Arc::new(FileLogWriter::new(
                config.log_path.clone(),
                Arc::clone(&rollover_mgr),
                config.fsync_interval_ms,
            )),
            WriterRole::Forwarding => {
                let store = store.ok_or_else(|| {
                    RedoError::Config("a forwarding redo log writer needs a shared store".into())
                })?;
                Arc::new(DistributedLogWriter::new(store))
            }
        };

        Ok(Self {
            limits: RolloverLimits::from_config(&config),
            config,
            txn_ids,
            writer,
            rollover_mgr,
            durability,
            fatal: Arc::new(HaltOnFatal),
            rw_lock: RwLock::new(()),
            active_ops: Mutex::new(ActiveOps::new()),
            initial_size: AtomicU64::new(0),
            enabled: AtomicBool::new(false),
            recovery_mode: AtomicBool::new(false),
            in_crash_recovery: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            logged_count: AtomicU64::new(0),
            logged_micros: AtomicU64::new(0),
            rollover_worker: Mutex::new(None),
        })
    }

    /// Create a manager whose generator is chosen by `config.txn_id_generator`
    pub fn from_config(
        config: RedoConfig,
        store: Option<Arc<dyn SharedStore>>,
        durability: Arc<dyn DurabilityStore>,
    ) -> Result<Self> {
        let txn_ids = create_generator(config.txn_id_generator, store.clone())?;
        Self::new(config, txn_ids, store, durability)
    }

    /// Replace the fatal error handler
    pub fn with_fatal_handler(mut self, handler: Arc<dyn FatalErrorHandler>) -> Self {
        self.fatal = handler;
        self
    }

    pub fn config(&self) -> &RedoConfig {
        &self.config
    }

    pub fn log_path(&self) -> &Path {
        &self.config.log_path
    }

    pub fn archive_dir(&self) -> &Path {
        &self.config.archive_dir
    }

    fn is_authoritative(&self) -> bool {
        self.config.writer_role == WriterRole::Authoritative
    }

    fn read_lock(&self) -> Result<RwLockReadGuard<'_, ()>> {
        self.rw_lock
            .read()
            .map_err(|_| RedoError::Internal("redo log lock poisoned".into()))
    }

    fn write_lock(&self) -> Result<RwLockWriteGuard<'_, ()>> {
        self.rw_lock
            .write()
            .map_err(|_| RedoError::Internal("redo log lock poisoned".into()))
    }

    fn lock_active_ops(&self) -> Result<MutexGuard<'_, ActiveOps>> {
        self.active_ops
            .lock()
            .map_err(|_| RedoError::Internal("active ops lock poisoned".into()))
    }

    fn signal_fatal(&self, context: &str, error: &RedoError) {
        log::error!("Redo log failure while {}: {}", context, error);
        self.fatal.on_fatal(context, error);
    }

    /// Set from the start of `stop()` until the next `start()`
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Open the log and start the background rollover worker
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if !self.config.enabled {
            log::info!("Redo logging is disabled");
            return Ok(());
        }
        if let Err(e) = self.writer.open() {
            self.signal_fatal("opening the redo log", &e);
            return Err(e);
        }
        self.initial_size.store(self.writer.size(), Ordering::Release);
        self.closed.store(false, Ordering::Release);
        self.shutting_down.store(false, Ordering::Release);
        self.enabled.store(true, Ordering::Release);

        if self.is_authoritative() {
            let mut worker = self
                .rollover_worker
                .lock()
                .map_err(|_| RedoError::Internal("rollover worker lock poisoned".into()))?;
            if worker.is_none() {
                // Capacity 1: requests made while one is pending coalesce
                let (tx, rx) = mpsc::sync_channel(1);
                let manager = Arc::downgrade(self);
                let handle = std::thread::Builder::new()
                    .name("redolog-rollover".into())
                    .spawn(move || rollover_worker_thread(manager, rx))?;
                *worker = Some(RolloverWorker { requests: tx, handle });
            }
        }

        log::info!(
            "Redo log started: {} (sequence {}, {} bytes)",
            self.config.log_path.display(),
            self.current_log_sequence(),
            self.writer.size()
        );
        Ok(())
    }

    /// Start the log, replaying any transactions a crash left unfinished.
    ///
    /// Uncommitted, unaborted operations in the active log go through
    /// `handler` in the order they started; a failed replay is logged and
    /// skipped. The crashed log is then rolled over without a checkpoint.
    /// Returns the number of operations replayed successfully.
    pub fn start_with_recovery(self: &Arc<Self>, handler: &dyn RedoHandler) -> Result<usize> {
        let scan = if self.config.enabled
            && self.config.supports_crash_recovery
            && self.is_authoritative()
        {
            Some(RecoveryScan::scan(&self.config.log_path)?)
        } else {
            None
        };

        self.start()?;

        let Some(scan) = scan else {
            return Ok(0);
        };
        if scan.uncommitted.is_empty() {
            return Ok(0);
        }

        self.in_crash_recovery.store(true, Ordering::Release);
        self.recovery_mode.store(true, Ordering::Release);
        log::info!(
            "Redo log crash recovery: replaying {} uncommitted operation(s)",
            scan.uncommitted.len()
        );

        let mut replayed = 0;
        for op in &scan.uncommitted {
            match handler.redo(op) {
                Ok(()) => replayed += 1,
                Err(e) => log::warn!("Redo of {} failed during crash recovery: {}", op, e),
            }
        }

        self.recovery_mode.store(false, Ordering::Release);
        let result = self.rollover(true, true);
        self.in_crash_recovery.store(false, Ordering::Release);
        result?;

        log::info!(
            "Redo log crash recovery finished: {} of {} operation(s) replayed",
            replayed,
            scan.uncommitted.len()
        );
        Ok(replayed)
    }

    /// Roll over what is left, flush, close, and report logging statistics
    pub fn stop(&self) {
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }
        self.shutting_down.store(true, Ordering::Release);

        let worker = match self.rollover_worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(_) => None,
        };
        if let Some(RolloverWorker { requests, handle }) = worker {
            drop(requests);
            if handle.join().is_err() {
                log::error!("Redo log rollover worker panicked");
            }
        }

        if self.is_authoritative() {
            if let Err(e) = self.force_rollover() {
                log::error!("Error rolling over redo log on shutdown: {}", e);
            }
        }

        match self.write_lock() {
            Ok(_guard) => {
                let closed = self.writer.flush().and_then(|()| self.writer.close());
                if let Err(e) = closed {
                    log::error!("Error closing redo log {}: {}", self.config.log_path.display(), e);
                }
                self.closed.store(true, Ordering::Release);
            }
            Err(e) => log::error!("Error closing redo log: {}", e),
        }
        self.enabled.store(false, Ordering::Release);

        let count = self.logged_count.load(Ordering::Acquire);
        let micros = self.logged_micros.load(Ordering::Acquire);
        let rate = if count > 0 {
            (micros as f64 / 1000.0 / count as f64 * 1000.0).round() / 1000.0
        } else {
            0.0
        };
        log::info!("Logged: {} items, {}ms/item", count, rate);
    }

    pub fn new_txn_id(&self) -> Result<TransactionId> {
        self.txn_ids.next_id()
    }

    /// Log `op`, then ask for a rollover if the active log has outgrown its limits.
    ///
    /// A no-op while disabled or replaying. `synchronous` returns only once
    /// the record is durable. The payload buffer is released after the write.
    pub fn log(&self, op: &mut RedoableOp, synchronous: bool) -> Result<()> {
        if !self.enabled.load(Ordering::Acquire) || self.recovery_mode.load(Ordering::Acquire) {
            return Ok(());
        }

        self.log_only(op, synchronous)?;
        op.release();

        if self.is_authoritative() && self.is_rollover_needed(false) {
            log::debug!("Redo log rollover is needed");
            self.request_rollover();
        }
        Ok(())
    }

    /// Log the COMMIT record for `op`; the fsync is left to the flusher
    pub fn commit(&self, op: &RedoableOp) -> Result<()> {
        if !self.enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut commit = RedoableOp::commit_of(op);
        self.log(&mut commit, false)
    }

    /// Log the ABORT record for `op` and wait until it is durable, so crash
    /// recovery can never replay an aborted transaction
    pub fn abort(&self, op: &RedoableOp) -> Result<()> {
        if !self.enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut abort = RedoableOp::abort_of(op);
        self.log(&mut abort, true)
    }

    pub fn flush(&self) -> Result<()> {
        if !self.enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        self.writer.flush()
    }

    /// Append only: no rollover check
    fn log_only(&self, op: &RedoableOp, synchronous: bool) -> Result<()> {
        let _guard = self.read_lock()?;
        if self.closed.load(Ordering::Acquire) {
            if self.is_shutting_down() {
                log::debug!("Redo log closed for shutdown; dropping {}", op);
            } else {
                log::warn!("Redo log closed; dropping {}", op);
            }
            return Err(RedoError::ShuttingDown);
        }

        let start = Instant::now();
        let frame = match op.serialize() {
            Ok(frame) => frame,
            Err(e) => {
                self.signal_fatal("serializing a redo record", &e);
                return Err(e);
            }
        };

        {
            let mut active = self.lock_active_ops()?;
            if op.is_start_marker() {
                active.insert(op.clone());
            }
            if op.is_end_marker() {
                active.remove(&op.txn_id);
            }
        }
        if let Err(e) = self.writer.log(op, &frame, synchronous) {
            self.signal_fatal("writing the redo log", &e);
            return Err(e);
        }

        self.logged_micros
            .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
        self.logged_count.fetch_add(1, Ordering::Relaxed);
        log::trace!("Logged {}", op);
        Ok(())
    }

    fn request_rollover(&self) {
        let worker = match self.rollover_worker.lock() {
            Ok(worker) => worker,
            Err(_) => return,
        };
        if let Some(worker) = worker.as_ref() {
            match worker.requests.try_send(()) {
                Ok(()) | Err(mpsc::TrySendError::Full(())) => {}
                Err(mpsc::TrySendError::Disconnected(())) if self.is_shutting_down() => {
                    log::debug!("Rollover requested during shutdown; left to stop()");
                }
                Err(mpsc::TrySendError::Disconnected(())) => {
                    log::warn!("Redo log rollover worker is gone; rollover request dropped");
                }
            }
        }
    }

    /// Whether the active log should roll over now.
    /// `immediate` asks whether there is anything to roll over at all.
    pub fn is_rollover_needed(&self, immediate: bool) -> bool {
        self.limits.is_needed(
            immediate,
            self.writer.is_empty(),
            self.writer.size(),
            self.initial_size.load(Ordering::Acquire),
            self.writer.create_time(),
            now_millis(),
        )
    }

    /// Write a checkpoint of the active transactions.
    /// Caller holds the write lock.
    fn checkpoint_locked(&self) -> Result<()> {
        let active = self.lock_active_ops()?.txn_ids();
        if active.is_empty() {
            return Ok(());
        }
        let count = active.len();
        let ckpt = RedoableOp::checkpoint(self.new_txn_id()?, active);
        let frame = ckpt.serialize()?;
        self.writer.log(&ckpt, &frame, true)?;
        log::debug!("Checkpoint logged with {} active transaction(s)", count);
        Ok(())
    }

    /// Roll the active log over if warranted.
    ///
    /// `force` rolls over any non-empty log; otherwise the size/age limits
    /// decide. Returns the archived file, or `None` if nothing rolled over.
    pub fn rollover(&self, force: bool, skip_checkpoint: bool) -> Result<Option<PathBuf>> {
        if !self.enabled.load(Ordering::Acquire) {
            return Ok(None);
        }

        let _guard = self.write_lock()?;
        if self.closed.load(Ordering::Acquire) || !self.is_rollover_needed(force) {
            return Ok(None);
        }

        log::debug!("Redo log rollover started");
        let start = Instant::now();
        let result = self.rollover_locked(skip_checkpoint);
        match &result {
            Ok(_) => log::info!("Redo log rollover took {}ms", start.elapsed().as_millis()),
            Err(e) => self.signal_fatal("rolling over the redo log", e),
        }
        result
    }

    fn rollover_locked(&self, skip_checkpoint: bool) -> Result<Option<PathBuf>> {
        self.durability.flush_to_disk()?;
        if !skip_checkpoint {
            self.checkpoint_locked()?;
        }
        let active = self.lock_active_ops()?;
        let archived = self.writer.rollover(&active)?;
        self.initial_size.store(self.writer.size(), Ordering::Release);
        Ok(archived)
    }

    /// Roll over any non-empty log, with a checkpoint
    pub fn force_rollover(&self) -> Result<Option<PathBuf>> {
        self.rollover(true, false)
    }

    pub fn current_log_sequence(&self) -> u64 {
        self.rollover_mgr.current_sequence()
    }

    pub fn rollover_manager(&self) -> &RolloverManager {
        &self.rollover_mgr
    }

    pub fn archived_logs(&self) -> Result<Vec<PathBuf>> {
        self.rollover_mgr.archive_logs()
    }

    pub fn archived_logs_from_sequence(&self, seq: u64) -> Result<Vec<PathBuf>> {
        self.rollover_mgr.archive_logs_from(seq)
    }

    /// Quiesce the log until the returned guard is dropped
    pub fn acquire_exclusive_lock(&self) -> Result<ExclusiveLock<'_>> {
        Ok(ExclusiveLock {
            _guard: self.write_lock()?,
        })
    }

    /// Transactions started but not yet committed or aborted, in start order
    pub fn active_txn_ids(&self) -> Result<Vec<TransactionId>> {
        let _guard = self.read_lock()?;
        Ok(self.lock_active_ops()?.txn_ids())
    }

    pub fn in_crash_recovery(&self) -> bool {
        self.in_crash_recovery.load(Ordering::Acquire)
    }

    /// Mailboxes with committed changes after `cid`, plus the CommitId of the
    /// last commit seen.
    ///
    /// The logs from `cid`'s sequence onward are hard-linked into a scratch
    /// directory under the read lock, so rollover can continue while they are
    /// scanned. Fails with an invalid-commit-id error if the first log does
    /// not carry `cid`'s sequence or the commit record is never found.
    pub fn changed_mailboxes_since(&self, cid: &CommitId) -> Result<(HashSet<MailboxId>, CommitId)> {
        let scratch = tempfile::Builder::new()
            .prefix("tmp-scan-")
            .tempdir_in(self.config.log_dir())?;

        let linked = {
            let _guard = self.read_lock()?;
            let mut logs = self.rollover_mgr.archive_logs_from(cid.redo_seq)?;
            if self.config.log_path.exists() {
                logs.push(self.config.log_path.clone());
            }

            let first = logs.first().ok_or_else(|| RedoError::invalid_commit_id(cid))?;
            if FileLogReader::open(first)?.header().sequence != cid.redo_seq {
                return Err(RedoError::invalid_commit_id(cid));
            }

            let mut linked = Vec::with_capacity(logs.len());
            for (i, src) in logs.iter().enumerate() {
                let name = src
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("redo.log");
                // Index prefix keeps the scan order independent of file names
                let dest = scratch.path().join(format!("{:06}-{}", i, name));
                fs::hard_link(src, &dest)?;
                linked.push(dest);
            }
            linked
        };

        let mut mailboxes = HashSet::new();
        let mut last = *cid;
        let mut found_marker = false;
        for (i, path) in linked.iter().enumerate() {
            let mut reader = match FileLogReader::open(path) {
                Ok(reader) => reader,
                Err(e) if i > 0 => {
                    log::warn!("Skipping unreadable redo log {}: {}", path.display(), e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let seq = reader.header().sequence;
            loop {
                let op = match reader.next_op() {
                    Ok(Some(op)) => op,
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("Error while reading redo log {}: {}", path.display(), e);
                        break;
                    }
                };
                if log::log_enabled!(log::Level::Debug) {
                    log::debug!("Read: {}", op);
                }
                if !op.is_commit() {
                    continue;
                }
                if found_marker {
                    if op.mailbox_id > 0 {
                        mailboxes.insert(op.mailbox_id);
                    }
                    last = CommitId::new(seq, op.txn_id);
                } else if cid.matches(&op) {
                    found_marker = true;
                    last = CommitId::new(seq, op.txn_id);
                }
            }
        }

        if let Err(e) = scratch.close() {
            log::warn!("Unable to delete redo log scan directory: {}", e);
        }
        if !found_marker {
            return Err(RedoError::invalid_commit_id(cid));
        }
        Ok((mailboxes, last))
    }
}

#[cfg(test)]
mod tests;
