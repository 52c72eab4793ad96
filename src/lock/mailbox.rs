//! Mailbox locks: per-thread read/write locking of an account
//!
//! The [`LockManager`] is created once per worker. Every worker thread gets
//! its own holder identity (`<worker>:<thread id>`), so holds are reentrant
//! per thread and exclusive between threads and workers.
//!
//! A thread holding read locks that asks for the write lock is upgraded: its
//! read holds are released, the write lock is acquired, and the read holds
//! are taken back (ahead of other waiters) once the write lock is fully
//! released. A thread holding the write lock may take read holds directly.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crate::error::{RedoError, Result};
use crate::store::SharedStore;
use super::channel::{LockChannel, LockTimingContext};
use super::config::LockConfig;
use super::distributed::{DistributedLock, LockMode, ReleaseOutcome};
use super::scripts::{self, HeldLock, ShutdownReleaseScript};

/// What one holder has on one account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct HoldState {
    reads: u32,
    writes: u32,
    /// Read holds given up in the store while upgraded to write
    suspended_reads: u32,
}

impl HoldState {
    fn remote_reads(&self) -> u32 {
        self.reads - self.suspended_reads
    }

    fn is_empty(&self) -> bool {
        self.reads == 0 && self.writes == 0
    }
}

type HoldKey = (String, String);

pub struct LockManager {
    store: Arc<dyn SharedStore>,
    config: LockConfig,
    worker_name: String,
    channels: Vec<Arc<LockChannel>>,
    holds: Mutex<HashMap<HoldKey, HoldState>>,
    /// Accounts this worker has locked, for the shutdown release
    touched: Mutex<HashSet<String>>,
}

impl LockManager {
    pub fn new(
        store: Arc<dyn SharedStore>,
        config: LockConfig,
        worker_name: &str,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if worker_name.is_empty() || worker_name.contains('|') {
            return Err(RedoError::Config(format!(
                "invalid worker name '{}'",
                worker_name
            )));
        }
        let channels = (0..config.num_channels)
            .map(|bucket| {
                Arc::new(LockChannel::new(
                    store.clone(),
                    bucket,
                    worker_name,
                    config.max_waiting_threads,
                ))
            })
            .collect();
        Ok(Arc::new(Self {
            store,
            config,
            worker_name: worker_name.to_string(),
            channels,
            holds: Mutex::new(HashMap::new()),
            touched: Mutex::new(HashSet::new()),
        }))
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn mailbox_lock(self: &Arc<Self>, account_id: &str) -> MailboxLock {
        MailboxLock {
            manager: self.clone(),
            account_id: account_id.to_string(),
        }
    }

    /// Holder identity of the calling thread
    pub fn current_holder(&self) -> String {
        format!("{}:{:?}", self.worker_name, thread::current().id())
    }

    fn bucket(&self, account_id: &str) -> u32 {
        scripts::bucket_for(account_id, self.config.num_channels)
    }

    fn channel(&self, bucket: u32) -> Result<&Arc<LockChannel>> {
        self.channels
            .get(bucket as usize)
            .ok_or_else(|| RedoError::Internal(format!("no lock channel for bucket {}", bucket)))
    }

    fn holds(&self) -> Result<MutexGuard<'_, HashMap<HoldKey, HoldState>>> {
        self.holds
            .lock()
            .map_err(|_| RedoError::Internal("lock hold table poisoned".into()))
    }

    fn hold_state(&self, key: &HoldKey) -> Result<HoldState> {
        Ok(self.holds()?.get(key).copied().unwrap_or_default())
    }

    fn update_hold(&self, key: &HoldKey, f: impl FnOnce(&mut HoldState)) -> Result<()> {
        let mut holds = self.holds()?;
        let state = holds.entry(key.clone()).or_default();
        f(state);
        if state.is_empty() {
            holds.remove(key);
        }
        Ok(())
    }

    fn new_lock(&self, account_id: &str, mode: LockMode, holder: &str) -> DistributedLock {
        let lease_ms = match mode {
            LockMode::Read => self.config.read_lease_ms,
            LockMode::Write => self.config.write_lease_ms,
        };
        DistributedLock::new(
            self.store.clone(),
            account_id,
            mode,
            self.bucket(account_id),
            holder,
            &self.worker_name,
            lease_ms,
        )
    }

    /// Acquire one hold, waiting on the bucket's channel if refused
    fn acquire(
        &self,
        account_id: &str,
        mode: LockMode,
        holder: &str,
        skip_queue: bool,
    ) -> Result<DistributedLock> {
        let lock = self.new_lock(account_id, mode, holder);
        let channel = self.channel(self.bucket(account_id))?;
        let mut timing = LockTimingContext::new(self.config.timeout());
        let request = channel.add(&lock, skip_queue)?;
        channel.wait_for_unlock(&request, &lock, &mut timing)?;

        if let Ok(mut touched) = self.touched.lock() {
            touched.insert(account_id.to_string());
        }
        log::debug!(
            "{} acquired {} lock on {} ({})",
            holder,
            mode,
            account_id,
            timing
        );
        Ok(lock)
    }

    fn lock(self: &Arc<Self>, account_id: &str, mode: LockMode) -> Result<MailboxLockGuard> {
        let holder = self.current_holder();
        let key = (account_id.to_string(), holder.clone());
        let state = self.hold_state(&key)?;

        let lock = match mode {
            LockMode::Read => {
                // Reentrant or downgrade: granted without waiting behind others
                let skip_queue = state.writes > 0 || state.remote_reads() > 0;
                let lock = self.acquire(account_id, mode, &holder, skip_queue)?;
                self.update_hold(&key, |s| s.reads += 1)?;
                lock
            }
            LockMode::Write if state.writes == 0 && state.remote_reads() > 0 => {
                self.upgrade(&key, state.remote_reads())?
            }
            LockMode::Write => {
                let lock = self.acquire(account_id, mode, &holder, state.writes > 0)?;
                self.update_hold(&key, |s| s.writes += 1)?;
                lock
            }
        };

        Ok(MailboxLockGuard {
            manager: self.clone(),
            account_id: account_id.to_string(),
            holder,
            lock,
            released: false,
        })
    }

    fn upgrade(&self, key: &HoldKey, reads: u32) -> Result<DistributedLock> {
        let (account_id, holder) = (key.0.as_str(), key.1.as_str());
        log::debug!("{} upgrading {} read holds on {} to write", holder, reads, account_id);
        let mut released = 0;
        for _ in 0..reads {
            match self.new_lock(account_id, LockMode::Read, holder).unlock() {
                // Lease already lapsed: nothing left to give up
                Ok(_) | Err(RedoError::LockState(_)) => released += 1,
                Err(e) => {
                    self.update_hold(key, |s| s.suspended_reads += released)?;
                    return Err(e);
                }
            }
        }
        self.update_hold(key, |s| s.suspended_reads += reads)?;

        match self.acquire(account_id, LockMode::Write, holder, false) {
            Ok(lock) => {
                self.update_hold(key, |s| s.writes += 1)?;
                Ok(lock)
            }
            Err(e) => {
                self.restore_reads(key)?;
                Err(e)
            }
        }
    }

    /// Take suspended read holds back in the store, one at a time. Holds that
    /// could not be restored stay suspended, so releasing them is local only.
    fn restore_reads(&self, key: &HoldKey) -> Result<()> {
        let (account_id, holder) = (key.0.as_str(), key.1.as_str());
        let suspended = self.hold_state(key)?.suspended_reads;
        if suspended == 0 {
            return Ok(());
        }
        log::debug!("{} restoring {} read holds on {}", holder, suspended, account_id);
        for restored in 0..suspended {
            if let Err(e) = self.acquire(account_id, LockMode::Read, holder, true) {
                log::warn!(
                    "{} restored {} of {} read holds on {}: {}",
                    holder,
                    restored,
                    suspended,
                    account_id,
                    e
                );
                return Err(e);
            }
            self.update_hold(key, |s| s.suspended_reads -= 1)?;
        }
        Ok(())
    }

    fn release(&self, account_id: &str, holder: &str, lock: &DistributedLock) -> Result<()> {
        let key = (account_id.to_string(), holder.to_string());
        let state = self.hold_state(&key)?;
        match lock.mode() {
            LockMode::Write => {
                if state.writes == 0 {
                    return Err(RedoError::LockState(format!(
                        "{} releasing write lock on {} it does not hold",
                        holder, account_id
                    )));
                }
                // The hold is gone locally whatever the store says
                let unlocked = lock.unlock();
                self.update_hold(&key, |s| s.writes -= 1)?;
                let restored = if state.writes == 1 {
                    self.restore_reads(&key)
                } else {
                    Ok(())
                };
                let outcome = unlocked?;
                log::trace!("{} released write hold on {}: {:?}", holder, account_id, outcome);
                restored?;
            }
            LockMode::Read => {
                if state.reads == 0 {
                    return Err(RedoError::LockState(format!(
                        "{} releasing read lock on {} it does not hold",
                        holder, account_id
                    )));
                }
                if state.remote_reads() > 0 {
                    let unlocked = lock.unlock();
                    self.update_hold(&key, |s| s.reads -= 1)?;
                    match unlocked {
                        Ok(ReleaseOutcome::Unlocked) => {
                            log::trace!("{} freed {}", holder, account_id)
                        }
                        Ok(_) => {}
                        Err(RedoError::LockState(msg)) => {
                            log::debug!("read hold already gone from the store: {}", msg)
                        }
                        Err(e) => return Err(e),
                    }
                } else {
                    // Suspended by an upgrade: nothing held in the store
                    self.update_hold(&key, |s| {
                        s.reads -= 1;
                        s.suspended_reads -= 1;
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Holds of the calling thread on `account_id` in `mode`
    pub fn hold_count(&self, account_id: &str, mode: LockMode) -> u32 {
        let key = (account_id.to_string(), self.current_holder());
        match self.hold_state(&key) {
            Ok(state) => match mode {
                LockMode::Read => state.reads,
                LockMode::Write => state.writes,
            },
            Err(_) => 0,
        }
    }

    /// Drop every hold this worker has in the store and tell other workers.
    /// Returns the number of holder entries removed.
    pub fn release_all_on_shutdown(&self) -> Result<usize> {
        let accounts: Vec<String> = match self.touched.lock() {
            Ok(mut touched) => touched.drain().collect(),
            Err(_) => return Err(RedoError::Internal("lock account set poisoned".into())),
        };
        let mut by_bucket: BTreeMap<u32, Vec<HeldLock>> = BTreeMap::new();
        for account_id in &accounts {
            let bucket = self.bucket(account_id);
            by_bucket.entry(bucket).or_default().push(HeldLock {
                lock_key: scripts::lock_key(bucket, account_id),
                channel: scripts::channel_key(bucket),
            });
        }

        let mut removed = 0;
        for locks in by_bucket.values() {
            let script = ShutdownReleaseScript {
                worker_name: &self.worker_name,
                locks,
            };
            let reply = self.store.execute(&script)?;
            removed += reply.as_int().unwrap_or(0).max(0) as usize;
        }
        self.holds()?.clear();
        log::info!(
            "Released {} lock holds of {} across {} accounts",
            removed,
            self.worker_name,
            accounts.len()
        );
        Ok(removed)
    }
}

/// Handle on one account's lock
#[derive(Clone)]
pub struct MailboxLock {
    manager: Arc<LockManager>,
    account_id: String,
}

impl MailboxLock {
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Acquire in `mode`, waiting up to the configured timeout
    pub fn lock(&self, mode: LockMode) -> Result<MailboxLockGuard> {
        self.manager.lock(&self.account_id, mode)
    }

    pub fn hold_count(&self, mode: LockMode) -> u32 {
        self.manager.hold_count(&self.account_id, mode)
    }
}

/// One hold; released on drop
pub struct MailboxLockGuard {
    manager: Arc<LockManager>,
    account_id: String,
    holder: String,
    lock: DistributedLock,
    released: bool,
}

impl MailboxLockGuard {
    pub fn mode(&self) -> LockMode {
        self.lock.mode()
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Release now, reporting errors instead of logging them
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.manager.release(&self.account_id, &self.holder, &self.lock)
    }
}

impl Drop for MailboxLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            log::error!(
                "Failed to release {} lock on {}: {}",
                self.lock.mode(),
                self.account_id,
                e
            );
        }
    }
}
