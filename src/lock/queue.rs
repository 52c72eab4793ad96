//! Per-account FIFO of threads waiting for a lock

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{RedoError, Result};
use super::distributed::DistributedLock;

/// A waiting thread's place in a [`LockQueue`].
///
/// Each request has its own mutex and condvar. A notification is sticky: if
/// the unlock arrives before the waiter parks, the next wait returns at once.
pub struct QueuedLockRequest {
    account_id: String,
    uuid: String,
    write: bool,
    try_acquire_now: AtomicBool,
    notified: Mutex<bool>,
    wakeup: Condvar,
}

impl QueuedLockRequest {
    pub fn new(lock: &DistributedLock) -> Self {
        Self {
            account_id: lock.account_id().to_string(),
            uuid: lock.uuid().to_string(),
            write: lock.is_write(),
            try_acquire_now: AtomicBool::new(false),
            notified: Mutex::new(false),
            wakeup: Condvar::new(),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn is_write_lock(&self) -> bool {
        self.write
    }

    /// Whether the request may attempt the lock without waiting first
    pub fn try_acquire_now(&self) -> bool {
        self.try_acquire_now.load(Ordering::Acquire)
    }

    pub fn set_try_acquire_now(&self, value: bool) {
        self.try_acquire_now.store(value, Ordering::Release);
    }

    pub fn notify_unlock(&self) {
        if let Ok(mut notified) = self.notified.lock() {
            *notified = true;
            self.wakeup.notify_all();
        }
    }

    /// Park until notified or `timeout` passes; consumes the notification.
    /// Returns true if notified.
    pub fn wait_notified(&self, timeout: Duration) -> Result<bool> {
        let guard = self
            .notified
            .lock()
            .map_err(|_| RedoError::Internal("lock request mutex poisoned".into()))?;
        let (mut notified, _) = self
            .wakeup
            .wait_timeout_while(guard, timeout, |n| !*n)
            .map_err(|_| RedoError::Internal("lock request mutex poisoned".into()))?;
        let was_notified = *notified;
        *notified = false;
        Ok(was_notified)
    }
}

#[derive(Default)]
struct QueueState {
    requests: VecDeque<Arc<QueuedLockRequest>>,
    num_writers: usize,
}

/// FIFO of waiters on one account, with a count of queued writers
#[derive(Default)]
pub struct LockQueue {
    state: Mutex<QueueState>,
}

impl LockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| RedoError::Internal("lock queue mutex poisoned".into()))
    }

    /// Append a request.
    ///
    /// Returns whether it may try the lock immediately: always if the queue
    /// was empty, never for a writer behind others, and for a reader only
    /// while no writer is queued.
    pub fn add(&self, request: Arc<QueuedLockRequest>) -> Result<bool> {
        let mut state = self.state()?;
        let was_empty = state.requests.is_empty();
        let write = request.is_write_lock();
        if write {
            state.num_writers += 1;
        }
        state.requests.push_back(request);
        Ok(if was_empty {
            true
        } else if write {
            false
        } else {
            state.num_writers == 0
        })
    }

    /// Put a request ahead of everyone already waiting
    pub fn add_to_front(&self, request: Arc<QueuedLockRequest>) -> Result<()> {
        let mut state = self.state()?;
        if request.is_write_lock() {
            state.num_writers += 1;
        }
        state.requests.push_front(request);
        Ok(())
    }

    /// Remove a request; false if it was not queued
    pub fn remove(&self, request: &Arc<QueuedLockRequest>) -> Result<bool> {
        let mut state = self.state()?;
        let pos = state.requests.iter().position(|r| Arc::ptr_eq(r, request));
        match pos {
            Some(pos) => {
                state.requests.remove(pos);
                if request.is_write_lock() {
                    state.num_writers -= 1;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Wake the head writer alone, or every reader up to the first writer.
    /// Returns the uuids of the woken requests.
    pub fn notify_waiting_locks(&self) -> Result<Vec<String>> {
        let state = self.state()?;
        let mut woken = Vec::new();
        match state.requests.front() {
            Some(head) if head.is_write_lock() => {
                head.notify_unlock();
                woken.push(head.uuid().to_string());
            }
            _ => {
                for request in state.requests.iter().take_while(|r| !r.is_write_lock()) {
                    request.notify_unlock();
                    woken.push(request.uuid().to_string());
                }
            }
        }
        Ok(woken)
    }

    pub fn len(&self) -> usize {
        self.state().map(|s| s.requests.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_writers(&self) -> usize {
        self.state().map(|s| s.num_writers).unwrap_or(0)
    }
}
