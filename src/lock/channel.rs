//! Wait channel: parks threads whose lock attempt was refused and wakes
//! them when an unlock message arrives on the bucket's pub/sub channel.
//!
//! One channel serves every account hashed onto its bucket and keeps one
//! [`LockQueue`] per account. Subscription happens on first use.
//!
//! Messages on the channel:
//!
//! - `<account>|<lock uuid>` after a normal unlock
//! - `SHUTDOWN|<lock key>|<worker>` after a worker dropped its holds on exit

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{RedoError, Result};
use crate::store::{MessageListener, SharedStore};
use super::distributed::{DistributedLock, LockResponse};
use super::queue::{LockQueue, QueuedLockRequest};
use super::scripts::{self, SHUTDOWN_PREFIX};

/// Attempts and deadline of one `lock()` call
#[derive(Debug, Clone)]
pub struct LockTimingContext {
    pub attempts: u32,
    start: Instant,
    deadline: Instant,
}

impl LockTimingContext {
    pub fn new(timeout: Duration) -> Self {
        let start = Instant::now();
        Self {
            attempts: 0,
            start,
            deadline: start + timeout,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

impl fmt::Display for LockTimingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} attempts in {}ms",
            self.attempts,
            self.elapsed().as_millis()
        )
    }
}

pub struct LockChannel {
    name: String,
    worker_name: String,
    store: Arc<dyn SharedStore>,
    max_waiting: usize,
    queues: Mutex<HashMap<String, Arc<LockQueue>>>,
    subscribed: Mutex<bool>,
}

impl LockChannel {
    pub fn new(
        store: Arc<dyn SharedStore>,
        bucket: u32,
        worker_name: &str,
        max_waiting: usize,
    ) -> Self {
        Self {
            name: scripts::channel_key(bucket),
            worker_name: worker_name.to_string(),
            store,
            max_waiting,
            queues: Mutex::new(HashMap::new()),
            subscribed: Mutex::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn queues(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<LockQueue>>>> {
        self.queues
            .lock()
            .map_err(|_| RedoError::Internal("lock channel mutex poisoned".into()))
    }

    fn ensure_subscribed(self: &Arc<Self>) -> Result<()> {
        let mut subscribed = self
            .subscribed
            .lock()
            .map_err(|_| RedoError::Internal("lock channel mutex poisoned".into()))?;
        if !*subscribed {
            let listener: Arc<dyn MessageListener> = self.clone();
            self.store.subscribe(&self.name, listener)?;
            *subscribed = true;
            log::debug!("Subscribed to lock channel {}", self.name);
        }
        Ok(())
    }

    /// Queue a waiter for `lock`.
    ///
    /// With `skip_queue` the request goes to the front and may try the lock
    /// at once, regardless of queue depth. Otherwise a full queue rejects
    /// the request without changing anything.
    pub fn add(
        self: &Arc<Self>,
        lock: &DistributedLock,
        skip_queue: bool,
    ) -> Result<Arc<QueuedLockRequest>> {
        self.ensure_subscribed()?;
        let request = Arc::new(QueuedLockRequest::new(lock));
        let mut queues = self.queues()?;
        let queue = queues
            .entry(lock.account_id().to_string())
            .or_insert_with(|| Arc::new(LockQueue::new()));

        if skip_queue {
            request.set_try_acquire_now(true);
            queue.add_to_front(request.clone())?;
        } else {
            if queue.len() >= self.max_waiting {
                log::warn!(
                    "Too many waiting locks for {} ({} queued)",
                    lock.account_id(),
                    queue.len()
                );
                return Err(RedoError::lock_failed("too many waiting locks"));
            }
            let try_now = queue.add(request.clone())?;
            request.set_try_acquire_now(try_now);
        }
        Ok(request)
    }

    /// Take a request out of its queue; a no-op if it already left
    pub fn remove(&self, request: &Arc<QueuedLockRequest>) -> Result<()> {
        let mut queues = self.queues()?;
        if let Some(queue) = queues.get(request.account_id()) {
            queue.remove(request)?;
            if queue.is_empty() {
                queues.remove(request.account_id());
            }
        }
        Ok(())
    }

    pub fn waiting(&self, account_id: &str) -> usize {
        self.queues()
            .ok()
            .and_then(|q| q.get(account_id).map(|queue| queue.len()))
            .unwrap_or(0)
    }

    /// Retry `lock` until it is granted or the deadline in `timing` passes.
    ///
    /// Between attempts the thread parks until notified, or at most for the
    /// holder's remaining lease so a lost notification costs one lease. The
    /// request leaves the queue whatever the outcome.
    pub fn wait_for_unlock(
        &self,
        request: &Arc<QueuedLockRequest>,
        lock: &DistributedLock,
        timing: &mut LockTimingContext,
    ) -> Result<LockResponse> {
        let result = self.acquire_loop(request, lock, timing);
        if let Err(e) = self.remove(request) {
            log::warn!("Failed to dequeue lock request {}: {}", request.uuid(), e);
        }
        result
    }

    fn acquire_loop(
        &self,
        request: &QueuedLockRequest,
        lock: &DistributedLock,
        timing: &mut LockTimingContext,
    ) -> Result<LockResponse> {
        let mut try_now = request.try_acquire_now();
        let mut last = LockResponse::default();
        loop {
            if try_now {
                timing.attempts += 1;
                last = lock.try_acquire()?;
                if last.acquired {
                    return Ok(last);
                }
            }

            let remaining = timing.remaining();
            if remaining.is_zero() {
                return Err(RedoError::LockTimeout(format!(
                    "timed out waiting for {} lock on {} after {}; held by {:?}",
                    lock.mode(),
                    lock.account_id(),
                    timing,
                    last.holders
                )));
            }

            let lease = if last.ttl_ms > 0 { last.ttl_ms } else { lock.lease_ms() };
            let wait = remaining.min(Duration::from_millis(lease.max(1) as u64));
            if !request.wait_notified(wait)? {
                log::debug!(
                    "No unlock notification for {} after {}ms, retrying",
                    lock.account_id(),
                    wait.as_millis()
                );
            }
            try_now = true;
        }
    }

    fn notify(&self, account_id: &str) {
        let queue = match self.queues() {
            Ok(queues) => queues.get(account_id).cloned(),
            Err(e) => {
                log::error!("Cannot notify waiters on {}: {}", account_id, e);
                return;
            }
        };
        if let Some(queue) = queue {
            match queue.notify_waiting_locks() {
                Ok(woken) => {
                    if log::log_enabled!(log::Level::Trace) {
                        log::trace!("Woke {} waiting on {}", woken.join(", "), account_id);
                    }
                }
                Err(e) => log::error!("Cannot notify waiters on {}: {}", account_id, e),
            }
        }
    }
}

impl MessageListener for LockChannel {
    fn on_message(&self, channel: &str, message: &str) {
        let parts: Vec<&str> = message.split('|').collect();
        match parts.as_slice() {
            [SHUTDOWN_PREFIX, lock_name, pod] => {
                if *pod == self.worker_name {
                    log::debug!("Ignoring own shutdown release of {}", lock_name);
                    return;
                }
                match scripts::account_from_lock_key(lock_name) {
                    Some(account_id) => {
                        log::debug!("{} released {} on shutdown", pod, lock_name);
                        self.notify(account_id);
                    }
                    None => log::warn!("Malformed shutdown message on {}: {}", channel, message),
                }
            }
            [account_id, uuid] if !account_id.is_empty() && !uuid.is_empty() => {
                log::trace!("Unlock of {} by {} on {}", account_id, uuid, channel);
                self.notify(account_id);
            }
            _ => log::warn!("Ignoring unrecognized message on {}: {}", channel, message),
        }
    }
}
