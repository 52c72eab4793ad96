//! One attempt on an account's read/write lock

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RedoError, Result};
use crate::store::{AtomicScript, ScriptReply, SharedStore};
use super::scripts::{
    self, ReadAcquireScript, ReadReleaseScript, WriteAcquireScript, WriteReleaseScript,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Read,
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Read => write!(f, "read"),
            LockMode::Write => write!(f, "write"),
        }
    }
}

/// Outcome of an acquire attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockResponse {
    pub acquired: bool,
    /// Worker that last held the write lock (granted attempts only)
    pub last_writer: Option<String>,
    /// Remaining lease of the lock in milliseconds (refused attempts only)
    pub ttl_ms: i64,
    /// Uuids of the current holds (refused attempts only)
    pub holders: Vec<String>,
}

impl LockResponse {
    fn from_reply(script: &str, reply: ScriptReply) -> Result<Self> {
        let items = reply.into_array(script)?;
        match items.first().and_then(ScriptReply::as_int) {
            Some(1) => Ok(LockResponse {
                acquired: true,
                last_writer: items.get(1).and_then(|r| r.as_str()).map(str::to_string),
                ..Default::default()
            }),
            Some(0) => Ok(LockResponse {
                acquired: false,
                last_writer: None,
                ttl_ms: items.get(1).and_then(ScriptReply::as_int).unwrap_or(-2),
                holders: items
                    .iter()
                    .skip(2)
                    .filter_map(|r| r.as_str().map(str::to_string))
                    .collect(),
            }),
            _ => Err(RedoError::unexpected_reply(script, items)),
        }
    }
}

/// Result of releasing one hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Reentrant holds of the same holder remain
    StillHeld,
    /// This holder is gone but other holds keep the lock
    Released,
    /// The lock was deleted and the unlock message published
    Unlocked,
}

/// A single request for an account's lock in one mode.
///
/// Each instance carries a fresh uuid identifying this hold in the store.
/// `holder` is the identity reentrancy is tracked by; the mailbox lock uses
/// one identity per worker thread.
pub struct DistributedLock {
    store: Arc<dyn SharedStore>,
    account_id: String,
    mode: LockMode,
    lock_key: String,
    channel: String,
    holder: String,
    worker_name: String,
    uuid: String,
    lease_ms: i64,
}

impl DistributedLock {
    pub fn new(
        store: Arc<dyn SharedStore>,
        account_id: &str,
        mode: LockMode,
        bucket: u32,
        holder: &str,
        worker_name: &str,
        lease_ms: i64,
    ) -> Self {
        Self {
            store,
            account_id: account_id.to_string(),
            mode,
            lock_key: scripts::lock_key(bucket, account_id),
            channel: scripts::channel_key(bucket),
            holder: holder.to_string(),
            worker_name: worker_name.to_string(),
            uuid: Uuid::new_v4().to_string(),
            lease_ms,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn is_write(&self) -> bool {
        self.mode == LockMode::Write
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn lease_ms(&self) -> i64 {
        self.lease_ms
    }

    /// Published when this hold frees the lock
    pub fn unlock_message(&self) -> String {
        format!("{}|{}", self.account_id, self.uuid)
    }

    /// One atomic attempt; never waits
    pub fn try_acquire(&self) -> Result<LockResponse> {
        let (name, reply) = match self.mode {
            LockMode::Write => {
                let script = WriteAcquireScript {
                    lock_key: &self.lock_key,
                    holder: &self.holder,
                    lease_ms: self.lease_ms,
                    worker_name: &self.worker_name,
                    uuid: &self.uuid,
                };
                (script.name(), self.store.execute(&script)?)
            }
            LockMode::Read => {
                let script = ReadAcquireScript {
                    lock_key: &self.lock_key,
                    holder: &self.holder,
                    lease_ms: self.lease_ms,
                    uuid: &self.uuid,
                };
                (script.name(), self.store.execute(&script)?)
            }
        };
        let response = LockResponse::from_reply(name, reply)?;
        if response.acquired {
            log::trace!(
                "Acquired {} lock {} for {} (last writer {:?})",
                self.mode,
                self.uuid,
                self.account_id,
                response.last_writer
            );
        } else {
            log::trace!(
                "{} lock on {} busy for {}ms, held by {:?}",
                self.mode,
                self.account_id,
                response.ttl_ms,
                response.holders
            );
        }
        Ok(response)
    }

    /// Release one hold of this holder in this mode
    pub fn unlock(&self) -> Result<ReleaseOutcome> {
        let message = self.unlock_message();
        let (name, reply) = match self.mode {
            LockMode::Write => {
                let script = WriteReleaseScript {
                    lock_key: &self.lock_key,
                    channel: &self.channel,
                    holder: &self.holder,
                    lease_ms: self.lease_ms,
                    unlock_message: &message,
                };
                (script.name(), self.store.execute(&script)?)
            }
            LockMode::Read => {
                let script = ReadReleaseScript {
                    lock_key: &self.lock_key,
                    channel: &self.channel,
                    holder: &self.holder,
                    lease_ms: self.lease_ms,
                    unlock_message: &message,
                };
                (script.name(), self.store.execute(&script)?)
            }
        };
        match reply {
            ScriptReply::Nil => Err(RedoError::LockState(format!(
                "{} releasing {} lock on {} it does not hold",
                self.holder, self.mode, self.account_id
            ))),
            ScriptReply::Int(scripts::RELEASE_STILL_HELD) => Ok(ReleaseOutcome::StillHeld),
            ScriptReply::Int(scripts::RELEASE_RELEASED) => Ok(ReleaseOutcome::Released),
            ScriptReply::Int(scripts::RELEASE_UNLOCKED) => {
                log::trace!("Unlocked {} ({})", self.account_id, message);
                Ok(ReleaseOutcome::Unlocked)
            }
            other => Err(RedoError::unexpected_reply(name, other)),
        }
    }
}

impl fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedLock")
            .field("account_id", &self.account_id)
            .field("mode", &self.mode)
            .field("holder", &self.holder)
            .field("uuid", &self.uuid)
            .finish()
    }
}
