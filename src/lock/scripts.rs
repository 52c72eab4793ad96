//! Lock state transitions, each run atomically by the shared store
//!
//! Layout of one account's lock:
//!
//! - `{LOCK-<bucket>}-<account>-LOCK` is a hash. Field `mode` is `read` or
//!   `write`; every other field is a holder identity mapped to its reentrant
//!   hold count. Write holders are stored as `<holder>:write`.
//! - `<hash>:<holder>:uuid:<n>` (write) and `<hash>:<holder>:rwlock_timeout:<n>`
//!   (read) hold the uuid of the n-th hold, each with the lease as TTL.
//! - `<hash>:last_writer` names the worker that last took the write lock.
//! - `<hash>:reads_since_last_write` counts read grants since then.

use crate::error::Result;
use crate::store::{AtomicScript, Keyspace, ScriptReply};

pub const MODE_FIELD: &str = "mode";
pub const MODE_READ: &str = "read";
pub const MODE_WRITE: &str = "write";

/// Prefix of a shutdown notification on a lock channel
pub const SHUTDOWN_PREFIX: &str = "SHUTDOWN";

const LOCK_SUFFIX: &str = "-LOCK";

/// Deterministic bucket for an account (FNV-1a)
pub fn bucket_for(account_id: &str, num_channels: u32) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in account_id.as_bytes() {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash % num_channels.max(1)
}

pub fn lock_key(bucket: u32, account_id: &str) -> String {
    format!("{{LOCK-{}}}-{}{}", bucket, account_id, LOCK_SUFFIX)
}

pub fn channel_key(bucket: u32) -> String {
    format!("{{LOCK-{}}}-CHANNEL", bucket)
}

/// Account id embedded in a lock key, e.g. `acct1` in `{LOCK-7}-acct1-LOCK`
pub fn account_from_lock_key(lock_key: &str) -> Option<&str> {
    let trimmed = lock_key.strip_suffix(LOCK_SUFFIX)?;
    let (_, account) = trimmed.split_once("}-")?;
    if account.is_empty() {
        None
    } else {
        Some(account)
    }
}

pub fn write_field(holder: &str) -> String {
    format!("{}:{}", holder, MODE_WRITE)
}

fn last_writer_key(lock_key: &str) -> String {
    format!("{}:last_writer", lock_key)
}

fn reads_since_write_key(lock_key: &str) -> String {
    format!("{}:reads_since_last_write", lock_key)
}

/// Key holding the uuid of a hold; `field` is the hash field of the holder
fn hold_key(lock_key: &str, field: &str, write: bool, n: i64) -> String {
    let kind = if write { "uuid" } else { "rwlock_timeout" };
    format!("{}:{}:{}:{}", lock_key, field, kind, n)
}

fn set_with_lease(ks: &mut dyn Keyspace, key: &str, value: &str, lease_ms: i64) -> Result<()> {
    ks.set(key, value)?;
    ks.pexpire(key, lease_ms);
    Ok(())
}

/// Reply of a successful acquire: `[1, last_writer]`
fn granted(last_writer: Option<String>) -> ScriptReply {
    ScriptReply::Array(vec![
        ScriptReply::Int(1),
        last_writer.map_or(ScriptReply::Nil, ScriptReply::Bulk),
    ])
}

/// Reply of a refused acquire: `[0, pttl, uuid...]`.
///
/// Lists the uuid of every current hold, newest first per holder. A hold
/// whose uuid key already expired is reported as `<key>:nil`.
fn contention(ks: &mut dyn Keyspace, lock_key: &str) -> Result<ScriptReply> {
    let write = ks.hget(lock_key, MODE_FIELD)?.as_deref() == Some(MODE_WRITE);
    let mut reply = vec![ScriptReply::Int(0), ScriptReply::Int(ks.pttl(lock_key))];
    for field in ks.hkeys(lock_key)? {
        let count = match ks.hget(lock_key, &field)?.and_then(|v| v.parse::<i64>().ok()) {
            Some(count) => count,
            None => continue,
        };
        for n in (1..=count).rev() {
            let key = hold_key(lock_key, &field, write, n);
            match ks.get(&key)? {
                Some(uuid) => reply.push(ScriptReply::Bulk(uuid)),
                None => reply.push(ScriptReply::Bulk(format!("{}:nil", key))),
            }
        }
    }
    Ok(ScriptReply::Array(reply))
}

/// Take or re-enter the write lock.
///
/// Granted when the lock is free, or when `holder` already holds it for
/// writing; a reentrant grant adds the lease to the remaining TTL.
pub struct WriteAcquireScript<'a> {
    pub lock_key: &'a str,
    pub holder: &'a str,
    pub lease_ms: i64,
    /// Recorded as the last writer
    pub worker_name: &'a str,
    pub uuid: &'a str,
}

impl AtomicScript for WriteAcquireScript<'_> {
    fn name(&self) -> &'static str {
        "lock-write-acquire"
    }

    fn run(&self, ks: &mut dyn Keyspace) -> Result<ScriptReply> {
        let key = self.lock_key;
        let field = write_field(self.holder);
        let last_writer = ks.get(&last_writer_key(key))?;

        let count = match ks.hget(key, MODE_FIELD)?.as_deref() {
            None => {
                ks.hset(key, MODE_FIELD, MODE_WRITE)?;
                ks.hset(key, &field, "1")?;
                ks.pexpire(key, self.lease_ms);
                1
            }
            Some(MODE_WRITE) if ks.hexists(key, &field)? => {
                let count = ks.hincrby(key, &field, 1)?;
                let remaining = ks.pttl(key).max(0);
                ks.pexpire(key, remaining + self.lease_ms);
                count
            }
            Some(_) => return contention(ks, key),
        };

        ks.set(&last_writer_key(key), self.worker_name)?;
        ks.del(&reads_since_write_key(key));
        set_with_lease(ks, &hold_key(key, &field, true, count), self.uuid, self.lease_ms)?;
        Ok(granted(last_writer))
    }
}

/// Take or re-enter a read hold.
///
/// Granted when the lock is free or in read mode, and also while the same
/// holder has the write lock (a downgrade: the read hold outlives the
/// write hold and the mode flips back to read on the write release).
pub struct ReadAcquireScript<'a> {
    pub lock_key: &'a str,
    pub holder: &'a str,
    pub lease_ms: i64,
    pub uuid: &'a str,
}

impl AtomicScript for ReadAcquireScript<'_> {
    fn name(&self) -> &'static str {
        "lock-read-acquire"
    }

    fn run(&self, ks: &mut dyn Keyspace) -> Result<ScriptReply> {
        let key = self.lock_key;
        match ks.hget(key, MODE_FIELD)?.as_deref() {
            None => ks.hset(key, MODE_FIELD, MODE_READ)?,
            Some(MODE_READ) => {}
            Some(MODE_WRITE) if ks.hexists(key, &write_field(self.holder))? => {}
            Some(_) => return contention(ks, key),
        }

        let count = ks.hincrby(key, self.holder, 1)?;
        if ks.pttl(key) < self.lease_ms {
            ks.pexpire(key, self.lease_ms);
        }
        set_with_lease(ks, &hold_key(key, self.holder, false, count), self.uuid, self.lease_ms)?;
        ks.incr(&reads_since_write_key(key))?;
        Ok(granted(ks.get(&last_writer_key(key))?))
    }
}

/// Reply codes of the release scripts
pub const RELEASE_STILL_HELD: i64 = 0;
pub const RELEASE_RELEASED: i64 = 1;
pub const RELEASE_UNLOCKED: i64 = 2;

/// Drop the hash, or flip it back to read mode when read holds remain
fn finish_release(
    ks: &mut dyn Keyspace,
    lock_key: &str,
    channel: &str,
    unlock_message: &str,
) -> Result<ScriptReply> {
    if ks.hlen(lock_key)? <= 1 {
        ks.del(lock_key);
        ks.publish(channel, unlock_message);
        return Ok(ScriptReply::Int(RELEASE_UNLOCKED));
    }
    let writers_left = ks
        .hkeys(lock_key)?
        .iter()
        .any(|f| f.ends_with(&format!(":{}", MODE_WRITE)));
    if !writers_left {
        ks.hset(lock_key, MODE_FIELD, MODE_READ)?;
    }
    Ok(ScriptReply::Int(RELEASE_RELEASED))
}

/// Release one write hold.
///
/// Replies [`RELEASE_STILL_HELD`] while reentrant holds remain,
/// [`RELEASE_RELEASED`] when the holder left but read holds keep the lock,
/// [`RELEASE_UNLOCKED`] when the lock is gone (the unlock message is
/// published), and nil when `holder` does not hold the write lock.
pub struct WriteReleaseScript<'a> {
    pub lock_key: &'a str,
    pub channel: &'a str,
    pub holder: &'a str,
    pub lease_ms: i64,
    pub unlock_message: &'a str,
}

impl AtomicScript for WriteReleaseScript<'_> {
    fn name(&self) -> &'static str {
        "lock-write-release"
    }

    fn run(&self, ks: &mut dyn Keyspace) -> Result<ScriptReply> {
        let key = self.lock_key;
        let field = write_field(self.holder);
        match ks.hget(key, MODE_FIELD)?.as_deref() {
            None => {
                // Lease already ran out; waiters may still be parked on it
                ks.publish(self.channel, self.unlock_message);
                Ok(ScriptReply::Int(RELEASE_UNLOCKED))
            }
            Some(MODE_WRITE) if ks.hexists(key, &field)? => {
                let count = ks.hincrby(key, &field, -1)?;
                ks.del(&hold_key(key, &field, true, count + 1));
                if count > 0 {
                    ks.pexpire(key, self.lease_ms);
                    return Ok(ScriptReply::Int(RELEASE_STILL_HELD));
                }
                ks.hdel(key, &field)?;
                finish_release(ks, key, self.channel, self.unlock_message)
            }
            Some(_) => Ok(ScriptReply::Nil),
        }
    }
}

/// Release one read hold; replies like [`WriteReleaseScript`]
pub struct ReadReleaseScript<'a> {
    pub lock_key: &'a str,
    pub channel: &'a str,
    pub holder: &'a str,
    pub lease_ms: i64,
    pub unlock_message: &'a str,
}

impl AtomicScript for ReadReleaseScript<'_> {
    fn name(&self) -> &'static str {
        "lock-read-release"
    }

    fn run(&self, ks: &mut dyn Keyspace) -> Result<ScriptReply> {
        let key = self.lock_key;
        if ks.hget(key, MODE_FIELD)?.is_none() {
            ks.publish(self.channel, self.unlock_message);
            return Ok(ScriptReply::Int(RELEASE_UNLOCKED));
        }
        if !ks.hexists(key, self.holder)? {
            return Ok(ScriptReply::Nil);
        }
        let count = ks.hincrby(key, self.holder, -1)?;
        ks.del(&hold_key(key, self.holder, false, count + 1));
        if count > 0 {
            if ks.pttl(key) < self.lease_ms {
                ks.pexpire(key, self.lease_ms);
            }
            return Ok(ScriptReply::Int(RELEASE_STILL_HELD));
        }
        ks.hdel(key, self.holder)?;
        finish_release(ks, key, self.channel, self.unlock_message)
    }
}

/// One lock a worker still holds at shutdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLock {
    pub lock_key: String,
    pub channel: String,
}

/// Remove every hold of one worker from the given locks.
///
/// Holder fields belonging to the worker start with `<worker>:`. A lock left
/// without holders is deleted and `SHUTDOWN|<lock key>|<worker>` published on
/// its channel. Replies with the number of holder fields removed.
pub struct ShutdownReleaseScript<'a> {
    pub worker_name: &'a str,
    pub locks: &'a [HeldLock],
}

impl AtomicScript for ShutdownReleaseScript<'_> {
    fn name(&self) -> &'static str {
        "lock-shutdown-release"
    }

    fn run(&self, ks: &mut dyn Keyspace) -> Result<ScriptReply> {
        let prefix = format!("{}:", self.worker_name);
        let mut removed = 0;
        for lock in self.locks {
            let key = lock.lock_key.as_str();
            if ks.hget(key, MODE_FIELD)?.is_none() {
                continue;
            }
            let mut touched = false;
            for field in ks.hkeys(key)? {
                if !field.starts_with(&prefix) {
                    continue;
                }
                let write = field.ends_with(&format!(":{}", MODE_WRITE));
                let count = ks
                    .hget(key, &field)?
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(0);
                for n in 1..=count {
                    ks.del(&hold_key(key, &field, write, n));
                }
                ks.hdel(key, &field)?;
                removed += 1;
                touched = true;
            }
            if touched {
                let message = format!("{}|{}|{}", SHUTDOWN_PREFIX, key, self.worker_name);
                finish_release(ks, key, &lock.channel, &message)?;
            }
        }
        Ok(ScriptReply::Int(removed))
    }
}
