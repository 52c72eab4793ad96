//! Shared keyed store used by every worker in the cluster
//!
//! The redo log's distributed transaction-id counter and the distributed
//! mailbox locks both live in one shared store. Correctness relies on the
//! store running a script atomically: while an [`AtomicScript`] executes, no
//! other command touches the keyspace. Client-side locking is never used for
//! state transitions.
//!
//! The store also carries publish/subscribe channels (unlock notifications)
//! and append-only streams (records forwarded by non-authoritative redo log
//! writers).

pub mod memory;

pub use memory::MemoryStore;

use std::sync::Arc;

use crate::error::{RedoError, Result};

/// Reply of an atomic script, shaped like the replies of a Redis server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptReply {
    Nil,
    Int(i64),
    Bulk(String),
    Array(Vec<ScriptReply>),
}

impl ScriptReply {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ScriptReply::Int(v) => Some(*v),
            ScriptReply::Bulk(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptReply::Bulk(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, ScriptReply::Nil)
    }

    /// Consume an array reply
    pub fn into_array(self, script: &str) -> Result<Vec<ScriptReply>> {
        match self {
            ScriptReply::Array(items) => Ok(items),
            other => Err(RedoError::unexpected_reply(script, other)),
        }
    }
}

/// Keyspace operations available to a script while it runs atomically.
///
/// Semantics follow Redis: missing keys read as absent, a hash with no
/// fields left is deleted, `pttl` is -2 for a missing key and -1 for a key
/// without expiry, and `set` clears any expiry on the key.
pub trait Keyspace {
    fn get(&mut self, key: &str) -> Result<Option<String>>;
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
    fn del(&mut self, key: &str) -> bool;
    fn incr(&mut self, key: &str) -> Result<i64>;
    fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>>;
    fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<()>;
    fn hincrby(&mut self, key: &str, field: &str, delta: i64) -> Result<i64>;
    fn hdel(&mut self, key: &str, field: &str) -> Result<bool>;
    fn hlen(&mut self, key: &str) -> Result<usize>;
    fn hkeys(&mut self, key: &str) -> Result<Vec<String>>;
    fn hexists(&mut self, key: &str, field: &str) -> Result<bool>;
    fn pttl(&mut self, key: &str) -> i64;
    fn pexpire(&mut self, key: &str, millis: i64) -> bool;
    /// Server clock, whole seconds since the Unix epoch
    fn time_secs(&mut self) -> i64;
    /// Queue a message; delivered once the script has finished
    fn publish(&mut self, channel: &str, message: &str);
}

/// A parameterized state transition executed server-side in one step.
pub trait AtomicScript: Send + Sync {
    /// Short name used in diagnostics
    fn name(&self) -> &'static str;

    fn run(&self, ks: &mut dyn Keyspace) -> Result<ScriptReply>;
}

/// Receives messages published on a subscribed channel
pub trait MessageListener: Send + Sync {
    fn on_message(&self, channel: &str, message: &str);
}

/// Handle to the cluster's shared store.
///
/// Owned by process startup and passed explicitly to the redo log manager and
/// the lock manager.
pub trait SharedStore: Send + Sync {
    /// Run `script` atomically
    fn execute(&self, script: &dyn AtomicScript) -> Result<ScriptReply>;

    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn del(&self, key: &str) -> Result<bool>;

    fn pexpire(&self, key: &str, millis: i64) -> Result<bool>;

    /// Publish a message; returns the number of listeners it reached
    fn publish(&self, channel: &str, message: &str) -> Result<usize>;

    fn subscribe(&self, channel: &str, listener: Arc<dyn MessageListener>) -> Result<()>;

    /// Append an entry to a stream; returns the stream length afterwards
    fn append(&self, stream: &str, entry: &[u8]) -> Result<u64>;
}
