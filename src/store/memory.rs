//! In-process shared store
//!
//! Single-mutex keyspace: a script holds the mutex for its whole run, which
//! gives the same atomicity a Redis server gives a Lua script. Published
//! messages are buffered while the script runs and handed to subscribers
//! after the mutex is released, so listeners may call back into the store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::{RedoError, Result};
use super::{AtomicScript, Keyspace, MessageListener, ScriptReply, SharedStore};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(BTreeMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self { value, expires_at: None }
    }
}

#[derive(Default)]
struct MemoryKeyspace {
    entries: HashMap<String, Entry>,
    /// Messages published by the running script, delivered after it ends
    outbox: Vec<(String, String)>,
}

fn wrong_type(key: &str) -> RedoError {
    RedoError::Store(format!(
        "WRONGTYPE operation against key '{}' holding the wrong kind of value",
        key
    ))
}

impl MemoryKeyspace {
    /// Look up a live entry, dropping it first if its lease ran out
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = match self.entries.get(key) {
            Some(entry) => matches!(entry.expires_at, Some(at) if at <= Instant::now()),
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get_mut(key)
    }

    fn hash_mut(&mut self, key: &str) -> Result<Option<&mut BTreeMap<String, String>>> {
        match self.live(key) {
            Some(Entry { value: Value::Hash(h), .. }) => Ok(Some(h)),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    fn hash_or_create(&mut self, key: &str) -> Result<&mut BTreeMap<String, String>> {
        if self.live(key).is_none() {
            self.entries
                .insert(key.to_string(), Entry::new(Value::Hash(BTreeMap::new())));
        }
        match self.entries.get_mut(key) {
            Some(Entry { value: Value::Hash(h), .. }) => Ok(h),
            _ => Err(wrong_type(key)),
        }
    }
}

impl Keyspace for MemoryKeyspace {
    fn get(&mut self, key: &str) -> Result<Option<String>> {
        match self.live(key) {
            Some(Entry { value: Value::Str(s), .. }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.entries
            .insert(key.to_string(), Entry::new(Value::Str(value.to_string())));
        Ok(())
    }

    fn del(&mut self, key: &str) -> bool {
        self.live(key).is_some() && self.entries.remove(key).is_some()
    }

    fn incr(&mut self, key: &str) -> Result<i64> {
        let current = match self.live(key) {
            Some(Entry { value: Value::Str(s), .. }) => s
                .parse::<i64>()
                .map_err(|_| RedoError::Store(format!("value at '{}' is not an integer", key)))?,
            Some(_) => return Err(wrong_type(key)),
            None => 0,
        };
        let next = current
            .checked_add(1)
            .ok_or_else(|| RedoError::Store(format!("increment would overflow '{}'", key)))?;
        match self.live(key) {
            Some(entry) => entry.value = Value::Str(next.to_string()),
            None => {
                self.entries
                    .insert(key.to_string(), Entry::new(Value::Str(next.to_string())));
            }
        }
        Ok(next)
    }

    fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.hash_mut(key)?.and_then(|h| h.get(field).cloned()))
    }

    fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<()> {
        self.hash_or_create(key)?
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    fn hincrby(&mut self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let hash = self.hash_or_create(key)?;
        let current = match hash.get(field) {
            Some(v) => v.parse::<i64>().map_err(|_| {
                RedoError::Store(format!("hash value at '{}'/'{}' is not an integer", key, field))
            })?,
            None => 0,
        };
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    fn hdel(&mut self, key: &str, field: &str) -> Result<bool> {
        let (removed, now_empty) = match self.hash_mut(key)? {
            Some(h) => (h.remove(field).is_some(), h.is_empty()),
            None => return Ok(false),
        };
        if now_empty {
            self.entries.remove(key);
        }
        Ok(removed)
    }

    fn hlen(&mut self, key: &str) -> Result<usize> {
        Ok(self.hash_mut(key)?.map(|h| h.len()).unwrap_or(0))
    }

    fn hkeys(&mut self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .hash_mut(key)?
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn hexists(&mut self, key: &str, field: &str) -> Result<bool> {
        Ok(self.hash_mut(key)?.map(|h| h.contains_key(field)).unwrap_or(false))
    }

    fn pttl(&mut self, key: &str) -> i64 {
        match self.live(key) {
            Some(Entry { expires_at: Some(at), .. }) => {
                at.saturating_duration_since(Instant::now()).as_millis() as i64
            }
            Some(_) => -1,
            None => -2,
        }
    }

    fn pexpire(&mut self, key: &str, millis: i64) -> bool {
        if self.live(key).is_none() {
            return false;
        }
        if millis <= 0 {
            self.entries.remove(key);
            return true;
        }
        if let Some(entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_millis(millis as u64));
        }
        true
    }

    fn time_secs(&mut self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(dur) => dur.as_secs() as i64,
            Err(_) => 0,
        }
    }

    fn publish(&mut self, channel: &str, message: &str) {
        self.outbox.push((channel.to_string(), message.to_string()));
    }
}

/// Shared store living inside this process
#[derive(Default)]
pub struct MemoryStore {
    keyspace: Mutex<MemoryKeyspace>,
    subscribers: RwLock<HashMap<String, Vec<Arc<dyn MessageListener>>>>,
    streams: Mutex<HashMap<String, Vec<Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_keyspace(&self) -> Result<MutexGuard<'_, MemoryKeyspace>> {
        self.keyspace
            .lock()
            .map_err(|_| RedoError::Internal("store keyspace lock poisoned".into()))
    }

    /// Entries appended to a stream so far
    pub fn stream_entries(&self, stream: &str) -> Vec<Vec<u8>> {
        self.streams
            .lock()
            .map(|s| s.get(stream).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Hash fields currently stored at `key` (empty if absent or expired)
    pub fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>> {
        let mut ks = self.lock_keyspace()?;
        Ok(ks.hash_mut(key)?.cloned().unwrap_or_default())
    }

    /// Remaining lease of `key` in milliseconds, Redis-style
    pub fn pttl(&self, key: &str) -> Result<i64> {
        Ok(self.lock_keyspace()?.pttl(key))
    }

    fn deliver(&self, messages: Vec<(String, String)>) -> usize {
        let mut reached = 0;
        for (channel, message) in messages {
            let listeners: Vec<Arc<dyn MessageListener>> = match self.subscribers.read() {
                Ok(subs) => subs.get(&channel).cloned().unwrap_or_default(),
                Err(_) => {
                    log::error!("store subscriber registry poisoned; dropping message on {}", channel);
                    continue;
                }
            };
            for listener in &listeners {
                listener.on_message(&channel, &message);
            }
            reached += listeners.len();
        }
        reached
    }
}

impl SharedStore for MemoryStore {
    fn execute(&self, script: &dyn AtomicScript) -> Result<ScriptReply> {
        let (reply, outbox) = {
            let mut ks = self.lock_keyspace()?;
            let reply = script.run(&mut *ks);
            (reply, std::mem::take(&mut ks.outbox))
        };
        if !outbox.is_empty() {
            log::trace!("script {} published {} message(s)", script.name(), outbox.len());
            self.deliver(outbox);
        }
        reply
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        self.lock_keyspace()?.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock_keyspace()?.set(key, value)
    }

    fn del(&self, key: &str) -> Result<bool> {
        Ok(self.lock_keyspace()?.del(key))
    }

    fn pexpire(&self, key: &str, millis: i64) -> Result<bool> {
        Ok(self.lock_keyspace()?.pexpire(key, millis))
    }

    fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        Ok(self.deliver(vec![(channel.to_string(), message.to_string())]))
    }

    fn subscribe(&self, channel: &str, listener: Arc<dyn MessageListener>) -> Result<()> {
        let mut subs = self
            .subscribers
            .write()
            .map_err(|_| RedoError::Internal("store subscriber registry poisoned".into()))?;
        subs.entry(channel.to_string()).or_default().push(listener);
        Ok(())
    }

    fn append(&self, stream: &str, entry: &[u8]) -> Result<u64> {
        let mut streams = self
            .streams
            .lock()
            .map_err(|_| RedoError::Internal("store stream lock poisoned".into()))?;
        let entries = streams.entry(stream.to_string()).or_default();
        entries.push(entry.to_vec());
        Ok(entries.len() as u64)
    }
}
