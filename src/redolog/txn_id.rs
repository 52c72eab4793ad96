//! Transaction ID generation
//!
//! Two strategies share one contract: every id returned by a generator is
//! strictly greater than every id it returned before.
//!
//! - [`LocalTxnIdGenerator`] stamps the process start second and counts up.
//! - [`SharedStoreTxnIdGenerator`] keeps the stamp and counter in the shared
//!   store and advances them with one atomic script per call, so ids are
//!   unique across every worker in the cluster.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{RedoError, Result};
use crate::store::{AtomicScript, Keyspace, ScriptReply, SharedStore};
use super::config::TxnIdStrategy;
use super::types::TransactionId;

pub const TXN_TIMESTAMP_KEY: &str = "{redolog}-timestamp";
pub const TXN_COUNTER_KEY: &str = "{redolog}-counter";

const MAX_COUNTER: i64 = i32::MAX as i64;

pub trait TxnIdGenerator: Send + Sync {
    fn next_id(&self) -> Result<TransactionId>;
}

fn epoch_seconds() -> i32 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_secs().min(i32::MAX as u64) as i32,
        Err(_) => 0,
    }
}

/// In-process generator
pub struct LocalTxnIdGenerator {
    /// (stamp, next counter)
    state: Mutex<(i32, i32)>,
}

impl LocalTxnIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(epoch_seconds(), 1)
    }

    /// Generator whose next id is `(time, counter)`
    pub fn starting_at(time: i32, counter: i32) -> Self {
        Self {
            state: Mutex::new((time, counter.max(1))),
        }
    }
}

impl Default for LocalTxnIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnIdGenerator for LocalTxnIdGenerator {
    fn next_id(&self) -> Result<TransactionId> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| RedoError::Internal("txn id generator lock poisoned".into()))?;
        let (time, counter) = *state;
        let id = TransactionId::new(time, counter);
        if counter < i32::MAX {
            state.1 = counter + 1;
        } else {
            // A restamp within the same second must still move forward.
            let restamp = epoch_seconds().max(time.saturating_add(1));
            *state = (restamp, 1);
        }
        Ok(id)
    }
}

/// Reads the stamp, increments the counter, and restarts both when the
/// counter would leave the i32 range or the stamp is missing (first use, or
/// the store lost its data).
pub struct TxnIdScript;

impl AtomicScript for TxnIdScript {
    fn name(&self) -> &'static str {
        "redolog-txn-id"
    }

    fn run(&self, ks: &mut dyn Keyspace) -> Result<ScriptReply> {
        let parse = |t: String| {
            t.parse::<i64>()
                .map_err(|_| RedoError::Store(format!("unparseable value at {}", TXN_TIMESTAMP_KEY)))
        };
        let stamp = ks.get(TXN_TIMESTAMP_KEY)?.map(parse).transpose()?;
        let mut counter = ks.incr(TXN_COUNTER_KEY)?;
        let timestamp = match stamp {
            Some(stamp) if counter <= MAX_COUNTER => stamp,
            _ => {
                // A restamp within the same second must still move forward
                let now = match stamp {
                    Some(previous) => ks.time_secs().max(previous + 1),
                    None => ks.time_secs(),
                };
                ks.del(TXN_COUNTER_KEY);
                ks.set(TXN_TIMESTAMP_KEY, &now.to_string())?;
                counter = ks.incr(TXN_COUNTER_KEY)?;
                now
            }
        };
        Ok(ScriptReply::Array(vec![
            ScriptReply::Int(timestamp),
            ScriptReply::Int(counter),
        ]))
    }
}

/// Cluster-wide generator backed by the shared store
pub struct SharedStoreTxnIdGenerator {
    store: Arc<dyn SharedStore>,
}

impl SharedStoreTxnIdGenerator {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }
}

impl TxnIdGenerator for SharedStoreTxnIdGenerator {
    fn next_id(&self) -> Result<TransactionId> {
        let script = TxnIdScript;
        let reply = self.store.execute(&script)?.into_array(script.name())?;
        // The script keeps both values inside the i32 range
        match reply.as_slice() {
            [ScriptReply::Int(time), ScriptReply::Int(counter)] => {
                Ok(TransactionId::new(*time as i32, *counter as i32))
            }
            other => Err(RedoError::unexpected_reply(script.name(), other)),
        }
    }
}

/// Build the generator selected by configuration
pub fn create_generator(
    strategy: TxnIdStrategy,
    store: Option<Arc<dyn SharedStore>>,
) -> Result<Arc<dyn TxnIdGenerator>> {
    match (strategy, store) {
        (TxnIdStrategy::Local, _) => Ok(Arc::new(LocalTxnIdGenerator::new())),
        (TxnIdStrategy::SharedStore, Some(store)) => {
            Ok(Arc::new(SharedStoreTxnIdGenerator::new(store)))
        }
        (TxnIdStrategy::SharedStore, None) => Err(RedoError::Config(
            "shared-store transaction ids need a shared store handle".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_local_ids_strictly_increase() {
        let gen = LocalTxnIdGenerator::new();
        let mut prev = gen.next_id().unwrap();
        for _ in 0..1000 {
            let next = gen.next_id().unwrap();
            assert!(next > prev, "{} should follow {}", next, prev);
            prev = next;
        }
    }

    #[test]
    fn test_local_same_second_counters() {
        let gen = LocalTxnIdGenerator::starting_at(1000, 1);
        assert_eq!(gen.next_id().unwrap(), TransactionId::new(1000, 1));
        assert_eq!(gen.next_id().unwrap(), TransactionId::new(1000, 2));
    }

    #[test]
    fn test_local_overflow_restamps() {
        let now = epoch_seconds();
        let gen = LocalTxnIdGenerator::starting_at(now, i32::MAX);
        let last = gen.next_id().unwrap();
        assert_eq!(last, TransactionId::new(now, i32::MAX));

        let next = gen.next_id().unwrap();
        assert_eq!(next.counter, 1);
        assert!(next.time > now);
        assert!(next > last);
    }

    #[test]
    fn test_local_concurrent_unique() {
        let gen = Arc::new(LocalTxnIdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gen = Arc::clone(&gen);
                thread::spawn(move || (0..250).map(|_| gen.next_id().unwrap()).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn test_shared_store_first_use_initializes() {
        let store = Arc::new(MemoryStore::new());
        let gen = SharedStoreTxnIdGenerator::new(store.clone());
        let first = gen.next_id().unwrap();
        assert_eq!(first.counter, 1);
        assert!(first.time > 0);
        let second = gen.next_id().unwrap();
        assert_eq!(second, TransactionId::new(first.time, 2));
        assert_eq!(store.get(TXN_COUNTER_KEY).unwrap(), Some("2".to_string()));
    }

    #[test]
    fn test_shared_store_counter_overflow_resets() {
        let store = Arc::new(MemoryStore::new());
        store.set(TXN_TIMESTAMP_KEY, "1000").unwrap();
        store.set(TXN_COUNTER_KEY, &(i32::MAX - 1).to_string()).unwrap();
        let gen = SharedStoreTxnIdGenerator::new(store.clone());

        assert_eq!(gen.next_id().unwrap(), TransactionId::new(1000, i32::MAX));
        let next = gen.next_id().unwrap();
        assert_eq!(next.counter, 1);
        assert!(next.time > 1000);
    }

    #[test]
    fn test_shared_store_overflow_within_same_second() {
        let store = Arc::new(MemoryStore::new());
        // A stamp ahead of the store clock stands in for "still this second"
        let stamp = epoch_seconds() + 3600;
        store.set(TXN_TIMESTAMP_KEY, &stamp.to_string()).unwrap();
        store.set(TXN_COUNTER_KEY, &(i32::MAX - 1).to_string()).unwrap();
        let gen = SharedStoreTxnIdGenerator::new(store.clone());

        let last = gen.next_id().unwrap();
        let next = gen.next_id().unwrap();
        assert!(next > last);
        assert_eq!(next, TransactionId::new(stamp + 1, 1));
    }

    #[test]
    fn test_shared_store_lost_timestamp_resets() {
        let store = Arc::new(MemoryStore::new());
        store.set(TXN_COUNTER_KEY, "500").unwrap();
        let gen = SharedStoreTxnIdGenerator::new(store.clone());
        assert_eq!(gen.next_id().unwrap().counter, 1);
    }

    #[test]
    fn test_two_generators_share_sequence() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let a = SharedStoreTxnIdGenerator::new(Arc::clone(&store));
        let b = SharedStoreTxnIdGenerator::new(Arc::clone(&store));
        let mut ids = Vec::new();
        for _ in 0..10 {
            ids.push(a.next_id().unwrap());
            ids.push(b.next_id().unwrap());
        }
        for pair in ids.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn test_create_generator_requires_store() {
        assert!(create_generator(TxnIdStrategy::Local, None).is_ok());
        assert!(matches!(
            create_generator(TxnIdStrategy::SharedStore, None),
            Err(RedoError::Config(_))
        ));
    }
}
