//! Writer for non-authoritative nodes: records go to a shared-store stream

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{RedoError, Result};
use crate::store::SharedStore;
use super::op::{now_millis, RedoableOp};
use super::writer::{ActiveOps, LogWriter};

pub const REDO_STREAM_KEY: &str = "{redolog}-stream";

/// Forwards every frame to the cluster's redo stream.
///
/// The authoritative node owns the file log and its rollover; this writer
/// has no local file, so `rollover` is a no-op and the sequence stays at 0.
pub struct DistributedLogWriter {
    store: Arc<dyn SharedStore>,
    stream: String,
    open: AtomicBool,
    bytes: AtomicU64,
    records: AtomicU64,
    create_time: AtomicU64,
}

impl DistributedLogWriter {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self::with_stream(store, REDO_STREAM_KEY)
    }

    pub fn with_stream(store: Arc<dyn SharedStore>, stream: &str) -> Self {
        Self {
            store,
            stream: stream.to_string(),
            open: AtomicBool::new(false),
            bytes: AtomicU64::new(0),
            records: AtomicU64::new(0),
            create_time: AtomicU64::new(0),
        }
    }
}

impl LogWriter for DistributedLogWriter {
    fn open(&self) -> Result<()> {
        if !self.open.swap(true, Ordering::AcqRel) {
            self.create_time.store(now_millis(), Ordering::Release);
            log::info!("Forwarding redo records to stream {}", self.stream);
        }
        Ok(())
    }

    fn log(&self, op: &RedoableOp, frame: &[u8], _synchronous: bool) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(RedoError::Internal("distributed redo writer is not open".into()));
        }
        // Every append is acknowledged by the store before returning
        let len = self.store.append(&self.stream, frame)?;
        self.bytes.fetch_add(frame.len() as u64, Ordering::AcqRel);
        self.records.fetch_add(1, Ordering::AcqRel);
        log::trace!("Forwarded {} as stream entry {}", op, len);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.records.load(Ordering::Acquire) == 0
    }

    fn size(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    fn create_time(&self) -> u64 {
        self.create_time.load(Ordering::Acquire)
    }

    fn rollover(&self, _active_ops: &ActiveOps) -> Result<Option<PathBuf>> {
        Ok(None)
    }

    fn sequence(&self) -> u64 {
        0
    }
}
