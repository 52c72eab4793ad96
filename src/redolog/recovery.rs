//! Crash recovery: find and replay transactions left open in the active log

use std::collections::HashSet;
use std::path::Path;

use crate::error::Result;
use super::op::{OpKind, RedoableOp};
use super::reader::FileLogReader;
use super::types::TransactionId;
use super::writer::ActiveOps;

/// Applies a recovered operation to the mail store
pub trait RedoHandler: Send + Sync {
    fn redo(&self, op: &RedoableOp) -> Result<()>;
}

/// What a scan of the active log found
#[derive(Debug, Default)]
pub struct RecoveryScan {
    pub sequence: u64,
    pub records: usize,
    /// Started but neither committed nor aborted, in start order
    pub uncommitted: Vec<RedoableOp>,
    /// Active set recorded by the last checkpoint, if any
    pub last_checkpoint: Option<Vec<TransactionId>>,
    pub committed: HashSet<TransactionId>,
    pub aborted: HashSet<TransactionId>,
}

impl RecoveryScan {
    /// Read the log at `path` and work out which transactions never finished.
    /// A missing file means there is nothing to recover.
    pub fn scan(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let mut reader = FileLogReader::open(path)?;
        let mut scan = RecoveryScan {
            sequence: reader.header().sequence,
            ..Default::default()
        };
        let mut open = ActiveOps::new();

        while let Some(op) = reader.next_op()? {
            scan.records += 1;
            match &op.kind {
                OpKind::Operation => open.insert(op),
                OpKind::CommitTxn { .. } => {
                    open.remove(&op.txn_id);
                    scan.committed.insert(op.txn_id);
                }
                OpKind::AbortTxn { .. } => {
                    open.remove(&op.txn_id);
                    scan.aborted.insert(op.txn_id);
                }
                OpKind::Checkpoint { active_txns } => {
                    scan.last_checkpoint = Some(active_txns.clone());
                }
            }
        }

        scan.uncommitted = open.iter().cloned().collect();
        log::info!(
            "Redo log scan of {} (sequence {}): {} records, {} committed, {} aborted, {} uncommitted",
            path.display(),
            scan.sequence,
            scan.records,
            scan.committed.len(),
            scan.aborted.len(),
            scan.uncommitted.len()
        );
        Ok(scan)
    }
}
