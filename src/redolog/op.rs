//! Redo log record structures and framing

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{RedoError, Result};
use super::types::{MailboxId, MailboxOperation, TransactionId};

/// Size of the little-endian length prefix in front of every frame
pub const FRAME_PREFIX_LEN: usize = 4;

/// Upper bound on a single frame body; anything larger is treated as corruption
pub const MAX_FRAME_LEN: usize = 64 << 20;

/// What a record means to the transaction bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// A mailbox operation; starts its transaction
    Operation,
    /// Transaction completed successfully
    CommitTxn { wrapped: MailboxOperation },
    /// Transaction failed; never replayed
    AbortTxn { wrapped: MailboxOperation },
    /// Transactions still active when the checkpoint was taken
    Checkpoint { active_txns: Vec<TransactionId> },
}

/// A unit of loggable work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedoableOp {
    pub txn_id: TransactionId,
    pub mailbox_id: MailboxId,
    pub op_type: MailboxOperation,
    /// Unix epoch millis when the record was created
    pub timestamp: u64,
    pub kind: OpKind,
    /// Serialized operation data, opaque to the log
    pub payload: Vec<u8>,
}

/// Current time in Unix epoch millis
pub(crate) fn now_millis() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_millis() as u64,
        Err(_) => 0,
    }
}

impl RedoableOp {
    pub fn new(
        txn_id: TransactionId,
        mailbox_id: MailboxId,
        op_type: MailboxOperation,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            txn_id,
            mailbox_id,
            op_type,
            timestamp: now_millis(),
            kind: OpKind::Operation,
            payload,
        }
    }

    /// COMMIT record for `op`'s transaction
    pub fn commit_of(op: &RedoableOp) -> Self {
        Self {
            txn_id: op.txn_id,
            mailbox_id: op.mailbox_id,
            op_type: MailboxOperation::CommitTxn,
            timestamp: now_millis(),
            kind: OpKind::CommitTxn { wrapped: op.op_type },
            payload: Vec::new(),
        }
    }

    /// ABORT record for `op`'s transaction
    pub fn abort_of(op: &RedoableOp) -> Self {
        Self {
            txn_id: op.txn_id,
            mailbox_id: op.mailbox_id,
            op_type: MailboxOperation::AbortTxn,
            timestamp: now_millis(),
            kind: OpKind::AbortTxn { wrapped: op.op_type },
            payload: Vec::new(),
        }
    }

    /// Checkpoint record listing the transactions active right now
    pub fn checkpoint(txn_id: TransactionId, active_txns: Vec<TransactionId>) -> Self {
        Self {
            txn_id,
            mailbox_id: 0,
            op_type: MailboxOperation::Checkpoint,
            timestamp: now_millis(),
            kind: OpKind::Checkpoint { active_txns },
            payload: Vec::new(),
        }
    }

    pub fn is_start_marker(&self) -> bool {
        matches!(self.kind, OpKind::Operation)
    }

    pub fn is_end_marker(&self) -> bool {
        matches!(self.kind, OpKind::CommitTxn { .. } | OpKind::AbortTxn { .. })
    }

    pub fn is_commit(&self) -> bool {
        matches!(self.kind, OpKind::CommitTxn { .. })
    }

    /// Drop the payload buffer once the record has been written
    pub fn release(&mut self) {
        self.payload = Vec::new();
    }

    /// Length-prefixed frame for this record
    pub fn serialize(&self) -> Result<Bytes> {
        encode_frame(self)
    }

    /// Decode a frame body (without its length prefix)
    pub fn deserialize(body: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(body)?)
    }
}

impl fmt::Display for RedoableOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            OpKind::Operation => write!(
                f,
                "txn={} mbox={} op={} payload={}B",
                self.txn_id,
                self.mailbox_id,
                self.op_type,
                self.payload.len()
            ),
            OpKind::CommitTxn { wrapped } => {
                write!(f, "txn={} mbox={} COMMIT {}", self.txn_id, self.mailbox_id, wrapped)
            }
            OpKind::AbortTxn { wrapped } => {
                write!(f, "txn={} mbox={} ABORT {}", self.txn_id, self.mailbox_id, wrapped)
            }
            OpKind::Checkpoint { active_txns } => {
                write!(f, "txn={} CHECKPOINT active={}", self.txn_id, active_txns.len())
            }
        }
    }
}

/// Encode `value` as a 4-byte little-endian length prefix followed by its
/// bincode body. Bodies over [`MAX_FRAME_LEN`] are refused, as the reader
/// rejects them.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Bytes> {
    let body = bincode::serialize(value)?;
    let len = match u32::try_from(body.len()) {
        Ok(len) if body.len() <= MAX_FRAME_LEN => len,
        _ => {
            return Err(RedoError::Serialization(format!(
                "frame body of {} bytes exceeds the {} byte limit",
                body.len(),
                MAX_FRAME_LEN
            )))
        }
    };
    let mut buf = BytesMut::with_capacity(FRAME_PREFIX_LEN + body.len());
    buf.put_u32_le(len);
    buf.put_slice(&body);
    Ok(buf.freeze())
}
