//! Core redo log value types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RedoError;
use super::op::{OpKind, RedoableOp};

/// Mailbox identifier; only positive ids refer to real mailboxes
pub type MailboxId = i32;

/// Transaction ID
///
/// Ordered lexicographically by `(time, counter)`. A generator never hands
/// out the same value twice and every value is greater than the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId {
    /// Epoch seconds the generator was stamped with
    pub time: i32,
    /// Counter within that stamp, starting at 1
    pub counter: i32,
}

impl TransactionId {
    pub fn new(time: i32, counter: i32) -> Self {
        Self { time, counter }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.time, self.counter)
    }
}

impl FromStr for TransactionId {
    type Err = RedoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (time, counter) = s
            .split_once('-')
            .ok_or_else(|| RedoError::Serialization(format!("malformed transaction id '{}'", s)))?;
        let parse = |v: &str| {
            v.parse::<i32>()
                .map_err(|_| RedoError::Serialization(format!("malformed transaction id '{}'", s)))
        };
        Ok(Self::new(parse(time)?, parse(counter)?))
    }
}

/// Kinds of mailbox operations recorded in the redo log.
///
/// The log core never interprets these; they are carried for replay and
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MailboxOperation {
    CommitTxn,
    AbortTxn,
    Checkpoint,
    CreateMailbox,
    DeleteMailbox,
    CreateFolder,
    RenameFolder,
    CreateMessage,
    SaveDraft,
    SetItemTags,
    AlterItemTag,
    MoveItem,
    CopyItem,
    DeleteItem,
    IndexItem,
    ModifyContact,
    PurgeOldMessages,
    /// Operation type carried through from a newer peer
    Other(u16),
}

impl fmt::Display for MailboxOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MailboxOperation::Other(code) => write!(f, "Other({})", code),
            op => write!(f, "{:?}", op),
        }
    }
}

/// Position in the redo log stream: the sequence of the log file and the
/// transaction whose commit record marks the position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitId {
    pub redo_seq: u64,
    pub txn_id: TransactionId,
}

impl CommitId {
    pub fn new(redo_seq: u64, txn_id: TransactionId) -> Self {
        Self { redo_seq, txn_id }
    }

    /// True if `op` is the commit record this id points at
    pub fn matches(&self, op: &RedoableOp) -> bool {
        matches!(op.kind, OpKind::CommitTxn { .. }) && op.txn_id == self.txn_id
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.redo_seq, self.txn_id)
    }
}

impl FromStr for CommitId {
    type Err = RedoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (seq, txn) = s
            .split_once('-')
            .ok_or_else(|| RedoError::invalid_commit_id(s))?;
        let redo_seq = seq.parse::<u64>().map_err(|_| RedoError::invalid_commit_id(s))?;
        let txn_id = txn.parse::<TransactionId>().map_err(|_| RedoError::invalid_commit_id(s))?;
        Ok(Self { redo_seq, txn_id })
    }
}
