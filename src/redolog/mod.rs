//! Redo log for the mail store
//!
//! Write-ahead log of mailbox operations with rollover, checkpoints,
//! crash recovery and changed-mailbox scans.

pub mod config;
pub mod distributed;
pub mod manager;
pub mod op;
pub mod reader;
pub mod recovery;
pub mod rollover;
pub mod txn_id;
pub mod types;
pub mod writer;

pub use config::{RedoConfig, TxnIdStrategy, WriterRole};
pub use distributed::DistributedLogWriter;
pub use manager::{
    DurabilityStore, ExclusiveLock, FatalErrorHandler, HaltOnFatal, NoopDurability, RedoLogManager,
};
pub use op::{OpKind, RedoableOp};
pub use reader::FileLogReader;
pub use recovery::{RecoveryScan, RedoHandler};
pub use rollover::{RolloverLimits, RolloverManager};
pub use txn_id::{
    create_generator, LocalTxnIdGenerator, SharedStoreTxnIdGenerator, TxnIdGenerator,
};
pub use types::{CommitId, MailboxId, MailboxOperation, TransactionId};
pub use writer::{ActiveOps, FileHeader, FileLogWriter, LogWriter};
