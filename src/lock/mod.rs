//! Distributed read/write locks on mailboxes
//!
//! Lock state lives in the shared store and changes only through atomic
//! scripts; threads whose attempt is refused wait on a pub/sub channel
//! instead of polling.

pub mod channel;
pub mod config;
pub mod distributed;
pub mod mailbox;
pub mod queue;
pub mod scripts;

pub use channel::{LockChannel, LockTimingContext};
pub use config::LockConfig;
pub use distributed::{DistributedLock, LockMode, LockResponse, ReleaseOutcome};
pub use mailbox::{LockManager, MailboxLock, MailboxLockGuard};
pub use queue::{LockQueue, QueuedLockRequest};
