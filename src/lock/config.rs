//! Configuration for distributed mailbox locks

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RedoError, Result};

/// Lock configuration.
///
/// # Presets
///
/// - [`LockConfig::default()`] - 60s leases and timeout, 15 waiters per account
/// - [`LockConfig::short_lease()`] - 2s leases, 5s timeout (tests, local tooling)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease on a write hold (milliseconds); reentrant holds accumulate it
    pub write_lease_ms: i64,
    /// Lease on a read hold (milliseconds)
    pub read_lease_ms: i64,
    /// Queue depth per account before new waiters are rejected
    pub max_waiting_threads: usize,
    /// How long `lock()` waits before giving up (milliseconds)
    pub timeout_ms: u64,
    /// Number of pub/sub channels accounts are bucketed onto
    pub num_channels: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            write_lease_ms: 60_000,
            read_lease_ms: 60_000,
            max_waiting_threads: 15,
            timeout_ms: 60_000,
            num_channels: 100,
        }
    }
}

impl LockConfig {
    pub fn short_lease() -> Self {
        Self {
            write_lease_ms: 2_000,
            read_lease_ms: 2_000,
            timeout_ms: 5_000,
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.write_lease_ms <= 0 || self.read_lease_ms <= 0 {
            return Err(RedoError::Config(format!(
                "lock leases must be positive (write {}ms, read {}ms)",
                self.write_lease_ms, self.read_lease_ms
            )));
        }
        if self.num_channels == 0 {
            return Err(RedoError::Config("num_channels must be at least 1".into()));
        }
        if self.max_waiting_threads == 0 {
            return Err(RedoError::Config(
                "max_waiting_threads must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
