//! Configuration for the redo log manager

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RedoError, Result};

/// Which transaction id generator a process uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnIdStrategy {
    /// In-process counter; unique within this process only
    Local,
    /// Atomic counter in the shared store; unique across the cluster
    SharedStore,
}

/// Whether this process owns the redo log file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriterRole {
    /// Writes the local log file and performs rollover
    Authoritative,
    /// Forwards records to the distributed writer; never rolls over
    Forwarding,
}

/// Redo log configuration.
///
/// # Presets
///
/// - [`RedoConfig::default()`] - 1 GB soft / 4 GB hard rollover, 10ms fsync interval
/// - [`RedoConfig::in_dir()`] - defaults with the log and archive under one directory
/// - [`RedoConfig::synchronous()`] - fsync inline on every synchronous write
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedoConfig {
    /// When false, `log()` is a no-op
    pub enabled: bool,
    /// The one active log file
    pub log_path: PathBuf,
    /// Where rolled-over files go
    pub archive_dir: PathBuf,
    /// A log over the soft cap must be at least this old to roll over
    pub rollover_min_age_ms: u64,
    /// Soft size cap (bytes), subject to the minimum age
    pub rollover_soft_max_bytes: u64,
    /// Hard size cap (bytes); always rolls over
    pub rollover_hard_max_bytes: u64,
    /// How often the background flusher fsyncs (milliseconds).
    /// Set to 0 to fsync inline on every synchronous write.
    pub fsync_interval_ms: u64,
    /// Replay uncommitted operations from the active log on start
    pub supports_crash_recovery: bool,
    pub txn_id_generator: TxnIdStrategy,
    pub writer_role: WriterRole,
}

impl Default for RedoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_path: PathBuf::from("./redolog/redo.log"),
            archive_dir: PathBuf::from("./redolog/archive"),
            rollover_min_age_ms: 30 * 60 * 1000,           // 30 minutes
            rollover_soft_max_bytes: 1024 * 1024 * 1024,   // 1 GB
            rollover_hard_max_bytes: 4 * 1024 * 1024 * 1024, // 4 GB
            fsync_interval_ms: 10,
            supports_crash_recovery: true,
            txn_id_generator: TxnIdStrategy::Local,
            writer_role: WriterRole::Authoritative,
        }
    }
}

impl RedoConfig {
    /// Defaults with `redo.log` and `archive/` under `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            log_path: dir.join("redo.log"),
            archive_dir: dir.join("archive"),
            ..Default::default()
        }
    }

    /// Create a config that fsyncs inline on synchronous writes
    pub fn synchronous(dir: &Path) -> Self {
        Self {
            fsync_interval_ms: 0,
            ..Self::in_dir(dir)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.rollover_hard_max_bytes < self.rollover_soft_max_bytes {
            return Err(RedoError::Config(format!(
                "rollover hard max ({} bytes) is below soft max ({} bytes)",
                self.rollover_hard_max_bytes, self.rollover_soft_max_bytes
            )));
        }
        if self.log_path.file_name().is_none() {
            return Err(RedoError::Config(format!(
                "redo log path '{}' does not name a file",
                self.log_path.display()
            )));
        }
        Ok(())
    }

    /// Directory holding the active log (scratch directories go here too)
    pub fn log_dir(&self) -> PathBuf {
        match self.log_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}
