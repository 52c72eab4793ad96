//! Rollover policy and archive bookkeeping

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use super::config::RedoConfig;

const ARCHIVE_PREFIX: &str = "redo-";
const ARCHIVE_SEQ_MARKER: &str = "-seq";
const ARCHIVE_SUFFIX: &str = ".log";

/// Tracks the active log's sequence number and names archived files.
///
/// Archived files are named `redo-<createTime>-seq<N>.log`, so sorting by the
/// parsed `N` gives log order regardless of directory listing order.
pub struct RolloverManager {
    archive_dir: PathBuf,
    sequence: AtomicU64,
}

impl RolloverManager {
    pub fn new(archive_dir: PathBuf) -> Self {
        Self {
            archive_dir,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    pub fn init_sequence(&self, seq: u64) {
        self.sequence.store(seq, Ordering::Release);
    }

    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Advance to the next sequence and return it
    pub fn increment_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn archive_file_name(create_time: u64, seq: u64) -> String {
        format!("{}{}{}{}{}", ARCHIVE_PREFIX, create_time, ARCHIVE_SEQ_MARKER, seq, ARCHIVE_SUFFIX)
    }

    pub fn archive_path(&self, create_time: u64, seq: u64) -> PathBuf {
        self.archive_dir.join(Self::archive_file_name(create_time, seq))
    }

    /// Sequence number encoded in an archive file name
    pub fn parse_sequence(file_name: &str) -> Option<u64> {
        let stem = file_name
            .strip_prefix(ARCHIVE_PREFIX)?
            .strip_suffix(ARCHIVE_SUFFIX)?;
        let (time, seq) = stem.rsplit_once(ARCHIVE_SEQ_MARKER)?;
        time.parse::<u64>().ok()?;
        seq.parse::<u64>().ok()
    }

    /// All archived logs, ascending by sequence
    pub fn archive_logs(&self) -> Result<Vec<PathBuf>> {
        self.archive_logs_from(0)
    }

    /// Archived logs with sequence >= `from_seq`, ascending by sequence
    pub fn archive_logs_from(&self, from_seq: u64) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.archive_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut logs = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(seq) = name.to_str().and_then(Self::parse_sequence) else {
                continue;
            };
            if seq >= from_seq {
                logs.push((seq, entry.path()));
            }
        }
        logs.sort_by_key(|(seq, _)| *seq);
        Ok(logs.into_iter().map(|(_, path)| path).collect())
    }

    /// Sequence for a brand-new active log: one past the highest archived
    pub fn next_sequence_from_archive(&self) -> Result<u64> {
        let last = self
            .archive_logs()?
            .last()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .and_then(Self::parse_sequence);
        Ok(last.map(|s| s + 1).unwrap_or(0))
    }
}

/// Size and age thresholds that trigger a rollover
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloverLimits {
    pub min_age_ms: u64,
    pub soft_max_bytes: u64,
    pub hard_max_bytes: u64,
}

impl RolloverLimits {
    pub fn from_config(config: &RedoConfig) -> Self {
        Self {
            min_age_ms: config.rollover_min_age_ms,
            soft_max_bytes: config.rollover_soft_max_bytes,
            hard_max_bytes: config.rollover_hard_max_bytes,
        }
    }

    /// Decide whether the active log should roll over.
    ///
    /// `immediate` asks for a rollover of any non-empty log. Otherwise the log
    /// rolls over at the hard cap, or at the soft cap once it has grown since
    /// it was opened and is at least `min_age_ms` old.
    pub fn is_needed(
        &self,
        immediate: bool,
        is_empty: bool,
        size: u64,
        initial_size: u64,
        create_time: u64,
        now: u64,
    ) -> bool {
        if immediate {
            return !is_empty;
        }
        if size >= self.hard_max_bytes {
            return true;
        }
        size >= self.soft_max_bytes
            && size > initial_size
            && now.saturating_sub(create_time) >= self.min_age_ms
    }
}
