use std::path::Path;
use std::sync::Arc;

use log::{error, info};
use serde::{Deserialize, Serialize};

pub mod error;
pub mod lock;
pub mod redolog;
pub mod store;

use crate::error::{RedoError, Result};
use crate::lock::{LockConfig, LockManager};
use crate::redolog::{DurabilityStore, RedoConfig, RedoHandler, RedoLogManager};
use crate::store::SharedStore;

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of this worker in the cluster; recorded as lock holder and
    /// last writer, and used to recognize its own shutdown messages
    pub worker_name: String,
    pub redo: RedoConfig,
    pub lock: LockConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_name: "mailredo-0".to_string(),
            redo: RedoConfig::default(),
            lock: LockConfig::default(),
        }
    }
}

impl Config {
    /// Load a JSON config file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_name.is_empty() {
            return Err(RedoError::Config("worker_name must not be empty".into()));
        }
        self.redo.validate()?;
        self.lock.validate()
    }
}

/// One mail store worker: its redo log and its mailbox lock manager
pub struct Node {
    config: Config,
    redo: Arc<RedoLogManager>,
    locks: Arc<LockManager>,
}

impl Node {
    pub fn new(
        config: Config,
        store: Arc<dyn SharedStore>,
        durability: Arc<dyn DurabilityStore>,
    ) -> Result<Self> {
        config.validate()?;
        let redo = Arc::new(RedoLogManager::from_config(
            config.redo.clone(),
            Some(store.clone()),
            durability,
        )?);
        let locks = LockManager::new(store, config.lock.clone(), &config.worker_name)?;
        Ok(Self { config, redo, locks })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn redo_log(&self) -> &Arc<RedoLogManager> {
        &self.redo
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Open the redo log, replaying whatever a crash left unfinished
    pub fn start(&self, handler: &dyn RedoHandler) -> Result<usize> {
        let replayed = self.redo.start_with_recovery(handler)?;
        info!(
            "Worker {} started (redo sequence {})",
            self.config.worker_name,
            self.redo.current_log_sequence()
        );
        Ok(replayed)
    }

    /// Release this worker's locks and close the redo log
    pub fn shutdown(&self) {
        if let Err(e) = self.locks.release_all_on_shutdown() {
            error!("Failed to release locks on shutdown: {}", e);
        }
        self.redo.stop();
        info!("Worker {} stopped", self.config.worker_name);
    }

    /// Run until Ctrl-C, then shut down
    pub async fn run(self: Arc<Self>) -> Result<()> {
        tokio::signal::ctrl_c().await?;
        info!("Shutdown requested");
        let node = Arc::clone(&self);
        tokio::task::spawn_blocking(move || node.shutdown())
            .await
            .map_err(|e| RedoError::Internal(format!("shutdown task failed: {}", e)))
    }
}
