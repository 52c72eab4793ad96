//! mailredo - redo log and mailbox lock service for one mail store worker
//!
//! Components:
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Mailbox operations                        │
//! └─────────────────────────────────────────────────────────────┘
//!                    │                   │
//!                    ▼                   ▼
//! ┌──────────────────────────┐ ┌────────────────────────────────┐
//! │     Redo Log Manager     │ │       Mailbox Lock Manager     │
//! │ (append, rollover, scan) │ │  (read/write, wait channel)    │
//! └──────────────────────────┘ └────────────────────────────────┘
//!          │            │                   │
//!          ▼            └─────────┬─────────┘
//! ┌─────────────────┐             ▼
//! │  Log files and  │ ┌────────────────────────────────────────┐
//! │    archive      │ │  Shared store (txn ids, locks, pub/sub)│
//! └─────────────────┘ └────────────────────────────────────────┘

use std::path::PathBuf;
use std::sync::Arc;

use log::info;

use mailredo::error::Result as RedoResult;
use mailredo::redolog::{NoopDurability, RedoHandler, RedoableOp};
use mailredo::store::{MemoryStore, SharedStore};
use mailredo::{Config, Node};

/// Without a mail store attached, recovered operations are only reported
struct ReportingRedoHandler;

impl RedoHandler for ReportingRedoHandler {
    fn redo(&self, op: &RedoableOp) -> RedoResult<()> {
        info!("Recovered unfinished operation {}", op);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    ).init();

    let args: Vec<String> = std::env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut redo_dir: Option<PathBuf> = None;
    let mut worker_name: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--redo-dir" | "-d" => {
                if i + 1 < args.len() {
                    redo_dir = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--worker" | "-w" => {
                if i + 1 < args.len() {
                    worker_name = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("mailredo - redo log and mailbox lock service");
                println!();
                println!("Usage: mailredo [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config FILE     JSON config file");
                println!("  -d, --redo-dir DIR    Directory for redo.log and archive/ (default: ./redolog)");
                println!("  -w, --worker NAME     Worker name (default: mailredo-0)");
                println!("  -h, --help            Show this help");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    let mut config = match &config_path {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };
    if let Some(dir) = redo_dir {
        let redo = mailredo::redolog::RedoConfig::in_dir(&dir);
        config.redo.log_path = redo.log_path;
        config.redo.archive_dir = redo.archive_dir;
    }
    if let Some(name) = worker_name {
        config.worker_name = name;
    }

    info!("Starting mailredo worker {}...", config.worker_name);

    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let node = Arc::new(Node::new(config, store, Arc::new(NoopDurability))?);
    let replayed = node.start(&ReportingRedoHandler)?;
    if replayed > 0 {
        info!("Replayed {} operation(s) from the previous run", replayed);
    }

    node.run().await?;
    Ok(())
}
