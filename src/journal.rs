//! Stage journal
//!
//! Appends one JSON line per stage event to `<storage root>/journal.jsonl`,
//! so the history of what was built, reused and failed survives the
//! process. Journal failures are logged and otherwise ignored.

use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// File name of the journal inside the storage root
pub const JOURNAL_FILE: &str = "journal.jsonl";

/// Append-only JSON-lines journal
#[derive(Debug, Clone)]
pub struct StageJournal {
    enabled: bool,
    path: PathBuf,
}

impl StageJournal {
    /// Journal stored under `storage_root`
    pub fn new(storage_root: &Path, enabled: bool) -> Self {
        Self {
            enabled,
            path: storage_root.join(JOURNAL_FILE),
        }
    }

    /// A journal that records nothing
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            path: PathBuf::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an event
    pub async fn log(&self, event: &str, data: &serde_json::Value) {
        if !self.enabled {
            return;
        }

        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
            "data": data,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize journal event: {}", e);
                return;
            }
        };
        line.push('\n');

        if let Err(e) = self.append(&line).await {
            warn!("Failed to write journal {}: {}", self.path.display(), e);
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
