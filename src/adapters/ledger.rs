//! Append-only record of published papers.
//!
//! One JSON line per publish. A paper counts as published if any entry for
//! it was not a dry run. The ledger is the only state that survives
//! between runs, and it is what makes a rerun skip finished papers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::warn;

use crate::core::error::CollaboratorError;
use crate::domain::PublishedRef;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<LedgerError> for CollaboratorError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Io(e) => CollaboratorError::Unavailable(format!("publish ledger: {}", e)),
            LedgerError::Serialization(e) => {
                CollaboratorError::InvalidInput(format!("publish ledger: {}", e))
            }
        }
    }
}

/// One line of the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub paper_id: String,
    pub published: PublishedRef,
    pub recorded_at: DateTime<Utc>,
}

/// JSONL publish ledger
pub struct PublishLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl PublishLedger {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a publish (dry runs included, flagged as such)
    pub async fn record(&self, paper_id: &str, published: &PublishedRef) -> Result<(), LedgerError> {
        let entry = LedgerEntry {
            paper_id: paper_id.to_string(),
            published: published.clone(),
            recorded_at: Utc::now(),
        };
        let json = serde_json::to_string(&entry)?;

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(format!("{}\n", json).as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }

    /// All entries, oldest first. Unparseable lines are skipped with a warning.
    pub async fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        if !fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut entries = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(path = %self.path.display(), error = %e, "Skipping bad ledger line"),
            }
        }

        Ok(entries)
    }

    /// Latest real (non dry-run) publish per paper
    pub async fn published(&self) -> Result<HashMap<String, PublishedRef>, LedgerError> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|entry| !entry.published.dry_run)
            .map(|entry| (entry.paper_id, entry.published))
            .collect())
    }

    pub async fn is_published(&self, paper_id: &str) -> Result<bool, LedgerError> {
        Ok(self.published().await?.contains_key(paper_id))
    }
}
