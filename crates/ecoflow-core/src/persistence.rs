//! Connection history using JSON-lines file storage

use crate::state::ConnectionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// One line of the history file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub state: ConnectionState,
}

/// Path of the history file for a device serial
#[must_use]
pub fn history_path(dir: &Path, serial: &str) -> PathBuf {
    dir.join(format!("{serial}.jsonl"))
}

/// Append-only state log, written by a background task in arrival order
#[derive(Debug, Clone)]
pub struct HistoryLog {
    tx: mpsc::UnboundedSender<HistoryEntry>,
}

impl HistoryLog {
    /// Start a writer appending to `<dir>/<serial>.jsonl`
    #[must_use]
    pub fn spawn(dir: &Path, serial: &str) -> Self {
        let path = history_path(dir, serial);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::writer_task(path, rx));
        Self { tx }
    }

    /// Record a state transition
    pub fn record(&self, state: ConnectionState) {
        let entry = HistoryEntry {
            timestamp: Utc::now(),
            state,
        };
        if self.tx.send(entry).is_err() {
            tracing::debug!("History writer stopped, dropping {}", state);
        }
    }

    async fn writer_task(path: PathBuf, mut rx: mpsc::UnboundedReceiver<HistoryEntry>) {
        while let Some(entry) = rx.recv().await {
            if let Err(e) = append_entry(&path, &entry).await {
                tracing::warn!("Failed to append history to {:?}: {}", path, e);
            }
        }
        tracing::debug!("History writer for {:?} shutting down", path);
    }
}

/// Append one entry as a JSON line
#[allow(clippy::missing_errors_doc)]
pub async fn append_entry(path: &Path, entry: &HistoryEntry) -> Result<(), std::io::Error> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut line = serde_json::to_string(entry)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push('\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

/// Load a history file, skipping malformed lines
pub async fn load_history(path: &Path) -> Vec<HistoryEntry> {
    match fs::read_to_string(path).await {
        Ok(contents) => contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!("Skipping malformed history line in {:?}: {}", path, e);
                    None
                }
            })
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No history file found at {:?}", path);
            Vec::new()
        }
        Err(e) => {
            tracing::warn!("Failed to read history file {:?}: {}", path, e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ecoflow-history-{}-{}", name, std::process::id()))
    }

    #[tokio::test]
    async fn test_log_appends_in_order() {
        let dir = temp_dir("order");
        let log = HistoryLog::spawn(&dir, "R351ZEB4HF000001");
        for state in [
            ConnectionState::Connecting,
            ConnectionState::KeyExchange,
            ConnectionState::Authenticated,
        ] {
            log.record(state);
        }

        let path = history_path(&dir, "R351ZEB4HF000001");
        let mut entries = Vec::new();
        for _ in 0..50 {
            entries = load_history(&path).await;
            if entries.len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let _ = fs::remove_dir_all(&dir).await;

        let states: Vec<_> = entries.iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::KeyExchange,
                ConnectionState::Authenticated,
            ]
        );
        assert!(entries[0].timestamp <= entries[2].timestamp);
    }

    #[tokio::test]
    async fn test_line_format() {
        let dir = temp_dir("format");
        let path = history_path(&dir, "SERIAL");
        let entry = HistoryEntry {
            timestamp: "2024-05-01T10:00:00Z".parse().unwrap(),
            state: ConnectionState::ErrorAuthFailed,
        };
        append_entry(&path, &entry).await.unwrap();
        let raw = fs::read_to_string(&path).await.unwrap();
        let _ = fs::remove_dir_all(&dir).await;
        assert_eq!(
            raw,
            "{\"timestamp\":\"2024-05-01T10:00:00Z\",\"state\":\"ERROR_AUTH_FAILED\"}\n"
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        assert!(load_history(&temp_dir("missing").join("none.jsonl")).await.is_empty());
    }
}
