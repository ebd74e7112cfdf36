//! Structured timeline journal
//!
//! Append-only NDJSON event log reconstructing what the defender did and
//! when. Many components write; one task owns the file. Callers submit
//! entries through a bounded channel and never block for longer than the
//! short send timeout — when the channel stays full, entries are dropped,
//! counted, and the burst is reported with one `ERROR` entry as soon as the
//! channel drains.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::types::JournalError;

/// Channel capacity between callers and the writer task.
const CHANNEL_CAPACITY: usize = 1024;

/// How long `append` waits for channel space before dropping the entry.
const SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Severity/kind of a timeline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum Level {
    INIT,
    ALERT,
    PLAN,
    SSH,
    EXEC,
    DONE,
    ERROR,
}

/// One line of the timeline. `ts`, `level` and `msg` are always present;
/// `alert` and `exec` carry 8-char digest prefixes for correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    #[serde(with = "ts_micros")]
    pub ts: DateTime<Utc>,
    pub level: Level,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JournalEntry {
    pub fn new(level: Level, msg: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            level,
            msg: msg.into(),
            alert: None,
            exec: None,
            data: None,
        }
    }

    pub fn with_alert(mut self, prefix: impl Into<String>) -> Self {
        self.alert = Some(prefix.into());
        self
    }

    pub fn with_exec(mut self, prefix: impl Into<String>) -> Self {
        self.exec = Some(prefix.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// RFC 3339 timestamps with microsecond precision and explicit timezone.
mod ts_micros {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(de)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Cloneable producer side of the journal.
#[derive(Clone)]
pub struct JournalHandle {
    tx: mpsc::Sender<JournalEntry>,
    dropped: Arc<AtomicU64>,
}

impl JournalHandle {
    /// Submit an entry. Waits at most [`SEND_TIMEOUT`] for channel space;
    /// on timeout the entry is dropped and counted.
    pub async fn append(&self, entry: JournalEntry) {
        // Report a preceding drop burst once space is available again.
        let pending_drops = self.dropped.swap(0, Ordering::Relaxed);
        if pending_drops > 0 {
            let report = JournalEntry::new(
                Level::ERROR,
                format!("journal backpressure: {pending_drops} entries dropped"),
            )
            .with_data(serde_json::json!({ "dropped": pending_drops }));
            if self.tx.send_timeout(report, SEND_TIMEOUT).await.is_err() {
                // Still full; fold the report back into the counter.
                self.dropped.fetch_add(pending_drops, Ordering::Relaxed);
            }
        }

        if self.tx.send_timeout(entry, SEND_TIMEOUT).await.is_err() {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(dropped = total, "journal channel full, entry dropped");
        }
    }

    /// Entries dropped and not yet reported to the timeline.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Timeline journal owning the writer task.
pub struct Journal {
    handle: JournalHandle,
    writer: JoinHandle<Result<(), JournalError>>,
}

impl Journal {
    /// Open (append) the timeline file and start the writer task.
    pub async fn spawn(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path: PathBuf = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let writer = tokio::spawn(write_loop(BufWriter::new(file), rx));

        Ok(Self {
            handle: JournalHandle {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            writer,
        })
    }

    pub fn handle(&self) -> JournalHandle {
        self.handle.clone()
    }

    /// Close the channel and wait for the writer to flush and exit.
    ///
    /// Call after every other producer has been dropped; pending entries are
    /// written before the task returns.
    pub async fn close(self) -> Result<(), JournalError> {
        drop(self.handle);
        match self.writer.await {
            Ok(result) => result,
            Err(join) => Err(JournalError::Io {
                source: std::io::Error::other(join),
            }),
        }
    }
}

/// Writer loop: serialise, append, flush per entry. Durability target is
/// "survives process exit", so flushed buffered writes without fsync.
async fn write_loop(
    mut out: BufWriter<tokio::fs::File>,
    mut rx: mpsc::Receiver<JournalEntry>,
) -> Result<(), JournalError> {
    while let Some(entry) = rx.recv().await {
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(err) => {
                tracing::error!(error = %err, "unserialisable journal entry skipped");
                continue;
            }
        };
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
    }
    out.flush().await?;
    Ok(())
}

/// Read a timeline file back, skipping blank lines. Intended for tests and
/// operator tooling, not the hot path.
pub fn read_entries(path: impl AsRef<Path>) -> Result<Vec<JournalEntry>, JournalError> {
    let raw = std::fs::read_to_string(path)?;
    let mut entries = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: JournalEntry =
            serde_json::from_str(line).map_err(|e| JournalError::Malformed {
                line: idx + 1,
                reason: e.to_string(),
            })?;
        entries.push(entry);
    }
    Ok(entries)
}
