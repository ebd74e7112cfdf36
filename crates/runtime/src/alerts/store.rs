//! Durable alert store
//!
//! NDJSON append sink owned by the ingest path. Each alert is one envelope
//! line `{raw, run_id, ts}`; a line is buffered fully and written with a
//! single call so a partial line is never committed. An OS file lock guards
//! against a second writer process on the same file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::types::{Alert, StoreError};

/// Minimum gap between malformed-line error logs while reading.
const MALFORMED_LOG_GAP: Duration = Duration::from_secs(10);

/// On-disk envelope for one alert line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEnvelope {
    pub raw: String,
    pub run_id: String,
    pub ts: DateTime<Utc>,
}

struct StoreInner {
    lock: fd_lock::RwLock<std::fs::File>,
    next_offset: u64,
}

/// Append-only NDJSON alert store.
pub struct AlertStore {
    path: PathBuf,
    inner: Mutex<StoreInner>,
    /// Unix millis of the most recent append; store open time before that.
    last_append_ms: Arc<AtomicI64>,
    last_malformed_log_ms: AtomicI64,
}

impl AlertStore {
    /// Open the store, acquiring the writer lock.
    ///
    /// Fails with [`StoreError::Locked`] when another process already holds
    /// it; there is exactly one writer per alert file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(&path, e))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;

        let mut lock = fd_lock::RwLock::new(file);
        // Probe exclusivity up front so a second writer fails at startup,
        // not on its first alert.
        {
            let guard = lock.try_write().map_err(|_| StoreError::Locked {
                path: path.display().to_string(),
            })?;
            drop(guard);
        }

        let next_offset = count_lines(&path)?;
        let now = Utc::now().timestamp_millis();
        Ok(Self {
            path,
            inner: Mutex::new(StoreInner { lock, next_offset }),
            last_append_ms: Arc::new(AtomicI64::new(now)),
            last_malformed_log_ms: AtomicI64::new(0),
        })
    }

    /// Append one alert envelope; returns the assigned offset.
    pub async fn persist(&self, raw: &str, run_id: &str) -> Result<Alert, StoreError> {
        let envelope = AlertEnvelope {
            raw: raw.to_string(),
            run_id: run_id.to_string(),
            ts: Utc::now(),
        };
        let mut line = serde_json::to_string(&envelope).map_err(|e| StoreError::Corrupt {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        line.push('\n');

        let mut inner = self.inner.lock().await;
        {
            use std::io::Write;
            let mut guard = inner.lock.write().map_err(|_| StoreError::Locked {
                path: self.path.display().to_string(),
            })?;
            guard
                .write_all(line.as_bytes())
                .and_then(|_| guard.flush())
                .map_err(|e| io_err(&self.path, e))?;
        }
        let offset = inner.next_offset;
        inner.next_offset += 1;
        drop(inner);

        self.last_append_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

        let mut alert = Alert::new(envelope.raw, envelope.run_id, offset);
        alert.received_at = envelope.ts;
        Ok(alert)
    }

    /// Milliseconds since the last append (or since open when empty).
    pub fn last_append_age_ms(&self) -> i64 {
        let last = self.last_append_ms.load(Ordering::Relaxed);
        (Utc::now().timestamp_millis() - last).max(0)
    }

    /// Shared age counter for the health endpoint.
    pub fn age_handle(&self) -> Arc<AtomicI64> {
        self.last_append_ms.clone()
    }

    /// The most recent `n` alerts in receipt order.
    pub async fn latest_n(&self, n: usize) -> Result<Vec<Alert>, StoreError> {
        let all = self.read_all()?;
        let skip = all.len().saturating_sub(n);
        Ok(all.into_iter().skip(skip).collect())
    }

    /// Lazy reader over the file starting at a line offset. New appends
    /// become visible without reopening the stream.
    pub fn stream(&self, from_offset: u64, poll_interval: Duration) -> AlertStream {
        AlertStream {
            path: self.path.clone(),
            byte_pos: 0,
            line_offset: 0,
            start_offset: from_offset,
            poll_interval,
        }
    }

    fn read_all(&self) -> Result<Vec<Alert>, StoreError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| io_err(&self.path, e))?;
        let mut alerts = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AlertEnvelope>(line) {
                Ok(envelope) => {
                    let mut alert = Alert::new(envelope.raw, envelope.run_id, idx as u64);
                    alert.received_at = envelope.ts;
                    alerts.push(alert);
                }
                Err(err) => self.log_malformed(idx + 1, &err),
            }
        }
        Ok(alerts)
    }

    fn log_malformed(&self, line: usize, err: &serde_json::Error) {
        let now = Utc::now().timestamp_millis();
        let last = self.last_malformed_log_ms.load(Ordering::Relaxed);
        if now - last >= MALFORMED_LOG_GAP.as_millis() as i64
            && self
                .last_malformed_log_ms
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            tracing::error!(line, error = %err, path = %self.path.display(),
                "skipping malformed alert line");
        }
    }
}

/// Polling reader over an alert file; tolerates and skips malformed lines.
pub struct AlertStream {
    path: PathBuf,
    byte_pos: u64,
    line_offset: u64,
    start_offset: u64,
    poll_interval: Duration,
}

impl AlertStream {
    /// Next alert at or past the stream's starting offset. Waits for new
    /// appends when the file is exhausted; only complete lines are emitted.
    pub async fn next(&mut self) -> Result<Alert, StoreError> {
        loop {
            if let Some(alert) = self.read_one()? {
                return Ok(alert);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Like [`next`](Self::next) but returns `None` instead of waiting.
    pub fn try_next(&mut self) -> Result<Option<Alert>, StoreError> {
        self.read_one()
    }

    fn read_one(&mut self) -> Result<Option<Alert>, StoreError> {
        use std::io::{Read, Seek, SeekFrom};

        loop {
            let mut file = match std::fs::File::open(&self.path) {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(io_err(&self.path, e)),
            };
            file.seek(SeekFrom::Start(self.byte_pos))
                .map_err(|e| io_err(&self.path, e))?;
            let mut buf = String::new();
            file.read_to_string(&mut buf)
                .map_err(|e| io_err(&self.path, e))?;

            let Some(newline) = buf.find('\n') else {
                return Ok(None); // nothing complete yet
            };
            let line = &buf[..newline];
            self.byte_pos += newline as u64 + 1;
            let offset = self.line_offset;
            self.line_offset += 1;

            if offset < self.start_offset || line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AlertEnvelope>(line) {
                Ok(envelope) => {
                    let mut alert = Alert::new(envelope.raw, envelope.run_id, offset);
                    alert.received_at = envelope.ts;
                    return Ok(Some(alert));
                }
                Err(err) => {
                    tracing::error!(line = offset + 1, error = %err,
                        "skipping malformed alert line in stream");
                    continue;
                }
            }
        }
    }
}

fn count_lines(path: &Path) -> Result<u64, StoreError> {
    let raw = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    Ok(raw.lines().count() as u64)
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn persist_assigns_sequential_offsets() {
        let dir = tempdir().unwrap();
        let store = AlertStore::open(dir.path().join("alerts.ndjson")).unwrap();
        let a = store.persist("first", "run_test").await.unwrap();
        let b = store.persist("second", "run_test").await.unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 1);
    }

    #[tokio::test]
    async fn latest_n_returns_receipt_order() {
        let dir = tempdir().unwrap();
        let store = AlertStore::open(dir.path().join("alerts.ndjson")).unwrap();
        for i in 0..5 {
            store
                .persist(&format!("alert {i}"), "run_test")
                .await
                .unwrap();
        }
        let latest = store.latest_n(3).await.unwrap();
        assert_eq!(latest.len(), 3);
        assert_eq!(latest[0].raw_text, "alert 2");
        assert_eq!(latest[2].raw_text, "alert 4");
    }

    #[tokio::test]
    async fn offsets_resume_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alerts.ndjson");
        {
            let store = AlertStore::open(&path).unwrap();
            store.persist("one", "run_test").await.unwrap();
        }
        let store = AlertStore::open(&path).unwrap();
        let alert = store.persist("two", "run_test").await.unwrap();
        assert_eq!(alert.offset, 1);
    }

    #[tokio::test]
    async fn stream_sees_new_appends() {
        let dir = tempdir().unwrap();
        let store = AlertStore::open(dir.path().join("alerts.ndjson")).unwrap();
        let mut stream = store.stream(0, Duration::from_millis(10));

        assert!(stream.try_next().unwrap().is_none());
        store.persist("live alert", "run_test").await.unwrap();
        let alert = stream.try_next().unwrap().expect("append visible");
        assert_eq!(alert.raw_text, "live alert");
        assert!(stream.try_next().unwrap().is_none());
    }

    #[tokio::test]
    async fn stream_skips_malformed_and_respects_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alerts.ndjson");
        let store = AlertStore::open(&path).unwrap();
        store.persist("zero", "run_test").await.unwrap();
        store.persist("one", "run_test").await.unwrap();
        // Corrupt line injected by an outside writer.
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(f, "garbage not json").unwrap();
        }
        store.persist("three", "run_test").await.unwrap();

        let mut stream = store.stream(1, Duration::from_millis(10));
        assert_eq!(stream.try_next().unwrap().unwrap().raw_text, "one");
        assert_eq!(stream.try_next().unwrap().unwrap().raw_text, "three");
    }

    #[tokio::test]
    async fn malformed_lines_do_not_break_latest_n() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alerts.ndjson");
        std::fs::write(&path, "not json at all\n").unwrap();
        let store = AlertStore::open(&path).unwrap();
        store.persist("good", "run_test").await.unwrap();
        let latest = store.latest_n(10).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].raw_text, "good");
    }

    #[tokio::test]
    async fn age_counter_moves_on_persist() {
        let dir = tempdir().unwrap();
        let store = AlertStore::open(dir.path().join("alerts.ndjson")).unwrap();
        store.persist("x", "run_test").await.unwrap();
        assert!(store.last_append_age_ms() < 5_000);
    }
}
