//! Upstream log tailer
//!
//! Follows append-only files written by external detector processes and
//! feeds each new complete line into the alert sink. The in-process channel
//! carries co-resident alerts; this path exists only for producers outside
//! the process, so plain interval polling is enough.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::alerts::AlertSink;

/// Polling tailer over one or more upstream log files.
pub struct FileTailer {
    files: Vec<PathBuf>,
    interval: Duration,
    sink: Arc<dyn AlertSink>,
    positions: HashMap<PathBuf, u64>,
}

impl FileTailer {
    pub fn new(files: Vec<PathBuf>, interval: Duration, sink: Arc<dyn AlertSink>) -> Self {
        Self {
            files,
            interval,
            sink,
            positions: HashMap::new(),
        }
    }

    /// Poll until shutdown. Missing files are tolerated (the detector may
    /// not have started yet); truncation resets the position.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if self.files.is_empty() {
            return;
        }
        tracing::info!(files = self.files.len(), "file tailer started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => self.poll_all().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("file tailer stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn poll_all(&mut self) {
        for path in self.files.clone() {
            if let Err(err) = self.poll_file(&path).await {
                tracing::warn!(path = %path.display(), error = %err, "tail poll failed");
            }
        }
    }

    async fn poll_file(&mut self, path: &PathBuf) -> std::io::Result<()> {
        use std::io::{Read, Seek, SeekFrom};

        let mut file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        let len = file.metadata()?.len();
        let pos = self.positions.entry(path.clone()).or_insert(0);
        if len < *pos {
            tracing::warn!(path = %path.display(), "tailed file truncated, restarting from 0");
            *pos = 0;
        }

        file.seek(SeekFrom::Start(*pos))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;

        // Only consume up to the last complete line; a partial tail stays
        // for the next poll.
        let consumed = match buf.rfind('\n') {
            Some(idx) => idx + 1,
            None => return Ok(()),
        };
        let complete = &buf[..consumed];
        *pos += consumed as u64;

        for line in complete.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Err(err) = self.sink.accept(line, None).await {
                tracing::error!(error = %err, "tailer failed to hand off alert");
            }
        }
        Ok(())
    }
}
