//! Processed-threat state store
//!
//! Persistent set of fingerprints that already went through planning in this
//! or an earlier process of the same run. Write-through on every mark so a
//! restart never replans a threat it already handled.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Fingerprint, StoreError};

/// Disk record for one processed fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeenRecord {
    pub first_seen_ts: DateTime<Utc>,
    pub count: u64,
}

/// Outcome of loading the state file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// File existed and parsed.
    Loaded,
    /// No prior file; starting empty.
    Fresh,
    /// File existed but was unreadable as state; reset to empty. The caller
    /// must journal this loudly — proceeding with unknown state silently is
    /// not allowed.
    CorruptReset,
}

/// Fingerprint set with JSON persistence.
pub struct StateStore {
    path: PathBuf,
    seen: HashMap<String, SeenRecord>,
}

impl StateStore {
    /// Load prior state from disk (or start fresh / reset on corruption).
    pub fn load(path: impl AsRef<Path>) -> Result<(Self, LoadOutcome), StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(&path, e))?;
        }

        let (seen, outcome) = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, SeenRecord>>(&raw) {
                Ok(map) => (map, LoadOutcome::Loaded),
                Err(err) => {
                    tracing::error!(path = %path.display(), error = %err,
                        "state file corrupt, resetting to empty");
                    (HashMap::new(), LoadOutcome::CorruptReset)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                (HashMap::new(), LoadOutcome::Fresh)
            }
            Err(e) => return Err(io_err(&path, e)),
        };

        Ok((Self { path, seen }, outcome))
    }

    pub fn seen_before(&self, fingerprint: &Fingerprint) -> bool {
        self.seen.contains_key(fingerprint.as_str())
    }

    /// Record the fingerprint as processed. Idempotent: repeats bump the
    /// count but keep `first_seen_ts`. Persisted before returning.
    pub fn mark_seen(&mut self, fingerprint: &Fingerprint) -> Result<(), StoreError> {
        self.seen
            .entry(fingerprint.as_str().to_string())
            .and_modify(|r| r.count += 1)
            .or_insert_with(|| SeenRecord {
                first_seen_ts: Utc::now(),
                count: 1,
            });
        self.flush()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Write the whole map atomically: temp file then rename.
    fn flush(&self) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(&self.seen).map_err(|e| StoreError::Corrupt {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, e))?;
        Ok(())
    }
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}
