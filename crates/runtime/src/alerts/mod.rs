//! Alert handling: facet extraction, classification, durable storage, and
//! the processed-threat state used for deduplication.

pub mod filter;
pub mod parse;
pub mod state;
pub mod store;

pub use filter::{classify, Classification, FilterConfig};
pub use parse::{match_attack_class, parse, ATTACK_PATTERNS};
pub use state::{LoadOutcome, SeenRecord, StateStore};
pub use store::{AlertEnvelope, AlertStore, AlertStream};

use crate::types::{Alert, StoreError};

/// Where ingest paths hand alerts off to.
///
/// The HTTP endpoint and the file tailer both talk to this interface; the
/// supervisor injects an implementation that persists to the [`AlertStore`]
/// and fans out to the filter over an in-process channel.
#[async_trait::async_trait]
pub trait AlertSink: Send + Sync {
    /// Persist and enqueue one alert; returns the stored alert with its
    /// assigned offset.
    async fn accept(&self, raw: &str, run_id: Option<&str>) -> Result<Alert, StoreError>;
}
