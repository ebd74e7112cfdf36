//! Alert ingestion: the HTTP API detectors post to, and the tailer that
//! follows log files written by external detector processes.

pub mod server;
pub mod tailer;

pub use server::{IngestServer, IngestState, MAX_ALERT_BYTES};
pub use tailer::FileTailer;
