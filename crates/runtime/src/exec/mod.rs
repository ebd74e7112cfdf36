//! Plan execution: coder-agent sessions, per-execution digests, and the
//! bounded parallel executor.

pub mod digest;
pub mod executor;
pub mod session;

pub use digest::{SessionDigest, ToolInvocation};
pub use executor::{Executor, ExecutorConfig};
pub use session::{CoderClient, EventStream};
