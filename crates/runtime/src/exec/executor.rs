//! Parallel remediation executor
//!
//! Fans plans out to their target hosts, bounded by a global concurrency
//! cap. Each plan gets its own task; each attempt gets a fresh session and
//! its own deadline. Retryable failures back off 10 s / 20 s / 30 s between
//! attempts. At most one execution per `(fingerprint, host)` per run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashSet;
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;

use crate::exec::digest::SessionDigest;
use crate::exec::session::CoderClient;
use crate::journal::{JournalEntry, JournalHandle, Level};
use crate::retry::{run_with_retry, RetryPolicy};
use crate::types::{ExecutionId, ExecutionResult, ExecutionStatus, Plan, SessionError};

/// How often the status probe runs while the event stream is quiet.
const STATUS_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Executor tuning; all values come from the runtime configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Attempt bound and backoff schedule per plan.
    pub retry: RetryPolicy,
    /// Per-attempt deadline.
    pub attempt_timeout: Duration,
    /// Global cap on concurrently running attempts.
    pub concurrency: usize,
    /// Coder-agent HTTP port on target hosts.
    pub coder_agent_port: u16,
    /// Root for per-host raw artifacts (`defender/{host_tag}/...`).
    pub artifacts_dir: PathBuf,
}

/// Plan executor shared by all pipeline tasks.
pub struct Executor {
    config: ExecutorConfig,
    semaphore: Arc<Semaphore>,
    journal: JournalHandle,
    claimed: DashSet<String>,
    http: reqwest::Client,
    shutdown: watch::Receiver<bool>,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        journal: JournalHandle,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        let http = CoderClient::build_pool().unwrap_or_default();
        Arc::new(Self {
            config,
            semaphore,
            journal,
            claimed: DashSet::new(),
            http,
            shutdown,
        })
    }

    /// Execute every plan of one alert in parallel and wait for all of them.
    ///
    /// Plans whose `(fingerprint, host)` pair already ran this run are
    /// skipped and produce no result.
    pub async fn execute(self: Arc<Self>, plans: Vec<Plan>) -> Vec<ExecutionResult> {
        let mut tasks = Vec::new();
        for plan in plans {
            let execution_id = ExecutionId::derive(&plan.fingerprint, &plan.executor_host_ip);
            if !self.claimed.insert(execution_id.as_str().to_string()) {
                tracing::debug!(
                    exec = execution_id.prefix(),
                    host = %plan.executor_host_ip,
                    "execution already claimed, skipping duplicate plan"
                );
                continue;
            }
            let executor = Arc::clone(&self);
            tasks.push(tokio::spawn(async move {
                executor.run_plan(plan, execution_id).await
            }));
        }

        futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(result) => Some(result),
                Err(err) => {
                    tracing::error!(error = %err, "execution task panicked");
                    None
                }
            })
            .collect()
    }

    /// One plan: queue for a permit, run attempts with backoff, journal the
    /// terminal `DONE` entry, write artifacts.
    async fn run_plan(self: Arc<Self>, plan: Plan, execution_id: ExecutionId) -> ExecutionResult {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("executor semaphore closed");

        let started_at = Utc::now();
        let host_tag = plan.executor_host_ip.replace('.', "-");

        let outcome = run_with_retry(
            &self.config.retry,
            Some(self.shutdown.clone()),
            |attempt| self.run_attempt(&plan, &execution_id, &host_tag, attempt),
            SessionError::is_retryable,
        )
        .await;

        let (status, digest) = match outcome.result {
            Ok(digest) => (ExecutionStatus::Success, digest),
            Err(err) => {
                tracing::warn!(
                    exec = execution_id.prefix(),
                    host = %plan.executor_host_ip,
                    attempts = outcome.attempts,
                    error = %err,
                    "plan execution failed"
                );
                (err.status(), SessionDigest::default())
            }
        };

        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds();

        self.journal
            .append(
                JournalEntry::new(
                    Level::DONE,
                    format!(
                        "execution on {} finished: {}",
                        plan.executor_host_ip, status
                    ),
                )
                .with_alert(plan.fingerprint.prefix())
                .with_exec(execution_id.prefix())
                .with_data(serde_json::json!({
                    "status": status,
                    "executor_host_ip": plan.executor_host_ip,
                    "attempts_used": outcome.attempts,
                    "duration_ms": duration_ms,
                    "digest": digest.summary(),
                })),
            )
            .await;

        self.write_message_digest(&host_tag, &digest);

        ExecutionResult {
            execution_id,
            executor_host_ip: plan.executor_host_ip.clone(),
            status,
            attempts_used: outcome.attempts,
            started_at,
            finished_at,
            digest,
        }
    }

    /// One attempt: fresh session, submit, follow events until the terminal
    /// message, an idle probe, or the deadline.
    async fn run_attempt(
        &self,
        plan: &Plan,
        execution_id: &ExecutionId,
        host_tag: &str,
        attempt: u32,
    ) -> Result<SessionDigest, SessionError> {
        let timeout = self.config.attempt_timeout;
        self.journal
            .append(
                JournalEntry::new(
                    Level::SSH,
                    format!(
                        "connecting to coder agent on {} (attempt {attempt})",
                        plan.executor_host_ip
                    ),
                )
                .with_alert(plan.fingerprint.prefix())
                .with_exec(execution_id.prefix())
                .with_data(serde_json::json!({
                    "target_ip": plan.executor_host_ip,
                    "attempt": attempt,
                    "timeout_secs": timeout.as_secs(),
                })),
            )
            .await;

        let deadline = Instant::now() + timeout;
        let client = CoderClient::new(
            self.http.clone(),
            &plan.executor_host_ip,
            self.config.coder_agent_port,
        );

        let session_id = self
            .bounded(deadline, client.create_session())
            .await??;
        let mut digest = SessionDigest::new(session_id.clone());

        match self
            .bounded(deadline, client.submit(&session_id, &plan.plan_text))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) | Err(err) => {
                client.abort(&session_id).await;
                return Err(err);
            }
        }

        let mut events = match self.bounded(deadline, client.open_events(&session_id)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) | Err(err) => {
                client.abort(&session_id).await;
                return Err(err);
            }
        };

        let mut probe = tokio::time::interval_at(
            Instant::now() + STATUS_PROBE_INTERVAL,
            STATUS_PROBE_INTERVAL,
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    client.abort(&session_id).await;
                    return Err(SessionError::Deadline { seconds: timeout.as_secs() });
                }
                event = events.next_event() => {
                    match event? {
                        Some(event) => {
                            digest.record(&event);
                            self.append_sse_artifact(host_tag, &event);
                            self.journal
                                .append(
                                    JournalEntry::new(Level::EXEC, "agent event")
                                        .with_alert(plan.fingerprint.prefix())
                                        .with_exec(execution_id.prefix())
                                        .with_data(event.clone()),
                                )
                                .await;
                            if SessionDigest::is_terminal(&event) {
                                return Ok(digest);
                            }
                        }
                        None => {
                            // Stream closed without a terminal message; the
                            // probe settles whether the session finished.
                            return match client.status_idle().await {
                                Ok(true) => Ok(digest),
                                Ok(false) => Err(SessionError::Stream(
                                    "event stream closed while session busy".to_string(),
                                )),
                                Err(err) => Err(err),
                            };
                        }
                    }
                }
                _ = probe.tick() => {
                    match client.status_idle().await {
                        Ok(true) => return Ok(digest),
                        Ok(false) => {}
                        Err(err) => tracing::debug!(error = %err, "status probe failed"),
                    }
                }
            }
        }
    }

    /// Bound a session call by the attempt deadline.
    async fn bounded<T>(
        &self,
        deadline: Instant,
        fut: impl std::future::Future<Output = T>,
    ) -> Result<T, SessionError> {
        tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| SessionError::Deadline {
                seconds: self.config.attempt_timeout.as_secs(),
            })
    }

    fn host_dir(&self, host_tag: &str) -> PathBuf {
        self.config.artifacts_dir.join(host_tag)
    }

    /// Append one raw event line to the per-host stream artifact.
    fn append_sse_artifact(&self, host_tag: &str, event: &serde_json::Value) {
        use std::io::Write;
        let dir = self.host_dir(host_tag);
        let result = std::fs::create_dir_all(&dir).and_then(|_| {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("opencode_sse_events.jsonl"))?;
            writeln!(file, "{event}")
        });
        if let Err(err) = result {
            tracing::warn!(host = host_tag, error = %err, "failed to write sse artifact");
        }
    }

    /// Write the final message digest artifact for the host.
    fn write_message_digest(&self, host_tag: &str, digest: &SessionDigest) {
        let dir = self.host_dir(host_tag);
        let result = std::fs::create_dir_all(&dir).and_then(|_| {
            let json = serde_json::to_string_pretty(digest).unwrap_or_else(|_| "{}".to_string());
            std::fs::write(dir.join("opencode_api_messages.json"), json)
        });
        if let Err(err) = result {
            tracing::warn!(host = host_tag, error = %err, "failed to write message digest");
        }
    }
}
