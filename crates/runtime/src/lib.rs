//! Aegis Defender Runtime
//!
//! Turns raw intrusion-detection alerts into remediation actions executed on
//! target hosts by coder agents. The pipeline: ingest persists and fans out
//! alerts, the filter classifies and deduplicates them, the planner asks an
//! LLM for per-host remediation plans, and the executor drives each plan
//! through a coder-agent session while the journal records the timeline.

pub mod alerts;
pub mod config;
pub mod exec;
pub mod ingest;
pub mod journal;
pub mod planner;
pub mod retry;
pub mod types;

pub use alerts::{
    classify, parse, AlertSink, AlertStore, Classification, FilterConfig, StateStore,
};
pub use config::{LlmConfig, RuntimeConfig};
pub use exec::{Executor, ExecutorConfig, SessionDigest};
pub use ingest::{FileTailer, IngestServer, IngestState};
pub use journal::{Journal, JournalEntry, JournalHandle, Level};
pub use planner::{LlmClient, LlmPlanner, Planner};
pub use retry::{run_with_retry, RetryPolicy};
pub use types::*;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;

/// Capacity of the in-process alert channel between ingest and the filter.
const ALERT_CHANNEL_CAPACITY: usize = 1024;

/// Minimum gap between journaled malformed-alert errors.
const MALFORMED_JOURNAL_GAP: Duration = Duration::from_secs(10);

/// Sink implementation wiring ingest into the pipeline: persist to the
/// durable store first, then fan out over the in-process channel. The
/// NDJSON file stays the record of truth; the channel is only a fast path.
struct PipelineSink {
    store: Arc<AlertStore>,
    tx: mpsc::Sender<Alert>,
    run_id: String,
}

#[async_trait::async_trait]
impl AlertSink for PipelineSink {
    async fn accept(&self, raw: &str, run_id: Option<&str>) -> Result<Alert, StoreError> {
        let alert = self
            .store
            .persist(raw, run_id.unwrap_or(&self.run_id))
            .await?;
        if self.tx.send(alert.clone()).await.is_err() {
            tracing::warn!("pipeline channel closed; alert persisted but not dispatched");
        }
        Ok(alert)
    }
}

/// The defender supervisor: owns startup order, wiring, and shutdown.
pub struct DefenderRuntime {
    config: RuntimeConfig,
}

/// A started defender; exposes the bound ingest address and completion.
pub struct RunningDefender {
    ingest_addr: std::net::SocketAddr,
    task: tokio::task::JoinHandle<DefenderResult<()>>,
}

impl RunningDefender {
    pub fn ingest_addr(&self) -> std::net::SocketAddr {
        self.ingest_addr
    }

    /// Wait for the defender to finish its shutdown sequence.
    pub async fn wait(self) -> DefenderResult<()> {
        self.task
            .await
            .unwrap_or_else(|e| Err(DefenderError::Internal(format!("supervisor failed: {e}"))))
    }
}

impl DefenderRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// Run until the shutdown signal flips.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> DefenderResult<()> {
        self.start(shutdown).await?.wait().await
    }

    /// Start every subsystem and return once the ingest API is listening.
    ///
    /// Startup order: journal, state store, pipeline (filter, planner,
    /// executor), tailer, then the ingest API. Shutdown reverses it: the
    /// API drains first, in-flight executions get the configured grace
    /// period, and the journal is flushed last.
    pub async fn start(self, shutdown: watch::Receiver<bool>) -> DefenderResult<RunningDefender> {
        let config = self.config;
        std::fs::create_dir_all(config.run_dir())
            .map_err(|e| DefenderError::Internal(format!("cannot create run dir: {e}")))?;

        // 1. Journal first; everything else reports through it.
        let journal = Journal::spawn(config.timeline_path()).await?;
        let handle = journal.handle();
        handle
            .append(
                JournalEntry::new(Level::INIT, format!("defender starting (run {})", config.run_id))
                    .with_data(config.sanitized_snapshot()),
            )
            .await;

        // 2. Prior processed-threat state.
        let (state, load_outcome) = StateStore::load(config.state_path())?;
        if load_outcome == alerts::LoadOutcome::CorruptReset {
            handle
                .append(JournalEntry::new(
                    Level::ERROR,
                    "processed-threat state was corrupt and has been reset to empty",
                ))
                .await;
        }
        tracing::info!(known_fingerprints = state.len(), "state store loaded");

        // 3. Alert store + in-process fan-out channel.
        let store = Arc::new(AlertStore::open(config.alerts_path())?);
        let (alert_tx, alert_rx) = mpsc::channel(ALERT_CHANNEL_CAPACITY);
        let sink: Arc<dyn AlertSink> = Arc::new(PipelineSink {
            store: store.clone(),
            tx: alert_tx,
            run_id: config.run_id.clone(),
        });

        // 4. Planner and executor.
        let planner: Arc<dyn Planner> = Arc::new(LlmPlanner::new(LlmClient::new(&config.llm)?));
        let executor = Executor::new(
            ExecutorConfig {
                retry: RetryPolicy::executor(config.max_execution_retries),
                attempt_timeout: config.exec_timeout,
                concurrency: config.global_exec_concurrency,
                coder_agent_port: config.coder_agent_port,
                artifacts_dir: config.defender_dir(),
            },
            handle.clone(),
            shutdown.clone(),
        );

        // 5. Filter/dedup/planning pipeline.
        let filter_config = FilterConfig {
            min_confidence: config.min_confidence,
            ..FilterConfig::default()
        };
        let pipeline = tokio::spawn(run_pipeline(PipelineContext {
            rx: alert_rx,
            state,
            filter_config,
            planner: planner.clone(),
            planner_limit: Arc::new(Semaphore::new(config.planner_concurrency)),
            executor,
            journal: handle.clone(),
            shutdown: shutdown.clone(),
        }));

        // 6. Tailer for external detector logs.
        let tailer = FileTailer::new(
            config.tail_files.clone(),
            config.poll_interval,
            sink.clone(),
        );
        let tailer_task = tokio::spawn(tailer.run(shutdown.clone()));

        // 7. Ingest API; serves until shutdown, draining in-flight requests.
        let server = IngestServer::bind(
            "0.0.0.0",
            config.port,
            IngestState {
                sink: sink.clone(),
                planner,
                run_id: config.run_id.clone(),
                last_append_ms: store.age_handle(),
            },
        )
        .await?;
        let ingest_addr = server.local_addr();

        let task = tokio::spawn(async move {
            server.serve(shutdown.clone()).await?;

            // Shutdown: the API has drained. Drop our sink references so
            // the pipeline channel closes once the tailer is done too.
            let _ = tailer_task.await;
            drop(sink);

            tracing::info!(
                deadline_secs = config.shutdown_deadline.as_secs(),
                "waiting for in-flight executions"
            );
            let mut pipeline = pipeline;
            let pipeline_result =
                match tokio::time::timeout(config.shutdown_deadline, &mut pipeline).await {
                    Ok(joined) => joined.unwrap_or_else(|e| {
                        Err(DefenderError::Internal(format!("pipeline task failed: {e}")))
                    }),
                    Err(_) => {
                        pipeline.abort();
                        handle
                            .append(JournalEntry::new(
                                Level::ERROR,
                                "shutdown deadline expired; abandoning in-flight executions",
                            ))
                            .await;
                        Ok(())
                    }
                };

            handle
                .append(JournalEntry::new(Level::INIT, "defender stopped"))
                .await;
            drop(handle);
            journal.close().await?;

            pipeline_result
        });

        Ok(RunningDefender { ingest_addr, task })
    }
}

struct PipelineContext {
    rx: mpsc::Receiver<Alert>,
    state: StateStore,
    filter_config: FilterConfig,
    planner: Arc<dyn Planner>,
    planner_limit: Arc<Semaphore>,
    executor: Arc<Executor>,
    journal: JournalHandle,
    shutdown: watch::Receiver<bool>,
}

/// Filter + dedup task. Runs alone so journal ordering and fingerprint
/// writes stay in receipt order; planning and execution fan out from here.
async fn run_pipeline(mut ctx: PipelineContext) -> DefenderResult<()> {
    let mut tasks: JoinSet<()> = JoinSet::new();
    let mut last_malformed_journal: Option<Instant> = None;

    loop {
        let maybe_alert = tokio::select! {
            maybe_alert = ctx.rx.recv() => maybe_alert,
            changed = ctx.shutdown.changed() => {
                if changed.is_err() || *ctx.shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        let Some(alert) = maybe_alert else { break };
        handle_alert(&mut ctx, &mut tasks, &mut last_malformed_journal, alert).await?;
    }

    // Let in-flight planning/execution finish; the supervisor bounds this
    // wait with the shutdown deadline.
    while tasks.join_next().await.is_some() {}
    Ok(())
}

async fn handle_alert(
    ctx: &mut PipelineContext,
    tasks: &mut JoinSet<()>,
    last_malformed_journal: &mut Option<Instant>,
    alert: Alert,
) -> DefenderResult<()> {
    match classify(&alert, &ctx.filter_config) {
        Classification::Malformed => {
            let due = last_malformed_journal
                .map(|at| at.elapsed() >= MALFORMED_JOURNAL_GAP)
                .unwrap_or(true);
            if due {
                *last_malformed_journal = Some(Instant::now());
                ctx.journal
                    .append(JournalEntry::new(
                        Level::ERROR,
                        format!("malformed alert at offset {} dropped", alert.offset),
                    ))
                    .await;
            }
        }
        Classification::Ignore => {
            tracing::debug!(offset = alert.offset, "alert ignored by filter");
        }
        Classification::Process(facets) => {
            let fingerprint = Fingerprint::derive(&facets, &alert.raw_text);

            if ctx.state.seen_before(&fingerprint) {
                ctx.journal
                    .append(
                        JournalEntry::new(Level::ALERT, "duplicate threat, already handled")
                            .with_alert(fingerprint.prefix())
                            .with_data(serde_json::json!({ "deduped": true })),
                    )
                    .await;
                return Ok(());
            }

            // Marking happens before any plan call for this fingerprint; a
            // concurrent duplicate arriving next is deduped above.
            ctx.state.mark_seen(&fingerprint)?;

            ctx.journal
                .append(
                    JournalEntry::new(Level::ALERT, "high-confidence alert accepted")
                        .with_alert(fingerprint.prefix())
                        .with_data(serde_json::json!({
                            "offset": alert.offset,
                            "facets": facets,
                        })),
                )
                .await;

            let planner = ctx.planner.clone();
            let executor = ctx.executor.clone();
            let journal = ctx.journal.clone();
            let limit = ctx.planner_limit.clone();
            tasks.spawn(async move {
                let _permit = match limit.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                plan_and_execute(planner, executor, journal, alert, fingerprint).await;
            });
        }
    }
    Ok(())
}

/// One alert past dedup: generate plans, then fan executions out. A failing
/// alert never blocks its siblings, so every outcome ends here.
async fn plan_and_execute(
    planner: Arc<dyn Planner>,
    executor: Arc<Executor>,
    journal: JournalHandle,
    alert: Alert,
    fingerprint: Fingerprint,
) {
    match planner.generate_for(&alert, &fingerprint).await {
        Ok(plans) if !plans.is_empty() => {
            journal
                .append(
                    JournalEntry::new(
                        Level::PLAN,
                        format!("{} remediation plan(s) generated", plans.len()),
                    )
                    .with_alert(fingerprint.prefix())
                    .with_data(serde_json::json!({
                        "model": plans[0].model,
                        "targets": plans
                            .iter()
                            .map(|p| p.executor_host_ip.as_str())
                            .collect::<Vec<_>>(),
                    })),
                )
                .await;
            executor.execute(plans).await;
        }
        Ok(_) => {
            journal
                .append(
                    JournalEntry::new(Level::ERROR, "planner produced no usable plans")
                        .with_alert(fingerprint.prefix())
                        .with_data(serde_json::json!({ "kind": "planner_empty" })),
                )
                .await;
        }
        Err(err) => {
            journal
                .append(
                    JournalEntry::new(Level::ERROR, format!("plan generation failed: {err}"))
                        .with_alert(fingerprint.prefix())
                        .with_data(serde_json::json!({ "kind": err.kind() })),
                )
                .await;
        }
    }
}
