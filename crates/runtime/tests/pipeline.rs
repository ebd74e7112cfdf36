//! End-to-end pipeline tests
//!
//! The full defender runs against in-process mock services: an
//! OpenAI-compatible LLM endpoint and a coder agent speaking the session
//! API. Everything binds ephemeral loopback ports; no network, no external
//! processes.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::watch;

use aegis_runtime::journal::{read_entries, JournalEntry, Level};
use aegis_runtime::{
    DefenderRuntime, Executor, ExecutorConfig, ExecutionStatus, Fingerprint, Journal, LlmConfig,
    ParsedFacets, Plan, RetryPolicy, RuntimeConfig,
};

const SCAN_ALERT: &str = "2026-01-20T10:00:00Z Src IP 10.0.0.5. Detected horizontal port scan \
                          to port 22/TCP. Confidence: 0.9. threat level: high.";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

// --- mock LLM -----------------------------------------------------------

struct MockLlm {
    responses: Vec<String>,
    calls: AtomicU32,
}

async fn chat_completions(State(state): State<Arc<MockLlm>>) -> impl IntoResponse {
    let call = state.calls.fetch_add(1, Ordering::SeqCst) as usize;
    let content = state
        .responses
        .get(call.min(state.responses.len().saturating_sub(1)))
        .cloned()
        .unwrap_or_else(|| "[]".to_string());
    Json(serde_json::json!({
        "model": "mock-model",
        "choices": [{ "message": { "role": "assistant", "content": content } }],
        "usage": { "prompt_tokens": 42, "completion_tokens": 17, "total_tokens": 59 }
    }))
}

async fn spawn_mock_llm(responses: Vec<&str>) -> (SocketAddr, Arc<MockLlm>) {
    let state = Arc::new(MockLlm {
        responses: responses.into_iter().map(String::from).collect(),
        calls: AtomicU32::new(0),
    });
    let app = Router::new()
        .route("/chat/completions", post(chat_completions))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (addr, state)
}

// --- mock coder agent ---------------------------------------------------

struct MockAgent {
    /// First event-stream open hangs past any deadline when set.
    hang_first_events: bool,
    event_delay: Duration,
    opens: AtomicU32,
    aborts: AtomicU32,
    sessions: AtomicU32,
}

async fn create_session(State(state): State<Arc<MockAgent>>) -> impl IntoResponse {
    let n = state.sessions.fetch_add(1, Ordering::SeqCst);
    Json(serde_json::json!({ "id": format!("ses_{n}") }))
}

async fn post_message() -> impl IntoResponse {
    (axum::http::StatusCode::ACCEPTED, Json(serde_json::json!({})))
}

async fn session_events(State(state): State<Arc<MockAgent>>) -> impl IntoResponse {
    let open = state.opens.fetch_add(1, Ordering::SeqCst);
    if state.hang_first_events && open == 0 {
        return Body::from_stream(futures::stream::pending::<Result<Bytes, Infallible>>());
    }
    let delay = state.event_delay;
    let tool_line = concat!(
        r#"{"type":"tool","tool":"bash","state":{"status":"completed","#,
        r#""input":"ss -ltn","output":"LISTEN 0 128"}}"#,
        "\n"
    );
    let terminal_line = concat!(
        r#"{"type":"message","role":"assistant","finish":"stop","#,
        r#""tokens":{"input":120,"output":30},"cost":0.012}"#,
        "\n"
    );
    Body::from_stream(futures::stream::unfold(0u8, move |step| async move {
        match step {
            0 => Some((Ok::<_, Infallible>(Bytes::from(tool_line)), 1)),
            1 => {
                tokio::time::sleep(delay).await;
                Some((Ok(Bytes::from(terminal_line)), 2))
            }
            _ => None,
        }
    }))
}

async fn session_status() -> impl IntoResponse {
    Json(serde_json::json!({}))
}

async fn abort_session(State(state): State<Arc<MockAgent>>) -> impl IntoResponse {
    state.aborts.fetch_add(1, Ordering::SeqCst);
    Json(serde_json::json!({ "aborted": true }))
}

/// Binds on 0.0.0.0 so both 127.0.0.1 and 127.0.0.2 reach it.
async fn spawn_mock_agent(hang_first_events: bool, event_delay: Duration) -> (u16, Arc<MockAgent>) {
    let state = Arc::new(MockAgent {
        hang_first_events,
        event_delay,
        opens: AtomicU32::new(0),
        aborts: AtomicU32::new(0),
        sessions: AtomicU32::new(0),
    });
    let app = Router::new()
        .route("/session", post(create_session))
        .route("/session/:id/message", post(post_message))
        .route("/session/:id/events", get(session_events))
        .route("/session/status", get(session_status))
        .route("/session/:id/abort", post(abort_session))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("0.0.0.0:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (port, state)
}

// --- harness ------------------------------------------------------------

fn test_config(dir: &Path, llm_addr: SocketAddr, agent_port: u16) -> RuntimeConfig {
    RuntimeConfig {
        run_id: "run_test".to_string(),
        port: 0,
        output_dir: dir.to_path_buf(),
        llm: LlmConfig {
            base_url: format!("http://{llm_addr}"),
            api_key: "test-key".to_string(),
            model: "mock-model".to_string(),
            temperature: 0.0,
            max_tokens: 512,
            timeout: Duration::from_secs(5),
        },
        tail_files: vec![],
        poll_interval: Duration::from_secs(1),
        max_execution_retries: 3,
        exec_timeout: Duration::from_secs(5),
        global_exec_concurrency: 8,
        planner_concurrency: 4,
        coder_agent_port: agent_port,
        min_confidence: 0.8,
        shutdown_deadline: Duration::from_secs(10),
    }
}

fn timeline(entries_dir: &Path) -> std::path::PathBuf {
    entries_dir.join("run_test").join("auto_responder_timeline.jsonl")
}

async fn post_alert(addr: SocketAddr, raw: &str) -> serde_json::Value {
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/alerts"))
        .json(&serde_json::json!({ "raw": raw }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    resp.json().await.unwrap()
}

/// Poll the timeline until the predicate holds or the deadline passes.
async fn wait_for(
    path: &Path,
    deadline: Duration,
    pred: impl Fn(&[JournalEntry]) -> bool,
) -> Vec<JournalEntry> {
    let started = tokio::time::Instant::now();
    loop {
        let entries = read_entries(path).unwrap_or_default();
        if pred(&entries) {
            return entries;
        }
        if started.elapsed() > deadline {
            panic!(
                "timeline predicate not satisfied within {deadline:?}; entries: {entries:#?}"
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn count(entries: &[JournalEntry], level: Level) -> usize {
    entries.iter().filter(|e| e.level == level).count()
}

// --- scenarios ----------------------------------------------------------

#[tokio::test]
async fn port_scan_single_host_success() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (llm_addr, _llm) = spawn_mock_llm(vec![
        "```json\n[{\"executor_host_ip\": \"127.0.0.1\", \"plan\": \"Inspect sshd and block the scanner\"}]\n```",
    ])
    .await;
    let (agent_port, _agent) = spawn_mock_agent(false, Duration::from_millis(50)).await;

    let config = test_config(dir.path(), llm_addr, agent_port);
    let (tx, rx) = watch::channel(false);
    let running = DefenderRuntime::new(config).start(rx).await.unwrap();

    let ack = post_alert(running.ingest_addr(), SCAN_ALERT).await;
    assert_eq!(ack["accepted"], true);
    assert_eq!(ack["offset"], 0);

    let entries = wait_for(&timeline(dir.path()), Duration::from_secs(10), |e| {
        count(e, Level::DONE) == 1
    })
    .await;

    assert_eq!(count(&entries, Level::ALERT), 1);
    assert_eq!(count(&entries, Level::PLAN), 1);
    assert_eq!(count(&entries, Level::SSH), 1);
    assert!(count(&entries, Level::EXEC) >= 1);

    let plan = entries.iter().find(|e| e.level == Level::PLAN).unwrap();
    assert_eq!(plan.data.as_ref().unwrap()["targets"][0], "127.0.0.1");

    let ssh = entries.iter().find(|e| e.level == Level::SSH).unwrap();
    assert_eq!(ssh.data.as_ref().unwrap()["attempt"], 1);

    let done = entries.iter().find(|e| e.level == Level::DONE).unwrap();
    assert_eq!(done.data.as_ref().unwrap()["status"], "success");
    assert_eq!(done.data.as_ref().unwrap()["attempts_used"], 1);

    // Causal order within the execution.
    let execs: Vec<_> = entries.iter().filter(|e| e.level == Level::EXEC).collect();
    assert!(ssh.ts <= execs[0].ts);
    assert!(execs.last().unwrap().ts <= done.ts);

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(11), running.wait())
        .await
        .expect("shutdown within deadline + 1s")
        .unwrap();
}

#[tokio::test]
async fn duplicate_alert_is_planned_once() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (llm_addr, llm) = spawn_mock_llm(vec![
        "[{\"executor_host_ip\": \"127.0.0.1\", \"plan\": \"rotate ssh keys\"}]",
    ])
    .await;
    let (agent_port, _agent) = spawn_mock_agent(false, Duration::from_millis(20)).await;

    let config = test_config(dir.path(), llm_addr, agent_port);
    let (tx, rx) = watch::channel(false);
    let running = DefenderRuntime::new(config).start(rx).await.unwrap();

    post_alert(running.ingest_addr(), SCAN_ALERT).await;
    post_alert(running.ingest_addr(), SCAN_ALERT).await;

    let entries = wait_for(&timeline(dir.path()), Duration::from_secs(10), |e| {
        count(e, Level::DONE) == 1 && count(e, Level::ALERT) == 2
    })
    .await;

    assert_eq!(count(&entries, Level::PLAN), 1);
    assert_eq!(count(&entries, Level::DONE), 1);
    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);

    let deduped: Vec<_> = entries
        .iter()
        .filter(|e| {
            e.level == Level::ALERT
                && e.data
                    .as_ref()
                    .is_some_and(|d| d["deduped"] == true)
        })
        .collect();
    assert_eq!(deduped.len(), 1);

    tx.send(true).unwrap();
    running.wait().await.unwrap();
}

#[tokio::test]
async fn malformed_llm_output_marks_seen_without_execution() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (llm_addr, llm) = spawn_mock_llm(vec!["sorry I cannot help"]).await;
    let (agent_port, agent) = spawn_mock_agent(false, Duration::from_millis(20)).await;

    let config = test_config(dir.path(), llm_addr, agent_port);
    let (tx, rx) = watch::channel(false);
    let running = DefenderRuntime::new(config).start(rx).await.unwrap();

    post_alert(running.ingest_addr(), SCAN_ALERT).await;

    let entries = wait_for(&timeline(dir.path()), Duration::from_secs(10), |e| {
        e.iter().any(|entry| {
            entry.level == Level::ERROR
                && entry
                    .data
                    .as_ref()
                    .is_some_and(|d| d["kind"] == "planner_malformed")
        })
    })
    .await;

    assert_eq!(count(&entries, Level::PLAN), 0);
    assert_eq!(count(&entries, Level::SSH), 0);
    assert_eq!(agent.sessions.load(Ordering::SeqCst), 0);
    // Malformed output is not retried.
    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);

    // The fingerprint stays marked: a replay dedupes instead of replanning.
    post_alert(running.ingest_addr(), SCAN_ALERT).await;
    wait_for(&timeline(dir.path()), Duration::from_secs(5), |e| {
        e.iter().any(|entry| {
            entry.level == Level::ALERT
                && entry.data.as_ref().is_some_and(|d| d["deduped"] == true)
        })
    })
    .await;
    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);

    tx.send(true).unwrap();
    running.wait().await.unwrap();
}

#[tokio::test]
async fn two_plans_fan_out_in_parallel() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (llm_addr, _llm) = spawn_mock_llm(vec![
        "[{\"executor_host_ip\":\"127.0.0.1\",\"plan\":\"A\"},{\"executor_host_ip\":\"127.0.0.2\",\"plan\":\"B\"}]",
    ])
    .await;
    // Slow terminal event keeps both executions in flight together.
    let (agent_port, _agent) = spawn_mock_agent(false, Duration::from_millis(400)).await;

    let config = test_config(dir.path(), llm_addr, agent_port);
    let (tx, rx) = watch::channel(false);
    let running = DefenderRuntime::new(config).start(rx).await.unwrap();

    post_alert(running.ingest_addr(), SCAN_ALERT).await;

    let entries = wait_for(&timeline(dir.path()), Duration::from_secs(10), |e| {
        count(e, Level::DONE) == 2
    })
    .await;

    assert_eq!(count(&entries, Level::SSH), 2);
    let done_hosts: Vec<_> = entries
        .iter()
        .filter(|e| e.level == Level::DONE)
        .map(|e| e.data.as_ref().unwrap()["executor_host_ip"].clone())
        .collect();
    assert!(done_hosts.contains(&serde_json::json!("127.0.0.1")));
    assert!(done_hosts.contains(&serde_json::json!("127.0.0.2")));

    // Overlap: both attempts started before either finished.
    let ssh_ts: Vec<_> = entries
        .iter()
        .filter(|e| e.level == Level::SSH)
        .map(|e| e.ts)
        .collect();
    let done_ts: Vec<_> = entries
        .iter()
        .filter(|e| e.level == Level::DONE)
        .map(|e| e.ts)
        .collect();
    assert!(ssh_ts.iter().max().unwrap() <= done_ts.iter().min().unwrap());

    tx.send(true).unwrap();
    running.wait().await.unwrap();
}

#[tokio::test]
async fn control_message_produces_no_work() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (llm_addr, llm) = spawn_mock_llm(vec!["[]"]).await;
    let (agent_port, _agent) = spawn_mock_agent(false, Duration::from_millis(20)).await;

    let config = test_config(dir.path(), llm_addr, agent_port);
    let (tx, rx) = watch::channel(false);
    let running = DefenderRuntime::new(config).start(rx).await.unwrap();

    let ack = post_alert(
        running.ingest_addr(),
        "queued: processing pcap router_001.pcap",
    )
    .await;
    assert_eq!(ack["accepted"], true);

    // Give the pipeline time to (not) act.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let entries = read_entries(&timeline(dir.path())).unwrap_or_default();
    assert_eq!(count(&entries, Level::ALERT), 0);
    assert_eq!(count(&entries, Level::PLAN), 0);
    assert_eq!(count(&entries, Level::SSH), 0);
    assert_eq!(llm.calls.load(Ordering::SeqCst), 0);

    tx.send(true).unwrap();
    running.wait().await.unwrap();
}

#[tokio::test]
async fn timed_out_attempt_is_retried_to_success() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    // First event stream hangs; the attempt deadline must cut it off.
    let (agent_port, agent) = spawn_mock_agent(true, Duration::from_millis(20)).await;

    let journal = Journal::spawn(dir.path().join("timeline.jsonl")).await.unwrap();
    let (_tx, rx) = watch::channel(false);
    let executor = Executor::new(
        ExecutorConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                delays: vec![Duration::from_millis(200)],
            },
            attempt_timeout: Duration::from_millis(600),
            concurrency: 4,
            coder_agent_port: agent_port,
            artifacts_dir: dir.path().join("defender"),
        },
        journal.handle(),
        rx,
    );

    let fingerprint = Fingerprint::derive(&ParsedFacets::Unparsed, SCAN_ALERT);
    let results = executor
        .execute(vec![Plan {
            fingerprint,
            executor_host_ip: "127.0.0.1".to_string(),
            plan_text: "kill the scanner process".to_string(),
            model: "mock-model".to_string(),
            created_at: chrono::Utc::now(),
        }])
        .await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ExecutionStatus::Success);
    assert_eq!(results[0].attempts_used, 2);
    assert!(agent.aborts.load(Ordering::SeqCst) >= 1);

    journal.close().await.unwrap();
    let entries = read_entries(dir.path().join("timeline.jsonl")).unwrap();
    let attempts: Vec<_> = entries
        .iter()
        .filter(|e| e.level == Level::SSH)
        .map(|e| e.data.as_ref().unwrap()["attempt"].as_u64().unwrap())
        .collect();
    assert_eq!(attempts, vec![1, 2]);
    let done = entries.iter().find(|e| e.level == Level::DONE).unwrap();
    assert_eq!(done.data.as_ref().unwrap()["attempts_used"], 2);
    assert_eq!(done.data.as_ref().unwrap()["status"], "success");
}

#[tokio::test]
async fn state_survives_restart_within_a_run() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (llm_addr, llm) = spawn_mock_llm(vec![
        "[{\"executor_host_ip\":\"127.0.0.1\",\"plan\":\"inspect\"}]",
    ])
    .await;
    let (agent_port, _agent) = spawn_mock_agent(false, Duration::from_millis(20)).await;

    {
        let config = test_config(dir.path(), llm_addr, agent_port);
        let (tx, rx) = watch::channel(false);
        let running = DefenderRuntime::new(config).start(rx).await.unwrap();
        post_alert(running.ingest_addr(), SCAN_ALERT).await;
        wait_for(&timeline(dir.path()), Duration::from_secs(10), |e| {
            count(e, Level::DONE) == 1
        })
        .await;
        tx.send(true).unwrap();
        running.wait().await.unwrap();
    }

    // Second process of the same run: the fingerprint is already seen.
    let config = test_config(dir.path(), llm_addr, agent_port);
    let (tx, rx) = watch::channel(false);
    let running = DefenderRuntime::new(config).start(rx).await.unwrap();
    post_alert(running.ingest_addr(), SCAN_ALERT).await;
    wait_for(&timeline(dir.path()), Duration::from_secs(5), |e| {
        e.iter().any(|entry| {
            entry.level == Level::ALERT
                && entry.data.as_ref().is_some_and(|d| d["deduped"] == true)
        })
    })
    .await;
    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);

    tx.send(true).unwrap();
    running.wait().await.unwrap();
}
