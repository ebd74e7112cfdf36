//! Runtime configuration
//!
//! Everything the defender reads from its environment, validated into one
//! typed struct at startup. Missing or unparseable values are fatal; the
//! process exits 1 before any subsystem starts.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::types::ConfigError;

/// Hard ceiling on the LLM request timeout, regardless of configuration.
const LLM_TIMEOUT_CEILING_SECS: u64 = 60;

/// LLM endpoint settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// Complete defender configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Bounded operational episode; all artifacts live under its directory.
    pub run_id: String,
    /// Ingest API port.
    pub port: u16,
    /// Root under which per-run output directories are created.
    pub output_dir: PathBuf,
    pub llm: LlmConfig,
    /// Upstream log files the tailer follows; empty disables the tailer.
    pub tail_files: Vec<PathBuf>,
    /// Tailer poll interval.
    pub poll_interval: Duration,
    pub max_execution_retries: u32,
    pub exec_timeout: Duration,
    pub global_exec_concurrency: usize,
    pub planner_concurrency: usize,
    /// Coder-agent HTTP port on target hosts.
    pub coder_agent_port: u16,
    /// Filter acceptance threshold on parsed confidence.
    pub min_confidence: f64,
    /// Grace period for in-flight executions after a shutdown signal.
    pub shutdown_deadline: Duration,
}

impl RuntimeConfig {
    /// Build from process environment. `.env` loading is the caller's job.
    pub fn from_env() -> Result<Self, ConfigError> {
        let llm = LlmConfig {
            base_url: require("LLM_BASE_URL")?,
            api_key: require("LLM_API_KEY")?,
            model: string_or("LLM_MODEL", "gpt-4o"),
            temperature: parse_or("LLM_TEMPERATURE", 0.2)?,
            max_tokens: parse_or("LLM_MAX_TOKENS", 4096)?,
            timeout: Duration::from_secs(
                parse_or("LLM_TIMEOUT_SECS", LLM_TIMEOUT_CEILING_SECS)?
                    .min(LLM_TIMEOUT_CEILING_SECS),
            ),
        };

        let tail_files = std::env::var("ALERT_TAIL_FILES")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();

        let config = Self {
            run_id: string_or("RUN_ID", "run_local"),
            port: parse_or("DEFENDER_PORT", 8000)?,
            output_dir: PathBuf::from(string_or("OUTPUT_DIR", "/outputs")),
            llm,
            tail_files,
            poll_interval: Duration::from_secs(parse_or("AUTO_RESPONDER_INTERVAL_SECS", 5)?),
            max_execution_retries: parse_or("MAX_EXECUTION_RETRIES", 3)?,
            exec_timeout: Duration::from_secs(parse_or("EXEC_TIMEOUT_SECS", 600)?),
            global_exec_concurrency: parse_or("GLOBAL_EXEC_CONCURRENCY", 8)?,
            planner_concurrency: parse_or("PLANNER_CONCURRENCY", 4)?,
            coder_agent_port: parse_or("CODER_AGENT_PORT", 4096)?,
            min_confidence: parse_or("FILTER_MIN_CONFIDENCE", 0.8)?,
            shutdown_deadline: Duration::from_secs(parse_or("SHUTDOWN_DEADLINE_SECS", 30)?),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.run_id.trim().is_empty() {
            return Err(ConfigError::Invalid("RUN_ID must not be empty".into()));
        }
        if self.run_id.contains(['/', '\\']) {
            return Err(ConfigError::Invalid(
                "RUN_ID must not contain path separators".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigError::Invalid(
                "FILTER_MIN_CONFIDENCE must be within [0, 1]".into(),
            ));
        }
        if self.global_exec_concurrency == 0 || self.planner_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "concurrency caps must be at least 1".into(),
            ));
        }
        if self.max_execution_retries == 0 {
            return Err(ConfigError::Invalid(
                "MAX_EXECUTION_RETRIES must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// `{output_dir}/{run_id}` — root of this run's artifacts.
    pub fn run_dir(&self) -> PathBuf {
        self.output_dir.join(&self.run_id)
    }

    /// Alert store NDJSON.
    pub fn alerts_path(&self) -> PathBuf {
        self.run_dir().join("slips").join("defender_alerts.ndjson")
    }

    /// Processed-fingerprint state.
    pub fn state_path(&self) -> PathBuf {
        self.run_dir().join("processed_alerts.json")
    }

    /// Structured timeline.
    pub fn timeline_path(&self) -> PathBuf {
        self.run_dir().join("auto_responder_timeline.jsonl")
    }

    /// Human-readable log tee; not authoritative.
    pub fn detailed_log_path(&self) -> PathBuf {
        self.run_dir().join("auto_responder_detailed.log")
    }

    /// Per-host execution artifacts root.
    pub fn defender_dir(&self) -> PathBuf {
        self.run_dir().join("defender")
    }

    /// Snapshot for the `INIT` journal entry, with secrets scrubbed.
    pub fn sanitized_snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "run_id": self.run_id,
            "port": self.port,
            "output_dir": self.output_dir,
            "llm": {
                "base_url": self.llm.base_url,
                "api_key": "***",
                "model": self.llm.model,
                "temperature": self.llm.temperature,
                "max_tokens": self.llm.max_tokens,
                "timeout_secs": self.llm.timeout.as_secs(),
            },
            "tail_files": self.tail_files,
            "poll_interval_secs": self.poll_interval.as_secs(),
            "max_execution_retries": self.max_execution_retries,
            "exec_timeout_secs": self.exec_timeout.as_secs(),
            "global_exec_concurrency": self.global_exec_concurrency,
            "planner_concurrency": self.planner_concurrency,
            "coder_agent_port": self.coder_agent_port,
            "min_confidence": self.min_confidence,
            "shutdown_deadline_secs": self.shutdown_deadline.as_secs(),
        })
    }
}

fn require(name: &str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingVar(name.to_string())),
    }
}

fn string_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_or<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|e| {
            ConfigError::Invalid(format!("{name}={raw} is not valid: {e}"))
        }),
        _ => Ok(default),
    }
}
