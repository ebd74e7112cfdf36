//! Remediation plan generation
//!
//! Builds a prompt from the raw alert text, queries the configured LLM, and
//! extracts a validated list of per-host plans from the reply. The model is
//! asked for a bare JSON array but replies routinely arrive wrapped in code
//! fences or commentary, so extraction scans for the first well-formed array
//! instead of parsing the body whole.

pub mod llm_client;

pub use llm_client::{ChatCompletion, LlmClient, TokenUsage};

use std::net::Ipv4Addr;

use chrono::Utc;

use crate::retry::{run_with_retry, RetryPolicy};
use crate::types::{Alert, Fingerprint, Plan, PlannerError};

/// System directive sent with every planning request.
const SYSTEM_DIRECTIVE: &str = "You are the planning component of an autonomous network \
defender. Given one intrusion-detection alert, decide which hosts need remediation and \
what a coding agent on each host should do. Respond with a JSON array only, no prose: \
[{\"executor_host_ip\": \"<IPv4 of the host to act on>\", \"plan\": \"<step-by-step \
remediation instructions>\"}]. Return an entry per affected host; return [] when no \
action is warranted.";

/// Plan generation interface injected into the pipeline and the debug
/// endpoint.
#[async_trait::async_trait]
pub trait Planner: Send + Sync {
    /// Produce zero or more plans for the alert.
    ///
    /// `Ok(vec![])` means the model decided no action is warranted; the
    /// caller journals it and moves on. `PlannerError::Malformed` is
    /// terminal for the alert, every other error kind has already been
    /// retried internally.
    async fn generate_for(&self, alert: &Alert, fingerprint: &Fingerprint)
        -> Result<Vec<Plan>, PlannerError>;
}

/// LLM-backed planner with retry on transient upstream failures.
pub struct LlmPlanner {
    client: LlmClient,
    retry: RetryPolicy,
}

impl LlmPlanner {
    pub fn new(client: LlmClient) -> Self {
        Self {
            client,
            retry: RetryPolicy::planner(),
        }
    }
}

#[async_trait::async_trait]
impl Planner for LlmPlanner {
    async fn generate_for(
        &self,
        alert: &Alert,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<Plan>, PlannerError> {
        let user_prompt = format!("Alert:\n{}", alert.raw_text);

        let outcome = run_with_retry(
            &self.retry,
            None,
            |attempt| {
                if attempt > 1 {
                    tracing::warn!(alert = fingerprint.prefix(), attempt, "retrying LLM call");
                }
                self.client.chat_completion(SYSTEM_DIRECTIVE, &user_prompt)
            },
            PlannerError::is_transient,
        )
        .await;

        let completion = outcome.result?;
        let specs = extract_plan_specs(&completion.content)?;

        let mut plans = Vec::new();
        let mut dropped = 0usize;
        for spec in specs {
            match validate_spec(&spec) {
                Some((host, text)) => plans.push(Plan {
                    fingerprint: fingerprint.clone(),
                    executor_host_ip: host,
                    plan_text: text,
                    model: completion.model.clone(),
                    created_at: Utc::now(),
                }),
                None => dropped += 1,
            }
        }
        if dropped > 0 {
            tracing::warn!(
                alert = fingerprint.prefix(),
                dropped,
                "dropped invalid plan entries from LLM output"
            );
        }
        Ok(plans)
    }
}

/// Find the first well-formed JSON array in the content and return its
/// elements. Tolerates code fences, surrounding whitespace, and trailing
/// commentary; fails with `Malformed` when no array can be recovered.
pub fn extract_plan_specs(content: &str) -> Result<Vec<serde_json::Value>, PlannerError> {
    let stripped = strip_code_fences(content);

    let bytes = stripped.as_bytes();
    let mut search_from = 0;
    while let Some(rel) = stripped[search_from..].find('[') {
        let start = search_from + rel;
        if let Some(end) = matching_bracket(bytes, start) {
            let candidate = &stripped[start..=end];
            if let Ok(serde_json::Value::Array(items)) =
                serde_json::from_str::<serde_json::Value>(candidate)
            {
                return Ok(items);
            }
        }
        search_from = start + 1;
    }

    Err(PlannerError::Malformed {
        preview: preview(content),
    })
}

/// Index of the `]` closing the `[` at `start`, honouring strings and
/// escapes; `None` when unbalanced.
fn matching_bracket(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn strip_code_fences(content: &str) -> String {
    content
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Validate one array element: syntactically valid IPv4 target and a
/// non-empty plan. Invalid entries are dropped, not fatal.
fn validate_spec(spec: &serde_json::Value) -> Option<(String, String)> {
    let host = spec.get("executor_host_ip")?.as_str()?.trim().to_string();
    host.parse::<Ipv4Addr>().ok()?;
    let plan = spec.get("plan")?.as_str()?.trim().to_string();
    if plan.is_empty() {
        return None;
    }
    Some((host, plan))
}

fn preview(content: &str) -> String {
    let flat = content.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut end = flat.len().min(120);
    while !flat.is_char_boundary(end) {
        end -= 1;
    }
    flat[..end].to_string()
}
