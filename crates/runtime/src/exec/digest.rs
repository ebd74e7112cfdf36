//! Per-execution session digest
//!
//! Each attempt owns one digest; event handlers mutate it directly instead
//! of sharing counters across callbacks. The digest becomes part of the
//! `DONE` journal entry and the per-host artifact files.

use serde::{Deserialize, Serialize};

/// Longest input/output preview kept per tool invocation.
const PREVIEW_LIMIT: usize = 200;

/// One tool call observed on the event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_preview: Option<String>,
}

/// Structured summary of one coder-agent session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionDigest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub tool_invocations: Vec<ToolInvocation>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub events_seen: u64,
}

impl SessionDigest {
    pub fn new(session_id: String) -> Self {
        Self {
            session_id: Some(session_id),
            ..Default::default()
        }
    }

    /// Fold one event from the agent's stream into the digest.
    pub fn record(&mut self, event: &serde_json::Value) {
        self.events_seen += 1;

        if event.get("type").and_then(|t| t.as_str()) == Some("tool") {
            let name = event
                .get("tool")
                .and_then(|t| t.as_str())
                .unwrap_or("unknown")
                .to_string();
            let state = event.get("state");
            let status = state
                .and_then(|s| s.get("status"))
                .and_then(|s| s.as_str())
                .unwrap_or("unknown")
                .to_string();
            self.tool_invocations.push(ToolInvocation {
                name,
                status,
                input_preview: state
                    .and_then(|s| s.get("input"))
                    .map(|v| preview_value(v)),
                output_preview: state
                    .and_then(|s| s.get("output"))
                    .map(|v| preview_value(v)),
            });
        }

        if let Some(tokens) = event.get("tokens") {
            self.tokens_in += tokens.get("input").and_then(|v| v.as_u64()).unwrap_or(0);
            self.tokens_out += tokens.get("output").and_then(|v| v.as_u64()).unwrap_or(0);
        }
        if let Some(cost) = event.get("cost").and_then(|v| v.as_f64()) {
            self.cost += cost;
        }
    }

    /// Whether the event is the terminal assistant message.
    pub fn is_terminal(event: &serde_json::Value) -> bool {
        event.get("finish").and_then(|f| f.as_str()) == Some("stop")
    }

    /// Compact summary embedded into the `DONE` journal entry.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "session_id": self.session_id,
            "tool_invocations": self.tool_invocations.len(),
            "tokens_in": self.tokens_in,
            "tokens_out": self.tokens_out,
            "cost": self.cost,
            "events": self.events_seen,
        })
    }
}

fn preview_value(value: &serde_json::Value) -> String {
    let raw = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let mut end = raw.len().min(PREVIEW_LIMIT);
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    raw[..end].to_string()
}
