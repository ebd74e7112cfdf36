//! Coder-agent session client
//!
//! HTTP/JSON client for the agent runtime on a managed host: create a
//! session, submit the plan as a user message, follow the line-delimited
//! event stream, probe status, abort. One client instance serves one
//! execution attempt; nothing is shared across attempts except the pooled
//! HTTP connector.

use std::time::Duration;

use crate::types::SessionError;

/// A live line-delimited JSON event stream.
///
/// Events are buffered by line; a partial trailing line is kept until the
/// next chunk completes it.
pub struct EventStream {
    response: reqwest::Response,
    buffer: String,
}

impl EventStream {
    /// Next event from the stream. `Ok(None)` when the agent closes it.
    ///
    /// Non-JSON lines (SSE comments, keep-alives) are skipped. Lines with an
    /// SSE `data:` prefix are unwrapped so both framing styles work.
    pub async fn next_event(&mut self) -> Result<Option<serde_json::Value>, SessionError> {
        loop {
            if let Some(pos) = self.buffer.find('\n') {
                let line = self.buffer[..pos].trim().to_string();
                self.buffer.drain(..=pos);
                let payload = line.strip_prefix("data:").map(str::trim).unwrap_or(&line);
                if payload.is_empty() || payload.starts_with(':') {
                    continue;
                }
                match serde_json::from_str::<serde_json::Value>(payload) {
                    Ok(event) => return Ok(Some(event)),
                    Err(_) => {
                        tracing::debug!(line = %payload, "skipping non-JSON event line");
                        continue;
                    }
                }
            }

            let chunk = self
                .response
                .chunk()
                .await
                .map_err(|e| SessionError::Stream(e.to_string()))?;
            match chunk {
                Some(bytes) => self.buffer.push_str(&String::from_utf8_lossy(&bytes)),
                None => {
                    // Stream closed; flush whatever is left.
                    let rest = std::mem::take(&mut self.buffer);
                    let rest = rest.trim();
                    let payload = rest.strip_prefix("data:").map(str::trim).unwrap_or(rest);
                    if payload.is_empty() {
                        return Ok(None);
                    }
                    return Ok(serde_json::from_str(payload).ok());
                }
            }
        }
    }
}

/// Client bound to one target host's coder agent. The underlying
/// `reqwest::Client` is pooled and shared across executions; only the base
/// URL is per-host.
pub struct CoderClient {
    http: reqwest::Client,
    base_url: String,
}

impl CoderClient {
    /// Pooled connector shared by every execution.
    pub fn build_pool() -> Result<reqwest::Client, SessionError> {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SessionError::Connect {
                base_url: String::new(),
                reason: e.to_string(),
            })
    }

    /// Bind the shared connector to `http://{host_ip}:{port}`.
    pub fn new(http: reqwest::Client, host_ip: &str, port: u16) -> Self {
        Self {
            http,
            base_url: format!("http://{host_ip}:{port}"),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST /session` → new session id.
    pub async fn create_session(&self) -> Result<String, SessionError> {
        let response = self
            .http
            .post(format!("{}/session", self.base_url))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let response = self.check_status(response, "create_session")?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SessionError::Protocol(format!("session body unreadable: {e}")))?;
        body.get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| SessionError::Protocol("session response carries no id".to_string()))
    }

    /// `POST /session/{id}/message` — submit the plan as the user message.
    pub async fn submit(&self, session_id: &str, plan_text: &str) -> Result<(), SessionError> {
        let response = self
            .http
            .post(format!("{}/session/{session_id}/message", self.base_url))
            .json(&serde_json::json!({ "text": plan_text }))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.check_status(response, "submit")?;
        Ok(())
    }

    /// `GET /session/{id}/events` — open the event stream.
    pub async fn open_events(&self, session_id: &str) -> Result<EventStream, SessionError> {
        let response = self
            .http
            .get(format!("{}/session/{session_id}/events", self.base_url))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let response = self.check_status(response, "open_events")?;
        Ok(EventStream {
            response,
            buffer: String::new(),
        })
    }

    /// `GET /session/status` — true when no session is busy.
    pub async fn status_idle(&self) -> Result<bool, SessionError> {
        let response = self
            .http
            .get(format!("{}/session/status", self.base_url))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let response = self.check_status(response, "status")?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SessionError::Protocol(format!("status body unreadable: {e}")))?;
        let busy = body.as_object().is_some_and(|sessions| {
            sessions
                .values()
                .any(|s| s.get("type").and_then(|t| t.as_str()) == Some("busy"))
        });
        Ok(!busy)
    }

    /// `POST /session/{id}/abort` — best effort; failures are only logged.
    pub async fn abort(&self, session_id: &str) {
        let result = self
            .http
            .post(format!("{}/session/{session_id}/abort", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        if let Err(err) = result {
            tracing::warn!(session = session_id, error = %err, "abort request failed");
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> SessionError {
        if err.is_connect() {
            SessionError::Connect {
                base_url: self.base_url.clone(),
                reason: err.to_string(),
            }
        } else {
            SessionError::Stream(err.to_string())
        }
    }

    fn check_status(
        &self,
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<reqwest::Response, SessionError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(SessionError::Http {
                status: status.as_u16(),
                operation,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_shape() {
        let client = CoderClient::new(CoderClient::build_pool().unwrap(), "10.0.0.5", 4096);
        assert_eq!(client.base_url(), "http://10.0.0.5:4096");
    }
}
