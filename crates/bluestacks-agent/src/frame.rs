use serde::Serialize;
use serde_json::{Value, json};
use tracing::warn;

use crate::result::{RawOrigin, RunResult};

pub const TASK_PROGRESS: &str = "task_progress";
pub const TASK_AWAIT_INPUT: &str = "task_await_input";
pub const TASK_COMPLETED: &str = "task_completed";
pub const TASK_FAILED: &str = "task_failed";
pub const TASK_ERROR: &str = "task_error";

/// Classification of a frame's event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Progress,
    AwaitInput,
    Completed,
    Failed,
    /// Synthesized locally when the stream ends abnormally.
    Error,
    Other,
}

impl FrameKind {
    pub fn from_event(event: &str) -> Self {
        match event {
            TASK_PROGRESS => Self::Progress,
            TASK_AWAIT_INPUT => Self::AwaitInput,
            TASK_COMPLETED => Self::Completed,
            TASK_FAILED => Self::Failed,
            TASK_ERROR => Self::Error,
            _ => Self::Other,
        }
    }

    /// Frames that end the current turn.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One event received on the task stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    pub event: String,
    pub kind: FrameKind,
    pub payload: Value,
    pub step_index: Option<u64>,
    pub task_state: Option<String>,
    pub timestamp: Option<Value>,
    pub responses: Vec<Value>,
    pub delta: Option<Value>,
}

impl Frame {
    /// Builds a frame from an event name and its joined data lines.
    ///
    /// Data that is not valid JSON is kept as `{"raw": data}`.
    pub fn parse(event: Option<&str>, data: &str) -> Self {
        let payload = match serde_json::from_str::<Value>(data) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, data, "invalid JSON in event data");
                json!({ "raw": data })
            }
        };
        Self::from_payload(event.unwrap_or("message"), payload)
    }

    pub fn from_payload(event: impl Into<String>, payload: Value) -> Self {
        let event = event.into();
        let responses = payload
            .get("responses")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Self {
            kind: FrameKind::from_event(&event),
            event,
            step_index: payload.get("step_index").and_then(Value::as_u64),
            task_state: payload
                .get("task_state")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
            timestamp: payload.get("timestamp").filter(|v| !v.is_null()).cloned(),
            delta: payload.get("delta").filter(|v| !v.is_null()).cloned(),
            responses,
            payload,
        }
    }

    /// Error-shaped frame handed to the completion callback when a turn ends
    /// without a terminal frame from the server.
    pub fn task_error(reason: &str, detail: Option<&str>) -> Self {
        Self::from_payload(
            TASK_ERROR,
            json!({
                "task_state": "error",
                "reason": reason,
                "exception": detail,
                "result": { "status": "error", "output": "", "message": reason },
            }),
        )
    }

    /// The `result` block of the payload, if any.
    pub fn result(&self) -> Option<&Value> {
        self.payload.get("result").filter(|v| v.is_object())
    }

    fn result_str(&self, key: &str) -> Option<&str> {
        self.result()
            .and_then(|r| r.get(key))
            .and_then(Value::as_str)
    }

    /// Output text carried by the result block (also the prompt of an
    /// await-input frame).
    pub fn output(&self) -> Option<&str> {
        self.result_str("output")
    }

    /// The `message` field of an `llm_response` delta, used for console
    /// progress output.
    pub fn delta_message(&self) -> Option<&str> {
        let delta = self.delta.as_ref()?;
        if delta.get("type").and_then(Value::as_str) != Some("llm_response") {
            return None;
        }
        delta
            .get("message")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
    }

    /// Converts a terminal frame into the turn's result.
    pub fn completion(&self) -> RunResult {
        let output = self.output().unwrap_or_default().to_string();
        let succeeded =
            self.kind != FrameKind::Failed && self.result_str("status") == Some("success");
        let result = if succeeded {
            RunResult::succeeded(output)
        } else {
            let code = self
                .result_str("error")
                .filter(|s| !s.is_empty())
                .unwrap_or("task_failed");
            let reason = self
                .result_str("message")
                .filter(|s| !s.is_empty())
                .unwrap_or("task_failed");
            RunResult::failed(code, reason).with_output(output)
        };
        result
            .with_responses(self.responses.clone())
            .with_delta(self.delta.clone())
            .with_raw(RawOrigin::Frame(self.clone()))
    }
}
