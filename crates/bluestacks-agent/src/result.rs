use serde::Serialize;
use serde_json::Value;

use crate::errors::AgentError;
use crate::frame::Frame;

/// Where a [`RunResult`] came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RawOrigin {
    /// A frame received on (or synthesized for) the event stream.
    Frame(Frame),
    /// A plain request/response reply.
    Response(Value),
}

/// Outcome of one turn or one device tool call.
///
/// `success == true` implies `error_code == None` and an empty `reason`;
/// `success == false` always carries a non-empty `error_code`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    pub success: bool,
    pub output: String,
    pub reason: String,
    pub error_code: Option<String>,
    pub responses: Vec<Value>,
    pub delta: Option<Value>,
    pub raw: Option<RawOrigin>,
}

impl RunResult {
    /// Successful result with the given output text.
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            reason: String::new(),
            error_code: None,
            responses: Vec::new(),
            delta: None,
            raw: None,
        }
    }

    /// Failed result. An empty `code` is replaced with `unknown_error`.
    pub fn failed(code: impl Into<String>, reason: impl Into<String>) -> Self {
        let code = code.into();
        let code = if code.trim().is_empty() {
            "unknown_error".to_string()
        } else {
            code
        };
        Self {
            success: false,
            output: String::new(),
            reason: reason.into(),
            error_code: Some(code),
            responses: Vec::new(),
            delta: None,
            raw: None,
        }
    }

    /// Failed result describing `err`.
    pub fn from_error(err: &AgentError) -> Self {
        Self::failed(err.code(), err.to_string())
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_responses(mut self, responses: Vec<Value>) -> Self {
        self.responses = responses;
        self
    }

    pub fn with_delta(mut self, delta: Option<Value>) -> Self {
        self.delta = delta;
        self
    }

    pub fn with_raw(mut self, raw: RawOrigin) -> Self {
        self.raw = Some(raw);
        self
    }

    /// The error code, or `""` for a successful result.
    pub fn code(&self) -> &str {
        self.error_code.as_deref().unwrap_or_default()
    }
}

impl From<AgentError> for RunResult {
    fn from(err: AgentError) -> Self {
        Self::from_error(&err)
    }
}
