/// Failures raised by a [`Gateway`](crate::gateway::Gateway) call, already
/// classified so callers never see raw transport errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// The request timed out before a response arrived.
    #[error("Connection with BlueStacks AppPlayer timed out ({path})")]
    ConnectionTimeout { path: String },
    /// Connecting or transferring failed for any other transport reason.
    #[error("Unable to reach BlueStacks AppPlayer ({path}): {message}")]
    ConnectionFailed { path: String, message: String },
    /// The body could not be decoded as JSON.
    #[error("Non-JSON response from {path}")]
    InvalidResponse { path: String },
    /// The server answered with a non-success status.
    #[error("{message}")]
    Server {
        status: Option<u16>,
        code: String,
        message: String,
    },
}

impl GatewayError {
    /// Creates a server-reported failure.
    pub fn server(status: Option<u16>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Stable machine-readable code for this failure.
    pub fn code(&self) -> &str {
        match self {
            Self::ConnectionTimeout { .. } => "connection_timeout",
            Self::ConnectionFailed { .. } => "connection_failed",
            Self::InvalidResponse { .. } => "invalid_response",
            Self::Server { code, .. } => code,
        }
    }
}

/// Top-level error type for the agent client API.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Invalid client configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Caller input rejected before any network call.
    #[error("{0}")]
    InvalidArgument(String),
    /// Request gateway failure.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    /// The server refused to create a session.
    #[error("session creation failed: {message}")]
    SessionCreation { code: String, message: String },
    /// The server refused to create a task.
    #[error("task start failed: {message}")]
    TaskStart { code: String, message: String },
    /// The server refused to resume the current task.
    #[error("task resume failed: {message}")]
    TaskResume { code: String, message: String },
    /// A device tool call was rejected by the server.
    #[error("{code}: {message}")]
    Tool { code: String, message: String },
    /// Another turn is already awaiting its result.
    #[error("A task turn is already in progress")]
    TurnInProgress,
    /// The event stream failed or ended before the turn completed.
    #[error("{0}")]
    Stream(String),
    /// The task was stopped before the turn completed.
    #[error("Task stopped before turn completion")]
    Stopped,
    /// No task exists to continue.
    #[error("No active task to resume")]
    NoActiveTask,
    /// Local file I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &str {
        match self {
            Self::Config(_) => "config_error",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Gateway(err) => err.code(),
            Self::SessionCreation { code, .. }
            | Self::TaskStart { code, .. }
            | Self::TaskResume { code, .. }
            | Self::Tool { code, .. } => code,
            Self::TurnInProgress => "task_turn_in_progress",
            Self::Stream(_) => "event_stream_error",
            Self::Stopped => "task_stopped",
            Self::NoActiveTask => "no_active_task",
            Self::Io(_) => "io_error",
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_code_comes_from_body() {
        let err = AgentError::from(GatewayError::server(Some(503), "E_BUSY", "busy"));
        assert_eq!(err.code(), "E_BUSY");
        assert_eq!(err.to_string(), "busy");
    }

    #[test]
    fn fixed_codes_are_stable() {
        assert_eq!(AgentError::TurnInProgress.code(), "task_turn_in_progress");
        assert_eq!(AgentError::NoActiveTask.code(), "no_active_task");
        assert_eq!(AgentError::Stopped.code(), "task_stopped");
        assert_eq!(
            AgentError::from(GatewayError::ConnectionTimeout { path: "/x".into() }).code(),
            "connection_timeout"
        );
    }
}
