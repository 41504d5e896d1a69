//! Common imports for typical client usage.
pub use crate::{
    AgentClient, AgentClientBuilder, AgentConfig, AgentError, Callbacks, Frame, FrameKind,
    GatewayError, InputSource, LlmConfig, RunResult, TaskState,
};
