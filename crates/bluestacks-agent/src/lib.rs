//! Async client for the BlueStacks automation agent.
//!
//! The client creates a session on the local helper service, starts agent
//! tasks, follows each task's event stream and resolves one outstanding
//! *turn* at a time.
//!
//! ```no_run
//! use bluestacks_agent::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), AgentError> {
//! let client = AgentClient::builder()
//!     .config(AgentConfig::from_env())
//!     .callbacks(Callbacks::new().on_progress(|frame| {
//!         println!("step {:?}", frame.step_index);
//!     }))
//!     .build()?;
//!
//! let result = client.run_task("Open the Play Store and search for chess").await;
//! if result.success {
//!     println!("{}", result.output);
//! } else {
//!     eprintln!("{}: {}", result.code(), result.reason);
//! }
//! client.close(true).await;
//! # Ok(())
//! # }
//! ```

/// Frame handlers, their registration and dispatch.
pub mod callbacks;
/// Public client handle and builder.
pub mod client;
/// Client and model configuration.
pub mod config;
mod controller;
/// Direct device tools (tap, swipe, screenshot, ...).
mod device;
/// Error types and their machine-readable codes.
pub mod errors;
/// Frames received on the task event stream.
pub mod frame;
/// Request/response and stream transport.
pub mod gateway;
/// Logging setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Turn and tool results.
pub mod result;
mod session;
mod sse;
mod stream;
#[cfg(test)]
mod testing;

pub use callbacks::{Callbacks, FrameHandler, HandlerError, InputSource, StdinInput};
pub use client::{AgentClient, AgentClientBuilder};
pub use config::{AgentConfig, LlmConfig};
pub use controller::TaskState;
pub use errors::{AgentError, GatewayError};
pub use frame::{Frame, FrameKind};
pub use gateway::{ByteStream, Gateway, GatewayRequest, HttpGateway, Method};
pub use observability::{LogConfig, LogSink, init_observability};
pub use result::{RawOrigin, RunResult};
