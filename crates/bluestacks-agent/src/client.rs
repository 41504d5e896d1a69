use std::sync::Arc;

use tracing::{info, warn};

use crate::callbacks::{Callbacks, Dispatcher, InputSource, StdinInput};
use crate::config::AgentConfig;
use crate::controller::{TaskController, TaskState};
use crate::errors::AgentError;
use crate::gateway::{Gateway, HttpGateway};
use crate::result::RunResult;

/// Client for the BlueStacks automation agent.
///
/// One client drives at most one task at a time and at most one outstanding
/// turn; cloning shares the same session and task.
#[derive(Clone)]
pub struct AgentClient {
    pub(crate) inner: Arc<TaskController>,
}

impl AgentClient {
    pub fn builder() -> AgentClientBuilder {
        AgentClientBuilder::default()
    }

    /// Client over HTTP with default callbacks.
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        Self::builder().config(config).build()
    }

    /// Session id, if one has been created.
    pub async fn session_id(&self) -> Option<String> {
        self.inner.sessions.current().await
    }

    /// Creates the session now instead of on first use.
    pub async fn ensure_session(&self) -> Result<String, AgentError> {
        self.inner.sessions.ensure_session().await
    }

    pub fn task_id(&self) -> Option<String> {
        self.inner.task_id()
    }

    pub fn task_state(&self) -> TaskState {
        self.inner.task_state()
    }

    /// Whether a `run_task`/`resume_task` call is waiting for its result.
    pub fn turn_in_progress(&self) -> bool {
        self.inner.turn_in_progress()
    }

    /// Creates a task without attaching the event stream or waiting on it.
    /// Any task already active on this client is stopped first.
    pub async fn start_task(&self, query: &str) -> Result<String, AgentError> {
        self.inner.start_task(query).await
    }

    /// Starts a task and waits for the end of its first turn.
    ///
    /// Never fails: every error is reported through the returned
    /// [`RunResult`].
    pub async fn run_task(&self, query: &str) -> RunResult {
        self.inner.run_task(query).await
    }

    /// Continues the current task with `text` and waits for the end of the
    /// next turn.
    pub async fn resume_task(&self, text: &str) -> RunResult {
        self.inner.resume_task(text).await
    }

    /// Sends operator input to the current task without waiting on a turn.
    /// Meant for await-input callbacks.
    pub async fn submit_input(&self, text: &str) -> Result<(), AgentError> {
        self.inner.submit_input(text).await
    }

    /// Stops the current task. Safe to call in any state; resolves a waiting
    /// turn with a `task_stopped` failure.
    pub async fn stop_task(&self) {
        self.inner.stop_task().await
    }

    /// Stops the task, optionally returns the device to its home screen, and
    /// closes the session. A later call starts a new session.
    pub async fn close(&self, go_home: bool) {
        self.stop_task().await;
        if go_home && self.session_id().await.is_some() {
            let result = self.home().await;
            if !result.success {
                warn!(code = result.code(), reason = %result.reason, "failed to go home while closing");
            }
        }
        self.inner.sessions.close().await;
        info!("agent client closed");
    }
}

/// Builder for [`AgentClient`].
#[derive(Default)]
pub struct AgentClientBuilder {
    config: Option<AgentConfig>,
    callbacks: Callbacks,
    gateway: Option<Arc<dyn Gateway>>,
    input: Option<Arc<dyn InputSource>>,
}

impl AgentClientBuilder {
    /// Defaults to [`AgentConfig::default`].
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Replaces the HTTP gateway (tests, proxies).
    pub fn gateway(mut self, gateway: Arc<dyn Gateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Where operator answers come from when no await-input handler is
    /// registered. Defaults to stdin.
    pub fn input_source(mut self, input: Arc<dyn InputSource>) -> Self {
        self.input = Some(input);
        self
    }

    pub fn build(self) -> Result<AgentClient, AgentError> {
        let config = self.config.unwrap_or_default();
        if config.base_url.trim().is_empty() {
            return Err(AgentError::Config("base_url must not be empty".into()));
        }
        let gateway = match self.gateway {
            Some(gateway) => gateway,
            None => Arc::new(HttpGateway::new(&config)?),
        };
        let input = self.input.unwrap_or_else(|| Arc::new(StdinInput));
        let dispatcher = Dispatcher::new(self.callbacks, config.use_default_callbacks, input);
        info!(base_url = %config.base_url, "agent client ready");
        Ok(AgentClient {
            inner: Arc::new(TaskController::new(config, gateway, dispatcher)),
        })
    }
}
