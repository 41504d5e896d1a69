use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::callbacks::{AwaitInputStrategy, Dispatcher, InputSource, Slot};
use crate::config::AgentConfig;
use crate::errors::AgentError;
use crate::frame::{Frame, FrameKind};
use crate::gateway::{Gateway, GatewayRequest};
use crate::result::{RawOrigin, RunResult};
use crate::session::SessionManager;
use crate::stream::{ConsumerHandle, StreamExit, spawn_consumer};

pub(crate) const TASK_CREATE: &str = "/v1/task/create";
pub(crate) const TASK_RESUME: &str = "/v1/task/resume";
pub(crate) const TASK_CLOSE: &str = "/v1/task/close";
pub(crate) const TASK_STREAM: &str = "/v1/task/stream";

/// Lifecycle of the client's current task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    NoTask,
    Created,
    Streaming,
    /// The agent asked for operator input; a sub-state of `Streaming`.
    AwaitingInput,
    Completed,
    Failed,
    Stopped,
}

struct ActiveTask {
    id: String,
    state: TaskState,
}

struct PendingTurn {
    turn: u64,
    /// `None` until the task backing the turn exists.
    task_id: Option<String>,
    tx: oneshot::Sender<RunResult>,
}

#[derive(Default)]
struct ControllerState {
    task: Option<ActiveTask>,
    pending: Option<PendingTurn>,
    consumer: Option<ConsumerHandle>,
    next_turn: u64,
}

/// Which pending turn a failure may resolve.
#[derive(Clone, Copy)]
pub(crate) enum TurnScope<'a> {
    BoundTo(&'a str),
    Any,
}

/// Owns the current task, the single pending-turn slot and the stream
/// consumer attached to the task.
pub(crate) struct TaskController {
    pub(crate) config: AgentConfig,
    pub(crate) gateway: Arc<dyn Gateway>,
    pub(crate) sessions: SessionManager,
    dispatcher: Dispatcher,
    state: Mutex<ControllerState>,
    stop_lock: tokio::sync::Mutex<()>,
}

/// A reserved turn. Dropping it unresolved frees the slot, so a cancelled
/// caller never blocks the next turn.
pub(crate) struct TurnTicket<'a> {
    controller: &'a TaskController,
    turn: u64,
    rx: oneshot::Receiver<RunResult>,
}

impl TurnTicket<'_> {
    async fn wait(&mut self) -> RunResult {
        match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => RunResult::from_error(&AgentError::Stream(
                "turn ended without a result".into(),
            )),
        }
    }
}

impl Drop for TurnTicket<'_> {
    fn drop(&mut self) {
        let mut state = self.controller.lock();
        if state.pending.as_ref().is_some_and(|p| p.turn == self.turn) {
            state.pending = None;
        }
    }
}

impl TaskController {
    pub fn new(
        config: AgentConfig,
        gateway: Arc<dyn Gateway>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            sessions: SessionManager::new(gateway.clone()),
            config,
            gateway,
            dispatcher,
            state: Mutex::new(ControllerState::default()),
            stop_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        // Handlers never run under this lock, so a poisoned state is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn task_state(&self) -> TaskState {
        self.lock()
            .task
            .as_ref()
            .map_or(TaskState::NoTask, |t| t.state)
    }

    pub fn task_id(&self) -> Option<String> {
        self.lock().task.as_ref().map(|t| t.id.clone())
    }

    pub fn turn_in_progress(&self) -> bool {
        self.lock().pending.is_some()
    }

    pub(crate) fn set_task_state(&self, task_id: &str, next: TaskState) {
        let mut state = self.lock();
        if let Some(task) = state.task.as_mut().filter(|t| t.id == task_id)
            && task.state != next
        {
            debug!(task_id, from = ?task.state, to = ?next, "task state");
            task.state = next;
        }
    }

    fn reserve_turn(&self, task_id: Option<String>) -> Result<TurnTicket<'_>, AgentError> {
        let mut state = self.lock();
        if state.pending.is_some() {
            return Err(AgentError::TurnInProgress);
        }
        state.next_turn += 1;
        let turn = state.next_turn;
        let (tx, rx) = oneshot::channel();
        state.pending = Some(PendingTurn { turn, task_id, tx });
        Ok(TurnTicket {
            controller: self,
            turn,
            rx,
        })
    }

    /// Binds a reserved turn to its task. `false` if the turn was already
    /// resolved (stopped while the task was being created).
    fn bind_turn(&self, turn: u64, task_id: &str) -> bool {
        let mut state = self.lock();
        match state.pending.as_mut().filter(|p| p.turn == turn) {
            Some(pending) => {
                pending.task_id = Some(task_id.to_string());
                true
            }
            None => false,
        }
    }

    fn take_turn(&self, scope: TurnScope<'_>) -> Option<PendingTurn> {
        let mut state = self.lock();
        let matches = match (scope, state.pending.as_ref()) {
            (_, None) => false,
            (TurnScope::Any, Some(_)) => true,
            (TurnScope::BoundTo(id), Some(p)) => p.task_id.as_deref() == Some(id),
        };
        if matches { state.pending.take() } else { None }
    }

    /// Fails the pending turn in `scope` after handing a `task_error` frame to
    /// the completion callback. Returns whether a turn was resolved.
    pub(crate) async fn fail_turn(&self, scope: TurnScope<'_>, err: &AgentError) -> bool {
        let Some(pending) = self.take_turn(scope) else {
            return false;
        };
        let reason = err.to_string();
        warn!(task_id = ?pending.task_id, code = err.code(), reason = %reason, "failing pending turn");
        let frame = Frame::task_error(&reason, Some(err.code()));
        let result = RunResult::from_error(err).with_raw(RawOrigin::Frame(frame.clone()));
        self.dispatcher.dispatch(Slot::Completed, &frame).await;
        let _ = pending.tx.send(result);
        true
    }

    pub async fn start_task(&self, query: &str) -> Result<String, AgentError> {
        require_text(query, "start_task requires a non-empty query")?;
        self.create_task(query).await
    }

    async fn create_task(&self, query: &str) -> Result<String, AgentError> {
        if self.task_id().is_some() {
            let _guard = self.stop_lock.lock().await;
            if let Some(previous) = self.teardown().await {
                info!(task_id = %previous, "replaced previous task");
            }
        }

        let session_id = self.sessions.ensure_session().await?;
        let body = json!({
            "session_id": session_id,
            "query": query,
            "llm": self.config.llm.to_value(),
            "metadata": {
                "timeout": self.config.task_timeout.as_secs(),
                "grid_config": self.config.grid_config,
            },
        });
        let data = self.gateway.send(GatewayRequest::post(TASK_CREATE, body)).await?;
        if status(&data) != Some("success") {
            let err = AgentError::TaskStart {
                code: field(&data, "error").unwrap_or("task_start_failed").to_string(),
                message: field(&data, "message").unwrap_or("Failed to start task").to_string(),
            };
            error!(session_id = %session_id, code = err.code(), "task start rejected");
            return Err(err);
        }
        let Some(task_id) = field(&data, "task_id").map(ToOwned::to_owned) else {
            return Err(AgentError::TaskStart {
                code: "invalid_response".into(),
                message: "task create reply has no task_id".into(),
            });
        };
        info!(session_id = %session_id, task_id = %task_id, "task created");
        self.lock().task = Some(ActiveTask {
            id: task_id.clone(),
            state: TaskState::Created,
        });
        Ok(task_id)
    }

    pub async fn run_task(self: &Arc<Self>, query: &str) -> RunResult {
        if let Err(err) = require_text(query, "run_task requires a non-empty query") {
            return err.into();
        }
        let mut ticket = match self.reserve_turn(None) {
            Ok(ticket) => ticket,
            Err(err) => return err.into(),
        };
        let task_id = match self.create_task(query).await {
            Ok(task_id) => task_id,
            Err(err) => return err.into(),
        };
        if !self.bind_turn(ticket.turn, &task_id) {
            // stop_task ran while the task was being created.
            self.abandon(&task_id).await;
            return ticket.wait().await;
        }
        match self.sessions.current().await {
            Some(session_id) => self.attach_stream(&session_id, &task_id),
            None => {
                self.fail_turn(TurnScope::BoundTo(&task_id), &AgentError::NoActiveTask)
                    .await;
            }
        }
        ticket.wait().await
    }

    pub async fn resume_task(self: &Arc<Self>, text: &str) -> RunResult {
        if let Err(err) = require_text(text, "resume_task requires a non-empty string") {
            return err.into();
        }
        let (Some(session_id), Some(task_id)) = (self.sessions.current().await, self.task_id())
        else {
            return AgentError::NoActiveTask.into();
        };
        let mut ticket = match self.reserve_turn(Some(task_id.clone())) {
            Ok(ticket) => ticket,
            Err(err) => return err.into(),
        };
        self.attach_stream(&session_id, &task_id);
        match self.post_resume(&session_id, &task_id, text).await {
            Ok(()) => self.set_task_state(&task_id, TaskState::Streaming),
            Err(err) => {
                self.fail_turn(TurnScope::BoundTo(&task_id), &err).await;
            }
        }
        ticket.wait().await
    }

    /// Answers the agent without reserving a turn.
    pub async fn submit_input(&self, text: &str) -> Result<(), AgentError> {
        require_text(text, "submit_input requires a non-empty string")?;
        let (Some(session_id), Some(task_id)) = (self.sessions.current().await, self.task_id())
        else {
            return Err(AgentError::NoActiveTask);
        };
        self.post_resume(&session_id, &task_id, text).await?;
        self.set_task_state(&task_id, TaskState::Streaming);
        Ok(())
    }

    pub(crate) async fn post_resume(
        &self,
        session_id: &str,
        task_id: &str,
        text: &str,
    ) -> Result<(), AgentError> {
        let body = json!({
            "session_id": session_id,
            "task_id": task_id,
            "resume_query": text,
        });
        let data = self.gateway.send(GatewayRequest::post(TASK_RESUME, body)).await?;
        match status(&data) {
            None | Some("accepted" | "in_progress" | "success") => {
                info!(session_id, task_id, "task resumed");
                Ok(())
            }
            Some(other) => Err(AgentError::TaskResume {
                code: field(&data, "error").unwrap_or("task_resume_failed").to_string(),
                message: field(&data, "message")
                    .map(ToOwned::to_owned)
                    .unwrap_or_else(|| format!("unexpected resume status {other:?}")),
            }),
        }
    }

    pub async fn stop_task(&self) {
        let _guard = self.stop_lock.lock().await;
        let stopped = self.teardown().await;
        // Covers a turn reserved before its task existed.
        self.fail_turn(TurnScope::Any, &AgentError::Stopped).await;
        if let Some(task_id) = stopped {
            info!(task_id = %task_id, "task stopped");
        }
    }

    /// Detaches the consumer and closes the current task on the server.
    /// Callers hold `stop_lock`.
    async fn teardown(&self) -> Option<String> {
        let (task, consumer) = {
            let mut state = self.lock();
            (state.task.take(), state.consumer.take())
        };
        if let Some(consumer) = &consumer {
            consumer.signal_stop();
        }
        if let Some(task) = &task {
            debug!(task_id = %task.id, from = ?task.state, to = ?TaskState::Stopped, "task state");
        }
        if let Some(task) = &task
            && let Some(session_id) = self.sessions.current().await
        {
            self.close_remote(&session_id, &task.id).await;
        }
        if let Some(consumer) = consumer {
            consumer.shutdown(self.config.shutdown_timeout).await;
        }
        let task_id = task.map(|t| t.id)?;
        self.fail_turn(TurnScope::BoundTo(&task_id), &AgentError::Stopped)
            .await;
        Some(task_id)
    }

    async fn close_remote(&self, session_id: &str, task_id: &str) {
        let body = json!({ "session_id": session_id, "task_id": task_id });
        if let Err(err) = self.gateway.send(GatewayRequest::post(TASK_CLOSE, body)).await {
            warn!(session_id, task_id, error = %err, "failed to close task");
        }
    }

    /// Closes a task whose turn was stopped before the task was bound to it.
    async fn abandon(&self, task_id: &str) {
        {
            let mut state = self.lock();
            if state.task.as_ref().is_some_and(|t| t.id == task_id) {
                state.task = None;
            }
        }
        if let Some(session_id) = self.sessions.current().await {
            self.close_remote(&session_id, task_id).await;
        }
    }

    /// Starts a consumer for `task_id` unless one is already reading it.
    fn attach_stream(self: &Arc<Self>, session_id: &str, task_id: &str) {
        let mut state = self.lock();
        if let Some(existing) = &state.consumer {
            if existing.task_id == task_id && existing.is_live() {
                return;
            }
            existing.signal_stop();
        }
        state.consumer = Some(spawn_consumer(
            Arc::downgrade(self),
            self.gateway.clone(),
            session_id.to_string(),
            task_id.to_string(),
        ));
    }

    pub(crate) async fn handle_frame(&self, session_id: &str, task_id: &str, frame: Frame) {
        self.dispatcher.dispatch(Slot::Event, &frame).await;
        match frame.kind {
            FrameKind::Progress => {
                self.set_task_state(task_id, TaskState::Streaming);
                self.dispatcher.dispatch(Slot::Progress, &frame).await;
            }
            FrameKind::AwaitInput => {
                self.set_task_state(task_id, TaskState::AwaitingInput);
                match &self.dispatcher.await_input {
                    AwaitInputStrategy::Delegate(_) => {
                        self.dispatcher.dispatch(Slot::AwaitingInput, &frame).await;
                    }
                    AwaitInputStrategy::Prompt(input) => {
                        self.prompt_operator(input.as_ref(), session_id, task_id, &frame)
                            .await;
                    }
                    AwaitInputStrategy::Ignore => {
                        warn!(task_id, "agent is waiting for input but no handler is registered");
                    }
                }
            }
            kind if kind.is_terminal() => {
                let result = frame.completion();
                self.set_task_state(
                    task_id,
                    if result.success { TaskState::Completed } else { TaskState::Failed },
                );
                info!(
                    task_id,
                    success = result.success,
                    output_len = result.output.len(),
                    "task turn completed"
                );
                // Claimed before `on_completed` runs, answered after it.
                let pending = self.take_turn(TurnScope::BoundTo(task_id));
                self.dispatcher.dispatch(Slot::Completed, &frame).await;
                match pending {
                    Some(pending) => {
                        let _ = pending.tx.send(result);
                    }
                    None => debug!(task_id, "terminal frame with no turn waiting"),
                }
            }
            _ => {}
        }
    }

    async fn prompt_operator(
        &self,
        input: &dyn InputSource,
        session_id: &str,
        task_id: &str,
        frame: &Frame,
    ) {
        let prompt = frame
            .output()
            .filter(|m| !m.is_empty())
            .unwrap_or("Agent needs input:");
        let answer = match input.read_line(prompt).await {
            Ok(answer) => answer,
            Err(err) => {
                error!(task_id, error = %err, "failed to read operator input");
                self.fail_turn(TurnScope::BoundTo(task_id), &AgentError::Io(err))
                    .await;
                return;
            }
        };
        match self.post_resume(session_id, task_id, &answer).await {
            Ok(()) => self.set_task_state(task_id, TaskState::Streaming),
            Err(err) => {
                error!(task_id, error = %err, "resume with operator input failed");
                self.fail_turn(TurnScope::BoundTo(task_id), &err).await;
            }
        }
    }

    /// Runs when the consumer for `task_id` exits.
    pub(crate) async fn finish_stream(&self, task_id: &str, exit: StreamExit) {
        let err = match exit {
            StreamExit::Stopped => AgentError::Stopped,
            StreamExit::Ended => AgentError::Stream(
                "Lost connection to BlueStacks AppPlayer: event stream ended".into(),
            ),
            StreamExit::Failed(message) => {
                AgentError::Stream(format!("Event stream error: {message}"))
            }
        };
        if self.fail_turn(TurnScope::BoundTo(task_id), &err).await
            && !matches!(err, AgentError::Stopped)
        {
            self.set_task_state(task_id, TaskState::Failed);
        }
    }
}

fn require_text(text: &str, message: &str) -> Result<(), AgentError> {
    if text.trim().is_empty() {
        return Err(AgentError::invalid(message));
    }
    Ok(())
}

fn status(data: &Value) -> Option<&str> {
    data.get("status").and_then(Value::as_str)
}

fn field<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}
