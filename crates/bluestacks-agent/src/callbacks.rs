use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use tracing::warn;

use crate::frame::Frame;

const CONSOLE_TAG: &str = "[BlueStacks]";

/// Error returned by a frame handler. Logged, never propagated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError(pub String);

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for HandlerError {}

pub type HandlerResult = Result<(), HandlerError>;

/// Uniform form every registered handler is converted into.
pub type FrameHandler = Arc<dyn Fn(Frame) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Return types accepted from handlers: `()` or `Result<(), E>`.
pub trait IntoHandlerResult {
    fn into_handler_result(self) -> HandlerResult;
}

impl IntoHandlerResult for () {
    fn into_handler_result(self) -> HandlerResult {
        Ok(())
    }
}

impl<E: fmt::Display> IntoHandlerResult for Result<(), E> {
    fn into_handler_result(self) -> HandlerResult {
        self.map_err(|e| HandlerError(e.to_string()))
    }
}

fn from_sync<F, R>(f: F) -> FrameHandler
where
    F: Fn(&Frame) -> R + Send + Sync + 'static,
    R: IntoHandlerResult,
{
    let f = Arc::new(f);
    Arc::new(move |frame: Frame| {
        let f = f.clone();
        // Deferred into the future so a panic is caught where the future is polled.
        async move { f(&frame).into_handler_result() }.boxed()
    })
}

fn from_async<F, Fut, R>(f: F) -> FrameHandler
where
    F: Fn(Frame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoHandlerResult,
{
    let f = Arc::new(f);
    Arc::new(move |frame: Frame| {
        let f = f.clone();
        // The closure's synchronous part may panic too; run it under the same poll.
        async move { f(frame).await.into_handler_result() }.boxed()
    })
}

/// Handlers for stream frames. Each may be a plain closure or an async one.
///
/// ```
/// use bluestacks_agent::Callbacks;
///
/// let callbacks = Callbacks::new()
///     .on_progress(|frame| println!("step {:?}", frame.step_index))
///     .on_completed_async(|frame| async move {
///         println!("finished: {}", frame.output().unwrap_or_default());
///     });
/// # let _ = callbacks;
/// ```
#[derive(Clone, Default)]
pub struct Callbacks {
    pub(crate) on_event: Option<FrameHandler>,
    pub(crate) on_progress: Option<FrameHandler>,
    pub(crate) on_awaiting_input: Option<FrameHandler>,
    pub(crate) on_completed: Option<FrameHandler>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called for every frame, before any type-specific handler.
    pub fn on_event<F, R>(mut self, f: F) -> Self
    where
        F: Fn(&Frame) -> R + Send + Sync + 'static,
        R: IntoHandlerResult,
    {
        self.on_event = Some(from_sync(f));
        self
    }

    pub fn on_event_async<F, Fut, R>(mut self, f: F) -> Self
    where
        F: Fn(Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoHandlerResult,
    {
        self.on_event = Some(from_async(f));
        self
    }

    pub fn on_progress<F, R>(mut self, f: F) -> Self
    where
        F: Fn(&Frame) -> R + Send + Sync + 'static,
        R: IntoHandlerResult,
    {
        self.on_progress = Some(from_sync(f));
        self
    }

    pub fn on_progress_async<F, Fut, R>(mut self, f: F) -> Self
    where
        F: Fn(Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoHandlerResult,
    {
        self.on_progress = Some(from_async(f));
        self
    }

    /// Takes over await-input frames. The handler is expected to answer with
    /// [`AgentClient::submit_input`](crate::AgentClient::submit_input).
    pub fn on_awaiting_input<F, R>(mut self, f: F) -> Self
    where
        F: Fn(&Frame) -> R + Send + Sync + 'static,
        R: IntoHandlerResult,
    {
        self.on_awaiting_input = Some(from_sync(f));
        self
    }

    pub fn on_awaiting_input_async<F, Fut, R>(mut self, f: F) -> Self
    where
        F: Fn(Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoHandlerResult,
    {
        self.on_awaiting_input = Some(from_async(f));
        self
    }

    /// Called for every terminal frame, and with a synthetic `task_error`
    /// frame when a turn ends without one.
    pub fn on_completed<F, R>(mut self, f: F) -> Self
    where
        F: Fn(&Frame) -> R + Send + Sync + 'static,
        R: IntoHandlerResult,
    {
        self.on_completed = Some(from_sync(f));
        self
    }

    pub fn on_completed_async<F, Fut, R>(mut self, f: F) -> Self
    where
        F: Fn(Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoHandlerResult,
    {
        self.on_completed = Some(from_async(f));
        self
    }
}

/// Source of operator answers for await-input frames.
#[async_trait::async_trait]
pub trait InputSource: Send + Sync {
    /// Returns one answer to the agent's `prompt`.
    async fn read_line(&self, prompt: &str) -> std::io::Result<String>;
}

/// Prints the agent's question and reads one line from stdin on the
/// blocking pool.
pub struct StdinInput;

#[async_trait::async_trait]
impl InputSource for StdinInput {
    async fn read_line(&self, prompt: &str) -> std::io::Result<String> {
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || {
            use std::io::{BufRead as _, Write as _};
            let mut stdout = std::io::stdout();
            write!(stdout, "{CONSOLE_TAG}: {prompt}\n> ")?;
            stdout.flush()?;
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            Ok(line.trim_end_matches(['\r', '\n']).to_string())
        })
        .await
        .map_err(std::io::Error::other)?
    }
}

/// How await-input frames are answered. Fixed when the client is built.
#[derive(Clone)]
pub(crate) enum AwaitInputStrategy {
    /// A registered handler owns the answer.
    Delegate(FrameHandler),
    /// Prompt the operator and resume with their answer.
    Prompt(Arc<dyn InputSource>),
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Event,
    Progress,
    AwaitingInput,
    Completed,
}

impl Slot {
    fn name(self) -> &'static str {
        match self {
            Self::Event => "on_event",
            Self::Progress => "on_progress",
            Self::AwaitingInput => "on_awaiting_input",
            Self::Completed => "on_completed",
        }
    }
}

/// Resolved handler set used by the stream consumer.
pub(crate) struct Dispatcher {
    on_event: Option<FrameHandler>,
    on_progress: Option<FrameHandler>,
    on_completed: Option<FrameHandler>,
    pub(crate) await_input: AwaitInputStrategy,
}

impl Dispatcher {
    /// Fills empty slots with console printers when `console` is set and picks
    /// the await-input strategy.
    pub fn new(callbacks: Callbacks, console: bool, input: Arc<dyn InputSource>) -> Self {
        let await_input = match callbacks.on_awaiting_input {
            Some(handler) => AwaitInputStrategy::Delegate(handler),
            None if console => AwaitInputStrategy::Prompt(input),
            None => AwaitInputStrategy::Ignore,
        };
        let on_progress = callbacks
            .on_progress
            .or_else(|| console.then(|| from_sync(print_progress)));
        let on_completed = callbacks
            .on_completed
            .or_else(|| console.then(|| from_sync(print_completion)));
        Self {
            on_event: callbacks.on_event,
            on_progress,
            on_completed,
            await_input,
        }
    }

    pub async fn dispatch(&self, slot: Slot, frame: &Frame) {
        let handler = match slot {
            Slot::Event => self.on_event.as_ref(),
            Slot::Progress => self.on_progress.as_ref(),
            Slot::Completed => self.on_completed.as_ref(),
            Slot::AwaitingInput => match &self.await_input {
                AwaitInputStrategy::Delegate(handler) => Some(handler),
                _ => None,
            },
        };
        if let Some(handler) = handler {
            invoke(handler, slot, frame).await;
        }
    }
}

async fn invoke(handler: &FrameHandler, slot: Slot, frame: &Frame) {
    match AssertUnwindSafe(handler(frame.clone())).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!(callback = slot.name(), event = %frame.event, error = %err, "callback failed")
        }
        Err(_) => warn!(callback = slot.name(), event = %frame.event, "callback panicked"),
    }
}

fn print_progress(frame: &Frame) {
    if let Some(message) = frame.delta_message() {
        println!("{CONSOLE_TAG}: {message}");
    }
}

fn print_completion(frame: &Frame) {
    let result = frame.completion();
    if result.success {
        println!("{CONSOLE_TAG}: Task completed successfully.");
        println!("{CONSOLE_TAG}: {}", result.output);
    } else {
        println!("{CONSOLE_TAG}: Task failed.");
        println!("{CONSOLE_TAG}: Error: {}", result.reason);
    }
}
