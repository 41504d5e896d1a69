use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::{FutureExt as _, StreamExt as _};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::controller::{TASK_STREAM, TaskController};
use crate::frame::Frame;
use crate::gateway::Gateway;
use crate::sse::SseDecoder;

/// Why a consumer stopped reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StreamExit {
    /// Stop was requested (or the client went away).
    Stopped,
    /// The server closed the stream.
    Ended,
    Failed(String),
}

/// Background reader attached to one task's event stream.
pub(crate) struct ConsumerHandle {
    pub task_id: String,
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn is_live(&self) -> bool {
        !self.join.is_finished()
    }

    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Stops the consumer and waits for it to exit, aborting it after
    /// `timeout`.
    pub async fn shutdown(self, timeout: Duration) {
        self.signal_stop();
        // Stopping from inside one of this consumer's own callbacks.
        if tokio::task::try_id() == Some(self.join.id()) {
            return;
        }
        let abort = self.join.abort_handle();
        if tokio::time::timeout(timeout, self.join).await.is_err() {
            warn!(task_id = %self.task_id, ?timeout, "event stream consumer did not stop in time; aborting");
            abort.abort();
        }
    }
}

pub(crate) fn spawn_consumer(
    controller: Weak<TaskController>,
    gateway: Arc<dyn Gateway>,
    session_id: String,
    task_id: String,
) -> ConsumerHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let join = tokio::spawn(consume(
        controller,
        gateway,
        session_id,
        task_id.clone(),
        stop_rx,
    ));
    ConsumerHandle {
        task_id,
        stop_tx,
        join,
    }
}

async fn consume(
    controller: Weak<TaskController>,
    gateway: Arc<dyn Gateway>,
    session_id: String,
    task_id: String,
    mut stop_rx: watch::Receiver<bool>,
) {
    let reading = read_stream(&controller, gateway.as_ref(), &session_id, &task_id, &mut stop_rx);
    // A panic here must still release the waiting turn.
    let exit = match AssertUnwindSafe(reading).catch_unwind().await {
        Ok(exit) => exit,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(session_id = %session_id, task_id = %task_id, panic = %message, "event stream consumer panicked");
            StreamExit::Failed(format!("consumer panicked: {message}"))
        }
    };
    info!(session_id = %session_id, task_id = %task_id, ?exit, "event stream closed");
    if let Some(controller) = controller.upgrade() {
        controller.finish_stream(&task_id, exit).await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

async fn read_stream(
    controller: &Weak<TaskController>,
    gateway: &dyn Gateway,
    session_id: &str,
    task_id: &str,
    stop_rx: &mut watch::Receiver<bool>,
) -> StreamExit {
    if *stop_rx.borrow() {
        return StreamExit::Stopped;
    }
    let params = [("session_id", session_id), ("task_id", task_id)];
    let opened = tokio::select! {
        biased;
        _ = stop_rx.changed() => return StreamExit::Stopped,
        opened = gateway.open_stream(TASK_STREAM, &params) => opened,
    };
    let mut bytes = match opened {
        Ok(bytes) => bytes,
        Err(err) => return StreamExit::Failed(err.to_string()),
    };
    info!(session_id, task_id, "event stream attached");

    let mut decoder = SseDecoder::default();
    loop {
        // A closed stop channel means the controller is gone.
        let next = tokio::select! {
            biased;
            _ = stop_rx.changed() => return StreamExit::Stopped,
            next = bytes.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                for sse in decoder.push_chunk(&chunk) {
                    let Some(controller) = controller.upgrade() else {
                        return StreamExit::Stopped;
                    };
                    let frame = Frame::parse(sse.event.as_deref(), &sse.data);
                    debug!(task_id, event = %frame.event, step_index = ?frame.step_index, "frame received");
                    controller.handle_frame(session_id, task_id, frame).await;
                    if *stop_rx.borrow() {
                        return StreamExit::Stopped;
                    }
                }
            }
            Some(Err(err)) => return StreamExit::Failed(err.to_string()),
            None => return StreamExit::Ended,
        }
    }
}
