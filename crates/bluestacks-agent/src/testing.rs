//! In-crate test doubles shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use futures::channel::mpsc;
use futures::stream;
use serde_json::{Value, json};

use crate::callbacks::InputSource;
use crate::errors::GatewayError;
use crate::gateway::{ByteStream, Gateway, GatewayRequest};

type Chunk = Result<Bytes, GatewayError>;

/// Scripted [`Gateway`]: replies per path, records every call, and hands out
/// channel-backed event streams.
#[derive(Default)]
pub(crate) struct FakeGateway {
    replies: Mutex<HashMap<String, VecDeque<Result<Value, GatewayError>>>>,
    calls: Mutex<Vec<GatewayRequest>>,
    streams: Mutex<VecDeque<mpsc::UnboundedReceiver<Chunk>>>,
    stream_params: Mutex<Vec<Vec<(String, String)>>>,
    tasks_created: AtomicUsize,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a one-off reply for the next call to `path`.
    pub fn reply(&self, path: &str, reply: Result<Value, GatewayError>) {
        self.replies
            .lock()
            .expect("replies lock")
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Prepares the stream handed to the next `open_stream` call.
    pub fn stream(&self) -> StreamFeed {
        let (tx, rx) = mpsc::unbounded();
        self.streams.lock().expect("streams lock").push_back(rx);
        StreamFeed { tx }
    }

    pub fn calls(&self) -> Vec<GatewayRequest> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn count(&self, path: &str) -> usize {
        self.calls().iter().filter(|c| c.path == path).count()
    }

    pub fn body_of(&self, path: &str) -> Option<Value> {
        self.calls()
            .into_iter()
            .rev()
            .find(|c| c.path == path)
            .map(|c| c.body)
    }

    pub fn stream_opens(&self) -> usize {
        self.stream_params.lock().expect("params lock").len()
    }

    pub fn last_stream_params(&self) -> Option<Vec<(String, String)>> {
        self.stream_params.lock().expect("params lock").last().cloned()
    }

    fn default_reply(&self, path: &str) -> Value {
        match path {
            "/v1/session/create" => json!({ "status": "success", "session_id": "s-1" }),
            "/v1/task/create" => {
                let n = self.tasks_created.fetch_add(1, Ordering::SeqCst) + 1;
                json!({ "status": "success", "task_id": format!("t-{n}") })
            }
            "/v1/task/resume" => json!({ "status": "accepted" }),
            _ => json!({ "status": "success" }),
        }
    }
}

#[async_trait::async_trait]
impl Gateway for FakeGateway {
    async fn send(&self, request: GatewayRequest) -> Result<Value, GatewayError> {
        let path = request.path.clone();
        self.calls.lock().expect("calls lock").push(request);
        let scripted = self
            .replies
            .lock()
            .expect("replies lock")
            .get_mut(&path)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(reply) => reply,
            None => Ok(self.default_reply(&path)),
        }
    }

    async fn open_stream(
        &self,
        _path: &str,
        params: &[(&str, &str)],
    ) -> Result<ByteStream, GatewayError> {
        self.stream_params.lock().expect("params lock").push(
            params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        match self.streams.lock().expect("streams lock").pop_front() {
            Some(rx) => Ok(Box::pin(rx)),
            None => Ok(Box::pin(stream::pending::<Chunk>())),
        }
    }
}

/// Sending side of a fake event stream. Dropping it ends the stream.
pub(crate) struct StreamFeed {
    tx: mpsc::UnboundedSender<Chunk>,
}

impl StreamFeed {
    pub fn frame(&self, event: &str, data: Value) {
        self.raw(&format!("event: {event}\ndata: {data}\n\n"));
    }

    pub fn raw(&self, text: &str) {
        let _ = self.tx.unbounded_send(Ok(Bytes::from(text.to_string())));
    }

    pub fn fail(&self, err: GatewayError) {
        let _ = self.tx.unbounded_send(Err(err));
    }
}

/// [`InputSource`] that answers prompts from a fixed list.
pub(crate) struct ScriptedInput {
    answers: Mutex<VecDeque<String>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedInput {
    pub fn new(answers: &[&str]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl InputSource for ScriptedInput {
    async fn read_line(&self, prompt: &str) -> std::io::Result<String> {
        self.prompts.lock().expect("prompts lock").push(prompt.to_string());
        self.answers
            .lock()
            .expect("answers lock")
            .pop_front()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "no input"))
    }
}

/// [`InputSource`] whose operator never answers.
pub(crate) struct SilentInput;

#[async_trait::async_trait]
impl InputSource for SilentInput {
    async fn read_line(&self, _prompt: &str) -> std::io::Result<String> {
        futures::future::pending().await
    }
}

/// Delegates calls to a [`FakeGateway`] but panics when the stream is opened.
pub(crate) struct BrokenStreamGateway(pub FakeGateway);

#[async_trait::async_trait]
impl Gateway for BrokenStreamGateway {
    async fn send(&self, request: GatewayRequest) -> Result<Value, GatewayError> {
        self.0.send(request).await
    }

    async fn open_stream(
        &self,
        _path: &str,
        _params: &[(&str, &str)],
    ) -> Result<ByteStream, GatewayError> {
        panic!("stream setup bug")
    }
}
