use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::observability::LogConfig;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

const DESCRIPTOR_ENV: &str = "BLUESTACKS_AGENT_DESCRIPTOR";
const MACOS_DESCRIPTOR: &str = "/Users/Shared/Library/Application Support/BlueStacks/bluestacksai.json";

/// Model settings sent with every new task.
///
/// Keys in `extra` are merged over the named fields on the wire, so callers can
/// pass provider-specific settings (for example an `api_key`).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub max_steps: u32,
    pub timeout: u64,
    pub vision: bool,
    pub accessibility: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "GoogleGenAI".to_string(),
            model: "gemini-3-flash-preview".to_string(),
            temperature: 1.0,
            max_tokens: 10_000,
            max_steps: 25,
            timeout: 300,
            vision: true,
            accessibility: true,
            extra: Map::new(),
        }
    }
}

impl LlmConfig {
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Adds a provider-specific key.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// JSON object sent as the `llm` field of a task-create call.
    pub fn to_value(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "llm settings could not be encoded; sending none");
                Value::Object(Map::new())
            }
        }
    }
}

/// Configuration for an [`AgentClient`](crate::AgentClient).
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Helper service address, e.g. `http://localhost:8080`.
    pub base_url: String,
    /// Bound on each request/response call.
    pub request_timeout: Duration,
    /// Bound on establishing any connection, including the event stream.
    pub connect_timeout: Duration,
    /// Server-side time budget for a task, sent with task creation.
    pub task_timeout: Duration,
    /// How long `stop_task` waits for the stream consumer before aborting it.
    pub shutdown_timeout: Duration,
    pub llm: LlmConfig,
    /// Optional grid overlay settings forwarded to the agent.
    pub grid_config: Option<Value>,
    /// Every screenshot is also written here when set.
    pub screenshot_path: Option<PathBuf>,
    /// Print progress and prompt on the console when no handler is registered.
    pub use_default_callbacks: bool,
    /// Where [`init_observability`](crate::init_observability) sends logs.
    pub log: LogConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::new(discover_base_url())
    }
}

impl AgentConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            task_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(5),
            llm: LlmConfig::default(),
            grid_config: None,
            screenshot_path: None,
            use_default_callbacks: true,
            log: LogConfig::default(),
        }
    }

    /// Builds a config from `BLUESTACKS_AGENT_*` environment variables, falling
    /// back to [`discover_base_url`] and the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::new(
            env_string("BLUESTACKS_AGENT_BASE_URL").unwrap_or_else(discover_base_url),
        );
        if let Some(secs) = env_parse::<u64>("BLUESTACKS_AGENT_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("BLUESTACKS_AGENT_TASK_TIMEOUT_SECS") {
            config.task_timeout = Duration::from_secs(secs);
        }
        if let Some(provider) = env_string("BLUESTACKS_AGENT_LLM_PROVIDER") {
            config.llm.provider = provider;
        }
        if let Some(model) = env_string("BLUESTACKS_AGENT_LLM_MODEL") {
            config.llm.model = model;
        }
        if let Some(steps) = env_parse::<u32>("BLUESTACKS_AGENT_LLM_MAX_STEPS") {
            config.llm.max_steps = steps;
        }
        if let Some(key) = env_string("BLUESTACKS_AGENT_LLM_API_KEY") {
            config.llm.extra.insert("api_key".into(), key.into());
        }
        if let Some(enabled) = env_string("BLUESTACKS_AGENT_DEFAULT_CALLBACKS")
            .as_deref()
            .and_then(parse_bool)
        {
            config.use_default_callbacks = enabled;
        }
        config.log = LogConfig::from_env();
        config
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn llm(mut self, llm: LlmConfig) -> Self {
        self.llm = llm;
        self
    }

    pub fn grid_config(mut self, grid: Value) -> Self {
        self.grid_config = Some(grid);
        self
    }

    pub fn screenshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.screenshot_path = Some(path.into());
        self
    }

    pub fn use_default_callbacks(mut self, enabled: bool) -> Self {
        self.use_default_callbacks = enabled;
        self
    }

    pub fn log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }
}

/// Resolves the helper service address from its descriptor file
/// (`host_url` + `port`), or [`DEFAULT_BASE_URL`].
pub fn discover_base_url() -> String {
    let path = env_string(DESCRIPTOR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(MACOS_DESCRIPTOR));
    match read_descriptor(&path) {
        Some(url) => {
            debug!(path = %path.display(), url = %url, "resolved helper address from descriptor");
            url
        }
        None => DEFAULT_BASE_URL.to_string(),
    }
}

fn read_descriptor(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let value: Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unreadable helper descriptor");
            return None;
        }
    };
    base_url_from_descriptor(&value)
}

fn base_url_from_descriptor(value: &Value) -> Option<String> {
    let host = value.get("host_url").and_then(Value::as_str)?.trim_end_matches('/');
    let port = match value.get("port")? {
        Value::Number(n) => n.to_string(),
        Value::String(s) if !s.is_empty() => s.clone(),
        _ => return None,
    };
    Some(format!("{host}:{port}"))
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

pub(crate) fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable environment value");
            None
        }
    }
}
