use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{env_string, parse_bool};

const DEFAULT_FILTER: &str = "info";
const JSON_FILE_NAME: &str = "bluestacks-agent.logs.jsonl";
const DAILY_FILE_NAME: &str = "agent.log";

static INSTALLED: OnceCell<LogSink> = OnceCell::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Destination for the client's log lines.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogSink {
    /// Compact lines on stderr, kept apart from the console prompt on stdout.
    #[default]
    Stderr,
    /// JSON lines appended to one file.
    JsonFile(PathBuf),
    /// Plain lines in a daily rolling `agent.log` inside the directory.
    DailyFile(PathBuf),
}

/// Logging part of [`AgentConfig`](crate::AgentConfig).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub enabled: bool,
    /// `EnvFilter` directives; `RUST_LOG` and then `info` apply when unset.
    pub filter: Option<String>,
    pub sink: LogSink,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            filter: None,
            sink: LogSink::Stderr,
        }
    }
}

impl LogConfig {
    /// Reads `BLUESTACKS_AGENT_OBSERVABILITY`, `BLUESTACKS_AGENT_LOG_LEVEL`,
    /// `BLUESTACKS_AGENT_JSON_LOG_PATH` and `BLUESTACKS_AGENT_LOG_DIR`.
    /// A JSON path wins over a log directory.
    pub fn from_env() -> Self {
        Self::from_lookup(env_string)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let sink = match (
            lookup("BLUESTACKS_AGENT_JSON_LOG_PATH"),
            lookup("BLUESTACKS_AGENT_LOG_DIR"),
        ) {
            (Some(path), _) => LogSink::JsonFile(path.into()),
            (None, Some(dir)) => LogSink::DailyFile(dir.into()),
            (None, None) => LogSink::Stderr,
        };
        Self {
            // Unrecognized values keep logging on.
            enabled: lookup("BLUESTACKS_AGENT_OBSERVABILITY")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(true),
            filter: lookup("BLUESTACKS_AGENT_LOG_LEVEL"),
            sink,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn filter(mut self, directives: impl Into<String>) -> Self {
        self.filter = Some(directives.into());
        self
    }

    pub fn sink(mut self, sink: LogSink) -> Self {
        self.sink = sink;
        self
    }

    fn env_filter(&self) -> EnvFilter {
        if let Some(filter) = self
            .filter
            .as_deref()
            .and_then(|directives| EnvFilter::try_new(directives).ok())
        {
            return filter;
        }
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    }
}

impl LogSink {
    /// Directory and file name the sink writes to, if it writes to disk.
    fn file_target(&self) -> Option<(PathBuf, String)> {
        match self {
            Self::Stderr => None,
            Self::JsonFile(path) => {
                let dir = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or(JSON_FILE_NAME);
                Some((dir.to_path_buf(), name.to_string()))
            }
            Self::DailyFile(dir) => Some((dir.clone(), DAILY_FILE_NAME.to_string())),
        }
    }

    fn layer(&self) -> BoxedLayer {
        let target = self.file_target();
        match (self, target) {
            (Self::JsonFile(_), Some((dir, name))) => tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_target(false)
                .with_writer(tracing_appender::rolling::never(dir, name))
                .boxed(),
            (Self::DailyFile(_), Some((dir, name))) => tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(tracing_appender::rolling::daily(dir, name))
                .boxed(),
            _ => tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr)
                .boxed(),
        }
    }
}

/// Installs the global subscriber described by `config`, once per process.
///
/// Returns the sink in use, or `None` when logging is disabled or another
/// subscriber was already installed. Once installed, later calls return the
/// same sink and change nothing.
pub fn init_observability(config: &LogConfig) -> Option<LogSink> {
    INSTALLED
        .get_or_try_init(|| install(config).ok_or(()))
        .ok()
        .cloned()
}

fn install(config: &LogConfig) -> Option<LogSink> {
    if !config.enabled {
        return None;
    }
    let mut sink = config.sink.clone();
    if let Some((dir, _)) = sink.file_target()
        && let Err(err) = std::fs::create_dir_all(&dir)
    {
        eprintln!("cannot create log directory {}: {err}; logging to stderr", dir.display());
        sink = LogSink::Stderr;
    }
    tracing_subscriber::registry()
        .with(sink.layer().with_filter(config.env_filter()))
        .try_init()
        .ok()?;
    Some(sink)
}
