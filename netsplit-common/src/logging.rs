//! Tracing subscriber setup for the drill binary.
//!
//! Console output goes to stderr (or stdout) in pretty or JSON form. When a
//! log directory is configured, a daily-rotated JSON file is written as well.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{EnvParser, Sourced};
use crate::errors::{DrillError, DrillResult};

/// Console output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub log_dir: Option<PathBuf>,
    pub stderr: bool,
}

impl LogConfig {
    /// Read `NETSPLIT_LOG_LEVEL`, `NETSPLIT_LOG_FORMAT` and `NETSPLIT_LOG_DIR`.
    ///
    /// Invalid values fall back to the defaults.
    pub fn from_env(default_level: &str) -> Self {
        let mut parser = EnvParser::new();
        let level = parser
            .log_level("LOG_LEVEL", Sourced::default_value(default_level.to_string()))
            .value;
        let format = parser
            .optional_string("LOG_FORMAT", Sourced::default_value(None))
            .value
            .and_then(|v| LogFormat::parse(&v))
            .unwrap_or_default();
        let log_dir = parser
            .path("LOG_DIR", Sourced::default_value(None))
            .value;
        Self {
            level,
            format,
            log_dir,
            stderr: false,
        }
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_json(mut self) -> Self {
        self.format = LogFormat::Json;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// `RUST_LOG` wins over the configured level when set.
    fn filter(&self) -> DrillResult<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.level)
            .map_err(|e| DrillError::Config(format!("invalid log level '{}': {e}", self.level)))
    }
}

/// Keeps the non-blocking writers flushing; drop on exit.
#[must_use = "logs are lost once the guards are dropped"]
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

/// Install the global subscriber.
pub fn init_logging(config: &LogConfig) -> DrillResult<LoggingGuards> {
    let mut guards = Vec::new();

    let (console_writer, console_guard) = if config.stderr {
        tracing_appender::non_blocking(std::io::stderr())
    } else {
        tracing_appender::non_blocking(std::io::stdout())
    };
    guards.push(console_guard);

    let console_layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(console_writer)
            .with_target(false)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(console_writer)
            .with_current_span(true)
            .boxed(),
    };

    let file_layer = match config.log_dir {
        Some(ref dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "netsplit.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);
            Some(fmt::layer().json().with_ansi(false).with_writer(writer).boxed())
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(config.filter()?)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| DrillError::Config(format!("logging already initialized: {e}")))?;

    Ok(LoggingGuards { _guards: guards })
}
