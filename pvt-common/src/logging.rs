//! Process-wide tracing setup for the binaries.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::EnvParser;
use crate::error::{HarnessError, HarnessResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default level or a full `EnvFilter` directive.
    pub level: String,
    pub format: LogFormat,
    pub stderr: bool,
    /// Also write to `<dir>/<file_prefix>.log`.
    pub file: Option<(PathBuf, String)>,
    /// Set by `PVT_LOG_LEVEL` or [`LogConfig::with_level`]. An explicit
    /// level takes precedence over `RUST_LOG`.
    pub explicit: bool,
}

impl LogConfig {
    /// Level from `PVT_LOG_LEVEL`, falling back to `default_level`.
    pub fn from_env(default_level: &str) -> Self {
        let mut parser = EnvParser::new();
        let level = parser.get_log_level("LOG_LEVEL", default_level);
        Self {
            explicit: !level.is_default(),
            level: level.value,
            format: LogFormat::Pretty,
            stderr: false,
            file: None,
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self.explicit = true;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Log to stderr so stdout stays machine-readable.
    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    pub fn with_file(mut self, dir: impl Into<PathBuf>, file_prefix: impl Into<String>) -> Self {
        self.file = Some((dir.into(), file_prefix.into()));
        self
    }

    /// `--verbose`, then `PVT_LOG_LEVEL`, then `RUST_LOG`, then the default.
    fn filter(&self) -> HarnessResult<EnvFilter> {
        if !self.explicit
            && let Ok(filter) = EnvFilter::try_from_default_env()
        {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.level)
            .map_err(|e| HarnessError::Config(format!("invalid log filter {:?}: {e}", self.level)))
    }
}

/// Keeps non-blocking writers flushing until dropped at the end of `main`.
#[must_use = "dropping the guards stops log output"]
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> HarnessResult<LoggingGuards> {
    let mut guards = Vec::new();

    let (console_writer, console_guard) = if config.stderr {
        tracing_appender::non_blocking(std::io::stderr())
    } else {
        tracing_appender::non_blocking(std::io::stdout())
    };
    guards.push(console_guard);

    let file_writer = match &config.file {
        Some((dir, prefix)) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::never(dir, format!("{prefix}.log"));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);
            Some(writer)
        }
        None => None,
    };

    let (console_pretty, console_json) = match config.format {
        LogFormat::Pretty => (Some(fmt::layer().with_writer(console_writer)), None),
        LogFormat::Json => (
            None,
            Some(fmt::layer().json().with_writer(console_writer)),
        ),
    };
    let file_layer = file_writer.map(|writer| {
        fmt::layer()
            .json()
            .with_ansi(false)
            .with_writer(writer)
    });

    tracing_subscriber::registry()
        .with(config.filter()?)
        .with(console_pretty)
        .with(console_json)
        .with(file_layer)
        .try_init()
        .map_err(|e| HarnessError::Config(format!("logging already initialized: {e}")))?;

    Ok(LoggingGuards { _guards: guards })
}
