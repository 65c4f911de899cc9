//! Tracing/logging initialization.
//!
//! - Filter: `RUST_LOG`, else `LOG_LEVEL`, else `info`
//! - Stdout: JSON lines (default) or human-readable output
//! - Optional file mirror (`LOG_FILE_PATH`), always JSON, written off-thread

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

const DEFAULT_LEVEL: &str = "info";

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    /// `pretty` (any case) selects [`LogFormat::Pretty`]; anything else is JSON.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("pretty") {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Mirror every event to this file as well.
    pub file: Option<PathBuf>,
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            file: None,
            level: DEFAULT_LEVEL.to_string(),
        }
    }
}

impl LogConfig {
    /// Read `LOG_FORMAT`, `LOG_FILE_PATH` and `LOG_LEVEL`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            format: non_empty("LOG_FORMAT")
                .map(|raw| LogFormat::parse(&raw))
                .unwrap_or_default(),
            file: non_empty("LOG_FILE_PATH").map(PathBuf::from),
            level: non_empty("LOG_LEVEL").unwrap_or_else(|| DEFAULT_LEVEL.to_string()),
        }
    }
}

/// Install the global subscriber.
///
/// Safe to call multiple times (subsequent calls are no-ops and return `None`).
pub fn init(config: &LogConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL));

    let stdout: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_timer(fmt::time::SystemTime)
            .with_target(false)
            .boxed(),
        LogFormat::Pretty => fmt::layer().pretty().boxed(),
    };

    let (file, guard) = match config.file.as_deref() {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(file_appender(path));
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stdout)
        .with(file)
        .with(filter)
        .try_init()
        .ok()
        .and(guard)
}

fn file_appender(path: &Path) -> tracing_appender::rolling::RollingFileAppender {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let name = path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("jobchain.log"));
    tracing_appender::rolling::never(dir, name)
}
