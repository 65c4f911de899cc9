//! Tracing and logging (shared setup).

/// Initialize process-wide tracing from `config`.
///
/// Returns the guard of the file writer when `config.file` is set; keep it
/// alive for as long as logs should be written. Calling this more than once
/// is a no-op.
pub fn init(config: &LogConfig) -> Option<WorkerGuard> {
    tracing::init(config)
}

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use self::tracing::{LogConfig, LogFormat};
pub use tracing_appender::non_blocking::WorkerGuard;
