//! Logging.

use std::path::Path;

use sluice_error::{ErrorContext as _, GenericError};
use tracing_appender::{non_blocking::WorkerGuard, rolling::RollingFileAppender};
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, Layer, Registry};

mod config;
pub use self::config::{LogLevel, LoggingConfiguration};

mod layer;
use self::layer::build_formatting_layer;

/// Holds the background writer threads for every log output.
///
/// Buffered lines are flushed when this is dropped, so keep it alive until the process exits.
#[must_use]
pub struct LoggingGuard(Vec<WorkerGuard>);

/// Prints `message` to standard error and exits with code 2.
///
/// For failures that happen before logging is available.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("sluice: fatal: {}", message);
    std::process::exit(2);
}

/// Sets `tracing` up to write to standard error, a log file, or both.
///
/// The level directives are applied once, ahead of all outputs. Each output renders lines in the same format: either
/// the pipe-delimited text form or JSON when `log_format_json` is set.
///
/// # Errors
///
/// If the log file path names no file, or a global subscriber is already installed, an error is returned.
pub fn initialize_logging(config: &LoggingConfiguration) -> Result<LoggingGuard, GenericError> {
    let mut writers = Vec::new();
    if config.log_to_console {
        writers.push(tracing_appender::non_blocking(std::io::stderr()));
    }
    if !config.log_file.is_empty() {
        writers.push(tracing_appender::non_blocking(file_appender(&config.log_file)?));
    }

    let (outputs, guards): (Vec<Box<dyn Layer<Registry> + Send + Sync>>, Vec<WorkerGuard>) = writers
        .into_iter()
        .map(|(writer, guard)| (build_formatting_layer(config, writer), guard))
        .unzip();

    tracing_subscriber::registry()
        .with(outputs.with_filter(config.log_level.as_env_filter()))
        .try_init()?;

    Ok(LoggingGuard(guards))
}

fn file_appender(path: &str) -> Result<RollingFileAppender, GenericError> {
    let path = Path::new(path);
    let file_name = path
        .file_name()
        .with_error_context(|| format!("Log file path '{}' has no file name.", path.display()))?;
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    Ok(tracing_appender::rolling::never(directory, file_name))
}
