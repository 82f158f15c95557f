use serde::Deserialize;
use sluice_config::GenericConfiguration;
use sluice_error::{generic_error, ErrorContext as _, GenericError};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

fn default_log_level() -> LogLevel {
    LevelFilter::INFO.into()
}

const fn default_true() -> bool {
    true
}

/// Logging configuration.
///
/// Read from the top-level `log_level`, `log_format_json`, `log_to_console`, and `log_file` keys, so `SLUICE_LOG_LEVEL`
/// can be used to adjust verbosity without touching the configuration file.
#[derive(Deserialize)]
pub struct LoggingConfiguration {
    /// Level filter directives, in `EnvFilter` syntax.
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Whether to emit JSON log lines instead of the pipe-delimited format.
    #[serde(default)]
    pub log_format_json: bool,

    /// Whether to write logs to standard error.
    #[serde(default = "default_true")]
    pub log_to_console: bool,

    /// Path to a log file. Empty disables file logging.
    #[serde(default)]
    pub log_file: String,
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration` instance from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized as `LoggingConfiguration`, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let logging_config = config.as_typed()?;
        Ok(logging_config)
    }

    /// Replaces the configured level directives with a single global level.
    ///
    /// Used when verbosity is requested on the command line, which takes precedence over configuration.
    pub fn override_level(&mut self, level: LevelFilter) {
        self.log_level = level.into();
    }
}

impl Default for LoggingConfiguration {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format_json: false,
            log_to_console: true,
            log_file: String::new(),
        }
    }
}

/// A validated set of log level directives, in `EnvFilter` syntax.
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "String")]
pub struct LogLevel(String);

impl LogLevel {
    /// Returns the raw directives.
    pub fn directives(&self) -> &str {
        &self.0
    }

    /// Builds an `EnvFilter` from the directives.
    pub fn as_env_filter(&self) -> EnvFilter {
        EnvFilter::builder().parse_lossy(&self.0)
    }
}

impl From<LevelFilter> for LogLevel {
    fn from(level: LevelFilter) -> Self {
        Self(level.to_string().to_lowercase())
    }
}

impl TryFrom<String> for LogLevel {
    type Error = GenericError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.trim().is_empty() {
            return Err(generic_error!("Log level cannot be empty."));
        }

        EnvFilter::builder()
            .parse(&value)
            .error_context("Failed to parse valid log level.")?;
        Ok(Self(value))
    }
}
