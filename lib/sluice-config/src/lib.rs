//! Layered configuration for sluice.
//!
//! A [`ConfigurationLoader`] stacks a configuration file and `SLUICE_`-style environment variables into one document.
//! Later layers override earlier ones. The result is a [`GenericConfiguration`], which the binary and its libraries
//! extract their own typed sections from.
#![deny(missing_docs)]

use std::{io, path::Path, sync::Arc};

use figment::{
    error::Kind,
    providers::{Env, Format as _, Json, Yaml},
    Figment,
};
use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

/// Separator between nesting levels in environment variable names.
const NESTING: &str = "__";

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// A configuration file exists but could not be read.
    #[snafu(display("Could not read configuration file '{}': {}", path, source))]
    ReadFile {
        /// Path to the file.
        path: String,

        /// Error source.
        source: io::Error,
    },

    /// A configuration file was read but is not valid YAML or JSON.
    #[snafu(display("Configuration file '{}' is malformed: {}", path, source))]
    ParseFile {
        /// Path to the file.
        path: String,

        /// Error source.
        source: figment::Error,
    },

    /// An empty environment variable prefix was given.
    #[snafu(display("Environment variable prefix cannot be empty."))]
    EmptyPrefix,

    /// A required key has no value in any layer.
    #[snafu(display("Configuration key '{}' is required. {}", key, hint))]
    MissingField {
        /// Dotted path of the key.
        key: String,

        /// How the key can be provided.
        hint: String,
    },

    /// A key holds a value of the wrong type.
    #[snafu(display("Configuration key '{}' should be {}, found {}.", key, expected, found))]
    WrongType {
        /// Dotted path of the key.
        key: String,

        /// Type the key should hold.
        expected: String,

        /// Type actually found.
        found: String,
    },

    /// Any other failure while extracting a value.
    #[snafu(display("Invalid configuration: {}", source))]
    Invalid {
        /// Error source.
        source: figment::Error,
    },
}

/// Builds a [`GenericConfiguration`] out of a file and the environment.
pub struct ConfigurationLoader {
    figment: Figment,
    env_prefix: Option<String>,
}

impl Default for ConfigurationLoader {
    fn default() -> Self {
        Self {
            figment: Figment::new(),
            env_prefix: None,
        }
    }
}

impl ConfigurationLoader {
    /// Adds a configuration file layer.
    ///
    /// Files ending in `.json` are parsed as JSON. Anything else is parsed as YAML.
    ///
    /// # Errors
    ///
    /// If the file cannot be read or parsed, an error is returned.
    pub fn with_file<P: AsRef<Path>>(self, path: P) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).context(ReadFile {
            path: path.display().to_string(),
        })?;
        self.with_contents(path, &contents)
    }

    /// Adds a configuration file layer if the file exists.
    ///
    /// # Errors
    ///
    /// If the file exists but cannot be read or parsed, an error is returned.
    pub fn with_optional_file<P: AsRef<Path>>(self, path: P) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => self.with_contents(path, &contents),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(file_path = %path.display(), "Configuration file not found. Using defaults.");
                Ok(self)
            }
            Err(e) => Err(e).context(ReadFile {
                path: path.display().to_string(),
            }),
        }
    }

    fn with_contents(mut self, path: &Path, contents: &str) -> Result<Self, ConfigurationError> {
        if contents.trim().is_empty() {
            return Ok(self);
        }

        let is_json = path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let layer = if is_json {
            Figment::from(Json::string(contents))
        } else {
            Figment::from(Yaml::string(contents))
        };

        // Surface parse errors now instead of on first lookup.
        let _: figment::value::Value = layer.extract().context(ParseFile {
            path: path.display().to_string(),
        })?;

        self.figment = self.figment.admerge(layer);
        Ok(self)
    }

    /// Adds a layer of environment variables starting with `prefix`.
    ///
    /// An underscore is appended to the prefix when missing, so `sluice` matches `SLUICE_BACKEND`. Double underscores
    /// mark nesting: `SLUICE_HEALTH__TIMEOUT_SECS` sets `health.timeout_secs`.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, an error is returned.
    pub fn with_environment(mut self, prefix: &str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let mut prefix = prefix.to_uppercase();
        if !prefix.ends_with('_') {
            prefix.push('_');
        }

        self.figment = self.figment.admerge(Env::prefixed(&prefix).split(NESTING));
        self.env_prefix = Some(prefix);
        Ok(self)
    }

    /// Finishes loading.
    pub fn build(self) -> GenericConfiguration {
        GenericConfiguration {
            figment: Arc::new(self.figment),
            env_prefix: self.env_prefix.map(Arc::from),
        }
    }
}

/// Merged configuration, queried by dotted key or extracted whole.
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    figment: Arc<Figment>,
    env_prefix: Option<Arc<str>>,
}

impl GenericConfiguration {
    /// Gets the value at `key`, such as `health.timeout_secs`.
    ///
    /// # Errors
    ///
    /// If the key is missing or its value does not fit `T`, an error is returned.
    pub fn get<'de, T: Deserialize<'de>>(&self, key: &str) -> Result<T, ConfigurationError> {
        self.figment.extract_inner(key).map_err(|e| self.explain(Some(key), e))
    }

    /// Gets the value at `key`, or `None` if no layer sets it.
    ///
    /// # Errors
    ///
    /// If the key is set but its value does not fit `T`, an error is returned.
    pub fn get_opt<'de, T: Deserialize<'de>>(&self, key: &str) -> Result<Option<T>, ConfigurationError> {
        if self.figment.find_value(key).is_err() {
            return Ok(None);
        }
        self.get(key).map(Some)
    }

    /// Extracts the whole document as `T`.
    ///
    /// # Errors
    ///
    /// If the document does not fit `T`, an error is returned.
    pub fn as_typed<'de, T: Deserialize<'de>>(&self) -> Result<T, ConfigurationError> {
        self.figment.extract().map_err(|e| self.explain(None, e))
    }

    fn env_name(&self, key: &str) -> Option<String> {
        self.env_prefix
            .as_ref()
            .map(|prefix| format!("{}{}", prefix, key.replace('.', NESTING).to_uppercase()))
    }

    fn explain(&self, key: Option<&str>, e: figment::Error) -> ConfigurationError {
        let nested = e.path.join(".");
        let path = match (nested.is_empty(), key) {
            (true, Some(key)) => key.to_string(),
            _ => nested,
        };

        match e.kind {
            Kind::MissingField(ref field) => {
                // Lookups by key already name the whole path.
                let path = match key {
                    Some(key) if e.path.is_empty() => key.to_string(),
                    _ if path.is_empty() => field.to_string(),
                    _ => format!("{}.{}", path, field),
                };

                let hint = match self.env_name(&path) {
                    Some(var) => format!("Set `{}` in the configuration file or `{}` in the environment.", path, var),
                    None => format!("Set `{}` in the configuration file.", path),
                };
                ConfigurationError::MissingField { key: path, hint }
            }
            Kind::InvalidType(ref found, ref expected) => ConfigurationError::WrongType {
                key: path,
                expected: expected.clone(),
                found: found.to_string(),
            },
            _ => ConfigurationError::Invalid { source: e },
        }
    }
}
