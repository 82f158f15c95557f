//! Service registry.
//!
//! The registry is a human-editable YAML document describing every managed service. It is loaded and validated once per
//! run, and written back only when an update attempt succeeds, by replacing the whole file atomically.

use std::{
    collections::HashSet,
    fmt, fs, io,
    io::Write as _,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use semver::VersionReq;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};
use tracing::{debug, info};

use crate::lock::RunLockGuard;

/// Service registry error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum RegistryError {
    /// The registry file could not be read.
    #[snafu(display("failed to read service registry '{}': {}", path.display(), source))]
    Read {
        /// Registry path.
        path: PathBuf,

        /// Underlying I/O error.
        source: io::Error,
    },

    /// The registry file is not a valid registry document.
    #[snafu(display(
        "failed to parse service registry '{}': {}; fix the entry or delete the file to regenerate defaults",
        path.display(),
        source
    ))]
    Parse {
        /// Registry path.
        path: PathBuf,

        /// Underlying parse error.
        source: serde_yaml::Error,
    },

    /// The registry parsed, but describes an invalid set of services.
    #[snafu(display("invalid service registry '{}': {}", path.display(), reason))]
    Invalid {
        /// Registry path.
        path: PathBuf,

        /// What is wrong.
        reason: String,
    },

    /// No service with the given name exists.
    #[snafu(display("unknown service '{}'; run `sluice status` to list registered services", name))]
    UnknownService {
        /// Requested service name.
        name: String,
    },

    /// The registry could not be written back.
    #[snafu(display("failed to write service registry '{}': {}", path.display(), source))]
    Persist {
        /// Registry path.
        path: PathBuf,

        /// Underlying I/O error.
        source: io::Error,
    },

    /// The registry could not be serialized.
    #[snafu(display("failed to serialize service registry: {}", source))]
    Encode {
        /// Underlying serialization error.
        source: serde_yaml::Error,
    },
}

/// How a service moves from one version to the next.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStrategy {
    /// Replace instances incrementally, within the configured unavailability and surge bounds.
    #[default]
    Rolling,

    /// Stand up a complete, healthy parallel deployment before retiring the old one.
    BlueGreen,
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rolling => f.write_str("rolling"),
            Self::BlueGreen => f.write_str("blue_green"),
        }
    }
}

fn default_health_host() -> String {
    "127.0.0.1".to_string()
}

fn default_health_path() -> String {
    "/".to_string()
}

/// How to determine whether a service is healthy.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthCheck {
    /// An HTTP `GET` that must return a 2xx status.
    Http {
        /// Port to connect to.
        port: u16,

        /// Request path.
        #[serde(default = "default_health_path")]
        path: String,

        /// Host to connect to.
        #[serde(default = "default_health_host")]
        host: String,
    },

    /// A bare TCP connection that must be accepted.
    Tcp {
        /// Port to connect to.
        port: u16,

        /// Host to connect to.
        #[serde(default = "default_health_host")]
        host: String,
    },
}

impl fmt::Display for HealthCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http { port, path, host } => write!(f, "http://{}:{}{}", host, port, path),
            Self::Tcp { port, host } => write!(f, "tcp://{}:{}", host, port),
        }
    }
}

/// A managed service.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceDefinition {
    /// Unique name, stable across runs.
    pub name: String,

    /// Artifact reference without a version, such as `docker.io/library/postgres`.
    pub artifact: String,

    /// Last version known to be running successfully.
    pub current_version: String,

    /// Lower priorities update first.
    #[serde(default)]
    pub priority: i32,

    /// Services that must be healthy before this one is updated, in declared order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    /// Update strategy.
    #[serde(default)]
    pub policy: UpdateStrategy,

    /// Health signal.
    pub health_check: HealthCheck,

    /// Constrains which versions are considered candidates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_req: Option<VersionReq>,

    /// When `current_version` last changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl ServiceDefinition {
    /// Returns the artifact reference for the given version.
    pub fn artifact_at(&self, version: &str) -> String {
        format!("{}:{}", self.artifact, version)
    }
}

#[derive(Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct RegistryDocument {
    services: Vec<ServiceDefinition>,
}

/// The set of managed services, backed by a file.
#[derive(Clone, Debug)]
pub struct ServiceRegistry {
    path: PathBuf,
    services: Vec<ServiceDefinition>,
}

impl ServiceRegistry {
    /// Loads the registry from the given path.
    ///
    /// When the file does not exist, the default service set is used instead. It is written to the path on the first
    /// successful update.
    ///
    /// # Errors
    ///
    /// If the file cannot be read or parsed, or describes an invalid set of services, an error is returned.
    pub fn load<P: Into<PathBuf>>(path: P) -> Result<Self, RegistryError> {
        let path = path.into();
        let services = match fs::read_to_string(&path) {
            Ok(contents) => {
                let document: RegistryDocument = serde_yaml::from_str(&contents).context(Parse { path: &path })?;
                debug!(path = %path.display(), services = document.services.len(), "Loaded service registry.");
                document.services
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Service registry not found. Using default service set.");
                default_services()
            }
            Err(e) => return Err(e).context(Read { path }),
        };

        Self::from_services(path, services)
    }

    /// Creates a registry from an explicit set of services, validating it.
    ///
    /// # Errors
    ///
    /// If the services are invalid, an error is returned.
    pub fn from_services<P: Into<PathBuf>>(path: P, services: Vec<ServiceDefinition>) -> Result<Self, RegistryError> {
        let path = path.into();
        if let Err(reason) = validate(&services) {
            return Invalid { path, reason }.fail();
        }

        Ok(Self { path, services })
    }

    /// Returns the path backing this registry.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns all services in declared order.
    pub fn services(&self) -> &[ServiceDefinition] {
        &self.services
    }

    /// Returns the service with the given name, if any.
    pub fn get(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Records a new current version for the given service.
    ///
    /// The file is replaced as a whole: the new contents are written to a temporary file in the same directory and then
    /// renamed over the old file, so readers never observe a partial write. The in-memory registry is only updated once
    /// the file has been replaced.
    ///
    /// # Errors
    ///
    /// If the service does not exist, or the file cannot be written, an error is returned.
    pub fn persist_version(&mut self, lock: &RunLockGuard, name: &str, version: &str) -> Result<(), RegistryError> {
        let index = self
            .services
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| RegistryError::UnknownService { name: name.to_string() })?;

        let mut services = self.services.clone();
        services[index].current_version = version.to_string();
        services[index].last_updated = Some(Utc::now());

        write_atomically(&self.path, &services)?;
        self.services = services;

        info!(service = name, version, path = %self.path.display(), run_owner = lock.owner(), "Recorded new current version.");
        Ok(())
    }
}

fn write_atomically(path: &Path, services: &[ServiceDefinition]) -> Result<(), RegistryError> {
    let document = RegistryDocument {
        services: services.to_vec(),
    };
    let contents = serde_yaml::to_string(&document).context(Encode)?;

    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(directory).context(Persist { path })?;

    let mut file = tempfile::NamedTempFile::new_in(directory).context(Persist { path })?;
    file.write_all(REGISTRY_HEADER.as_bytes()).context(Persist { path })?;
    file.write_all(contents.as_bytes()).context(Persist { path })?;
    file.as_file().sync_all().context(Persist { path })?;
    file.persist(path).map_err(|e| e.error).context(Persist { path })?;

    Ok(())
}

const REGISTRY_HEADER: &str = "# Managed by sluice. `current_version` and `last_updated` are rewritten after each successful update.\n";

/// Returns the service set used when no registry file exists yet.
///
/// A datastore tier (`postgres`, `redis`) at priority 0, an `api` tier at priority 1 that depends on both, and a `web`
/// tier at priority 2 that depends on `api`.
pub fn default_services() -> Vec<ServiceDefinition> {
    fn service(
        name: &str, artifact: &str, version: &str, priority: i32, deps: &[&str], health_check: HealthCheck,
    ) -> ServiceDefinition {
        ServiceDefinition {
            name: name.to_string(),
            artifact: artifact.to_string(),
            current_version: version.to_string(),
            priority,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            policy: UpdateStrategy::Rolling,
            health_check,
            version_req: None,
            last_updated: None,
        }
    }

    vec![
        service(
            "postgres",
            "docker.io/library/postgres",
            "16.4",
            0,
            &[],
            HealthCheck::Tcp {
                port: 5432,
                host: default_health_host(),
            },
        ),
        service(
            "redis",
            "docker.io/library/redis",
            "7.4.0",
            0,
            &[],
            HealthCheck::Tcp {
                port: 6379,
                host: default_health_host(),
            },
        ),
        service(
            "api",
            "ghcr.io/sluice-rs/api",
            "1.0.0",
            1,
            &["postgres", "redis"],
            HealthCheck::Http {
                port: 8080,
                path: "/health".to_string(),
                host: default_health_host(),
            },
        ),
        service(
            "web",
            "ghcr.io/sluice-rs/web",
            "1.0.0",
            2,
            &["api"],
            HealthCheck::Http {
                port: 80,
                path: "/".to_string(),
                host: default_health_host(),
            },
        ),
    ]
}

/// Checks everything about a service set except dependency cycles, which the planner reports.
fn validate(services: &[ServiceDefinition]) -> Result<(), String> {
    let mut names = HashSet::new();
    for service in services {
        if service.name.trim().is_empty() {
            return Err("service names must not be empty".to_string());
        }
        if !names.insert(service.name.as_str()) {
            return Err(format!("service '{}' is defined more than once", service.name));
        }
        if service.artifact.trim().is_empty() {
            return Err(format!("service '{}' has an empty artifact reference", service.name));
        }
        if artifact_has_version(&service.artifact) {
            return Err(format!(
                "service '{}' artifact '{}' must not include a tag or digest; record it in `current_version` instead",
                service.name, service.artifact
            ));
        }
        if service.current_version.trim().is_empty() {
            return Err(format!("service '{}' has an empty current version", service.name));
        }
    }

    for service in services {
        for dependency in &service.dependencies {
            if dependency == &service.name {
                return Err(format!("service '{}' depends on itself", service.name));
            }
            if !names.contains(dependency.as_str()) {
                return Err(format!(
                    "service '{}' depends on unknown service '{}'",
                    service.name, dependency
                ));
            }
        }
    }

    Ok(())
}

fn artifact_has_version(artifact: &str) -> bool {
    let last_segment = artifact.rsplit('/').next().unwrap_or(artifact);
    artifact.contains('@') || (artifact.contains('/') && last_segment.contains(':')) || (!artifact.contains('/') && artifact.contains(':'))
}
