//! Orchestrator configuration.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use sluice_config::GenericConfiguration;
use sluice_error::GenericError;

use crate::{attempt::AttemptSettings, driver::RolloutSettings};

/// Deployment backend selection.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Local Docker Engine composition.
    #[default]
    Compose,

    /// Kubernetes cluster.
    Kubernetes,
}

/// What to do when a dependency is unhealthy.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnhealthyDependencyPolicy {
    /// Skip the dependent service and continue with the rest of the plan.
    #[default]
    Skip,

    /// Stop the run. Remaining services are reported as not attempted.
    Abort,
}

/// Local composition backend settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ComposeConfiguration {
    /// Compose project that managed containers belong to.
    pub project: String,

    /// Grace period given to containers when stopping them.
    pub stop_timeout_secs: u64,
}

impl Default for ComposeConfiguration {
    fn default() -> Self {
        Self {
            project: "sluice".to_string(),
            stop_timeout_secs: 10,
        }
    }
}

/// Cluster backend settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct KubernetesConfiguration {
    /// Namespace that managed deployments live in.
    pub namespace: String,
}

impl Default for KubernetesConfiguration {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
        }
    }
}

/// Rolling update bounds.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RolloutConfiguration {
    /// Fraction of replicas that may be unavailable during a rolling update.
    pub max_unavailable: f64,

    /// Fraction of replicas that may be created above the desired count during a rolling update.
    pub max_surge: f64,

    /// How long the backend has to converge on a new version.
    pub timeout_secs: u64,

    /// Interval between backend convergence checks.
    pub poll_interval_secs: u64,
}

impl Default for RolloutConfiguration {
    fn default() -> Self {
        Self {
            max_unavailable: 0.25,
            max_surge: 0.25,
            timeout_secs: 300,
            poll_interval_secs: 2,
        }
    }
}

/// Health check timing.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfiguration {
    /// How long an updated service has to become healthy.
    pub timeout_secs: u64,

    /// Interval between probes.
    pub interval_secs: u64,

    /// How long a reverted service has to become healthy.
    pub rollback_timeout_secs: u64,

    /// Timeout of a single probe.
    pub request_timeout_secs: u64,
}

impl Default for HealthConfiguration {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            interval_secs: 5,
            rollback_timeout_secs: 60,
            request_timeout_secs: 5,
        }
    }
}

/// Dependency wait timing.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DependencyWaitConfiguration {
    /// How long to wait for each dependency to be healthy.
    pub timeout_secs: u64,

    /// Interval between probes.
    pub interval_secs: u64,
}

impl Default for DependencyWaitConfiguration {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            interval_secs: 5,
        }
    }
}

/// Version resolver settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ResolverConfiguration {
    /// Whether pre-release versions are candidates.
    pub allow_prerelease: bool,

    /// Timeout for registry requests.
    pub timeout_secs: u64,
}

impl Default for ResolverConfiguration {
    fn default() -> Self {
        Self {
            allow_prerelease: false,
            timeout_secs: 10,
        }
    }
}

/// Vulnerability gate settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct GateConfiguration {
    /// Whether candidates are scanned at all.
    pub enabled: bool,

    /// Scanner command.
    pub command: String,

    /// Comma-separated severities that count as findings.
    pub severities: String,

    /// Whether findings block the update.
    pub block_on_findings: bool,

    /// Scan timeout.
    pub timeout_secs: u64,
}

impl Default for GateConfiguration {
    fn default() -> Self {
        Self {
            enabled: false,
            command: "trivy".to_string(),
            severities: "HIGH,CRITICAL".to_string(),
            block_on_findings: false,
            timeout_secs: 300,
        }
    }
}

/// Email notification settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EmailConfiguration {
    /// `sendmail`-compatible command.
    #[serde(default = "default_sendmail")]
    pub command: String,

    /// Sender address.
    pub from: String,

    /// Recipient addresses.
    pub to: Vec<String>,
}

fn default_sendmail() -> String {
    "/usr/sbin/sendmail -t".to_string()
}

/// Notification settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationConfiguration {
    /// Chat webhook URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,

    /// Email delivery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<EmailConfiguration>,

    /// Number of notifications that may be queued for delivery.
    pub queue_capacity: usize,

    /// How long to wait for queued notifications at exit.
    pub flush_timeout_secs: u64,
}

impl Default for NotificationConfiguration {
    fn default() -> Self {
        Self {
            webhook_url: None,
            email: None,
            queue_capacity: 64,
            flush_timeout_secs: 10,
        }
    }
}

/// Orchestrator configuration.
///
/// Every field has a default, so an empty configuration is valid.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfiguration {
    /// Path to the service registry file.
    pub registry_path: PathBuf,

    /// Path to the run lock marker.
    pub lock_path: PathBuf,

    /// Directory run reports are written to.
    pub report_dir: PathBuf,

    /// Deployment backend.
    pub backend: BackendKind,

    /// Local composition backend settings.
    pub compose: ComposeConfiguration,

    /// Cluster backend settings.
    pub kubernetes: KubernetesConfiguration,

    /// Rolling update bounds.
    pub rollout: RolloutConfiguration,

    /// Health check timing.
    pub health: HealthConfiguration,

    /// Dependency wait timing.
    pub dependency_wait: DependencyWaitConfiguration,

    /// Whether failed updates are reverted.
    pub rollback_on_failure: bool,

    /// Pause after each service that touched the backend.
    pub settle_delay_secs: u64,

    /// What to do when a dependency is unhealthy.
    pub unhealthy_dependency: UnhealthyDependencyPolicy,

    /// Version resolver settings.
    pub resolver: ResolverConfiguration,

    /// Vulnerability gate settings.
    pub gate: GateConfiguration,

    /// Notification settings.
    pub notifications: NotificationConfiguration,
}

impl Default for OrchestratorConfiguration {
    fn default() -> Self {
        Self {
            registry_path: PathBuf::from("/var/lib/sluice/services.yaml"),
            lock_path: PathBuf::from("/tmp/sluice.lock"),
            report_dir: PathBuf::from("/var/lib/sluice/reports"),
            backend: BackendKind::default(),
            compose: ComposeConfiguration::default(),
            kubernetes: KubernetesConfiguration::default(),
            rollout: RolloutConfiguration::default(),
            health: HealthConfiguration::default(),
            dependency_wait: DependencyWaitConfiguration::default(),
            rollback_on_failure: true,
            settle_delay_secs: 2,
            unhealthy_dependency: UnhealthyDependencyPolicy::default(),
            resolver: ResolverConfiguration::default(),
            gate: GateConfiguration::default(),
            notifications: NotificationConfiguration::default(),
        }
    }
}

impl OrchestratorConfiguration {
    /// Creates a new `OrchestratorConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If any value is of the wrong type, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed()?)
    }

    /// Returns the per-attempt settings.
    pub fn attempt_settings(&self) -> AttemptSettings {
        AttemptSettings {
            health_interval: Duration::from_secs(self.health.interval_secs.max(1)),
            health_timeout: Duration::from_secs(self.health.timeout_secs),
            rollback_health_timeout: Duration::from_secs(self.health.rollback_timeout_secs),
            dependency_interval: Duration::from_secs(self.dependency_wait.interval_secs.max(1)),
            dependency_timeout: Duration::from_secs(self.dependency_wait.timeout_secs),
            rollback_on_failure: self.rollback_on_failure,
            block_on_findings: self.gate.block_on_findings,
            dry_run: false,
            strategy_override: None,
        }
    }

    /// Returns the backend rollout settings.
    pub fn rollout_settings(&self) -> RolloutSettings {
        RolloutSettings {
            max_unavailable: self.rollout.max_unavailable,
            max_surge: self.rollout.max_surge,
            timeout: Duration::from_secs(self.rollout.timeout_secs),
            poll_interval: Duration::from_secs(self.rollout.poll_interval_secs.max(1)),
        }
    }

    /// Returns the pause after each service that touched the backend.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }
}
