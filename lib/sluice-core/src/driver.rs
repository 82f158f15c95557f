//! Deployment driver contract.
//!
//! A [`DeploymentDriver`] is the only way a run touches the deployment backend. The attempt state machine is written
//! entirely against this trait, and concrete backends are selected at startup.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use snafu::Snafu;

use crate::{
    lock::RunLockGuard,
    registry::{ServiceDefinition, UpdateStrategy},
};

/// Deployment driver error.
///
/// Backend-specific errors are reduced to a message so that the state machine stays backend-agnostic.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum DriverError {
    /// The backend could not be reached, or returned an unexpected error.
    #[snafu(display("deployment backend unreachable: {}", message))]
    Unreachable {
        /// Backend error message.
        message: String,
    },

    /// The backend does not know about the service.
    #[snafu(display("service '{}' not found in the deployment backend", service))]
    ServiceNotFound {
        /// Service name.
        service: String,
    },

    /// The backend rejected the desired state.
    #[snafu(display("invalid manifest for service '{}': {}", service, message))]
    InvalidManifest {
        /// Service name.
        service: String,

        /// Backend error message.
        message: String,
    },

    /// The backend lacks the resources to schedule the desired state.
    #[snafu(display("insufficient resources to deploy service '{}': {}", service, message))]
    ResourceExhausted {
        /// Service name.
        service: String,

        /// Backend error message.
        message: String,
    },

    /// The rollout did not converge in time.
    #[snafu(display("rollout of service '{}' did not complete within {}s", service, timeout.as_secs()))]
    RolloutTimedOut {
        /// Service name.
        service: String,

        /// Rollout timeout.
        timeout: Duration,
    },

    /// A new instance failed while starting.
    #[snafu(display("instance of service '{}' failed: {}", service, message))]
    InstanceFailed {
        /// Service name.
        service: String,

        /// Failure detail.
        message: String,
    },
}

/// Observed backend state of a service.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ServiceState {
    /// Version the backend is running, if it can be determined.
    ///
    /// When instances disagree, this is the version of the newest instance.
    pub version: Option<String>,

    /// Number of instances.
    pub replicas: u32,

    /// Number of instances reporting ready.
    pub ready_replicas: u32,
}

impl ServiceState {
    /// Returns `true` if at least one instance exists and every instance is ready.
    pub fn is_ready(&self) -> bool {
        self.replicas > 0 && self.ready_replicas >= self.replicas
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "version={} ready={}/{}",
            self.version.as_deref().unwrap_or("unknown"),
            self.ready_replicas,
            self.replicas
        )
    }
}

/// Rollout tuning shared by every backend.
#[derive(Clone, Debug)]
pub struct RolloutSettings {
    /// Fraction of current replicas that may be unavailable during a rolling update.
    pub max_unavailable: f64,

    /// Fraction of current replicas that may be created above the desired count during a rolling update.
    pub max_surge: f64,

    /// How long a single rollout may take.
    pub timeout: Duration,

    /// Interval between rollout progress checks.
    pub poll_interval: Duration,
}

impl RolloutSettings {
    /// Returns the instance bounds for a service with the given number of replicas.
    pub fn bounds_for(&self, replicas: u32) -> RolloutBounds {
        RolloutBounds::for_replicas(replicas, self.max_unavailable, self.max_surge)
    }
}

/// Absolute instance bounds for one rolling update.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RolloutBounds {
    /// Instances that may be unavailable at once.
    pub max_unavailable: u32,

    /// Extra instances that may exist at once.
    pub max_surge: u32,
}

impl RolloutBounds {
    /// Converts fractional bounds into instance counts.
    ///
    /// Unavailability rounds down and surge rounds up, and both are at least one so that single-replica services can
    /// still be updated. Unavailability never exceeds the replica count.
    pub fn for_replicas(replicas: u32, max_unavailable: f64, max_surge: f64) -> Self {
        let scaled = |fraction: f64, round: fn(f64) -> f64| -> u32 {
            let value = round(fraction.max(0.0) * f64::from(replicas));
            if value >= f64::from(u32::MAX) {
                u32::MAX
            } else {
                value as u32
            }
        };

        let max_unavailable = scaled(max_unavailable, f64::floor).max(1).min(replicas.max(1));
        let max_surge = scaled(max_surge, f64::ceil).max(1);

        Self {
            max_unavailable,
            max_surge,
        }
    }
}

/// A deployment backend.
///
/// Calls that change the backend take the [`RunLockGuard`] of the current run, so they cannot be made without holding
/// the run lock.
#[async_trait]
pub trait DeploymentDriver: Send + Sync {
    /// Short backend name, used in logs and reports.
    fn backend_name(&self) -> &'static str;

    /// Reads the current state of the service without changing it.
    async fn current_state(&self, service: &ServiceDefinition) -> Result<ServiceState, DriverError>;

    /// Moves the service to the given version using the given strategy, returning once the rollout has converged.
    async fn apply_version(
        &self, lock: &RunLockGuard, service: &ServiceDefinition, version: &str, strategy: UpdateStrategy,
    ) -> Result<(), DriverError>;

    /// Moves the service back to a previous version.
    ///
    /// Also cleans up anything a failed [`apply_version`](DeploymentDriver::apply_version) may have left behind.
    async fn revert_version(
        &self, lock: &RunLockGuard, service: &ServiceDefinition, previous_version: &str,
    ) -> Result<(), DriverError>;
}
