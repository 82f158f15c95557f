//! Rollback.

use std::time::Duration;

use snafu::{ResultExt as _, Snafu};
use tracing::{info, warn};

use crate::{
    driver::{DeploymentDriver, DriverError},
    health::{wait_until_healthy, HealthProbe},
    lock::RunLockGuard,
    registry::ServiceDefinition,
};

/// Rollback error.
///
/// Either way, the service needs manual intervention: a failed rollback is never retried automatically.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum RollbackError {
    /// The backend rejected the revert.
    #[snafu(display("failed to revert '{}' to {}: {}", service, version, source))]
    Revert {
        /// Service name.
        service: String,

        /// Version being reverted to.
        version: String,

        /// Driver error.
        source: DriverError,
    },

    /// The reverted service did not become healthy.
    #[snafu(display("'{}' is still unhealthy after reverting to {}: {}", service, version, detail))]
    StillUnhealthy {
        /// Service name.
        service: String,

        /// Version reverted to.
        version: String,

        /// Last health detail.
        detail: String,
    },
}

/// Reverts a single service to its last-known-good version.
pub struct RollbackController<'a> {
    driver: &'a dyn DeploymentDriver,
    prober: &'a dyn HealthProbe,
    health_interval: Duration,
    health_timeout: Duration,
}

impl<'a> RollbackController<'a> {
    /// Creates a new `RollbackController`.
    ///
    /// `health_timeout` bounds the health check after the revert, and is normally shorter than the update health check.
    pub fn new(
        driver: &'a dyn DeploymentDriver, prober: &'a dyn HealthProbe, health_interval: Duration,
        health_timeout: Duration,
    ) -> Self {
        Self {
            driver,
            prober,
            health_interval,
            health_timeout,
        }
    }

    /// Reverts the service to `previous_version` and waits for it to become healthy.
    ///
    /// # Errors
    ///
    /// If the driver fails to revert, or the service is not healthy within the rollback health timeout, an error is
    /// returned.
    pub async fn revert(
        &self, lock: &RunLockGuard, service: &ServiceDefinition, previous_version: &str,
    ) -> Result<(), RollbackError> {
        info!(service = %service.name, version = previous_version, "Reverting service.");

        self.driver
            .revert_version(lock, service, previous_version)
            .await
            .context(Revert {
                service: &service.name,
                version: previous_version,
            })?;

        let health = wait_until_healthy(self.prober, service, self.health_interval, self.health_timeout).await;
        if !health.healthy {
            warn!(service = %service.name, version = previous_version, health = %health, "Service unhealthy after revert.");
            return StillUnhealthy {
                service: &service.name,
                version: previous_version,
                detail: health.message.unwrap_or_else(|| "unhealthy".to_string()),
            }
            .fail();
        }

        info!(service = %service.name, version = previous_version, "Service healthy after revert.");
        Ok(())
    }
}
