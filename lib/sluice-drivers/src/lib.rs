//! Deployment backends.
//!
//! [`ComposeDriver`] manages containers of a Docker Compose project through the Docker Engine API, and
//! [`KubernetesDriver`] manages Deployments in a Kubernetes namespace. Both implement
//! [`DeploymentDriver`](sluice_core::driver::DeploymentDriver) and are selected by the `backend` setting.
#![deny(missing_docs)]

use std::sync::Arc;

use sluice_core::{
    config::{BackendKind, OrchestratorConfiguration},
    driver::DeploymentDriver,
};
use sluice_error::GenericError;

mod compose;
pub use self::compose::ComposeDriver;

mod kubernetes;
pub use self::kubernetes::KubernetesDriver;

mod rollout;

/// Creates the deployment backend selected by the configuration.
///
/// # Errors
///
/// If the backend's client cannot be created, an error is returned.
pub async fn driver_from_configuration(
    config: &OrchestratorConfiguration,
) -> Result<Arc<dyn DeploymentDriver>, GenericError> {
    let rollout = config.rollout_settings();
    let driver: Arc<dyn DeploymentDriver> = match config.backend {
        BackendKind::Compose => Arc::new(ComposeDriver::new(
            config.compose.project.clone(),
            config.compose.stop_timeout_secs,
            rollout,
        )?),
        BackendKind::Kubernetes => {
            Arc::new(KubernetesDriver::new(config.kubernetes.namespace.clone(), rollout).await?)
        }
    };
    Ok(driver)
}

/// Extracts the tag from an image reference, such as `1.2.0` from `registry:5000/app:1.2.0@sha256:...`.
pub(crate) fn version_from_image(image: &str) -> Option<&str> {
    let without_digest = image.split('@').next().unwrap_or(image);
    let last_segment = without_digest.rsplit('/').next().unwrap_or(without_digest);
    last_segment
        .split_once(':')
        .map(|(_, tag)| tag)
        .filter(|tag| !tag.is_empty())
}
