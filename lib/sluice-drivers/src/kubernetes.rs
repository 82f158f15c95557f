use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{api::apps::v1::Deployment, apimachinery::pkg::apis::meta::v1::ObjectMeta};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    Client,
};
use serde_json::{json, Value};
use sluice_core::{
    driver::{DeploymentDriver, DriverError, RolloutBounds, RolloutSettings, ServiceState},
    lock::RunLockGuard,
    registry::{ServiceDefinition, UpdateStrategy},
    wait::poll_until,
};
use sluice_error::{ErrorContext as _, GenericError};
use tracing::{debug, info, warn};

use crate::version_from_image;

const FIELD_MANAGER: &str = "sluice";
const VERSION_ANNOTATION: &str = "sluice.io/version";
const SLOT_LABEL: &str = "sluice.io/slot";
const GREEN_SLOT: &str = "green";

/// Where a Deployment's rollout stands.
#[derive(Debug, Eq, PartialEq)]
enum RolloutProgress {
    Complete,
    Progressing(String),
    Failed(String),
}

fn rollout_progress(deployment: &Deployment) -> RolloutProgress {
    let Some(status) = deployment.status.as_ref() else {
        return RolloutProgress::Progressing("no status reported".to_string());
    };

    if let Some(condition) = status
        .conditions
        .iter()
        .flatten()
        .find(|c| c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded"))
    {
        return RolloutProgress::Failed(
            condition
                .message
                .clone()
                .unwrap_or_else(|| "progress deadline exceeded".to_string()),
        );
    }

    let generation = deployment.metadata.generation.unwrap_or(0);
    let observed = status.observed_generation.unwrap_or(0);
    if observed < generation {
        return RolloutProgress::Progressing(format!(
            "waiting for generation {} to be observed (at {})",
            generation, observed
        ));
    }

    let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let updated = status.updated_replicas.unwrap_or(0);
    let total = status.replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);

    if updated < desired {
        RolloutProgress::Progressing(format!("{} of {} replicas updated", updated, desired))
    } else if total > updated {
        RolloutProgress::Progressing(format!("{} old replicas pending termination", total - updated))
    } else if available < desired {
        RolloutProgress::Progressing(format!("{} of {} updated replicas available", available, desired))
    } else {
        RolloutProgress::Complete
    }
}

/// Finds the name and image of the container that carries the service's artifact.
///
/// Prefers the container named after the service, falling back to the first container in the pod.
fn service_container<'a>(deployment: &'a Deployment, service: &str) -> Option<(&'a str, Option<&'a str>)> {
    let containers = &deployment.spec.as_ref()?.template.spec.as_ref()?.containers;
    containers
        .iter()
        .find(|c| c.name == service)
        .or_else(|| containers.first())
        .map(|c| (c.name.as_str(), c.image.as_deref()))
}

/// Limits written into a Deployment's rolling update strategy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RollingLimits {
    /// The configured bounds, scaled to the Deployment's replica count.
    Bounded(RolloutBounds),

    /// Replace every pod at once without ever going below the replica count. Only used while the green copy is
    /// serving.
    Cutover,
}

impl RollingLimits {
    /// Returns the `maxUnavailable` and `maxSurge` values.
    fn values(self) -> (Value, Value) {
        match self {
            Self::Bounded(bounds) => (json!(bounds.max_unavailable), json!(bounds.max_surge)),
            Self::Cutover => (json!(0), json!("100%")),
        }
    }
}

fn deployment_bounds(deployment: &Deployment, settings: &RolloutSettings) -> RolloutBounds {
    let replicas = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    settings.bounds_for(u32::try_from(replicas).unwrap_or(1))
}

/// Steps of a blue-green update.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CutoverStep {
    /// Delete a green copy left by an interrupted run.
    ClearGreen,

    /// Create the green copy on the new version.
    CreateGreen,

    /// Wait until every green pod is ready.
    AwaitGreen,

    /// Move the original Deployment to the new version while green serves.
    ReplaceBlue,

    /// Wait for the original Deployment's rollout.
    AwaitBlue,

    /// Delete the green copy.
    RemoveGreen,
}

const BLUE_GREEN_CUTOVER: [CutoverStep; 6] = [
    CutoverStep::ClearGreen,
    CutoverStep::CreateGreen,
    CutoverStep::AwaitGreen,
    CutoverStep::ReplaceBlue,
    CutoverStep::AwaitBlue,
    CutoverStep::RemoveGreen,
];

fn rolling_patch(container: &str, image: &str, version: &str, limits: RollingLimits) -> Value {
    let (max_unavailable, max_surge) = limits.values();
    json!({
        "spec": {
            "strategy": {
                "type": "RollingUpdate",
                "rollingUpdate": {
                    "maxUnavailable": max_unavailable,
                    "maxSurge": max_surge,
                },
            },
            "template": {
                "metadata": {
                    "annotations": { (VERSION_ANNOTATION): version },
                },
                "spec": {
                    "containers": [{ "name": container, "image": image }],
                },
            },
        },
    })
}

fn green_name(service: &str) -> String {
    format!("{}-{}", service, GREEN_SLOT)
}

/// Builds a parallel copy of `blue` running `image`, whose pods carry an extra slot label.
fn green_deployment(blue: &Deployment, service: &str, container: &str, image: &str, version: &str) -> Deployment {
    let mut spec = blue.spec.clone().unwrap_or_default();
    spec.selector
        .match_labels
        .get_or_insert_with(BTreeMap::new)
        .insert(SLOT_LABEL.to_string(), GREEN_SLOT.to_string());

    let template_metadata = spec.template.metadata.get_or_insert_with(ObjectMeta::default);
    template_metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(SLOT_LABEL.to_string(), GREEN_SLOT.to_string());
    template_metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(VERSION_ANNOTATION.to_string(), version.to_string());

    if let Some(pod_spec) = spec.template.spec.as_mut() {
        for c in pod_spec.containers.iter_mut().filter(|c| c.name == container) {
            c.image = Some(image.to_string());
        }
    }

    let mut labels = blue.metadata.labels.clone().unwrap_or_default();
    labels.insert(SLOT_LABEL.to_string(), GREEN_SLOT.to_string());

    Deployment {
        metadata: ObjectMeta {
            name: Some(green_name(service)),
            namespace: blue.metadata.namespace.clone(),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    }
}

fn classify_api_error(service: &str, error: kube::Error) -> DriverError {
    match error {
        kube::Error::Api(response) => match response.code {
            404 => DriverError::ServiceNotFound {
                service: service.to_string(),
            },
            400 | 422 => DriverError::InvalidManifest {
                service: service.to_string(),
                message: response.message,
            },
            403 if response.message.contains("exceeded quota") => DriverError::ResourceExhausted {
                service: service.to_string(),
                message: response.message,
            },
            code => DriverError::Unreachable {
                message: format!("API server returned {}: {}", code, response.message),
            },
        },
        other => DriverError::Unreachable {
            message: other.to_string(),
        },
    }
}

fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(e) if e.code == 404)
}

/// Kubernetes backend.
///
/// Each service maps to the Deployment of the same name in the configured namespace. Rolling updates patch the
/// Deployment's image and rolling update bounds and then follow its rollout. Blue-green updates first bring up a
/// complete `<service>-green` Deployment, then move the original Deployment over with no unavailability before
/// deleting the green copy.
pub struct KubernetesDriver {
    deployments: Api<Deployment>,
    settings: RolloutSettings,
}

impl KubernetesDriver {
    /// Creates a new `KubernetesDriver` using the ambient kubeconfig or in-cluster configuration.
    ///
    /// # Errors
    ///
    /// If no usable cluster configuration is found, an error is returned.
    pub async fn new(namespace: String, settings: RolloutSettings) -> Result<Self, GenericError> {
        let client = Client::try_default()
            .await
            .error_context("Failed to create Kubernetes client.")?;

        Ok(Self {
            deployments: Api::namespaced(client, &namespace),
            settings,
        })
    }

    async fn deployment(&self, service: &ServiceDefinition) -> Result<Deployment, DriverError> {
        self.deployments
            .get(&service.name)
            .await
            .map_err(|e| classify_api_error(&service.name, e))
    }

    async fn patch_rolling(
        &self, service: &ServiceDefinition, deployment: &Deployment, version: &str, limits: RollingLimits,
    ) -> Result<(), DriverError> {
        let container = service_container(deployment, &service.name)
            .map(|(name, _)| name)
            .ok_or_else(|| DriverError::InvalidManifest {
                service: service.name.clone(),
                message: "deployment has no containers".to_string(),
            })?;

        let patch = rolling_patch(container, &service.artifact_at(version), version, limits);
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.deployments
            .patch(&service.name, &params, &Patch::Strategic(patch))
            .await
            .map_err(|e| classify_api_error(&service.name, e))?;

        debug!(service = %service.name, version, "Patched deployment.");
        Ok(())
    }

    async fn wait_rollout(&self, service: &ServiceDefinition, name: &str) -> Result<(), DriverError> {
        let outcome = poll_until(self.settings.poll_interval, self.settings.timeout, || async {
            let deployment = match self.deployments.get(name).await {
                Ok(deployment) => deployment,
                Err(e) => return Ok(Err(classify_api_error(&service.name, e))),
            };
            match rollout_progress(&deployment) {
                RolloutProgress::Complete => Ok(Ok(())),
                RolloutProgress::Progressing(detail) => Err(detail),
                RolloutProgress::Failed(message) => Ok(Err(DriverError::InstanceFailed {
                    service: service.name.clone(),
                    message,
                })),
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(timed_out) => {
                warn!(service = %service.name, deployment = name, last = %timed_out.last, "Rollout did not complete in time.");
                Err(DriverError::RolloutTimedOut {
                    service: service.name.clone(),
                    timeout: self.settings.timeout,
                })
            }
        }
    }

    /// Deletes the green Deployment, if any, and waits for it to be gone.
    async fn remove_green(&self, service: &ServiceDefinition) -> Result<(), DriverError> {
        let name = green_name(&service.name);
        match self.deployments.delete(&name, &DeleteParams::background()).await {
            Ok(_) => debug!(service = %service.name, deployment = %name, "Deleting green deployment."),
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(classify_api_error(&service.name, e)),
        }

        let outcome = poll_until(self.settings.poll_interval, self.settings.timeout, || async {
            match self.deployments.get_opt(&name).await {
                Ok(None) => Ok(Ok(())),
                Ok(Some(_)) => Err("still terminating".to_string()),
                Err(e) => Ok(Err(classify_api_error(&service.name, e))),
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(DriverError::RolloutTimedOut {
                service: service.name.clone(),
                timeout: self.settings.timeout,
            }),
        }
    }

    async fn blue_green(&self, service: &ServiceDefinition, blue: &Deployment, version: &str) -> Result<(), DriverError> {
        let container = service_container(blue, &service.name)
            .map(|(name, _)| name.to_string())
            .ok_or_else(|| DriverError::InvalidManifest {
                service: service.name.clone(),
                message: "deployment has no containers".to_string(),
            })?;

        let green_name = green_name(&service.name);
        for step in BLUE_GREEN_CUTOVER {
            match step {
                CutoverStep::ClearGreen | CutoverStep::RemoveGreen => self.remove_green(service).await?,
                CutoverStep::CreateGreen => {
                    let image = service.artifact_at(version);
                    let green = green_deployment(blue, &service.name, &container, &image, version);
                    self.deployments
                        .create(&PostParams::default(), &green)
                        .await
                        .map_err(|e| classify_api_error(&service.name, e))?;
                    info!(service = %service.name, deployment = %green_name, version, "Created green deployment.");
                }
                CutoverStep::AwaitGreen => self.wait_rollout(service, &green_name).await?,
                CutoverStep::ReplaceBlue => {
                    self.patch_rolling(service, blue, version, RollingLimits::Cutover).await?
                }
                CutoverStep::AwaitBlue => self.wait_rollout(service, &service.name).await?,
            }
        }

        Ok(())
    }
}

#[async_trait]
impl DeploymentDriver for KubernetesDriver {
    fn backend_name(&self) -> &'static str {
        "kubernetes"
    }

    async fn current_state(&self, service: &ServiceDefinition) -> Result<ServiceState, DriverError> {
        let deployment = self.deployment(service).await?;

        let version = service_container(&deployment, &service.name)
            .and_then(|(_, image)| image)
            .and_then(version_from_image)
            .map(str::to_string);
        let replicas = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let ready_replicas = deployment
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);

        Ok(ServiceState {
            version,
            replicas: u32::try_from(replicas).unwrap_or(0),
            ready_replicas: u32::try_from(ready_replicas).unwrap_or(0),
        })
    }

    async fn apply_version(
        &self, lock: &RunLockGuard, service: &ServiceDefinition, version: &str, strategy: UpdateStrategy,
    ) -> Result<(), DriverError> {
        let deployment = self.deployment(service).await?;

        match strategy {
            UpdateStrategy::Rolling => {
                let bounds = deployment_bounds(&deployment, &self.settings);
                info!(
                    service = %service.name,
                    version,
                    max_unavailable = bounds.max_unavailable,
                    max_surge = bounds.max_surge,
                    run_owner = lock.owner(),
                    "Starting rolling update."
                );

                self.patch_rolling(service, &deployment, version, RollingLimits::Bounded(bounds))
                    .await?;
                self.wait_rollout(service, &service.name).await
            }
            UpdateStrategy::BlueGreen => {
                info!(service = %service.name, version, run_owner = lock.owner(), "Starting blue-green update.");
                self.blue_green(service, &deployment, version).await
            }
        }
    }

    async fn revert_version(
        &self, lock: &RunLockGuard, service: &ServiceDefinition, previous_version: &str,
    ) -> Result<(), DriverError> {
        self.remove_green(service).await?;

        let deployment = self.deployment(service).await?;
        let bounds = deployment_bounds(&deployment, &self.settings);

        info!(
            service = %service.name,
            version = previous_version,
            run_owner = lock.owner(),
            "Reverting deployment."
        );
        self.patch_rolling(service, &deployment, previous_version, RollingLimits::Bounded(bounds))
            .await?;
        self.wait_rollout(service, &service.name).await
    }
}
