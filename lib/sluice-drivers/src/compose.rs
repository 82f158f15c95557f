use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, NetworkingConfig, RemoveContainerOptions,
        StopContainerOptions,
    },
    errors::Error as DockerError,
    image::CreateImageOptions,
    models::{ContainerInspectResponse, ContainerStateStatusEnum, ContainerSummary, EndpointSettings, HealthStatusEnum, HostConfig},
    Docker,
};
use futures::StreamExt as _;
use sluice_core::{
    driver::{DeploymentDriver, DriverError, RolloutSettings, ServiceState},
    lock::RunLockGuard,
    registry::{ServiceDefinition, UpdateStrategy},
    wait::poll_until,
};
use sluice_error::{ErrorContext as _, GenericError};
use tracing::{debug, info, trace, warn};

use crate::{
    rollout::{blue_green_steps, rolling_steps, Step},
    version_from_image,
};

const PROJECT_LABEL: &str = "com.docker.compose.project";
const SERVICE_LABEL: &str = "com.docker.compose.service";
const CONTAINER_NUMBER_LABEL: &str = "com.docker.compose.container-number";
const VERSION_LABEL: &str = "io.sluice.version";
const REPLICAS_LABEL: &str = "io.sluice.replicas";

/// A running (or stopped) container belonging to a service.
#[derive(Clone, Debug, Eq, PartialEq)]
struct Instance {
    name: String,
    number: u32,
    version: Option<String>,
    replicas_hint: Option<u32>,
}

impl Instance {
    fn from_summary(summary: &ContainerSummary) -> Option<Self> {
        let name = summary
            .names
            .as_ref()
            .and_then(|names| names.first())
            .map(|name| name.trim_start_matches('/').to_string())
            .or_else(|| summary.id.clone())?;
        let labels = summary.labels.clone().unwrap_or_default();

        let number = labels
            .get(CONTAINER_NUMBER_LABEL)
            .and_then(|n| n.parse().ok())
            .or_else(|| name.rsplit(['-', '_']).next().and_then(|n| n.parse().ok()))
            .unwrap_or(0);
        let version = labels
            .get(VERSION_LABEL)
            .cloned()
            .or_else(|| summary.image.as_deref().and_then(version_from_image).map(str::to_string));
        let replicas_hint = labels.get(REPLICAS_LABEL).and_then(|n| n.parse().ok());

        Some(Self {
            name,
            number,
            version,
            replicas_hint,
        })
    }
}

/// Readiness of a single container.
#[derive(Debug, Eq, PartialEq)]
enum Readiness {
    Ready,
    Starting(String),
    Failed(String),
}

fn readiness(response: &ContainerInspectResponse) -> Readiness {
    let Some(state) = response.state.as_ref() else {
        return Readiness::Starting("no state reported".to_string());
    };

    match state.status {
        Some(ContainerStateStatusEnum::RUNNING) => {
            match state.health.as_ref().and_then(|h| h.status) {
                None | Some(HealthStatusEnum::EMPTY) | Some(HealthStatusEnum::NONE) | Some(HealthStatusEnum::HEALTHY) => {
                    Readiness::Ready
                }
                Some(HealthStatusEnum::STARTING) => Readiness::Starting("health check starting".to_string()),
                Some(HealthStatusEnum::UNHEALTHY) => Readiness::Starting("health check failing".to_string()),
            }
        }
        Some(ContainerStateStatusEnum::EXITED) | Some(ContainerStateStatusEnum::DEAD) => {
            let mut message = format!("exited with code {}", state.exit_code.unwrap_or(-1));
            if let Some(error) = state.error.as_deref().filter(|e| !e.is_empty()) {
                message.push_str(": ");
                message.push_str(error);
            }
            Readiness::Failed(message)
        }
        other => Readiness::Starting(format!("container is {:?}", other)),
    }
}

/// Returns `true` if the container publishes ports on fixed host ports, which two instances cannot share.
fn has_fixed_host_ports(host_config: Option<&HostConfig>) -> bool {
    host_config
        .and_then(|hc| hc.port_bindings.as_ref())
        .into_iter()
        .flat_map(|bindings| bindings.values())
        .flatten()
        .flatten()
        .any(|binding| {
            binding
                .host_port
                .as_deref()
                .is_some_and(|port| !port.is_empty() && port != "0")
        })
}

/// Returns the replica count the service should converge on.
fn desired_replicas(instances: &[Instance]) -> u32 {
    instances
        .iter()
        .filter_map(|i| i.replicas_hint)
        .max()
        .unwrap_or_else(|| u32::try_from(instances.len()).unwrap_or(u32::MAX))
        .max(1)
}

/// Describes the versions across all instances: the version itself when they agree, or every distinct version
/// otherwise, which never matches a single recorded version.
fn summarize_versions(instances: &[Instance]) -> Option<String> {
    let versions: BTreeSet<&str> = instances.iter().filter_map(|i| i.version.as_deref()).collect();
    if versions.is_empty() {
        None
    } else {
        Some(versions.into_iter().collect::<Vec<_>>().join(","))
    }
}

/// Picks the lowest container numbers not in use, marking them used.
fn allocate_numbers(in_use: &mut BTreeSet<u32>, count: usize) -> Vec<u32> {
    let mut allocated = Vec::with_capacity(count);
    let mut candidate = 1;
    while allocated.len() < count {
        if in_use.insert(candidate) {
            allocated.push(candidate);
        }
        candidate += 1;
    }
    allocated
}

fn driver_error(service: &str, error: DockerError) -> DriverError {
    match error {
        DockerError::DockerResponseServerError { status_code, message } => match status_code {
            404 | 400 | 409 => DriverError::InvalidManifest {
                service: service.to_string(),
                message,
            },
            _ if is_resource_exhaustion(&message) => DriverError::ResourceExhausted {
                service: service.to_string(),
                message,
            },
            _ => DriverError::InstanceFailed {
                service: service.to_string(),
                message: format!("Docker Engine returned {}: {}", status_code, message),
            },
        },
        DockerError::DockerStreamError { error } => {
            if is_resource_exhaustion(&error) {
                DriverError::ResourceExhausted {
                    service: service.to_string(),
                    message: error,
                }
            } else {
                DriverError::InvalidManifest {
                    service: service.to_string(),
                    message: error,
                }
            }
        }
        other => DriverError::Unreachable {
            message: other.to_string(),
        },
    }
}

fn is_resource_exhaustion(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["no space left", "out of memory", "cannot allocate memory", "insufficient"]
        .iter()
        .any(|needle| message.contains(needle))
}

/// Docker Compose backend.
///
/// Manages the containers of one Compose project directly through the Docker Engine API. Containers are matched to
/// services by their `com.docker.compose.service` label, and replacements are created from the configuration of an
/// existing container with only the image changed.
///
/// Services that publish fixed host ports cannot run two instances side by side, so their rolling updates replace
/// containers in place, at most `max_unavailable` at a time. Other services surge new containers first, at most
/// `max_surge` at a time.
pub struct ComposeDriver {
    docker: Docker,
    project: String,
    stop_timeout_secs: u64,
    settings: RolloutSettings,
}

impl ComposeDriver {
    /// Creates a new `ComposeDriver` using the default Docker Engine connection settings.
    ///
    /// # Errors
    ///
    /// If the Docker client cannot be configured, an error is returned.
    pub fn new(project: String, stop_timeout_secs: u64, settings: RolloutSettings) -> Result<Self, GenericError> {
        let docker = Docker::connect_with_defaults().error_context("Failed to configure Docker Engine client.")?;

        Ok(Self {
            docker,
            project,
            stop_timeout_secs,
            settings,
        })
    }

    fn container_name(&self, service: &str, number: u32) -> String {
        format!("{}-{}-{}", self.project, service, number)
    }

    async fn instances(&self, service: &ServiceDefinition) -> Result<Vec<Instance>, DriverError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![
                format!("{}={}", PROJECT_LABEL, self.project),
                format!("{}={}", SERVICE_LABEL, service.name),
            ],
        )]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| driver_error(&service.name, e))?;

        let mut instances: Vec<_> = containers.iter().filter_map(Instance::from_summary).collect();
        instances.sort_by_key(|i| i.number);
        Ok(instances)
    }

    async fn inspect(&self, service: &ServiceDefinition, name: &str) -> Result<ContainerInspectResponse, DriverError> {
        self.docker
            .inspect_container(name, None)
            .await
            .map_err(|e| driver_error(&service.name, e))
    }

    async fn pull(&self, service: &ServiceDefinition, image: &str) -> Result<(), DriverError> {
        debug!(service = %service.name, image, "Pulling image...");

        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(update) = pull.next().await {
            let info = update.map_err(|e| driver_error(&service.name, e))?;
            trace!(service = %service.name, image, "Received image pull update: {:?}", info);
        }

        debug!(service = %service.name, image, "Pulled image.");
        Ok(())
    }

    async fn create_and_start(
        &self, service: &ServiceDefinition, template: &ContainerInspectResponse, version: &str, number: u32,
        replicas: u32,
    ) -> Result<String, DriverError> {
        let source = template.config.clone().unwrap_or_default();

        let mut labels = source.labels.unwrap_or_default();
        labels.insert(CONTAINER_NUMBER_LABEL.to_string(), number.to_string());
        labels.insert(VERSION_LABEL.to_string(), version.to_string());
        labels.insert(REPLICAS_LABEL.to_string(), replicas.to_string());

        // Keep the service name resolvable on every network the old container was attached to.
        let networking_config = template
            .network_settings
            .as_ref()
            .and_then(|ns| ns.networks.as_ref())
            .map(|networks| NetworkingConfig {
                endpoints_config: networks
                    .keys()
                    .map(|network| {
                        let endpoint = EndpointSettings {
                            aliases: Some(vec![service.name.clone()]),
                            ..Default::default()
                        };
                        (network.clone(), endpoint)
                    })
                    .collect(),
            });

        let config = Config {
            image: Some(service.artifact_at(version)),
            user: source.user,
            env: source.env,
            cmd: source.cmd,
            entrypoint: source.entrypoint,
            working_dir: source.working_dir,
            exposed_ports: source.exposed_ports,
            volumes: source.volumes,
            healthcheck: source.healthcheck,
            stop_signal: source.stop_signal,
            labels: Some(labels),
            host_config: template.host_config.clone(),
            networking_config,
            ..Default::default()
        };

        let name = self.container_name(&service.name, number);
        let options = CreateContainerOptions {
            name: name.clone(),
            ..Default::default()
        };
        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| driver_error(&service.name, e))?;
        self.docker
            .start_container::<String>(&name, None)
            .await
            .map_err(|e| driver_error(&service.name, e))?;

        debug!(service = %service.name, container = %name, version, "Started container.");
        Ok(name)
    }

    async fn remove(&self, service: &ServiceDefinition, name: &str) -> Result<(), DriverError> {
        let stop = StopContainerOptions {
            t: i64::try_from(self.stop_timeout_secs).unwrap_or(i64::MAX),
        };
        if let Err(e) = self.docker.stop_container(name, Some(stop)).await {
            debug!(service = %service.name, container = name, error = %e, "Failed to stop container. Removing it anyway.");
        }

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(name, Some(options))
            .await
            .map_err(|e| driver_error(&service.name, e))?;

        debug!(service = %service.name, container = name, "Removed container.");
        Ok(())
    }

    /// Waits until every named container is running and healthy, failing fast if one exits.
    async fn wait_ready(&self, service: &ServiceDefinition, names: &[String]) -> Result<(), DriverError> {
        let outcome = poll_until(self.settings.poll_interval, self.settings.timeout, || async {
            for name in names {
                let response = match self.inspect(service, name).await {
                    Ok(response) => response,
                    Err(e) => return Ok(Err(e)),
                };
                match readiness(&response) {
                    Readiness::Ready => {}
                    Readiness::Starting(detail) => return Err(format!("{}: {}", name, detail)),
                    Readiness::Failed(detail) => {
                        return Ok(Err(DriverError::InstanceFailed {
                            service: service.name.clone(),
                            message: format!("{} {}", name, detail),
                        }))
                    }
                }
            }
            Ok(Ok(()))
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(timed_out) => {
                warn!(service = %service.name, last = %timed_out.last, "Containers did not become ready in time.");
                Err(DriverError::RolloutTimedOut {
                    service: service.name.clone(),
                    timeout: self.settings.timeout,
                })
            }
        }
    }

    /// Moves every instance of the service to `version`, following the step plan for `strategy`.
    ///
    /// Instances already on `version` are kept and count towards the replica target.
    async fn converge(
        &self, lock: &RunLockGuard, service: &ServiceDefinition, version: &str, strategy: UpdateStrategy,
    ) -> Result<(), DriverError> {
        let instances = self.instances(service).await?;
        let Some(first) = instances.first() else {
            return Err(DriverError::ServiceNotFound {
                service: service.name.clone(),
            });
        };

        let template = self.inspect(service, &first.name).await?;
        let fixed_ports = has_fixed_host_ports(template.host_config.as_ref());
        let replicas = desired_replicas(&instances);

        if strategy == UpdateStrategy::BlueGreen && fixed_ports {
            return Err(DriverError::InvalidManifest {
                service: service.name.clone(),
                message: "blue-green updates need ephemeral host ports, but the service publishes fixed ones".to_string(),
            });
        }

        let mut in_use: BTreeSet<u32> = instances.iter().map(|i| i.number).collect();
        let (current, outdated): (Vec<_>, Vec<_>) = instances
            .into_iter()
            .partition(|i| i.version.as_deref() == Some(version));

        let bounds = self.settings.bounds_for(replicas);
        let steps = match strategy {
            UpdateStrategy::Rolling => {
                rolling_steps(outdated.len(), current.len(), replicas as usize, bounds, fixed_ports)
            }
            UpdateStrategy::BlueGreen => blue_green_steps(outdated.len(), current.len(), replicas as usize),
        };

        info!(
            service = %service.name,
            version,
            %strategy,
            replicas,
            current = current.len(),
            outdated = outdated.len(),
            max_unavailable = bounds.max_unavailable,
            max_surge = bounds.max_surge,
            in_place = fixed_ports,
            run_owner = lock.owner(),
            "Converging service."
        );

        if steps.iter().any(|step| matches!(step, Step::Launch(_))) {
            self.pull(service, &service.artifact_at(version)).await?;
        }

        let mut outdated = outdated;
        for step in steps {
            match step {
                Step::Retire(count) => {
                    let retiring: Vec<_> = outdated.drain(..count.min(outdated.len())).collect();
                    for instance in &retiring {
                        self.remove(service, &instance.name).await?;
                        in_use.remove(&instance.number);
                    }
                }
                Step::Launch(count) => {
                    let mut names = Vec::with_capacity(count);
                    for number in allocate_numbers(&mut in_use, count) {
                        names.push(self.create_and_start(service, &template, version, number, replicas).await?);
                    }
                    self.wait_ready(service, &names).await?;
                }
            }
        }

        let kept: Vec<String> = current.into_iter().map(|i| i.name).collect();
        if kept.is_empty() {
            Ok(())
        } else {
            self.wait_ready(service, &kept).await
        }
    }
}

#[async_trait]
impl DeploymentDriver for ComposeDriver {
    fn backend_name(&self) -> &'static str {
        "compose"
    }

    async fn current_state(&self, service: &ServiceDefinition) -> Result<ServiceState, DriverError> {
        let instances = self.instances(service).await?;
        if instances.is_empty() {
            return Err(DriverError::ServiceNotFound {
                service: service.name.clone(),
            });
        }

        let mut ready_replicas = 0;
        for instance in &instances {
            if readiness(&self.inspect(service, &instance.name).await?) == Readiness::Ready {
                ready_replicas += 1;
            }
        }

        Ok(ServiceState {
            version: summarize_versions(&instances),
            replicas: u32::try_from(instances.len()).unwrap_or(u32::MAX),
            ready_replicas,
        })
    }

    async fn apply_version(
        &self, lock: &RunLockGuard, service: &ServiceDefinition, version: &str, strategy: UpdateStrategy,
    ) -> Result<(), DriverError> {
        self.converge(lock, service, version, strategy).await
    }

    async fn revert_version(
        &self, lock: &RunLockGuard, service: &ServiceDefinition, previous_version: &str,
    ) -> Result<(), DriverError> {
        // Reverts always roll, within the same bounds as updates.
        self.converge(lock, service, previous_version, UpdateStrategy::Rolling)
            .await
    }
}
