//! Run loop.

use std::{collections::HashMap, fmt, path::PathBuf, sync::Arc, time::Duration};

use chrono::Utc;
use sluice_error::{ErrorContext as _, GenericError};
use tracing::{error, info, warn};

use crate::{
    attempt::{backend_drift, AttemptContext, AttemptOutcome, AttemptSettings, AttemptState, Transition, UpdateAttempt},
    config::UnhealthyDependencyPolicy,
    driver::{DeploymentDriver, ServiceState},
    gate::VulnerabilityGate,
    health::{HealthCheckResult, HealthProbe},
    lock::RunLockGuard,
    notify::{Notification, NotificationKind, NotificationLevel, Notifier},
    planner::{PlanError, UpdatePlan},
    registry::{ServiceRegistry, UpdateStrategy},
    report::RunReport,
    resolver::VersionResolver,
    rollback::RollbackController,
};

/// Per-invocation options for an update run.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Restricts the run to one service. Its dependencies are treated as not part of the run.
    pub only: Option<String>,

    /// Stops short of any mutating driver call or registry write.
    pub dry_run: bool,

    /// Treats vulnerability findings as advisory even if blocking is configured.
    pub force: bool,

    /// Overrides every planned service's update policy.
    pub strategy: Option<UpdateStrategy>,

    /// Overrides the health check timeout.
    pub health_timeout: Option<Duration>,
}

/// A service with a newer version available.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingUpdate {
    /// Service name.
    pub service: String,

    /// Recorded version.
    pub current_version: String,

    /// Newest acceptable version.
    pub candidate_version: String,

    /// Version the backend actually runs, when it differs from the recorded one.
    pub running_version: Option<String>,
}

impl fmt::Display for PendingUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.service, self.current_version)?;
        if let Some(running) = &self.running_version {
            write!(f, " (backend running {})", running)?;
        }
        write!(f, " -> {}", self.candidate_version)
    }
}

/// Point-in-time view of one service.
#[derive(Debug)]
pub struct ServiceStatus {
    /// Service name.
    pub service: String,

    /// Version recorded in the registry.
    pub recorded_version: String,

    /// State reported by the backend, or why it could not be read.
    pub backend: Result<ServiceState, String>,

    /// Result of a fresh health probe.
    pub health: HealthCheckResult,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: recorded={} ", self.service, self.recorded_version)?;
        match &self.backend {
            Ok(state) => write!(f, "{}", state)?,
            Err(e) => write!(f, "backend unavailable ({})", e)?,
        }
        write!(f, " health={}", self.health)
    }
}

/// Drives update runs against one deployment backend.
pub struct Orchestrator {
    driver: Arc<dyn DeploymentDriver>,
    resolver: Arc<dyn VersionResolver>,
    gate: Option<Arc<dyn VulnerabilityGate>>,
    prober: Arc<dyn HealthProbe>,
    notifier: Notifier,
    settings: AttemptSettings,
    settle_delay: Duration,
    unhealthy_dependency: UnhealthyDependencyPolicy,
    report_dir: Option<PathBuf>,
}

impl Orchestrator {
    /// Creates a new `Orchestrator` with default settings, no vulnerability gate, and no report output.
    pub fn new(
        driver: Arc<dyn DeploymentDriver>, resolver: Arc<dyn VersionResolver>, prober: Arc<dyn HealthProbe>,
        notifier: Notifier,
    ) -> Self {
        Self {
            driver,
            resolver,
            gate: None,
            prober,
            notifier,
            settings: AttemptSettings::default(),
            settle_delay: Duration::from_secs(2),
            unhealthy_dependency: UnhealthyDependencyPolicy::default(),
            report_dir: None,
        }
    }

    /// Sets the vulnerability gate.
    pub fn with_gate(mut self, gate: Arc<dyn VulnerabilityGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Sets the per-attempt settings.
    pub fn with_settings(mut self, settings: AttemptSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets the pause after each service that touched the backend.
    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    /// Sets what happens when a dependency is unhealthy.
    pub fn with_unhealthy_dependency_policy(mut self, policy: UnhealthyDependencyPolicy) -> Self {
        self.unhealthy_dependency = policy;
        self
    }

    /// Sets the directory run reports are written to.
    pub fn with_report_dir(mut self, report_dir: PathBuf) -> Self {
        self.report_dir = Some(report_dir);
        self
    }

    /// Returns the deployment backend's name.
    pub fn backend_name(&self) -> &'static str {
        self.driver.backend_name()
    }

    fn settings_for(&self, options: &RunOptions) -> AttemptSettings {
        let mut settings = self.settings.clone();
        settings.dry_run = options.dry_run;
        if options.strategy.is_some() {
            settings.strategy_override = options.strategy;
        }
        if let Some(health_timeout) = options.health_timeout {
            settings.health_timeout = health_timeout;
        }
        if options.force {
            settings.block_on_findings = false;
        }
        settings
    }

    /// Runs one update pass over the registry.
    ///
    /// The plan is built before anything is touched, and services are then processed strictly one at a time. Each
    /// successful update is persisted to the registry immediately.
    ///
    /// # Errors
    ///
    /// If the dependency graph has a cycle or a missing dependency, or the requested service is unknown, an error is
    /// returned and no service is touched.
    pub async fn run_update(
        &self, lock: &RunLockGuard, registry: &mut ServiceRegistry, options: &RunOptions,
    ) -> Result<RunReport, PlanError> {
        let started_at = Utc::now();
        let plan = match &options.only {
            Some(name) => UpdatePlan::build_for(registry.services(), name)?,
            None => UpdatePlan::build(registry.services())?,
        };

        let settings = self.settings_for(options);
        info!(
            plan = %plan,
            backend = self.driver.backend_name(),
            dry_run = options.dry_run,
            "Starting update run."
        );

        let mut outcomes: HashMap<String, AttemptOutcome> = HashMap::new();
        let mut records = Vec::with_capacity(plan.len());
        let mut not_attempted = Vec::new();
        let mut aborted = false;

        for (index, service) in plan.services().iter().enumerate() {
            if aborted {
                not_attempted.push(service.name.clone());
                continue;
            }

            let mut record = {
                let ctx = AttemptContext {
                    lock,
                    registry: &*registry,
                    driver: self.driver.as_ref(),
                    resolver: self.resolver.as_ref(),
                    gate: self.gate.as_deref(),
                    prober: self.prober.as_ref(),
                    settings: &settings,
                    prior_outcomes: &outcomes,
                };
                UpdateAttempt::new(service.clone()).run(&ctx).await
            };

            if record.outcome == AttemptOutcome::Succeeded && !options.dry_run {
                if let Some(candidate) = &record.candidate_version {
                    if let Err(e) = registry.persist_version(lock, &service.name, candidate) {
                        error!(service = %service.name, version = %candidate, error = %e, "Failed to record new version. The backend is ahead of the registry.");
                        record.transitions.push(Transition {
                            from: AttemptState::Succeeded,
                            to: AttemptState::Failed,
                            at: Utc::now(),
                        });
                        record.outcome = AttemptOutcome::Failed {
                            reason: format!("failed to record new version: {}", e),
                        };
                    }
                }
            }

            info!(service = %record.service, outcome = %record.outcome, duration_ms = record.duration_ms, "Attempt finished.");
            self.notifier.notify(Notification::for_attempt(&record));

            if matches!(record.outcome, AttemptOutcome::DependencyUnhealthy { .. })
                && self.unhealthy_dependency == UnhealthyDependencyPolicy::Abort
            {
                error!(service = %record.service, "Dependency unhealthy. Aborting run.");
                aborted = true;
            }

            let touched = record.touched_backend();
            outcomes.insert(record.service.clone(), record.outcome.clone());
            records.push(record);

            if touched && index + 1 < plan.len() && !self.settle_delay.is_zero() && !aborted {
                tokio::time::sleep(self.settle_delay).await;
            }
        }

        let report = RunReport::new(
            started_at,
            self.driver.backend_name(),
            options.dry_run,
            records,
            not_attempted,
        );
        info!(run_id = %report.run_id, summary = %report.summary, "Update run finished.");
        self.notifier.notify(Notification::for_run(&report));

        if let Some(dir) = &self.report_dir {
            match report.write_to(dir).await {
                Ok(path) => info!(path = %path.display(), "Wrote run report."),
                Err(e) => warn!(error = %e, "Failed to write run report."),
            }
        }

        Ok(report)
    }

    /// Lists services that `update` would deploy, without changing the backend.
    ///
    /// A service is pending when a newer version is available, or when the backend runs a version other than the
    /// recorded one. Services whose version could not be resolved are logged and left out.
    pub async fn check(&self, registry: &ServiceRegistry) -> Vec<PendingUpdate> {
        let mut pending = Vec::new();
        for service in registry.services() {
            let candidate = match self
                .resolver
                .latest_version(&service.artifact, &service.current_version, service.version_req.as_ref())
                .await
            {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!(service = %service.name, error = %e, "Version resolution failed.");
                    continue;
                }
            };

            let running_version = backend_drift(self.driver.as_ref(), service).await;
            if candidate == service.current_version && running_version.is_none() {
                info!(service = %service.name, version = %service.current_version, "Up to date.");
                continue;
            }

            pending.push(PendingUpdate {
                service: service.name.clone(),
                current_version: service.current_version.clone(),
                candidate_version: candidate,
                running_version,
            });
        }
        pending
    }

    /// Reverts a service to the version recorded in the registry.
    ///
    /// The registry is not changed.
    ///
    /// # Errors
    ///
    /// If the service is unknown, or the revert or its health check fails, an error is returned.
    pub async fn rollback_service(
        &self, lock: &RunLockGuard, registry: &ServiceRegistry, name: &str,
    ) -> Result<(), GenericError> {
        let service = registry
            .get(name)
            .with_error_context(|| format!("Unknown service '{}'. Check the registry file.", name))?;

        let controller = RollbackController::new(
            self.driver.as_ref(),
            self.prober.as_ref(),
            self.settings.health_interval,
            self.settings.rollback_health_timeout,
        );
        let result = controller.revert(lock, service, &service.current_version).await;

        let (level, title) = match &result {
            Ok(()) => (
                NotificationLevel::Warning,
                format!("[sluice] {} manually rolled back to {}", name, service.current_version),
            ),
            Err(_) => (
                NotificationLevel::Critical,
                format!("[sluice] {} manual rollback failed", name),
            ),
        };
        let body = match &result {
            Ok(()) => format!("Service: {}\nVersion: {}\n", name, service.current_version),
            Err(e) => format!("Service: {}\nVersion: {}\nError: {}\n", name, service.current_version, e),
        };
        self.notifier.notify(Notification {
            kind: NotificationKind::Attempt {
                service: name.to_string(),
            },
            level,
            title,
            body,
        });

        Ok(result?)
    }

    /// Reads the backend state and a fresh health probe for every service.
    pub async fn status(&self, registry: &ServiceRegistry) -> Vec<ServiceStatus> {
        let mut statuses = Vec::with_capacity(registry.services().len());
        for service in registry.services() {
            let backend = self
                .driver
                .current_state(service)
                .await
                .map_err(|e| e.to_string());
            let health = self.prober.probe(service).await;
            statuses.push(ServiceStatus {
                service: service.name.clone(),
                recorded_version: service.current_version.clone(),
                backend,
                health,
            });
        }
        statuses
    }
}
