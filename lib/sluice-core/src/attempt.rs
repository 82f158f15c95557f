//! Update attempt state machine.
//!
//! Each planned service gets one [`UpdateAttempt`], which moves through
//!
//! ```text
//! Pending -> DependencyWait -> VersionCheck -> UpToDate
//!                                           -> CandidateFound -> VulnerabilityCheck -> Deploying -> HealthChecking
//!                                                                                                  -> Succeeded
//!                                                                                                  -> RollingBack -> RolledBack
//!                                                                                                                 -> RollbackFailed
//! ```
//!
//! with early exits to `DependencyUnhealthy`, `Skipped`, `Failed`, and (for dry runs) `Planned`. Every transition is
//! logged and timestamped, and the attempt ends as an [`AttemptRecord`].

use std::{collections::HashMap, fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    driver::DeploymentDriver,
    gate::{ScanOutcome, VulnerabilityGate},
    health::{wait_until_healthy, HealthProbe},
    lock::RunLockGuard,
    registry::{ServiceDefinition, ServiceRegistry, UpdateStrategy},
    resolver::VersionResolver,
    rollback::RollbackController,
};

/// A state of an update attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    /// Not started.
    Pending,
    /// Waiting for dependencies to be healthy.
    DependencyWait,
    /// Asking the resolver for a newer version.
    VersionCheck,
    /// Nothing to do.
    UpToDate,
    /// A version to deploy was found.
    CandidateFound,
    /// Scanning the candidate.
    VulnerabilityCheck,
    /// Driving the backend to the candidate.
    Deploying,
    /// Waiting for the updated service to be healthy.
    HealthChecking,
    /// Updated and healthy.
    Succeeded,
    /// Reverting after a failure.
    RollingBack,
    /// Reverted and healthy.
    RolledBack,
    /// Reverting failed. Needs manual intervention.
    RollbackFailed,
    /// A dependency was not healthy.
    DependencyUnhealthy,
    /// Failed with rollback disabled.
    Failed,
    /// Not attempted because of a resolver failure or gate policy.
    Skipped,
    /// Dry run: the candidate would have been deployed.
    Planned,
}

impl AttemptState {
    /// Returns the state's name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::DependencyWait => "DependencyWait",
            Self::VersionCheck => "VersionCheck",
            Self::UpToDate => "UpToDate",
            Self::CandidateFound => "CandidateFound",
            Self::VulnerabilityCheck => "VulnerabilityCheck",
            Self::Deploying => "Deploying",
            Self::HealthChecking => "HealthChecking",
            Self::Succeeded => "Succeeded",
            Self::RollingBack => "RollingBack",
            Self::RolledBack => "RolledBack",
            Self::RollbackFailed => "RollbackFailed",
            Self::DependencyUnhealthy => "DependencyUnhealthy",
            Self::Failed => "Failed",
            Self::Skipped => "Skipped",
            Self::Planned => "Planned",
        }
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A timestamped state change.
#[derive(Clone, Debug, Serialize)]
pub struct Transition {
    /// Previous state.
    pub from: AttemptState,

    /// New state.
    pub to: AttemptState,

    /// When the change happened.
    pub at: DateTime<Utc>,
}

/// How an attempt ended.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Already running the newest acceptable version.
    UpToDate,

    /// Updated to the candidate version.
    Succeeded,

    /// The update failed and the previous version was restored.
    RolledBack {
        /// Why the update failed.
        reason: String,
    },

    /// The update failed and so did the rollback.
    RollbackFailed {
        /// Why the update failed.
        reason: String,

        /// Why the rollback failed.
        error: String,
    },

    /// A dependency was not healthy, so the backend was never touched.
    DependencyUnhealthy {
        /// The unhealthy dependency.
        dependency: String,

        /// Detail.
        reason: String,
    },

    /// The update failed and rollback is disabled.
    Failed {
        /// Why the update failed.
        reason: String,
    },

    /// The attempt was abandoned before deploying.
    Skipped {
        /// Why.
        reason: String,
    },

    /// Dry run: the candidate would have been deployed.
    Planned {
        /// The version that would have been deployed.
        candidate: String,
    },
}

impl AttemptOutcome {
    /// Returns the terminal state corresponding to this outcome.
    pub fn state(&self) -> AttemptState {
        match self {
            Self::UpToDate => AttemptState::UpToDate,
            Self::Succeeded => AttemptState::Succeeded,
            Self::RolledBack { .. } => AttemptState::RolledBack,
            Self::RollbackFailed { .. } => AttemptState::RollbackFailed,
            Self::DependencyUnhealthy { .. } => AttemptState::DependencyUnhealthy,
            Self::Failed { .. } => AttemptState::Failed,
            Self::Skipped { .. } => AttemptState::Skipped,
            Self::Planned { .. } => AttemptState::Planned,
        }
    }

    /// Returns `true` if this attempt changed the backend and left the service off its candidate version.
    ///
    /// Dependents of such a service fail without probing it. Any other outcome leaves the backend as it was, so
    /// dependents decide with a fresh health probe.
    pub fn disqualifies_dependents(&self) -> bool {
        matches!(
            self,
            Self::RolledBack { .. } | Self::RollbackFailed { .. } | Self::Failed { .. }
        )
    }

    /// Returns `true` if this outcome does not make the run fail.
    pub fn is_acceptable(&self) -> bool {
        matches!(
            self,
            Self::UpToDate | Self::Succeeded | Self::RolledBack { .. } | Self::Planned { .. }
        )
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpToDate => f.write_str("up to date"),
            Self::Succeeded => f.write_str("succeeded"),
            Self::RolledBack { reason } => write!(f, "rolled back ({})", reason),
            Self::RollbackFailed { reason, error } => {
                write!(f, "rollback failed ({}; rollback: {}); manual intervention required", reason, error)
            }
            Self::DependencyUnhealthy { dependency, reason } => {
                write!(f, "dependency '{}' unhealthy ({})", dependency, reason)
            }
            Self::Failed { reason } => write!(f, "failed ({})", reason),
            Self::Skipped { reason } => write!(f, "skipped ({})", reason),
            Self::Planned { candidate } => write!(f, "planned update to {}", candidate),
        }
    }
}

/// The finished record of one attempt.
#[derive(Clone, Debug, Serialize)]
pub struct AttemptRecord {
    /// Service name.
    pub service: String,

    /// Version recorded in the registry when the attempt began.
    pub previous_version: String,

    /// Version the attempt tried to deploy, if one was found.
    pub candidate_version: Option<String>,

    /// How the attempt ended.
    #[serde(flatten)]
    pub outcome: AttemptOutcome,

    /// Non-blocking warnings, such as vulnerability findings.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub advisories: Vec<String>,

    /// When the attempt began.
    pub started_at: DateTime<Utc>,

    /// When the attempt ended.
    pub finished_at: DateTime<Utc>,

    /// Wall-clock duration, in milliseconds.
    pub duration_ms: u64,

    /// Every state change, in order.
    pub transitions: Vec<Transition>,
}

impl AttemptRecord {
    /// Returns `true` if the attempt reached `Deploying`, meaning the backend may have changed.
    pub fn touched_backend(&self) -> bool {
        self.transitions.iter().any(|t| t.to == AttemptState::Deploying)
    }
}

/// Knobs for a single attempt.
#[derive(Clone, Debug)]
pub struct AttemptSettings {
    /// Interval between health probes.
    pub health_interval: Duration,

    /// How long a deployed candidate has to become healthy.
    pub health_timeout: Duration,

    /// How long a reverted service has to become healthy.
    pub rollback_health_timeout: Duration,

    /// Interval between dependency health probes.
    pub dependency_interval: Duration,

    /// How long to wait for each dependency to be healthy.
    pub dependency_timeout: Duration,

    /// Whether to revert failed updates.
    pub rollback_on_failure: bool,

    /// Whether vulnerability findings block the update.
    pub block_on_findings: bool,

    /// Whether to stop short of any mutating driver call.
    pub dry_run: bool,

    /// Strategy to use instead of each service's own policy.
    pub strategy_override: Option<UpdateStrategy>,
}

impl Default for AttemptSettings {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(5),
            health_timeout: Duration::from_secs(120),
            rollback_health_timeout: Duration::from_secs(60),
            dependency_interval: Duration::from_secs(5),
            dependency_timeout: Duration::from_secs(60),
            rollback_on_failure: true,
            block_on_findings: false,
            dry_run: false,
            strategy_override: None,
        }
    }
}

/// Everything an attempt reads from or acts through.
pub struct AttemptContext<'a> {
    /// Run ownership token.
    pub lock: &'a RunLockGuard,

    /// Current service definitions, for dependency lookups.
    pub registry: &'a ServiceRegistry,

    /// Deployment backend.
    pub driver: &'a dyn DeploymentDriver,

    /// Version resolver.
    pub resolver: &'a dyn VersionResolver,

    /// Vulnerability gate, if enabled.
    pub gate: Option<&'a dyn VulnerabilityGate>,

    /// Health prober.
    pub prober: &'a dyn HealthProbe,

    /// Attempt settings.
    pub settings: &'a AttemptSettings,

    /// Outcomes of attempts already finished in this run.
    pub prior_outcomes: &'a HashMap<String, AttemptOutcome>,
}

/// Returns the version the backend runs for `service` when it differs from the recorded one.
///
/// An interrupted earlier run can leave the backend ahead of or behind the registry. Only reads backend state. If the
/// state cannot be read, the recorded version is assumed to be running.
pub async fn backend_drift(driver: &dyn DeploymentDriver, service: &ServiceDefinition) -> Option<String> {
    match driver.current_state(service).await {
        Ok(state) => state.version.filter(|running| *running != service.current_version),
        Err(e) => {
            warn!(service = %service.name, error = %e, "Could not read backend state. Assuming the recorded version is running.");
            None
        }
    }
}

/// One service's progress through the state machine.
pub struct UpdateAttempt {
    service: ServiceDefinition,
    state: AttemptState,
    candidate_version: Option<String>,
    advisories: Vec<String>,
    started_at: DateTime<Utc>,
    started: tokio::time::Instant,
    transitions: Vec<Transition>,
}

impl UpdateAttempt {
    /// Creates a pending attempt for the given service.
    pub fn new(service: ServiceDefinition) -> Self {
        Self {
            service,
            state: AttemptState::Pending,
            candidate_version: None,
            advisories: Vec::new(),
            started_at: Utc::now(),
            started: tokio::time::Instant::now(),
            transitions: Vec::new(),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// Runs the attempt to a terminal state.
    pub async fn run(mut self, ctx: &AttemptContext<'_>) -> AttemptRecord {
        self.transition(AttemptState::DependencyWait);
        if let Err(outcome) = self.wait_for_dependencies(ctx).await {
            return self.finish(outcome);
        }

        self.transition(AttemptState::VersionCheck);
        let candidate = match self.check_version(ctx).await {
            Ok(Some(candidate)) => candidate,
            Ok(None) => return self.finish(AttemptOutcome::UpToDate),
            Err(outcome) => return self.finish(outcome),
        };
        self.candidate_version = Some(candidate.clone());
        self.transition(AttemptState::CandidateFound);

        self.transition(AttemptState::VulnerabilityCheck);
        if let Err(outcome) = self.check_vulnerabilities(ctx, &candidate).await {
            return self.finish(outcome);
        }

        if ctx.settings.dry_run {
            info!(
                service = %self.service.name,
                from = %self.service.current_version,
                to = %candidate,
                strategy = %self.strategy(ctx),
                "Dry run: would deploy candidate."
            );
            return self.finish(AttemptOutcome::Planned { candidate });
        }

        self.transition(AttemptState::Deploying);
        let strategy = self.strategy(ctx);
        if let Err(e) = ctx.driver.apply_version(ctx.lock, &self.service, &candidate, strategy).await {
            return self.fail(ctx, format!("deployment failed: {}", e)).await;
        }

        self.transition(AttemptState::HealthChecking);
        let health = wait_until_healthy(
            ctx.prober,
            &self.service,
            ctx.settings.health_interval,
            ctx.settings.health_timeout,
        )
        .await;
        if health.healthy {
            self.finish(AttemptOutcome::Succeeded)
        } else {
            let detail = health.message.unwrap_or_else(|| "unhealthy".to_string());
            self.fail(ctx, format!("health check failed: {}", detail)).await
        }
    }

    fn strategy(&self, ctx: &AttemptContext<'_>) -> UpdateStrategy {
        ctx.settings.strategy_override.unwrap_or(self.service.policy)
    }

    async fn wait_for_dependencies(&self, ctx: &AttemptContext<'_>) -> Result<(), AttemptOutcome> {
        for dependency in &self.service.dependencies {
            if let Some(outcome) = ctx.prior_outcomes.get(dependency) {
                if outcome.disqualifies_dependents() {
                    warn!(service = %self.service.name, dependency = %dependency, outcome = %outcome, "Dependency did not update cleanly in this run.");
                    return Err(AttemptOutcome::DependencyUnhealthy {
                        dependency: dependency.clone(),
                        reason: format!("ended {} in this run", outcome.state()),
                    });
                }
            }

            let Some(definition) = ctx.registry.get(dependency) else {
                return Err(AttemptOutcome::DependencyUnhealthy {
                    dependency: dependency.clone(),
                    reason: "not registered".to_string(),
                });
            };

            let health = wait_until_healthy(
                ctx.prober,
                definition,
                ctx.settings.dependency_interval,
                ctx.settings.dependency_timeout,
            )
            .await;
            if !health.healthy {
                warn!(service = %self.service.name, dependency = %dependency, health = %health, "Dependency is not healthy.");
                return Err(AttemptOutcome::DependencyUnhealthy {
                    dependency: dependency.clone(),
                    reason: health.message.unwrap_or_else(|| "unhealthy".to_string()),
                });
            }
            debug!(service = %self.service.name, dependency = %dependency, "Dependency is healthy.");
        }

        Ok(())
    }

    /// Returns the version to deploy, or `None` if the service is up to date.
    async fn check_version(&self, ctx: &AttemptContext<'_>) -> Result<Option<String>, AttemptOutcome> {
        let current = &self.service.current_version;
        let candidate = ctx
            .resolver
            .latest_version(&self.service.artifact, current, self.service.version_req.as_ref())
            .await
            .map_err(|e| {
                warn!(service = %self.service.name, error = %e, "Version resolution failed. Skipping service.");
                AttemptOutcome::Skipped {
                    reason: format!("version resolution failed: {}", e),
                }
            })?;

        if candidate != *current {
            info!(service = %self.service.name, current = %current, candidate = %candidate, "Found newer version.");
            return Ok(Some(candidate));
        }

        match backend_drift(ctx.driver, &self.service).await {
            Some(running) => {
                warn!(service = %self.service.name, recorded = %current, running = %running, "Backend is not running the recorded version. Redeploying it.");
                Ok(Some(current.clone()))
            }
            None => Ok(None),
        }
    }

    async fn check_vulnerabilities(&mut self, ctx: &AttemptContext<'_>, candidate: &str) -> Result<(), AttemptOutcome> {
        let Some(gate) = ctx.gate else {
            debug!(service = %self.service.name, "Vulnerability gate disabled.");
            return Ok(());
        };

        let target = self.service.artifact_at(candidate);
        match gate.scan(&self.service.artifact, candidate).await {
            Ok(ScanOutcome::Clean) => {
                info!(service = %self.service.name, target = %target, "Vulnerability scan clean.");
            }
            Ok(ScanOutcome::Findings { count }) => {
                let advisory = format!("{} vulnerability findings in {}", count, target);
                if ctx.settings.block_on_findings {
                    warn!(service = %self.service.name, findings = count, "Vulnerability findings block this update.");
                    return Err(AttemptOutcome::Skipped {
                        reason: format!("{}; blocked by gate policy", advisory),
                    });
                }
                warn!(service = %self.service.name, findings = count, "Vulnerability findings are advisory. Continuing.");
                self.advisories.push(advisory);
            }
            Err(e) => {
                warn!(service = %self.service.name, error = %e, "Vulnerability scan unavailable. Continuing.");
                self.advisories.push(format!("vulnerability scan unavailable: {}", e));
            }
        }

        Ok(())
    }

    async fn fail(mut self, ctx: &AttemptContext<'_>, reason: String) -> AttemptRecord {
        warn!(service = %self.service.name, reason = %reason, "Update failed.");
        if !ctx.settings.rollback_on_failure {
            return self.finish(AttemptOutcome::Failed { reason });
        }

        self.transition(AttemptState::RollingBack);
        let controller = RollbackController::new(
            ctx.driver,
            ctx.prober,
            ctx.settings.health_interval,
            ctx.settings.rollback_health_timeout,
        );
        let previous = self.service.current_version.clone();
        match controller.revert(ctx.lock, &self.service, &previous).await {
            Ok(()) => self.finish(AttemptOutcome::RolledBack { reason }),
            Err(e) => {
                error!(service = %self.service.name, error = %e, "Rollback failed. Manual intervention required.");
                self.finish(AttemptOutcome::RollbackFailed {
                    reason,
                    error: e.to_string(),
                })
            }
        }
    }

    fn transition(&mut self, to: AttemptState) {
        info!(service = %self.service.name, from = %self.state, to = %to, "State transition.");
        self.transitions.push(Transition {
            from: self.state,
            to,
            at: Utc::now(),
        });
        self.state = to;
    }

    fn finish(mut self, outcome: AttemptOutcome) -> AttemptRecord {
        self.transition(outcome.state());

        let elapsed = self.started.elapsed();
        AttemptRecord {
            service: self.service.name,
            previous_version: self.service.current_version,
            candidate_version: self.candidate_version,
            outcome,
            advisories: self.advisories,
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            transitions: self.transitions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{service, FakeGate, Fixture};
    use AttemptState::*;

    async fn run_with(fixture: &Fixture, name: &str, settings: &AttemptSettings, gate: Option<&FakeGate>) -> AttemptRecord {
        run_after(fixture, name, settings, gate, &HashMap::new()).await
    }

    async fn run_after(
        fixture: &Fixture, name: &str, settings: &AttemptSettings, gate: Option<&FakeGate>,
        prior_outcomes: &HashMap<String, AttemptOutcome>,
    ) -> AttemptRecord {
        let ctx = AttemptContext {
            lock: &fixture.lock,
            registry: &fixture.registry,
            driver: &fixture.driver,
            resolver: &fixture.resolver,
            gate: gate.map(|g| g as &dyn VulnerabilityGate),
            prober: &fixture.prober,
            settings,
            prior_outcomes,
        };
        let service = fixture.registry.get(name).unwrap().clone();
        UpdateAttempt::new(service).run(&ctx).await
    }

    fn states(record: &AttemptRecord) -> Vec<AttemptState> {
        record.transitions.iter().map(|t| t.to).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn up_to_date_makes_no_mutating_calls() {
        let fixture = Fixture::new(vec![service("a", 0, &[])]);

        let record = run_with(&fixture, "a", &AttemptSettings::default(), None).await;

        assert_eq!(record.outcome, AttemptOutcome::UpToDate);
        assert_eq!(states(&record), vec![DependencyWait, VersionCheck, UpToDate]);
        assert_eq!(record.transitions[0].from, Pending);
        assert_eq!(fixture.driver.mutating_calls(), 0);
        assert!(!record.touched_backend());
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_candidate_succeeds() {
        let fixture = Fixture::new(vec![service("a", 0, &[])]);
        fixture.resolver.offer("a", "1.1.0");

        let record = run_with(&fixture, "a", &AttemptSettings::default(), None).await;

        assert_eq!(record.outcome, AttemptOutcome::Succeeded);
        similar_asserts::assert_eq!(
            states(&record),
            vec![
                DependencyWait,
                VersionCheck,
                CandidateFound,
                VulnerabilityCheck,
                Deploying,
                HealthChecking,
                Succeeded
            ]
        );
        assert_eq!(record.previous_version, "1.0.0");
        assert_eq!(record.candidate_version.as_deref(), Some("1.1.0"));
        assert_eq!(fixture.driver.deployed("a").as_deref(), Some("1.1.0"));
        assert_eq!(fixture.driver.revert_calls(), 0);
        assert_eq!(fixture.driver.lock_paths(), vec![fixture.lock.path().to_path_buf()]);
    }

    #[tokio::test(start_paused = true)]
    async fn health_timeout_rolls_back() {
        let fixture = Fixture::new(vec![service("a", 0, &[])]);
        fixture.resolver.offer("a", "2.0.0");
        fixture.prober.break_version("a", "2.0.0");

        let started = tokio::time::Instant::now();
        let record = run_with(&fixture, "a", &AttemptSettings::default(), None).await;

        match &record.outcome {
            AttemptOutcome::RolledBack { reason } => assert!(reason.starts_with("health check failed"), "{}", reason),
            other => panic!("expected RolledBack, got {:?}", other),
        }
        assert_eq!(
            &states(&record)[4..],
            &[Deploying, HealthChecking, RollingBack, RolledBack]
        );
        assert_eq!(fixture.driver.deployed("a").as_deref(), Some("1.0.0"));
        assert_eq!(fixture.driver.revert_calls(), 1);
        assert!(started.elapsed() >= Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn driver_error_goes_straight_to_rollback() {
        let fixture = Fixture::new(vec![service("a", 0, &[])]);
        fixture.resolver.offer("a", "2.0.0");
        fixture.driver.fail_apply("a");

        let record = run_with(&fixture, "a", &AttemptSettings::default(), None).await;

        assert!(matches!(&record.outcome, AttemptOutcome::RolledBack { reason } if reason.starts_with("deployment failed")));
        assert!(!states(&record).contains(&HealthChecking));
        assert_eq!(fixture.driver.deployed("a").as_deref(), Some("1.0.0"));
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_disabled_fails() {
        let fixture = Fixture::new(vec![service("a", 0, &[])]);
        fixture.resolver.offer("a", "2.0.0");
        fixture.driver.fail_apply("a");
        let settings = AttemptSettings {
            rollback_on_failure: false,
            ..Default::default()
        };

        let record = run_with(&fixture, "a", &settings, None).await;

        assert!(matches!(record.outcome, AttemptOutcome::Failed { .. }));
        assert_eq!(fixture.driver.revert_calls(), 0);
        assert!(!record.outcome.is_acceptable());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_rollback_is_not_retried() {
        let fixture = Fixture::new(vec![service("a", 0, &[])]);
        fixture.resolver.offer("a", "2.0.0");
        fixture.prober.break_version("a", "2.0.0");
        fixture.driver.fail_revert("a");

        let record = run_with(&fixture, "a", &AttemptSettings::default(), None).await;

        assert!(matches!(record.outcome, AttemptOutcome::RollbackFailed { .. }));
        assert_eq!(fixture.driver.revert_calls(), 1);
        assert_eq!(fixture.driver.apply_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dependency_failed_in_this_run() {
        let fixture = Fixture::new(vec![service("a", 0, &[]), service("b", 1, &["a"])]);
        fixture.resolver.offer("b", "2.0.0");
        let prior = HashMap::from([(
            "a".to_string(),
            AttemptOutcome::RolledBack {
                reason: "health check failed".to_string(),
            },
        )]);

        let record = run_after(&fixture, "b", &AttemptSettings::default(), None, &prior).await;

        assert_eq!(
            record.outcome,
            AttemptOutcome::DependencyUnhealthy {
                dependency: "a".to_string(),
                reason: "ended RolledBack in this run".to_string(),
            }
        );
        assert_eq!(states(&record), vec![DependencyWait, DependencyUnhealthy]);
        assert_eq!(fixture.prober.probes("a"), 0);
        assert_eq!(fixture.driver.total_calls(), 0);
        assert_eq!(fixture.resolver.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_dependency_is_health_checked() {
        let fixture = Fixture::new(vec![service("a", 0, &[]), service("b", 1, &["a"])]);
        fixture.resolver.offer("b", "2.0.0");
        let prior = HashMap::from([(
            "a".to_string(),
            AttemptOutcome::Skipped {
                reason: "version resolution failed: 503".to_string(),
            },
        )]);

        let record = run_after(&fixture, "b", &AttemptSettings::default(), None, &prior).await;

        assert_eq!(record.outcome, AttemptOutcome::Succeeded);
        assert_eq!(fixture.prober.probes("a"), 1);
        assert_eq!(fixture.driver.deployed("b").as_deref(), Some("2.0.0"));
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_dependency_still_needs_to_be_healthy() {
        let fixture = Fixture::new(vec![service("a", 0, &[]), service("b", 1, &["a"])]);
        fixture.resolver.offer("b", "2.0.0");
        fixture.prober.set_unhealthy("a");
        let prior = HashMap::from([(
            "a".to_string(),
            AttemptOutcome::Skipped {
                reason: "blocked by gate policy".to_string(),
            },
        )]);

        let record = run_after(&fixture, "b", &AttemptSettings::default(), None, &prior).await;

        assert!(matches!(&record.outcome, AttemptOutcome::DependencyUnhealthy { reason, .. } if reason.contains("connection refused")));
        assert!(fixture.prober.probes("a") > 1);
        assert_eq!(fixture.driver.mutating_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dependency_unhealthy_outside_run() {
        let fixture = Fixture::new(vec![service("a", 0, &[]), service("b", 1, &["a"])]);
        fixture.resolver.offer("b", "2.0.0");
        fixture.prober.set_unhealthy("a");
        let settings = AttemptSettings {
            dependency_interval: Duration::from_secs(5),
            dependency_timeout: Duration::from_secs(30),
            ..Default::default()
        };

        let record = run_with(&fixture, "b", &settings, None).await;

        assert!(matches!(&record.outcome, AttemptOutcome::DependencyUnhealthy { dependency, .. } if dependency == "a"));
        // t=0, 5, ..., 30
        assert_eq!(fixture.prober.probes("a"), 7);
        assert_eq!(fixture.driver.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resolver_failure_skips() {
        let fixture = Fixture::new(vec![service("a", 0, &[])]);
        fixture.resolver.fail_for("a");

        let record = run_with(&fixture, "a", &AttemptSettings::default(), None).await;

        assert!(matches!(&record.outcome, AttemptOutcome::Skipped { reason } if reason.contains("503")));
        assert_eq!(fixture.driver.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_findings_are_advisory_by_default() {
        let fixture = Fixture::new(vec![service("a", 0, &[])]);
        fixture.resolver.offer("a", "1.1.0");

        let record = run_with(&fixture, "a", &AttemptSettings::default(), Some(&FakeGate::Findings(4))).await;

        assert_eq!(record.outcome, AttemptOutcome::Succeeded);
        assert_eq!(record.advisories, vec!["4 vulnerability findings in example/a:1.1.0".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_findings_block_when_configured() {
        let fixture = Fixture::new(vec![service("a", 0, &[])]);
        fixture.resolver.offer("a", "1.1.0");
        let settings = AttemptSettings {
            block_on_findings: true,
            ..Default::default()
        };

        let record = run_with(&fixture, "a", &settings, Some(&FakeGate::Findings(1))).await;

        assert!(matches!(record.outcome, AttemptOutcome::Skipped { .. }));
        assert_eq!(fixture.driver.mutating_calls(), 0);

        let clean = run_with(&fixture, "a", &settings, Some(&FakeGate::Clean)).await;
        assert_eq!(clean.outcome, AttemptOutcome::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_outage_never_blocks() {
        let fixture = Fixture::new(vec![service("a", 0, &[])]);
        fixture.resolver.offer("a", "1.1.0");
        let settings = AttemptSettings {
            block_on_findings: true,
            ..Default::default()
        };

        let record = run_with(&fixture, "a", &settings, Some(&FakeGate::Unavailable)).await;

        assert_eq!(record.outcome, AttemptOutcome::Succeeded);
        assert!(record.advisories[0].starts_with("vulnerability scan unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn dry_run_plans_without_mutating() {
        let fixture = Fixture::new(vec![service("a", 0, &[])]);
        fixture.resolver.offer("a", "1.1.0");
        let settings = AttemptSettings {
            dry_run: true,
            ..Default::default()
        };

        let record = run_with(&fixture, "a", &settings, None).await;

        assert_eq!(
            record.outcome,
            AttemptOutcome::Planned {
                candidate: "1.1.0".to_string()
            }
        );
        assert_eq!(fixture.driver.mutating_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drift_redeploys_recorded_version() {
        let fixture = Fixture::new(vec![service("a", 0, &[])]);
        fixture.driver.set_deployed("a", "1.1.0-half-applied");

        let record = run_with(&fixture, "a", &AttemptSettings::default(), None).await;

        assert_eq!(record.outcome, AttemptOutcome::Succeeded);
        assert_eq!(record.candidate_version.as_deref(), Some("1.0.0"));
        assert_eq!(fixture.driver.deployed("a").as_deref(), Some("1.0.0"));
    }

    #[tokio::test(start_paused = true)]
    async fn strategy_override() {
        let fixture = Fixture::new(vec![service("a", 0, &[])]);
        fixture.resolver.offer("a", "1.1.0");
        let settings = AttemptSettings {
            strategy_override: Some(UpdateStrategy::BlueGreen),
            ..Default::default()
        };

        run_with(&fixture, "a", &settings, None).await;

        assert_eq!(
            fixture.driver.applied(),
            vec![("a".to_string(), "1.1.0".to_string(), UpdateStrategy::BlueGreen)]
        );
    }

    #[test]
    fn acceptable_outcomes() {
        assert!(AttemptOutcome::RolledBack { reason: String::new() }.is_acceptable());
        assert!(AttemptOutcome::RolledBack { reason: String::new() }.disqualifies_dependents());
        assert!(AttemptOutcome::Failed { reason: String::new() }.disqualifies_dependents());
        assert!(!AttemptOutcome::Planned {
            candidate: "1".to_string()
        }
        .disqualifies_dependents());
        assert!(!AttemptOutcome::Skipped { reason: String::new() }.disqualifies_dependents());
        assert!(!AttemptOutcome::Skipped { reason: String::new() }.is_acceptable());
    }

    #[test]
    fn record_serializes_outcome_inline() {
        let record = AttemptRecord {
            service: "api".to_string(),
            previous_version: "1.0.0".to_string(),
            candidate_version: Some("1.1.0".to_string()),
            outcome: AttemptOutcome::RolledBack {
                reason: "health check failed".to_string(),
            },
            advisories: Vec::new(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration_ms: 5,
            transitions: Vec::new(),
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["outcome"], "rolled_back");
        assert_eq!(value["reason"], "health check failed");
        assert!(value.get("advisories").is_none());
    }
}
