//! Fake collaborators with call counters.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use reqwest::StatusCode;
use semver::VersionReq;
use sluice_error::{generic_error, GenericError};

use crate::{
    driver::{DeploymentDriver, DriverError, ServiceState},
    gate::{GateError, ScanOutcome, VulnerabilityGate},
    health::{HealthCheckResult, HealthProbe},
    lock::RunLockGuard,
    notify::{Notification, NotificationChannel},
    registry::{HealthCheck, ServiceDefinition, ServiceRegistry, UpdateStrategy},
    resolver::{ResolverError, VersionResolver},
};

pub fn artifact_for(name: &str) -> String {
    format!("example/{}", name)
}

pub fn service(name: &str, priority: i32, deps: &[&str]) -> ServiceDefinition {
    ServiceDefinition {
        name: name.to_string(),
        artifact: artifact_for(name),
        current_version: "1.0.0".to_string(),
        priority,
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        policy: UpdateStrategy::Rolling,
        health_check: HealthCheck::Tcp {
            port: 1,
            host: "127.0.0.1".to_string(),
        },
        version_req: None,
        last_updated: None,
    }
}

#[derive(Default)]
struct DriverState {
    deployed: HashMap<String, String>,
    applied: Vec<(String, String, UpdateStrategy)>,
    reverted: Vec<(String, String)>,
    lock_paths: Vec<PathBuf>,
    state_reads: usize,
    fail_apply: HashSet<String>,
    fail_revert: HashSet<String>,
}

/// In-memory deployment backend. Clones share state.
#[derive(Clone, Default)]
pub struct FakeDriver {
    state: Arc<Mutex<DriverState>>,
}

impl FakeDriver {
    pub fn with_services(services: &[ServiceDefinition]) -> Self {
        let driver = Self::default();
        for service in services {
            driver.set_deployed(&service.name, &service.current_version);
        }
        driver
    }

    pub fn set_deployed(&self, name: &str, version: &str) {
        self.state
            .lock()
            .unwrap()
            .deployed
            .insert(name.to_string(), version.to_string());
    }

    pub fn deployed(&self, name: &str) -> Option<String> {
        self.state.lock().unwrap().deployed.get(name).cloned()
    }

    pub fn fail_apply(&self, name: &str) {
        self.state.lock().unwrap().fail_apply.insert(name.to_string());
    }

    pub fn fail_revert(&self, name: &str) {
        self.state.lock().unwrap().fail_revert.insert(name.to_string());
    }

    pub fn applied(&self) -> Vec<(String, String, UpdateStrategy)> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn apply_calls(&self) -> usize {
        self.state.lock().unwrap().applied.len()
    }

    pub fn revert_calls(&self) -> usize {
        self.state.lock().unwrap().reverted.len()
    }

    /// Run lock markers presented by each mutating call, in order.
    pub fn lock_paths(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().lock_paths.clone()
    }

    pub fn mutating_calls(&self) -> usize {
        self.apply_calls() + self.revert_calls()
    }

    pub fn state_reads(&self) -> usize {
        self.state.lock().unwrap().state_reads
    }

    pub fn total_calls(&self) -> usize {
        self.mutating_calls() + self.state_reads()
    }
}

#[async_trait]
impl DeploymentDriver for FakeDriver {
    fn backend_name(&self) -> &'static str {
        "fake"
    }

    async fn current_state(&self, service: &ServiceDefinition) -> Result<ServiceState, DriverError> {
        let mut state = self.state.lock().unwrap();
        state.state_reads += 1;
        match state.deployed.get(&service.name) {
            Some(version) => Ok(ServiceState {
                version: Some(version.clone()),
                replicas: 1,
                ready_replicas: 1,
            }),
            None => Err(DriverError::ServiceNotFound {
                service: service.name.clone(),
            }),
        }
    }

    async fn apply_version(
        &self, lock: &RunLockGuard, service: &ServiceDefinition, version: &str, strategy: UpdateStrategy,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        state.lock_paths.push(lock.path().to_path_buf());
        state
            .applied
            .push((service.name.clone(), version.to_string(), strategy));
        // A failed apply still leaves the backend half-updated.
        state.deployed.insert(service.name.clone(), version.to_string());
        if state.fail_apply.contains(&service.name) {
            return Err(DriverError::InstanceFailed {
                service: service.name.clone(),
                message: "container exited with code 1".to_string(),
            });
        }
        Ok(())
    }

    async fn revert_version(
        &self, lock: &RunLockGuard, service: &ServiceDefinition, previous_version: &str,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        state.lock_paths.push(lock.path().to_path_buf());
        state
            .reverted
            .push((service.name.clone(), previous_version.to_string()));
        if state.fail_revert.contains(&service.name) {
            return Err(DriverError::Unreachable {
                message: "connection refused".to_string(),
            });
        }
        state
            .deployed
            .insert(service.name.clone(), previous_version.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct ProberState {
    unhealthy: HashSet<String>,
    broken_versions: HashSet<(String, String)>,
    probes: HashMap<String, usize>,
}

/// Health prober that reports a service unhealthy when it is marked unhealthy, or when the fake driver has a broken
/// version of it deployed.
#[derive(Clone)]
pub struct FakeProber {
    driver: FakeDriver,
    state: Arc<Mutex<ProberState>>,
}

impl FakeProber {
    pub fn new(driver: FakeDriver) -> Self {
        Self {
            driver,
            state: Arc::default(),
        }
    }

    pub fn set_unhealthy(&self, name: &str) {
        self.state.lock().unwrap().unhealthy.insert(name.to_string());
    }

    pub fn break_version(&self, name: &str, version: &str) {
        self.state
            .lock()
            .unwrap()
            .broken_versions
            .insert((name.to_string(), version.to_string()));
    }

    pub fn probes(&self, name: &str) -> usize {
        self.state.lock().unwrap().probes.get(name).copied().unwrap_or(0)
    }
}

#[async_trait]
impl HealthProbe for FakeProber {
    async fn probe(&self, service: &ServiceDefinition) -> HealthCheckResult {
        let deployed = self.driver.deployed(&service.name).unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        *state.probes.entry(service.name.clone()).or_default() += 1;

        if state.unhealthy.contains(&service.name) {
            HealthCheckResult::unhealthy("connection refused")
        } else if state.broken_versions.contains(&(service.name.clone(), deployed.clone())) {
            HealthCheckResult::unhealthy(format!("{} crashes on startup", deployed))
        } else {
            HealthCheckResult::healthy()
        }
    }
}

#[derive(Default)]
struct ResolverState {
    offers: HashMap<String, String>,
    failing: HashSet<String>,
    calls: usize,
}

/// Resolver that offers configured versions, keyed by artifact.
#[derive(Clone, Default)]
pub struct FakeResolver {
    state: Arc<Mutex<ResolverState>>,
}

impl FakeResolver {
    pub fn offer(&self, name: &str, version: &str) {
        self.state
            .lock()
            .unwrap()
            .offers
            .insert(artifact_for(name), version.to_string());
    }

    pub fn fail_for(&self, name: &str) {
        self.state.lock().unwrap().failing.insert(artifact_for(name));
    }

    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }
}

#[async_trait]
impl VersionResolver for FakeResolver {
    async fn latest_version(
        &self, artifact: &str, current_version: &str, _requirement: Option<&VersionReq>,
    ) -> Result<String, ResolverError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        if state.failing.contains(artifact) {
            return Err(ResolverError::UnexpectedStatus {
                artifact: artifact.to_string(),
                status: StatusCode::SERVICE_UNAVAILABLE,
            });
        }
        Ok(state
            .offers
            .get(artifact)
            .cloned()
            .unwrap_or_else(|| current_version.to_string()))
    }
}

/// Gate returning a fixed result.
pub enum FakeGate {
    Clean,
    Findings(usize),
    Unavailable,
}

#[async_trait]
impl VulnerabilityGate for FakeGate {
    async fn scan(&self, _artifact: &str, _version: &str) -> Result<ScanOutcome, GateError> {
        match self {
            Self::Clean => Ok(ScanOutcome::Clean),
            Self::Findings(count) => Ok(ScanOutcome::Findings { count: *count }),
            Self::Unavailable => Err(GateError::TimedOut {
                command: "trivy".to_string(),
                timeout: std::time::Duration::from_secs(300),
            }),
        }
    }
}

/// Notification channel that records everything delivered to it.
#[derive(Clone, Default)]
pub struct RecordingChannel {
    delivered: Arc<Mutex<Vec<Notification>>>,
    failing: bool,
}

impl RecordingChannel {
    pub fn failing() -> Self {
        Self {
            delivered: Arc::default(),
            failing: true,
        }
    }

    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), GenericError> {
        self.delivered.lock().unwrap().push(notification.clone());
        if self.failing {
            return Err(generic_error!("channel unavailable"));
        }
        Ok(())
    }
}

/// A registry, a held run lock, and fakes for every collaborator.
pub struct Fixture {
    pub lock: RunLockGuard,
    pub registry: ServiceRegistry,
    pub driver: FakeDriver,
    pub prober: FakeProber,
    pub resolver: FakeResolver,
    pub dir: tempfile::TempDir,
}

impl Fixture {
    pub fn new(services: Vec<ServiceDefinition>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let lock = RunLockGuard::acquire(dir.path().join("sluice.lock")).unwrap();
        let registry = ServiceRegistry::from_services(dir.path().join("services.yaml"), services).unwrap();
        let driver = FakeDriver::with_services(registry.services());
        let prober = FakeProber::new(driver.clone());

        Self {
            lock,
            registry,
            driver,
            prober,
            resolver: FakeResolver::default(),
            dir,
        }
    }
}
