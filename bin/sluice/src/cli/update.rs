use std::{process::ExitCode, time::Duration};

use sluice_core::{
    config::OrchestratorConfiguration, lock::RunLockGuard, orchestrator::RunOptions, registry::ServiceRegistry,
};
use sluice_error::{ErrorContext as _, GenericError};
use tracing::{error, info, warn};

use super::{Components, EXIT_FATAL, EXIT_PARTIAL_FAILURE};
use crate::config::UpdateConfig;

impl From<UpdateConfig> for RunOptions {
    fn from(value: UpdateConfig) -> Self {
        Self {
            only: value.service,
            dry_run: value.dry_run,
            force: value.force,
            strategy: value.strategy.map(Into::into),
            health_timeout: value.timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Entrypoint for the `update` command.
pub async fn handle_update_command(config: &OrchestratorConfiguration, update: UpdateConfig) -> ExitCode {
    match run_update(config, update.into()).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(EXIT_PARTIAL_FAILURE),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run_update(config: &OrchestratorConfiguration, options: RunOptions) -> Result<bool, GenericError> {
    let lock = RunLockGuard::acquire(&config.lock_path)?;
    let mut registry = ServiceRegistry::load(&config.registry_path)?;
    let components = Components::from_configuration(config).await?;

    if options.dry_run {
        info!("Dry run: no changes will be made.");
    }

    let result = components
        .orchestrator
        .run_update(&lock, &mut registry, &options)
        .await
        .error_context("Failed to plan update run.");
    components.shutdown().await;
    let report = result?;

    for record in &report.services {
        match &record.candidate_version {
            Some(candidate) if candidate != &record.previous_version => println!(
                "{}: {} ({} -> {})",
                record.service, record.outcome, record.previous_version, candidate
            ),
            _ => println!("{}: {} ({})", record.service, record.outcome, record.previous_version),
        }
    }
    for service in &report.not_attempted {
        println!("{}: not attempted", service);
    }
    println!("{}", report.summary);

    if !report.is_success() {
        warn!(summary = %report.summary, "Update run finished with failures.");
    }

    Ok(report.is_success())
}
