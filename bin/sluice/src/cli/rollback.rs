use std::process::ExitCode;

use sluice_core::{config::OrchestratorConfiguration, lock::RunLockGuard, registry::ServiceRegistry};
use sluice_error::GenericError;
use tracing::error;

use super::{Components, EXIT_FATAL, EXIT_PARTIAL_FAILURE};
use crate::config::RollbackConfig;

/// Entrypoint for the `rollback` command.
pub async fn handle_rollback_command(config: &OrchestratorConfiguration, rollback: RollbackConfig) -> ExitCode {
    let lock = match RunLockGuard::acquire(&config.lock_path) {
        Ok(lock) => lock,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let (registry, components) = match prepare(config).await {
        Ok(prepared) => prepared,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let result = components
        .orchestrator
        .rollback_service(&lock, &registry, &rollback.service)
        .await;
    components.shutdown().await;
    drop(lock);

    match result {
        Ok(()) => {
            println!("{}: rolled back", rollback.service);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(service = %rollback.service, "Rollback failed. Manual intervention required: {:#}", e);
            ExitCode::from(EXIT_PARTIAL_FAILURE)
        }
    }
}

async fn prepare(config: &OrchestratorConfiguration) -> Result<(ServiceRegistry, Components), GenericError> {
    let registry = ServiceRegistry::load(&config.registry_path)?;
    let components = Components::from_configuration(config).await?;
    Ok((registry, components))
}
