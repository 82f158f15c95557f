use std::process::ExitCode;

use sluice_core::{config::OrchestratorConfiguration, registry::ServiceRegistry};
use sluice_error::GenericError;
use tracing::error;

use super::{Components, EXIT_FATAL};

/// Entrypoint for the `status` command.
pub async fn handle_status_command(config: &OrchestratorConfiguration) -> ExitCode {
    match status(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn status(config: &OrchestratorConfiguration) -> Result<(), GenericError> {
    let registry = ServiceRegistry::load(&config.registry_path)?;
    let components = Components::from_configuration(config).await?;

    let statuses = components.orchestrator.status(&registry).await;
    components.shutdown().await;

    for status in &statuses {
        println!("{}", status);
    }

    Ok(())
}
