use std::process::ExitCode;

use sluice_core::{config::OrchestratorConfiguration, registry::ServiceRegistry};
use sluice_error::GenericError;
use tracing::error;

use super::{Components, EXIT_FATAL, EXIT_PARTIAL_FAILURE};

/// Entrypoint for the `check` command.
///
/// Exits with 0 when everything is up to date, and 1 when updates are pending.
pub async fn handle_check_command(config: &OrchestratorConfiguration) -> ExitCode {
    match check(config).await {
        Ok(0) => {
            println!("All services are up to date.");
            ExitCode::SUCCESS
        }
        Ok(_) => ExitCode::from(EXIT_PARTIAL_FAILURE),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn check(config: &OrchestratorConfiguration) -> Result<usize, GenericError> {
    let registry = ServiceRegistry::load(&config.registry_path)?;
    let components = Components::from_configuration(config).await?;

    let pending = components.orchestrator.check(&registry).await;
    components.shutdown().await;

    for update in &pending {
        println!("{}", update);
    }

    Ok(pending.len())
}
