use std::process::ExitCode;

use sluice_core::config::OrchestratorConfiguration;
use tracing::error;

use super::EXIT_FATAL;

/// Entrypoint for the `config` command.
pub fn handle_config_command(config: &OrchestratorConfiguration) -> ExitCode {
    match serde_yaml::to_string(config) {
        Ok(yaml) => {
            print!("{}", yaml);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to render configuration: {}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}
