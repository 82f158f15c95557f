//! Operator command surface for sluice.
//!
//! Loads the orchestrator configuration, initializes logging, and dispatches to one of the `update`, `status`,
//! `check`, `rollback`, or `config` commands. Interrupting a command drops it, releasing the run lock, and exits with
//! 130.
#![deny(missing_docs)]

use std::{path::Path, process::ExitCode};

use clap::Parser as _;
use sluice_app::prelude::*;
use sluice_config::{ConfigurationLoader, GenericConfiguration};
use sluice_core::config::OrchestratorConfiguration;
use sluice_error::{ErrorContext as _, GenericError};
use tokio::{
    select,
    signal::unix::{signal, SignalKind},
};
use tracing::{debug, error, info, warn};

mod cli;
use self::cli::{
    handle_check_command, handle_config_command, handle_rollback_command, handle_status_command,
    handle_update_command, EXIT_FATAL, EXIT_INTERRUPTED,
};

mod config;
use self::config::{Action, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let configuration = match load_configuration(&cli.config) {
        Ok(configuration) => configuration,
        Err(e) => fatal_and_exit(format!("failed to load configuration: {:#}", e)),
    };

    let mut logging_config = match LoggingConfiguration::from_configuration(&configuration) {
        Ok(logging_config) => logging_config,
        Err(e) => fatal_and_exit(format!("invalid logging configuration: {:#}", e)),
    };
    if let Some(level) = cli.log_level_override() {
        logging_config.override_level(level);
    }

    let _guard = match initialize_logging(&logging_config) {
        Ok(guard) => guard,
        Err(e) => fatal_and_exit(format!("failed to initialize logging: {:#}", e)),
    };

    let config = match OrchestratorConfiguration::from_configuration(&configuration) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            return ExitCode::from(EXIT_FATAL);
        }
    };

    debug!(config_path = %cli.config.display(), backend = ?config.backend, "Loaded configuration.");

    let mut sigint_handler = match signal(SignalKind::interrupt()).error_context("Failed to set up SIGINT handler.") {
        Ok(handler) => handler,
        Err(e) => fatal_and_exit(format!("{:#}", e)),
    };
    let mut sigterm_handler = match signal(SignalKind::terminate()).error_context("Failed to set up SIGTERM handler.") {
        Ok(handler) => handler,
        Err(e) => fatal_and_exit(format!("{:#}", e)),
    };

    // Dropping the command future on a signal releases the run lock it may hold.
    select! {
        code = run(cli.action, &config) => code,
        _ = sigint_handler.recv() => {
            warn!("Received SIGINT. Abandoning in-flight work.");
            ExitCode::from(EXIT_INTERRUPTED)
        }
        _ = sigterm_handler.recv() => {
            warn!("Received SIGTERM. Abandoning in-flight work.");
            ExitCode::from(EXIT_INTERRUPTED)
        }
    }
}

async fn run(action: Action, config: &OrchestratorConfiguration) -> ExitCode {
    match action {
        Action::Update(update) => {
            info!("sluice update starting...");
            handle_update_command(config, update).await
        }
        Action::Status => handle_status_command(config).await,
        Action::Check => handle_check_command(config).await,
        Action::Rollback(rollback) => {
            info!(service = %rollback.service, "sluice rollback starting...");
            handle_rollback_command(config, rollback).await
        }
        Action::Config => handle_config_command(config),
    }
}

fn load_configuration(path: &Path) -> Result<GenericConfiguration, GenericError> {
    let configuration = ConfigurationLoader::default()
        .with_optional_file(path)?
        .with_environment("SLUICE")?
        .build();
    Ok(configuration)
}
