use std::{sync::Arc, time::Duration};

use sluice_core::{
    config::{NotificationConfiguration, OrchestratorConfiguration},
    gate::CommandGate,
    health::NetworkProber,
    notify::{EmailChannel, NotificationChannel, Notifier, NotifierHandle, WebhookChannel},
    orchestrator::Orchestrator,
    resolver::RegistryResolver,
};
use sluice_drivers::driver_from_configuration;
use sluice_error::{ErrorContext as _, GenericError};
use tracing::{debug, info};

mod check;
pub use self::check::handle_check_command;

mod config;
pub use self::config::handle_config_command;

mod rollback;
pub use self::rollback::handle_rollback_command;

mod status;
pub use self::status::handle_status_command;

mod update;
pub use self::update::handle_update_command;

/// Exit code when the command ran but some service ended badly, or updates are pending for `check`.
pub const EXIT_PARTIAL_FAILURE: u8 = 1;

/// Exit code when the command could not run at all.
pub const EXIT_FATAL: u8 = 2;

/// Exit code when the command was interrupted.
pub const EXIT_INTERRUPTED: u8 = 130;

/// The orchestrator and the background work it feeds.
pub struct Components {
    /// Drives update runs against the configured backend.
    pub orchestrator: Orchestrator,
    notifier: Option<NotifierHandle>,
    flush_timeout: Duration,
}

impl Components {
    /// Builds every collaborator named by the configuration.
    ///
    /// # Errors
    ///
    /// If the deployment backend, the HTTP clients, or a notification channel cannot be created, an error is returned.
    pub async fn from_configuration(config: &OrchestratorConfiguration) -> Result<Self, GenericError> {
        let driver = driver_from_configuration(config).await?;
        let resolver = RegistryResolver::new(
            Duration::from_secs(config.resolver.timeout_secs),
            config.resolver.allow_prerelease,
        )
        .error_context("Failed to create registry client.")?;
        let prober = NetworkProber::new(Duration::from_secs(config.health.request_timeout_secs))
            .error_context("Failed to create health check client.")?;

        let channels = notification_channels(&config.notifications)?;
        let (notifier, handle) = if channels.is_empty() {
            debug!("No notification channels configured.");
            (Notifier::disabled(), None)
        } else {
            let (notifier, handle) = Notifier::spawn(channels, config.notifications.queue_capacity);
            (notifier, Some(handle))
        };

        let mut orchestrator = Orchestrator::new(driver, Arc::new(resolver), Arc::new(prober), notifier)
            .with_settings(config.attempt_settings())
            .with_settle_delay(config.settle_delay())
            .with_unhealthy_dependency_policy(config.unhealthy_dependency)
            .with_report_dir(config.report_dir.clone());

        if config.gate.enabled {
            let gate = CommandGate::new(
                config.gate.command.clone(),
                config.gate.severities.clone(),
                Duration::from_secs(config.gate.timeout_secs),
            );
            orchestrator = orchestrator.with_gate(Arc::new(gate));
        }

        info!(backend = orchestrator.backend_name(), "Deployment backend ready.");

        Ok(Self {
            orchestrator,
            notifier: handle,
            flush_timeout: Duration::from_secs(config.notifications.flush_timeout_secs),
        })
    }

    /// Drops the orchestrator and waits for queued notifications to be delivered.
    pub async fn shutdown(self) {
        let Self {
            orchestrator,
            notifier,
            flush_timeout,
        } = self;
        drop(orchestrator);

        if let Some(handle) = notifier {
            handle.shutdown(flush_timeout).await;
        }
    }
}

fn notification_channels(config: &NotificationConfiguration) -> Result<Vec<Box<dyn NotificationChannel>>, GenericError> {
    let delivery_timeout = Duration::from_secs(config.flush_timeout_secs.max(1));
    let mut channels: Vec<Box<dyn NotificationChannel>> = Vec::new();

    if let Some(url) = &config.webhook_url {
        channels.push(Box::new(WebhookChannel::new(url.clone(), delivery_timeout)?));
    }

    if let Some(email) = &config.email {
        channels.push(Box::new(EmailChannel::new(
            email.command.clone(),
            email.from.clone(),
            email.to.clone(),
            delivery_timeout,
        )));
    }

    Ok(channels)
}
