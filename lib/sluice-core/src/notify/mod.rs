//! Notifications.
//!
//! Notifications are queued to a background worker that delivers each one to every configured channel in turn. The
//! queue is bounded, and enqueuing never waits: when it is full the notification is dropped with a warning, so a slow
//! or unreachable channel can never stall an update run.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use sluice_error::GenericError;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    attempt::{AttemptOutcome, AttemptRecord},
    report::RunReport,
    spawn_traced_named,
};

mod email;
pub use self::email::EmailChannel;

mod webhook;
pub use self::webhook::WebhookChannel;

/// Notification severity.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NotificationLevel {
    /// Routine progress.
    Info,

    /// Something failed, but the fleet is in a known-good state.
    Warning,

    /// A service needs manual intervention.
    Critical,
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => f.write_str("INFO"),
            Self::Warning => f.write_str("WARNING"),
            Self::Critical => f.write_str("CRITICAL"),
        }
    }
}

/// What a notification is about.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NotificationKind {
    /// The terminal outcome of one service's attempt.
    Attempt {
        /// Service name.
        service: String,
    },

    /// The summary of a whole run.
    RunSummary,
}

/// A human-readable status message.
#[derive(Clone, Debug)]
pub struct Notification {
    /// What the notification is about.
    pub kind: NotificationKind,

    /// Severity.
    pub level: NotificationLevel,

    /// One-line title.
    pub title: String,

    /// Free-form body.
    pub body: String,
}

impl Notification {
    /// Creates a notification for a finished attempt.
    pub fn for_attempt(record: &AttemptRecord) -> Self {
        let level = match record.outcome {
            AttemptOutcome::UpToDate | AttemptOutcome::Succeeded | AttemptOutcome::Planned { .. } => {
                NotificationLevel::Info
            }
            AttemptOutcome::RolledBack { .. }
            | AttemptOutcome::Skipped { .. }
            | AttemptOutcome::DependencyUnhealthy { .. } => NotificationLevel::Warning,
            AttemptOutcome::RollbackFailed { .. } | AttemptOutcome::Failed { .. } => NotificationLevel::Critical,
        };

        let title = match (&record.outcome, &record.candidate_version) {
            (AttemptOutcome::Succeeded, Some(candidate)) => format!(
                "[sluice] {} updated {} -> {}",
                record.service, record.previous_version, candidate
            ),
            (outcome, _) => format!("[sluice] {}: {}", record.service, outcome.state()),
        };

        let mut body = format!(
            "Service: {}\nPrevious version: {}\nCandidate version: {}\nOutcome: {}\nDuration: {}ms\n",
            record.service,
            record.previous_version,
            record.candidate_version.as_deref().unwrap_or("-"),
            record.outcome,
            record.duration_ms
        );
        for advisory in &record.advisories {
            body.push_str(&format!("Advisory: {}\n", advisory));
        }

        Self {
            kind: NotificationKind::Attempt {
                service: record.service.clone(),
            },
            level,
            title,
            body,
        }
    }

    /// Creates the summary notification for a finished run.
    pub fn for_run(report: &RunReport) -> Self {
        let level = if report.summary.rollback_failed > 0 || report.summary.failed > 0 {
            NotificationLevel::Critical
        } else if report.is_success() {
            NotificationLevel::Info
        } else {
            NotificationLevel::Warning
        };

        let mut body = format!(
            "Run: {}\nBackend: {}\nDry run: {}\nSummary: {}\n\n",
            report.run_id, report.backend, report.dry_run, report.summary
        );
        for record in &report.services {
            body.push_str(&format!("{}: {}\n", record.service, record.outcome));
        }
        for service in &report.not_attempted {
            body.push_str(&format!("{}: not attempted\n", service));
        }

        Self {
            kind: NotificationKind::RunSummary,
            level,
            title: format!("[sluice] run {}: {}", report.run_id, report.summary),
            body,
        }
    }
}

/// An outbound notification channel.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Returns the channel's name, for logging.
    fn name(&self) -> &'static str;

    /// Delivers a notification.
    async fn deliver(&self, notification: &Notification) -> Result<(), GenericError>;
}

/// Handle for queueing notifications.
///
/// Cheap to clone. Notifications are delivered in the order they were queued.
#[derive(Clone)]
pub struct Notifier {
    tx: Option<mpsc::Sender<Notification>>,
}

impl Notifier {
    /// Spawns the delivery worker for the given channels.
    ///
    /// The returned [`NotifierHandle`] flushes the queue on shutdown.
    pub fn spawn(channels: Vec<Box<dyn NotificationChannel>>, capacity: usize) -> (Self, NotifierHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = spawn_traced_named("notifier", run_worker(channels, rx));
        (Self { tx: Some(tx) }, NotifierHandle { worker })
    }

    /// Creates a notifier that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Queues a notification without waiting.
    pub fn notify(&self, notification: Notification) {
        let Some(tx) = &self.tx else {
            debug!(title = %notification.title, "Notifications disabled. Discarding.");
            return;
        };

        match tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(notification)) => {
                warn!(title = %notification.title, "Notification queue full. Dropping notification.");
            }
            Err(TrySendError::Closed(notification)) => {
                warn!(title = %notification.title, "Notification worker stopped. Dropping notification.");
            }
        }
    }
}

/// Owner of the notification delivery worker.
pub struct NotifierHandle {
    worker: JoinHandle<()>,
}

impl NotifierHandle {
    /// Waits up to `timeout` for queued notifications to be delivered.
    ///
    /// The worker finishes once every [`Notifier`] clone has been dropped and the queue is empty, so all notifiers
    /// should be dropped before calling this.
    pub async fn shutdown(self, timeout: Duration) {
        match tokio::time::timeout(timeout, self.worker).await {
            Ok(Ok(())) => debug!("Notification queue flushed."),
            Ok(Err(e)) => warn!(error = %e, "Notification worker failed."),
            Err(_) => warn!(
                timeout_secs = timeout.as_secs(),
                "Timed out flushing notifications. Remaining notifications were dropped."
            ),
        }
    }
}

async fn run_worker(channels: Vec<Box<dyn NotificationChannel>>, mut rx: mpsc::Receiver<Notification>) {
    debug!(channels = channels.len(), "Notification worker started.");

    while let Some(notification) = rx.recv().await {
        for channel in &channels {
            match channel.deliver(&notification).await {
                Ok(()) => debug!(channel = channel.name(), title = %notification.title, "Delivered notification."),
                Err(e) => warn!(channel = channel.name(), title = %notification.title, error = %e, "Failed to deliver notification."),
            }
        }
    }

    debug!("Notification worker stopped.");
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::test_util::RecordingChannel;

    fn record(outcome: AttemptOutcome) -> AttemptRecord {
        AttemptRecord {
            service: "api".to_string(),
            previous_version: "1.0.0".to_string(),
            candidate_version: Some("1.1.0".to_string()),
            outcome,
            advisories: vec!["2 vulnerability findings in example/api:1.1.0".to_string()],
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration_ms: 1500,
            transitions: Vec::new(),
        }
    }

    #[test]
    fn attempt_notifications() {
        let succeeded = Notification::for_attempt(&record(AttemptOutcome::Succeeded));
        assert_eq!(succeeded.level, NotificationLevel::Info);
        assert_eq!(succeeded.title, "[sluice] api updated 1.0.0 -> 1.1.0");
        assert!(succeeded.body.contains("Advisory: 2 vulnerability findings"));
        assert_eq!(
            succeeded.kind,
            NotificationKind::Attempt {
                service: "api".to_string()
            }
        );

        let failed = Notification::for_attempt(&record(AttemptOutcome::RollbackFailed {
            reason: "health check failed".to_string(),
            error: "unreachable".to_string(),
        }));
        assert_eq!(failed.level, NotificationLevel::Critical);
        assert_eq!(failed.title, "[sluice] api: RollbackFailed");
        assert!(failed.body.contains("manual intervention required"));
    }

    #[tokio::test]
    async fn delivers_to_every_channel_in_order() {
        let first = RecordingChannel::default();
        let second = RecordingChannel::default();
        let (notifier, handle) = Notifier::spawn(vec![Box::new(first.clone()), Box::new(second.clone())], 8);

        notifier.notify(Notification::for_attempt(&record(AttemptOutcome::UpToDate)));
        notifier.notify(Notification::for_attempt(&record(AttemptOutcome::Succeeded)));
        drop(notifier);
        handle.shutdown(Duration::from_secs(5)).await;

        for channel in [first, second] {
            let titles: Vec<_> = channel.delivered().into_iter().map(|n| n.title).collect();
            assert_eq!(titles, vec!["[sluice] api: UpToDate", "[sluice] api updated 1.0.0 -> 1.1.0"]);
        }
    }

    #[tokio::test]
    async fn failing_channel_does_not_stop_others() {
        let broken = RecordingChannel::failing();
        let working = RecordingChannel::default();
        let (notifier, handle) = Notifier::spawn(vec![Box::new(broken), Box::new(working.clone())], 8);

        notifier.notify(Notification::for_attempt(&record(AttemptOutcome::Succeeded)));
        notifier.notify(Notification::for_attempt(&record(AttemptOutcome::Succeeded)));
        drop(notifier);
        handle.shutdown(Duration::from_secs(5)).await;

        assert_eq!(working.delivered().len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn full_queue_drops_instead_of_blocking() {
        let channel = RecordingChannel::default();
        let (notifier, handle) = Notifier::spawn(vec![Box::new(channel.clone())], 1);

        // The worker cannot run until this task yields, so only the first fits in the queue.
        for _ in 0..5 {
            notifier.notify(Notification::for_attempt(&record(AttemptOutcome::UpToDate)));
        }
        drop(notifier);
        handle.shutdown(Duration::from_secs(5)).await;

        assert_eq!(channel.delivered().len(), 1);
    }

    #[test]
    fn disabled_notifier_discards() {
        Notifier::disabled().notify(Notification::for_attempt(&record(AttemptOutcome::UpToDate)));
    }
}
