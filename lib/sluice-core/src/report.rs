//! Run reports.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sluice_error::{ErrorContext as _, GenericError};
use uuid::Uuid;

use crate::attempt::{AttemptOutcome, AttemptRecord};

/// Per-outcome counts for a run.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RunSummary {
    /// Services updated.
    pub succeeded: usize,

    /// Services already on the newest version.
    pub up_to_date: usize,

    /// Services reverted after a failed update.
    pub rolled_back: usize,

    /// Services whose rollback failed.
    pub rollback_failed: usize,

    /// Services that failed with rollback disabled.
    pub failed: usize,

    /// Services skipped before deploying.
    pub skipped: usize,

    /// Services held back by an unhealthy dependency.
    pub dependency_unhealthy: usize,

    /// Services that a dry run would have updated.
    pub planned: usize,

    /// Services never attempted because the run was aborted.
    pub not_attempted: usize,
}

impl RunSummary {
    /// Tallies the outcomes of the given attempts.
    pub fn tally(records: &[AttemptRecord], not_attempted: usize) -> Self {
        let mut summary = Self {
            not_attempted,
            ..Default::default()
        };
        for record in records {
            let counter = match record.outcome {
                AttemptOutcome::UpToDate => &mut summary.up_to_date,
                AttemptOutcome::Succeeded => &mut summary.succeeded,
                AttemptOutcome::RolledBack { .. } => &mut summary.rolled_back,
                AttemptOutcome::RollbackFailed { .. } => &mut summary.rollback_failed,
                AttemptOutcome::DependencyUnhealthy { .. } => &mut summary.dependency_unhealthy,
                AttemptOutcome::Failed { .. } => &mut summary.failed,
                AttemptOutcome::Skipped { .. } => &mut summary.skipped,
                AttemptOutcome::Planned { .. } => &mut summary.planned,
            };
            *counter += 1;
        }
        summary
    }

    /// Returns `true` if no service ended in a state that needs attention.
    ///
    /// Rollbacks count as success: the fleet was left in a known-good state.
    pub fn is_success(&self) -> bool {
        self.rollback_failed == 0
            && self.failed == 0
            && self.skipped == 0
            && self.dependency_unhealthy == 0
            && self.not_attempted == 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} up to date, {} rolled back, {} rollback failed, {} failed, {} skipped, {} dependency unhealthy",
            self.succeeded,
            self.up_to_date,
            self.rolled_back,
            self.rollback_failed,
            self.failed,
            self.skipped,
            self.dependency_unhealthy
        )?;
        if self.planned > 0 {
            write!(f, ", {} planned", self.planned)?;
        }
        if self.not_attempted > 0 {
            write!(f, ", {} not attempted", self.not_attempted)?;
        }
        Ok(())
    }
}

/// The record of a whole run.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    /// Unique, time-ordered run identifier.
    pub run_id: Uuid,

    /// When the run began.
    pub started_at: DateTime<Utc>,

    /// When the run ended.
    pub finished_at: DateTime<Utc>,

    /// Deployment backend used.
    pub backend: String,

    /// Whether this was a dry run.
    pub dry_run: bool,

    /// Attempt records, in plan order.
    pub services: Vec<AttemptRecord>,

    /// Planned services that were never attempted.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub not_attempted: Vec<String>,

    /// Outcome counts.
    pub summary: RunSummary,
}

impl RunReport {
    /// Creates a report from the attempts of a finished run.
    pub fn new(
        started_at: DateTime<Utc>, backend: &str, dry_run: bool, services: Vec<AttemptRecord>,
        not_attempted: Vec<String>,
    ) -> Self {
        let summary = RunSummary::tally(&services, not_attempted.len());
        Self {
            run_id: Uuid::now_v7(),
            started_at,
            finished_at: Utc::now(),
            backend: backend.to_string(),
            dry_run,
            services,
            not_attempted,
            summary,
        }
    }

    /// Returns `true` if the run left nothing needing attention.
    pub fn is_success(&self) -> bool {
        self.summary.is_success()
    }

    /// Returns the record for the given service, if it was attempted.
    pub fn record(&self, service: &str) -> Option<&AttemptRecord> {
        self.services.iter().find(|r| r.service == service)
    }

    /// Writes the report as JSON into `dir`, creating it if necessary, and returns the path written.
    ///
    /// # Errors
    ///
    /// If the directory cannot be created or the file cannot be written, an error is returned.
    pub async fn write_to(&self, dir: &Path) -> Result<PathBuf, GenericError> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_error_context(|| format!("Failed to create report directory '{}'.", dir.display()))?;

        let path = dir.join(format!("{}.json", self.run_id));
        let encoded = serde_json::to_vec_pretty(self).error_context("Failed to encode run report.")?;
        tokio::fs::write(&path, encoded)
            .await
            .with_error_context(|| format!("Failed to write run report '{}'.", path.display()))?;

        Ok(path)
    }
}
