//! Rolling-update orchestration for fleets of interdependent services.
//!
//! A run acquires the [`lock::RunLockGuard`], loads the [`registry::ServiceRegistry`], orders its services with the
//! [`planner::UpdatePlan`], and drives each one through the [`attempt`] state machine against a
//! [`driver::DeploymentDriver`]. Failed updates are reverted by the [`rollback::RollbackController`], and every
//! terminal outcome is handed to the [`notify::Notifier`].
#![deny(missing_docs)]

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::Instrument as _;

pub mod attempt;
pub mod config;
pub mod driver;
pub mod gate;
pub mod health;
pub mod lock;
pub mod notify;
pub mod orchestrator;
pub mod planner;
pub mod registry;
pub mod report;
pub mod resolver;
pub mod rollback;
pub mod wait;

#[cfg(test)]
pub(crate) mod test_util;

/// Spawns a new named asynchronous task, attached to the current `tracing` span.
pub fn spawn_traced_named<F, N>(name: N, f: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    N: AsRef<str>,
{
    let span = tracing::debug_span!("task", name = name.as_ref());
    tokio::spawn(f.instrument(span))
}
