//! Process bootstrap primitives.
//!
//! Everything a sluice binary needs to set up before doing real work: currently, logging.
#![deny(missing_docs)]

pub mod logging;

/// Common imports.
pub mod prelude {
    pub use super::logging::{fatal_and_exit, initialize_logging, LoggingConfiguration, LoggingGuard};
}
