use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use sluice_core::registry::UpdateStrategy;
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(about, version)]
pub struct Cli {
    /// Enable verbose output. (Specify twice for more verbosity.)
    #[arg(global = true, short = 'v', long, action = ArgAction::Count, default_value_t = 0)]
    verbose: u8,

    /// Path to the orchestrator configuration file.
    ///
    /// A missing file is not an error: every setting has a default, and any setting can also be given as an
    /// environment variable prefixed with `SLUICE_`.
    #[arg(global = true, short = 'c', long, default_value = "/etc/sluice/sluice.yaml")]
    pub config: PathBuf,

    /// Subcommand to run.
    #[command(subcommand)]
    pub action: Action,
}

impl Cli {
    /// Gets the log level requested on the command line, if verbosity was raised.
    pub fn log_level_override(&self) -> Option<LevelFilter> {
        match self.verbose {
            0 => None,
            1 => Some(LevelFilter::DEBUG),
            _ => Some(LevelFilter::TRACE),
        }
    }
}

#[derive(Subcommand)]
pub enum Action {
    /// Update services to their newest acceptable versions, in dependency order.
    Update(UpdateConfig),

    /// Show recorded version, backend state, and health for every service.
    Status,

    /// List services with a newer version available. Exits with 1 if any are pending.
    Check,

    /// Revert a service to the version recorded in the registry.
    Rollback(RollbackConfig),

    /// Print the effective configuration.
    Config,
}

/// Update strategy, as accepted on the command line.
#[derive(Clone, Copy, ValueEnum)]
pub enum StrategyArg {
    /// Replace instances incrementally.
    Rolling,

    /// Stand up a complete parallel deployment before retiring the old one.
    #[value(alias = "blue_green")]
    BlueGreen,
}

impl From<StrategyArg> for UpdateStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::Rolling => Self::Rolling,
            StrategyArg::BlueGreen => Self::BlueGreen,
        }
    }
}

/// Update configuration.
#[derive(Args, Clone)]
pub struct UpdateConfig {
    /// Only update this service.
    ///
    /// Its dependencies are not updated, but must still be healthy.
    pub service: Option<String>,

    /// Proceed even if the vulnerability scan reports findings.
    #[arg(short = 'f', long)]
    pub force: bool,

    /// Update strategy to use for every service, overriding the registry.
    #[arg(short = 's', long, value_enum)]
    pub strategy: Option<StrategyArg>,

    /// Health check timeout, in seconds.
    #[arg(short = 't', long = "timeout", value_name = "SECONDS")]
    pub timeout_secs: Option<u64>,

    /// Resolve and plan, but do not change anything.
    #[arg(short = 'n', long)]
    pub dry_run: bool,
}

/// Rollback configuration.
#[derive(Args, Clone)]
pub struct RollbackConfig {
    /// Service to roll back.
    pub service: String,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;

    use super::*;

    #[test]
    fn command_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn update_flags() {
        let cli = Cli::parse_from([
            "sluice",
            "-vv",
            "update",
            "web",
            "--force",
            "--strategy",
            "blue-green",
            "--timeout",
            "30",
            "--dry-run",
        ]);

        assert_eq!(cli.log_level_override(), Some(LevelFilter::TRACE));
        assert_eq!(cli.config, PathBuf::from("/etc/sluice/sluice.yaml"));
        let Action::Update(update) = cli.action else {
            panic!("expected update action");
        };
        assert_eq!(update.service.as_deref(), Some("web"));
        assert!(update.force);
        assert!(update.dry_run);
        assert_eq!(update.timeout_secs, Some(30));
        assert_eq!(update.strategy.map(UpdateStrategy::from), Some(UpdateStrategy::BlueGreen));
    }

    #[test]
    fn strategy_alias() {
        let cli = Cli::parse_from(["sluice", "update", "--strategy", "blue_green"]);
        let Action::Update(update) = cli.action else {
            panic!("expected update action");
        };
        assert_eq!(update.service, None);
        assert_eq!(update.strategy.map(UpdateStrategy::from), Some(UpdateStrategy::BlueGreen));
    }

    #[test]
    fn rollback_requires_a_service() {
        assert!(Cli::try_parse_from(["sluice", "rollback"]).is_err());

        let cli = Cli::parse_from(["sluice", "rollback", "db", "--config", "/tmp/sluice.yaml"]);
        assert_eq!(cli.config, PathBuf::from("/tmp/sluice.yaml"));
        assert_eq!(cli.log_level_override(), None);
        assert!(matches!(cli.action, Action::Rollback(RollbackConfig { service }) if service == "db"));
    }
}
