//! netsplit - network partition drills
//!
//! Deploys a long-running workload on a scheduler instance, cuts the hosts
//! running the scheduler and the workload off the network, heals them and
//! checks that the workload's task survived with the same identity.

#![forbid(unsafe_code)]

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use netsplit_common::{DrillConfig, LogConfig, init_logging};
use tracing::debug;

#[derive(Parser)]
#[command(name = "netsplit")]
#[command(author, version, about = "Network partition drills against a Marathon scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.config/netsplit/config.toml when present)
    #[arg(short, long, global = true, env = "NETSPLIT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full partition drill, always tearing down afterwards
    Run {
        /// Restart the leading master process while agents are partitioned
        #[arg(long)]
        bounce_master: bool,

        /// Write the scenario report as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Check that the cluster has enough private agents for a drill
    Preflight,

    /// Cut hosts off the network (loopback and SSH stay open)
    Partition {
        /// Agent addresses
        #[arg(required = true)]
        hosts: Vec<String>,
    },

    /// Restore full connectivity on hosts
    Heal {
        /// Agent addresses
        #[arg(required = true)]
        hosts: Vec<String>,
    },

    /// Restart the leading master process
    RestartMaster,

    /// Remove everything a drill may have left behind
    Teardown,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    let config = DrillConfig::load(cli.config.as_deref())?;
    debug!(endpoint = ?config.endpoint(), sources = ?config.sources(), "Configuration loaded");

    match cli.command {
        Commands::Run {
            bounce_master,
            report,
        } => commands::run(&config, bounce_master, report.as_deref()).await,
        Commands::Preflight => commands::preflight(&config).await,
        Commands::Partition { hosts } => commands::partition(&config, &hosts).await,
        Commands::Heal { hosts } => commands::heal(&config, &hosts).await,
        Commands::RestartMaster => commands::restart_master(&config).await,
        Commands::Teardown => commands::teardown(&config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags() {
        let cli = Cli::try_parse_from([
            "netsplit",
            "-v",
            "run",
            "--bounce-master",
            "--report",
            "out/report.json",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run {
                bounce_master,
                report,
            } => {
                assert!(bounce_master);
                assert_eq!(report, Some(PathBuf::from("out/report.json")));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_partition_requires_hosts() {
        assert!(Cli::try_parse_from(["netsplit", "partition"]).is_err());

        let cli = Cli::try_parse_from([
            "netsplit",
            "--config",
            "drill.toml",
            "heal",
            "10.0.1.20",
            "10.0.1.21",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("drill.toml")));
        match cli.command {
            Commands::Heal { hosts } => assert_eq!(hosts, vec!["10.0.1.20", "10.0.1.21"]),
            _ => panic!("expected heal"),
        }
    }

    #[test]
    fn test_restart_master_subcommand_name() {
        let cli = Cli::try_parse_from(["netsplit", "restart-master"]).unwrap();
        assert!(matches!(cli.command, Commands::RestartMaster));
    }
}
