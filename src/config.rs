use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{domain::DomainError, tally::QuorumSpec};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "consentd",
    about = "Document access consent service",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the consent HTTP server (default).
    Run,

    /// Validate the directory file and quorum defaults, then exit.
    CheckConfig,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "CONSENTD_BIND",
        value_name = "ADDR",
        default_value = "127.0.0.1:62480"
    )]
    pub bind: SocketAddr,

    #[arg(
        long,
        global = true,
        env = "CONSENTD_DATA_DIR",
        value_name = "PATH",
        default_value = "./data"
    )]
    pub data_dir: PathBuf,

    #[arg(
        long = "directory-file",
        global = true,
        env = "CONSENTD_DIRECTORY_FILE",
        value_name = "PATH"
    )]
    pub directory_file: Option<PathBuf>,

    #[arg(
        long = "access-window-secs",
        global = true,
        env = "CONSENTD_ACCESS_WINDOW_SECS",
        value_name = "SECS",
        default_value_t = 7 * 24 * 60 * 60,
        value_parser = clap::value_parser!(u64).range(60..=31_536_000)
    )]
    pub access_window_secs: u64,

    #[arg(
        long = "expiry-sweep-interval-secs",
        global = true,
        env = "CONSENTD_EXPIRY_SWEEP_INTERVAL_SECS",
        value_name = "SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..=3600)
    )]
    pub expiry_sweep_interval_secs: u64,

    #[arg(
        long = "consensus-nodes",
        global = true,
        env = "CONSENTD_CONSENSUS_NODES",
        value_name = "IDS",
        value_delimiter = ',',
        default_value = "validator-1,validator-2,validator-3"
    )]
    pub consensus_nodes: Vec<String>,

    #[arg(
        long = "required-confirmations",
        global = true,
        env = "CONSENTD_REQUIRED_CONFIRMATIONS",
        value_name = "N",
        default_value_t = 2,
        value_parser = clap::value_parser!(u64).range(1..=64)
    )]
    pub required_confirmations: u64,

    #[arg(
        long = "simulate-validators",
        global = true,
        env = "CONSENTD_SIMULATE_VALIDATORS",
        value_name = "BOOL",
        default_value_t = false,
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub simulate_validators: bool,

    #[arg(
        long = "simulated-vote-delay-ms",
        global = true,
        env = "CONSENTD_SIMULATED_VOTE_DELAY_MS",
        value_name = "MS",
        default_value_t = 1500,
        value_parser = clap::value_parser!(u64).range(0..=60_000)
    )]
    pub simulated_vote_delay_ms: u64,
}

impl Config {
    pub fn quorum_defaults(&self) -> Result<QuorumSpec, DomainError> {
        let quorum = QuorumSpec {
            nodes: self
                .consensus_nodes
                .iter()
                .map(|n| n.trim().to_string())
                .collect(),
            required_confirmations: self.required_confirmations as usize,
        };
        quorum.validate()?;
        Ok(quorum)
    }

    pub fn access_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.access_window_secs as i64)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_interval_secs)
    }

    pub fn simulated_vote_delay(&self) -> Duration {
        Duration::from_millis(self.simulated_vote_delay_ms)
    }
}
