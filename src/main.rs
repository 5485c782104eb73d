use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use terrapin::logging::{self, LogOptions};
use terrapin::server_config::CliOverrides;

mod cmd;

#[derive(Parser)]
#[command(name = "terrapin")]
#[command(version, about = "Terraform pull request automation")]
pub struct Cli {
    /// Server config file (defaults to <data-dir>/terrapin.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding checkouts and the lock database
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Maximum number of projects executed concurrently
    #[arg(long, global = true)]
    pub max_parallel: Option<usize>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            config: self.config.clone(),
            data_dir: self.data_dir.clone(),
            max_parallel: self.max_parallel,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a command event read from a JSON file ("-" for stdin)
    Run {
        #[arg(long)]
        event: PathBuf,
    },
    /// Handle a closed pull request: release its locks and delete its checkouts
    Close {
        #[arg(long)]
        repo: String,
        #[arg(long)]
        pull: u64,
    },
    /// Inspect or release project locks
    Locks {
        #[command(subcommand)]
        command: LocksCommands,
    },
    /// Show or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum LocksCommands {
    List,
    /// Release a lock regardless of which pull request holds it
    Unlock {
        #[arg(long)]
        repo: String,
        #[arg(long, default_value = ".")]
        dir: String,
        #[arg(long, default_value = "default")]
        workspace: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    Show {
        /// Repo config file to load and print
        #[arg(long)]
        repo_config: Option<PathBuf>,
    },
    Validate {
        /// Repo config file to validate as well
        #[arg(long)]
        repo_config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(LogOptions {
        verbose: cli.verbose,
        json: cli.log_json,
    });

    match &cli.command {
        Commands::Run { event } => cmd::cmd_run(&cli, event).await?,
        Commands::Close { repo, pull } => cmd::cmd_close(&cli, repo, *pull).await?,
        Commands::Locks { command } => cmd::cmd_locks(&cli, command.clone()).await?,
        Commands::Config { command } => cmd::cmd_config(&cli, command.clone())?,
    }

    Ok(())
}
