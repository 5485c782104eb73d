//! Event execution: `terrapin run` and `terrapin close`.

use anyhow::{Context, Result};
use std::io::Read;
use std::path::Path;

use terrapin::models::{CommandEvent, Repo};
use terrapin::orchestrator::CommandOrchestrator;
use terrapin::server_config::ServerConfig;

use super::super::Cli;
use super::print_json;

fn read_event(path: &Path) -> Result<CommandEvent> {
    let content = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read event from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read event file: {}", path.display()))?
    };
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse event: {}", path.display()))
}

fn open_orchestrator(cli: &Cli) -> Result<CommandOrchestrator> {
    let config = ServerConfig::resolve(&cli.overrides())?;
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data dir: {}", config.data_dir.display()))?;
    let orchestrator = CommandOrchestrator::open(&config)
        .with_context(|| format!("Failed to open lock store: {}", config.lock_db_path().display()))?;
    Ok(orchestrator)
}

pub async fn cmd_run(cli: &Cli, event_path: &Path) -> Result<()> {
    let event = read_event(event_path)?;
    let orchestrator = open_orchestrator(cli)?;

    let result = orchestrator.execute(&event).await;
    print_json(&result)?;
    if result.has_errors() {
        anyhow::bail!(
            "{} on pull request #{} finished with errors",
            result.command,
            result.pull
        );
    }
    Ok(())
}

pub async fn cmd_close(cli: &Cli, repo: &str, pull: u64) -> Result<()> {
    let orchestrator = open_orchestrator(cli)?;
    let repo = Repo {
        full_name: repo.to_string(),
        clone_url: String::new(),
    };

    let result = orchestrator.close_pull_request(&repo, pull).await;
    print_json(&result)?;
    if let Some(error) = &result.error {
        anyhow::bail!("Failed to close pull request #{}: {}", pull, error);
    }
    Ok(())
}
