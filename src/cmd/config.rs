//! Configuration view and validation: `terrapin config`.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use terrapin::repo_config::RepoConfig;
use terrapin::server_config::{ServerConfig, ServerToml};

use super::super::{Cli, ConfigCommands};
use super::print_json;

#[derive(Serialize)]
struct ConfigView<'a> {
    config_path: &'a Path,
    config_file_exists: bool,
    data_dir: &'a Path,
    lock_db: PathBuf,
    settings: &'a ServerToml,
    #[serde(skip_serializing_if = "Option::is_none")]
    repo_config: Option<RepoConfig>,
}

fn load_repo_config(path: &Path) -> Result<RepoConfig> {
    RepoConfig::load(path).with_context(|| format!("Invalid repo config: {}", path.display()))
}

pub fn cmd_config(cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    let config = ServerConfig::resolve(&cli.overrides())?;

    match command {
        None => show(&config, None),
        Some(ConfigCommands::Show { repo_config }) => show(&config, repo_config.as_deref()),
        Some(ConfigCommands::Validate { repo_config }) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Server config OK ({})", config.config_path.display());
            } else {
                println!("Server config warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }

            if let Some(path) = repo_config {
                let repo = load_repo_config(&path)?;
                println!(
                    "Repo config OK ({}): {} project(s), {} workflow(s)",
                    path.display(),
                    repo.projects.len(),
                    repo.workflows.len()
                );
            }
            Ok(())
        }
    }
}

fn show(config: &ServerConfig, repo_config: Option<&Path>) -> Result<()> {
    let repo_config = repo_config.map(load_repo_config).transpose()?;
    print_json(&ConfigView {
        config_path: &config.config_path,
        config_file_exists: config.config_path.exists(),
        data_dir: &config.data_dir,
        lock_db: config.lock_db_path(),
        settings: &config.toml,
        repo_config,
    })
}
