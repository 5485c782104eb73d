//! Lock inspection: `terrapin locks`.

use anyhow::{Context, Result};
use std::sync::Arc;

use terrapin::locking::{ProjectLocker, SqliteLockStore};
use terrapin::models::ProjectIdentity;
use terrapin::server_config::ServerConfig;

use super::super::{Cli, LocksCommands};
use super::print_json;

pub async fn cmd_locks(cli: &Cli, command: LocksCommands) -> Result<()> {
    let config = ServerConfig::resolve(&cli.overrides())?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data dir: {}", config.data_dir.display()))?;
    let store = SqliteLockStore::open(&config.lock_db_path())
        .with_context(|| format!("Failed to open lock store: {}", config.lock_db_path().display()))?;
    let locker = ProjectLocker::new(Arc::new(store)).with_retries(config.toml.execution.store_retries);

    match command {
        LocksCommands::List => {
            let locks = locker.list().await.context("Failed to list locks")?;
            print_json(&locks)?;
        }
        LocksCommands::Unlock {
            repo,
            dir,
            workspace,
        } => {
            let identity = ProjectIdentity::new(&repo, &dir, &workspace);
            let released = locker
                .unlock(&identity)
                .await
                .with_context(|| format!("Failed to unlock {}", identity))?;
            match released {
                Some(lock) => {
                    tracing::info!(lock_key = %identity, pull = lock.pull_num, "Lock released");
                    print_json(&lock)?;
                }
                None => anyhow::bail!("No lock held for {}", identity),
            }
        }
    }
    Ok(())
}
