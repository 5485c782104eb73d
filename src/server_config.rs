//! Server configuration.
//!
//! Settings are layered: `terrapin.toml` → environment → CLI flags.
//!
//! ```toml
//! [server]
//! data_dir = "/var/lib/terrapin"
//! repo_config_file = "terrapin.yaml"
//! require_declared_projects = false
//! checkout_strategy = "merge"
//!
//! [execution]
//! max_parallel = 4
//! step_timeout_secs = 3600
//! terraform_bin = "terraform"
//! policy_bin = "conftest"
//! policy_checks = true
//! store_retries = 3
//!
//! [execution.env]
//! TF_IN_AUTOMATION = "1"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::runtime::RunnerSettings;
use crate::workspace::CheckoutStrategy;

pub const CONFIG_FILE_NAME: &str = "terrapin.toml";
const LOCK_DB_FILE: &str = "locks.db";

fn default_repo_config_file() -> String {
    "terrapin.yaml".to_string()
}

fn default_max_parallel() -> usize {
    4
}

fn default_step_timeout_secs() -> u64 {
    3600
}

fn default_terraform_bin() -> String {
    "terraform".to_string()
}

fn default_policy_bin() -> String {
    "conftest".to_string()
}

fn default_store_retries() -> u32 {
    3
}

/// Default data directory: `~/.terrapin`.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".terrapin"))
        .unwrap_or_else(|| PathBuf::from(".terrapin"))
}

/// `[server]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Root for checkouts and the lock database
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Repo config file name, relative to the checkout root
    #[serde(default = "default_repo_config_file")]
    pub repo_config_file: String,
    /// Explicit commands must target a declared project
    #[serde(default)]
    pub require_declared_projects: bool,
    #[serde(default)]
    pub checkout_strategy: CheckoutStrategy,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            data_dir: None,
            repo_config_file: default_repo_config_file(),
            require_declared_projects: false,
            checkout_strategy: CheckoutStrategy::default(),
        }
    }
}

/// `[execution]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSection {
    /// Projects executed concurrently within one command
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Per-process timeout
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    #[serde(default = "default_terraform_bin")]
    pub terraform_bin: String,
    #[serde(default = "default_policy_bin")]
    pub policy_bin: String,
    /// Run the policy_check stage after each successful plan
    #[serde(default)]
    pub policy_checks: bool,
    /// Retries for transient lock store errors
    #[serde(default = "default_store_retries")]
    pub store_retries: u32,
    /// Extra environment for every step
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            step_timeout_secs: default_step_timeout_secs(),
            terraform_bin: default_terraform_bin(),
            policy_bin: default_policy_bin(),
            policy_checks: false,
            store_retries: default_store_retries(),
            env: BTreeMap::new(),
        }
    }
}

/// Contents of `terrapin.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub execution: ExecutionSection,
}

impl ServerToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse terrapin.toml")
    }

    /// Returns the default configuration if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `TERRAPIN_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("TERRAPIN_DATA_DIR").filter(|v| !v.is_empty()) {
            self.server.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(bin) = lookup("TERRAPIN_TERRAFORM_BIN").filter(|v| !v.is_empty()) {
            self.execution.terraform_bin = bin;
        }
        if let Some(raw) = lookup("TERRAPIN_MAX_PARALLEL").filter(|v| !v.is_empty()) {
            self.execution.max_parallel = raw
                .parse()
                .with_context(|| format!("Invalid TERRAPIN_MAX_PARALLEL '{}'", raw))?;
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.execution.max_parallel == 0 {
            warnings.push(
                "execution.max_parallel is 0; projects will run one at a time".to_string(),
            );
        }
        if self.execution.step_timeout_secs == 0 {
            warnings.push(
                "execution.step_timeout_secs is 0; every step will time out immediately"
                    .to_string(),
            );
        }
        if self.execution.terraform_bin.trim().is_empty() {
            warnings.push("execution.terraform_bin is empty".to_string());
        }
        if self.execution.policy_checks && self.execution.policy_bin.trim().is_empty() {
            warnings.push("policy checks are enabled but execution.policy_bin is empty".to_string());
        }
        if self.server.repo_config_file.contains("..") {
            warnings.push(format!(
                "server.repo_config_file '{}' points outside the checkout",
                self.server.repo_config_file
            ));
        }

        warnings
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub max_parallel: Option<usize>,
}

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    pub toml: ServerToml,
}

impl ServerConfig {
    /// Resolve file → environment → CLI.
    pub fn resolve(cli: &CliOverrides) -> Result<Self> {
        Self::resolve_with(cli, |key| std::env::var(key).ok())
    }

    pub fn resolve_with<F>(cli: &CliOverrides, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // The config file lives in the data dir unless named explicitly, so the
        // data dir has to be known before the file is read.
        let bootstrap_dir = cli
            .data_dir
            .clone()
            .or_else(|| lookup("TERRAPIN_DATA_DIR").filter(|v| !v.is_empty()).map(PathBuf::from))
            .unwrap_or_else(default_data_dir);
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| bootstrap_dir.join(CONFIG_FILE_NAME));

        let mut toml = if cli.config.is_some() {
            ServerToml::load(&config_path)?
        } else {
            ServerToml::load_or_default(&config_path)?
        };
        toml.apply_env(&lookup)?;

        if let Some(dir) = &cli.data_dir {
            toml.server.data_dir = Some(dir.clone());
        }
        if let Some(n) = cli.max_parallel {
            toml.execution.max_parallel = n;
        }

        let data_dir = toml
            .server
            .data_dir
            .clone()
            .unwrap_or_else(|| bootstrap_dir.clone());

        Ok(Self {
            data_dir,
            config_path,
            toml,
        })
    }

    pub fn from_toml(data_dir: PathBuf, toml: ServerToml) -> Self {
        Self {
            config_path: data_dir.join(CONFIG_FILE_NAME),
            data_dir,
            toml,
        }
    }

    pub fn lock_db_path(&self) -> PathBuf {
        self.data_dir.join(LOCK_DB_FILE)
    }

    pub fn repo_config_file(&self) -> &str {
        &self.toml.server.repo_config_file
    }

    /// Worker pool size; at least one.
    pub fn max_parallel(&self) -> usize {
        self.toml.execution.max_parallel.max(1)
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        let exec = &self.toml.execution;
        RunnerSettings {
            terraform_bin: exec.terraform_bin.clone(),
            policy_bin: exec.policy_bin.clone(),
            step_timeout: Duration::from_secs(exec.step_timeout_secs),
            env: exec.env.clone(),
            policy_checks: exec.policy_checks,
        }
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
