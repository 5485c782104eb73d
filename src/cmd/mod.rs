//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `run`    | `Run`, `Close`   |
//! | `locks`  | `Locks`          |
//! | `config` | `Config`         |

pub mod config;
pub mod locks;
pub mod run;

pub use config::cmd_config;
pub use locks::cmd_locks;
pub use run::{cmd_close, cmd_run};

use anyhow::{Context, Result};
use serde::Serialize;

/// Print a result as pretty JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", rendered);
    Ok(())
}
