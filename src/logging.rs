//! Process-wide tracing setup.
//!
//! Filter comes from `TERRAPIN_LOG`, then `RUST_LOG`, then the `--verbose`
//! default. Output goes to stderr so command results on stdout stay parseable.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "TERRAPIN_LOG";

#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions {
    pub verbose: bool,
    pub json: bool,
}

fn default_directive(verbose: bool) -> &'static str {
    if verbose { "terrapin=debug,info" } else { "info" }
}

/// Build the filter from the first non-empty directive source.
pub fn filter_from<F>(lookup: F, verbose: bool) -> EnvFilter
where
    F: Fn(&str) -> Option<String>,
{
    let directive = lookup(LOG_ENV)
        .or_else(|| lookup("RUST_LOG"))
        .filter(|d| !d.trim().is_empty());
    match directive {
        Some(d) => EnvFilter::try_new(&d).unwrap_or_else(|_| EnvFilter::new(default_directive(verbose))),
        None => EnvFilter::new(default_directive(verbose)),
    }
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(options: LogOptions) {
    let filter = filter_from(|k| std::env::var(k).ok(), options.verbose);
    let registry = tracing_subscriber::registry().with(filter);
    let result = if options.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
