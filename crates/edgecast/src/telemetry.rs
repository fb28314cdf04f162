//! Logging setup.
//!
//! `RUST_LOG` wins when set; otherwise the configured log level applies to
//! every crate, with edgecast itself at debug when the level is left at the
//! default.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_FILTER: &str = "info,edgecast=debug";

pub fn init(log_level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(log_level)));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()?;

    Ok(())
}

fn filter_directives(log_level: &str) -> String {
    let log_level = log_level.trim();
    if log_level.is_empty() || log_level == "info" {
        return DEFAULT_FILTER.to_string();
    }
    match EnvFilter::try_new(log_level) {
        Ok(_) => log_level.to_string(),
        Err(e) => {
            eprintln!("Invalid log level {:?} ({}), using {}", log_level, e, DEFAULT_FILTER);
            DEFAULT_FILTER.to_string()
        }
    }
}
