// src/logging.rs

//! `tracing` subscriber for the binary.
//!
//! The filter comes from, in order: `--log-level`, the `HPCTEST_LOG`
//! environment variable (full `EnvFilter` syntax, e.g.
//! `hpctest::job=debug,info`), or `info`. Output goes to stderr; stdout
//! carries the run summary.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::cli::LogLevel;

pub const LOG_ENV: &str = "HPCTEST_LOG";

pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let filter = build_filter(cli_level, std::env::var(LOG_ENV).ok().as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("installing tracing subscriber: {e}"))
}

fn build_filter(cli_level: Option<LogLevel>, env: Option<&str>) -> Result<EnvFilter> {
    if let Some(level) = cli_level {
        return Ok(EnvFilter::new(level.as_directive()));
    }
    match env.map(str::trim).filter(|s| !s.is_empty()) {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("invalid {LOG_ENV} value '{directives}'")),
        None => Ok(EnvFilter::new("info")),
    }
}

impl LogLevel {
    fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_wins_over_environment() {
        let filter = build_filter(Some(LogLevel::Debug), Some("error")).expect("filter");
        assert!(filter.to_string().contains("debug"), "{filter}");
        assert!(!filter.to_string().contains("error"), "{filter}");
    }

    #[test]
    fn environment_accepts_directives() {
        let filter = build_filter(None, Some("hpctest::job=trace,warn")).expect("filter");
        assert!(filter.to_string().contains("hpctest::job=trace"), "{filter}");
        assert!(build_filter(None, Some("  ")).expect("filter").to_string().contains("info"));
        assert!(build_filter(None, None).expect("filter").to_string().contains("info"));
        assert!(build_filter(None, Some("hpctest=[")).is_err());
    }
}
