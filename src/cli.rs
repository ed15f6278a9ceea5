// src/cli.rs

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "hpctest",
    version,
    about = "Run regression and performance tests across cluster partitions and environments."
)]
pub struct CliArgs {
    /// Test suite description (TOML). Relative paths inside it resolve
    /// against its directory.
    #[arg(short, long, value_name = "PATH", default_value = "hpctest.toml")]
    pub config: String,

    /// Cap on concurrently admitted test cases; replaces `[config].max_jobs`.
    #[arg(short = 'j', long, value_name = "N")]
    pub max_jobs: Option<usize>,

    /// Verbosity. Without it, `HPCTEST_LOG` directives apply, then `info`.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Also write per-test results as JSON.
    #[arg(long, value_name = "PATH")]
    pub report: Option<String>,

    /// Expand and order the test cases, print them, and exit.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_flags_and_defaults() {
        let args = CliArgs::try_parse_from(["hpctest", "-j", "4", "--log-level", "debug"])
            .expect("parse");
        assert_eq!(args.config, "hpctest.toml");
        assert_eq!(args.max_jobs, Some(4));
        assert_eq!(args.log_level, Some(LogLevel::Debug));
        assert!(!args.dry_run);
        assert!(args.report.is_none());
    }

    #[test]
    fn rejects_unknown_level() {
        assert!(CliArgs::try_parse_from(["hpctest", "--log-level", "loud"]).is_err());
    }
}
