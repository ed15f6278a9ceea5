// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod job;
pub mod logging;
pub mod pipeline;
pub mod types;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::loader::load_and_validate;
use crate::config::model::ConfigFile;
use crate::engine::{control_channel, ExecutionContext, ExecutionPlan, RunReport, Runtime};
use crate::job::Backends;

/// Load the suite named by `args`, run it to completion and print the
/// summary. Config and graph errors (cycles included) surface before any
/// stage directory is created. Ctrl-C aborts the run: in-flight jobs are
/// cancelled and cleaned up, pending cases are marked aborted.
///
/// Returns `None` for `--dry-run`.
pub async fn run(args: CliArgs) -> Result<Option<RunReport>> {
    let config_path = PathBuf::from(&args.config);
    let mut cfg = load_and_validate(&config_path)?;
    rebase_paths(&mut cfg, &config_root_dir(&config_path));

    if let Some(max_jobs) = args.max_jobs {
        if max_jobs == 0 {
            anyhow::bail!("--max-jobs must be >= 1");
        }
        cfg.engine.max_jobs = max_jobs;
    }

    let plan = ExecutionPlan::from_config(&cfg)?;

    if args.dry_run {
        print_dry_run(&cfg, &plan);
        return Ok(None);
    }

    let backends = Backends::from_config(&cfg);
    debug!(?backends, "job backends ready");
    let ctx = ExecutionContext::from_config(&cfg, backends);

    let (control, receiver) = control_channel();

    // Ctrl-C → global abort; in-flight jobs are cancelled and cleaned up.
    {
        let control = control.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            info!("Ctrl+C received; aborting");
            control.request_abort();
        });
    }

    info!(
        test_cases = plan.len(),
        max_jobs = cfg.engine.max_jobs,
        "starting hpctest run"
    );
    let runtime = Runtime::new(plan, ctx, receiver)?;
    let report = runtime.run().await?;

    print!("{}", report.render_summary());

    if let Some(path) = &args.report {
        report
            .write_json(Path::new(path))
            .with_context(|| format!("writing --report {path}"))?;
        info!(path = %path, "wrote run report");
    }

    Ok(Some(report))
}

/// Directory containing the config file; relative paths in the config are
/// taken relative to it.
fn config_root_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn rebase_paths(cfg: &mut ConfigFile, root: &Path) {
    let rebase = |p: &mut PathBuf| {
        if p.is_relative() {
            *p = root.join(&*p);
        }
    };
    rebase(&mut cfg.engine.stage_prefix);
    rebase(&mut cfg.engine.output_prefix);
    for test in cfg.test.iter_mut() {
        if let Some(src) = test.sources.as_mut() {
            rebase(src);
        }
    }
}

/// Print the expanded test cases and the order they would run in.
fn print_dry_run(cfg: &ConfigFile, plan: &ExecutionPlan) {
    println!("hpctest dry-run");
    println!("  config.max_jobs = {}", cfg.engine.max_jobs);
    for (name, limit) in cfg.engine.partition_limits.iter() {
        println!("  partition.{name}.max_jobs = {limit}");
    }
    println!("  config.max_retries = {}", cfg.engine.max_retries);
    println!();
    print!("{}", plan.describe());

    debug!("dry-run complete (no execution)");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_root_dir_defaults_to_cwd() {
        assert_eq!(config_root_dir(Path::new("hpctest.toml")), PathBuf::from("."));
        assert_eq!(
            config_root_dir(Path::new("/etc/hpctest/site.toml")),
            PathBuf::from("/etc/hpctest")
        );
    }
}
