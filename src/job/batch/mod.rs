// src/job/batch/mod.rs

//! Batch-queue backend.
//!
//! Jobs are written out as scheduler scripts, submitted with the scheduler's
//! submit tool and tracked by the job identifier parsed from its output.
//! Everything scheduler-specific (directives, commands, status codes) lives
//! behind the [`QueueDialect`] trait; see [`slurm`], [`pbs`] and [`lsf`].
//!
//! Polling is batched: the first `poll` after the cache expires queries the
//! status of every outstanding job in one command, and later polls within
//! `cache_ttl` are answered from that snapshot. A failing query is retried
//! `poll_retries` times before [`JobError::Transient`] is returned.

pub mod lsf;
pub mod pbs;
pub mod runner;
pub mod slurm;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::backend::{
    BackendFuture, JobBackend, JobCompletion, JobError, JobHandle, JobSpec, JobState,
};
use super::shell_quote;

pub use lsf::Lsf;
pub use pbs::Pbs;
pub use runner::{CommandOutput, CommandRequest, CommandRunner, SystemCommandRunner};
pub use slurm::Slurm;

/// Status of one job as reported by a scheduler query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub state: JobState,
    pub exit_code: Option<i32>,
}

/// Scheduler-specific knowledge: how to write, submit, query and cancel jobs.
pub trait QueueDialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Script directive lines (e.g. `#SBATCH --ntasks=4`).
    fn directives(&self, spec: &JobSpec) -> Vec<String>;

    fn submit_command(&self, script: &Path) -> CommandRequest;

    /// Extract the job identifier from the submit tool's stdout.
    fn parse_job_id(&self, stdout: &str) -> Option<String>;

    /// One command querying all the given jobs.
    fn query_command(&self, ids: &[String]) -> CommandRequest;

    /// Parse the query output. Jobs missing from the result keep their
    /// previous state (schedulers may not list very fresh jobs yet).
    fn parse_query(&self, stdout: &str) -> HashMap<String, QueueStatus>;

    fn cancel_command(&self, id: &str) -> CommandRequest;
}

/// Tuning knobs of the batch backend.
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    /// Extra attempts for a failing status query.
    pub poll_retries: u32,
    /// Pause between query attempts.
    pub retry_delay: Duration,
    /// How long a query snapshot answers `poll` calls.
    pub cache_ttl: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            poll_retries: 3,
            retry_delay: Duration::from_millis(500),
            cache_ttl: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TrackedJob {
    state: JobState,
    exit_code: Option<i32>,
}

#[derive(Debug, Default)]
struct BatchState {
    jobs: HashMap<String, TrackedJob>,
    last_query: Option<Instant>,
}

/// Backend submitting to a batch queue scheduler.
pub struct BatchQueueBackend {
    dialect: Box<dyn QueueDialect>,
    runner: Arc<dyn CommandRunner>,
    options: BatchOptions,
    state: Mutex<BatchState>,
}

impl std::fmt::Debug for BatchQueueBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchQueueBackend")
            .field("scheduler", &self.dialect.name())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl BatchQueueBackend {
    pub fn new(
        dialect: Box<dyn QueueDialect>,
        runner: Arc<dyn CommandRunner>,
        options: BatchOptions,
    ) -> Self {
        Self {
            dialect,
            runner,
            options,
            state: Mutex::new(BatchState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn submit_job(&self, spec: &JobSpec) -> Result<JobHandle, JobError> {
        let script = spec.workdir.join(format!("{}.job.sh", spec.name));
        tokio::fs::write(&script, render_script(self.dialect.as_ref(), spec)).await?;

        let request = self.dialect.submit_command(&script);
        let out = self.runner.run(&request).await.map_err(|e| {
            JobError::Submission(format!("running '{}': {e}", request.program))
        })?;

        if !out.success() {
            return Err(JobError::Submission(format!(
                "'{}' exited with {:?}: {}",
                request.program,
                out.code,
                out.stderr.trim()
            )));
        }

        let id = self.dialect.parse_job_id(&out.stdout).ok_or_else(|| {
            JobError::Submission(format!(
                "could not find a job id in '{}' output: {:?}",
                request.program,
                out.stdout.trim()
            ))
        })?;

        self.lock().jobs.insert(
            id.clone(),
            TrackedJob {
                state: JobState::Queued,
                exit_code: None,
            },
        );

        info!(
            scheduler = self.dialect.name(),
            job = %spec.name,
            job_id = %id,
            "submitted batch job"
        );

        Ok(JobHandle {
            id,
            name: spec.name.clone(),
            stdout: spec.stdout.clone(),
            stderr: spec.stderr.clone(),
        })
    }

    async fn poll_job(&self, id: &str) -> Result<JobState, JobError> {
        let outstanding = {
            let state = self.lock();
            let job = state
                .jobs
                .get(id)
                .ok_or_else(|| JobError::Query(format!("unknown batch job '{id}'")))?;

            if job.state.is_terminal() {
                return Ok(job.state);
            }

            let fresh = state
                .last_query
                .is_some_and(|t| t.elapsed() < self.options.cache_ttl);
            if fresh {
                return Ok(job.state);
            }

            let mut ids: Vec<String> = state
                .jobs
                .iter()
                .filter(|(_, j)| !j.state.is_terminal())
                .map(|(k, _)| k.clone())
                .collect();
            ids.sort();
            ids
        };

        let statuses = self.query_with_retries(&outstanding).await?;

        let mut state = self.lock();
        state.last_query = Some(Instant::now());
        for (job_id, status) in statuses {
            if let Some(job) = state.jobs.get_mut(&job_id) {
                if !job.state.is_terminal() && job.state != status.state {
                    debug!(
                        scheduler = self.dialect.name(),
                        job_id = %job_id,
                        from = ?job.state,
                        to = ?status.state,
                        "batch job changed state"
                    );
                    job.state = status.state;
                    job.exit_code = status.exit_code;
                }
            }
        }

        state
            .jobs
            .get(id)
            .map(|j| j.state)
            .ok_or_else(|| JobError::Query(format!("unknown batch job '{id}'")))
    }

    async fn query_with_retries(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, QueueStatus>, JobError> {
        let request = self.dialect.query_command(ids);
        let mut last_error = String::new();

        for attempt in 0..=self.options.poll_retries {
            match self.runner.run(&request).await {
                Ok(out) if out.success() => return Ok(self.dialect.parse_query(&out.stdout)),
                Ok(out) => {
                    last_error = format!(
                        "'{}' exited with {:?}: {}",
                        request.program,
                        out.code,
                        out.stderr.trim()
                    );
                }
                Err(e) => {
                    last_error = format!("running '{}': {e}", request.program);
                }
            }

            if attempt < self.options.poll_retries {
                warn!(
                    scheduler = self.dialect.name(),
                    attempt = attempt + 1,
                    error = %last_error,
                    "job status query failed; retrying"
                );
                tokio::time::sleep(self.options.retry_delay).await;
            }
        }

        Err(JobError::Transient(last_error))
    }

    async fn cancel_job(&self, id: &str) -> Result<(), JobError> {
        {
            let state = self.lock();
            match state.jobs.get(id) {
                None => return Ok(()),
                Some(job) if job.state.is_terminal() => return Ok(()),
                Some(_) => {}
            }
        }

        let request = self.dialect.cancel_command(id);
        let out = self
            .runner
            .run(&request)
            .await
            .map_err(|e| JobError::Cancel(format!("running '{}': {e}", request.program)))?;

        if !out.success() {
            return Err(JobError::Cancel(format!(
                "'{}' exited with {:?}: {}",
                request.program,
                out.code,
                out.stderr.trim()
            )));
        }

        if let Some(job) = self.lock().jobs.get_mut(id) {
            if !job.state.is_terminal() {
                job.state = JobState::Cancelled;
            }
        }

        info!(scheduler = self.dialect.name(), job_id = %id, "cancelled batch job");
        Ok(())
    }

    fn finalize_job(&self, handle: &JobHandle) -> Result<JobCompletion, JobError> {
        let job = self
            .lock()
            .jobs
            .remove(&handle.id)
            .ok_or_else(|| JobError::Query(format!("unknown batch job '{}'", handle.id)))?;

        Ok(JobCompletion {
            exit_code: job.exit_code,
            stdout: handle.stdout.clone(),
            stderr: handle.stderr.clone(),
        })
    }
}

impl JobBackend for BatchQueueBackend {
    fn name(&self) -> &str {
        self.dialect.name()
    }

    fn submit<'a>(&'a self, spec: &'a JobSpec) -> BackendFuture<'a, JobHandle> {
        Box::pin(self.submit_job(spec))
    }

    fn poll<'a>(&'a self, handle: &'a JobHandle) -> BackendFuture<'a, JobState> {
        Box::pin(self.poll_job(&handle.id))
    }

    fn cancel<'a>(&'a self, handle: &'a JobHandle) -> BackendFuture<'a, ()> {
        Box::pin(self.cancel_job(&handle.id))
    }

    fn finalize<'a>(&'a self, handle: &'a JobHandle) -> BackendFuture<'a, JobCompletion> {
        Box::pin(std::future::ready(self.finalize_job(handle)))
    }
}

/// Render the full job script for a spec.
pub fn render_script(dialect: &dyn QueueDialect, spec: &JobSpec) -> String {
    let mut lines = vec!["#!/bin/bash".to_string()];
    lines.extend(dialect.directives(spec));
    lines.push(String::new());
    lines.push(format!("cd {}", shell_quote(&spec.workdir.to_string_lossy())));
    for (key, value) in spec.env.iter() {
        lines.push(format!("export {key}={}", shell_quote(value)));
    }
    lines.push(spec.command.clone());
    lines.push(String::new());
    lines.join("\n")
}

/// Parse an exit code field, ignoring placeholders like `-`.
pub(crate) fn parse_exit_code(field: &str) -> Option<i32> {
    field.trim().parse().ok()
}
