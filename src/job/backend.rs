// src/job/backend.rs

//! Pluggable job backend abstraction.
//!
//! A backend hides how an external unit of work is executed. Every backend
//! implements the same four operations:
//!
//! - `submit` hands a [`JobSpec`] to the substrate and returns promptly with a
//!   [`JobHandle`]; the work itself proceeds asynchronously.
//! - `poll` is a cheap, non-blocking status query. It may be called many times
//!   and backends are free to batch or cache the underlying queries.
//! - `cancel` is best-effort and idempotent: cancelling a job that already
//!   reached a terminal state succeeds without changing anything.
//! - `finalize` is called once after a terminal state was observed and returns
//!   the exit code and output locations.
//!
//! Backends are shared between all pipelines of a partition (`Arc<dyn
//! JobBackend>`), so all methods take `&self` and implementations keep their
//! bookkeeping behind a mutex.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Boxed future returned by backend operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, JobError>> + Send + 'a>>;

/// Errors surfaced by job backends.
#[derive(Error, Debug)]
pub enum JobError {
    /// The backend rejected the job (bad resource request, queue down, ...).
    /// The pipeline retries these with exponential backoff.
    #[error("job submission failed: {0}")]
    Submission(String),

    /// A status query kept failing after the backend's own retries.
    #[error("job status query failed after retries: {0}")]
    Transient(String),

    /// The handle is not known to this backend, or the backend returned
    /// something it could not interpret.
    #[error("job query error: {0}")]
    Query(String),

    #[error("job cancellation failed: {0}")]
    Cancel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resource requirements of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub num_tasks: u32,
    pub num_tasks_per_node: Option<u32>,
    pub num_cpus_per_task: Option<u32>,
    pub time_limit: Option<Duration>,
}

impl ResourceSpec {
    /// Number of nodes implied by the task layout.
    pub fn num_nodes(&self) -> u32 {
        match self.num_tasks_per_node {
            Some(per_node) if per_node > 0 => self.num_tasks.div_ceil(per_node),
            _ => 1,
        }
    }
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            num_tasks: 1,
            num_tasks_per_node: None,
            num_cpus_per_task: None,
            time_limit: None,
        }
    }
}

/// Everything a backend needs to submit a job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Human-readable job name (also used for job-script file names).
    pub name: String,
    /// Shell command to execute.
    pub command: String,
    /// Working directory of the job (the test's stage directory).
    pub workdir: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub resources: ResourceSpec,
    pub env: BTreeMap<String, String>,
    /// Extra scheduler options from the partition's `access` list.
    pub access: Vec<String>,
}

/// Opaque reference to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    /// Backend-assigned identifier.
    pub id: String,
    pub name: String,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// Lifecycle state of a job as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    NotSubmitted,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::TimedOut
        )
    }
}

/// Result of [`JobBackend::finalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCompletion {
    pub exit_code: Option<i32>,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// Trait abstracting how jobs are executed.
pub trait JobBackend: Send + Sync {
    /// Short backend name for logs ("local", "slurm", ...).
    fn name(&self) -> &str;

    fn submit<'a>(&'a self, spec: &'a JobSpec) -> BackendFuture<'a, JobHandle>;

    fn poll<'a>(&'a self, handle: &'a JobHandle) -> BackendFuture<'a, JobState>;

    fn cancel<'a>(&'a self, handle: &'a JobHandle) -> BackendFuture<'a, ()>;

    fn finalize<'a>(&'a self, handle: &'a JobHandle) -> BackendFuture<'a, JobCompletion>;
}

/// One outstanding unit of backend work, owned by a pipeline for the
/// duration of a compile or run stage.
#[derive(Debug, Clone)]
pub struct Job {
    pub handle: Option<JobHandle>,
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl Job {
    pub fn new(spec: &JobSpec) -> Self {
        Self {
            handle: None,
            state: JobState::NotSubmitted,
            exit_code: None,
            stdout: spec.stdout.clone(),
            stderr: spec.stderr.clone(),
        }
    }

    /// Backend identifier; empty until the submission completed.
    pub fn id(&self) -> &str {
        self.handle.as_ref().map(|h| h.id.as_str()).unwrap_or("")
    }

    pub fn submitted(&mut self, handle: JobHandle) {
        self.handle = Some(handle);
        self.state = JobState::Queued;
    }

    /// Whether the job has been submitted and not yet observed terminal.
    pub fn is_in_flight(&self) -> bool {
        self.handle.is_some() && !self.state.is_terminal()
    }
}
