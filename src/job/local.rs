// src/job/local.rs

//! Local subprocess backend.
//!
//! Jobs run as `sh -c <command>` children of this process, with stdout and
//! stderr redirected to the files named in the [`JobSpec`]. Process liveness
//! maps directly to [`JobState`]: `try_wait` makes `poll` non-blocking.

use std::collections::HashMap;
use std::fs::File;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::backend::{
    BackendFuture, JobBackend, JobCompletion, JobError, JobHandle, JobSpec, JobState,
};

/// Bookkeeping for one spawned child.
#[derive(Debug)]
struct LocalJob {
    child: Child,
    state: JobState,
    exit_code: Option<i32>,
    handle: JobHandle,
}

/// Runs jobs as local subprocesses.
#[derive(Debug, Default)]
pub struct LocalBackend {
    jobs: Mutex<HashMap<String, LocalJob>>,
    next_id: AtomicU64,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn spawn(&self, spec: &JobSpec) -> Result<JobHandle, JobError> {
        let stdout = File::create(&spec.stdout)?;
        let stderr = File::create(&spec.stderr)?;

        // Build a shell command appropriate for the platform.
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(&spec.command);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(&spec.command);
            c
        };

        cmd.current_dir(&spec.workdir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            JobError::Submission(format!("spawning process for job '{}': {e}", spec.name))
        })?;

        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("local-{seq}");
        let handle = JobHandle {
            id: id.clone(),
            name: spec.name.clone(),
            stdout: spec.stdout.clone(),
            stderr: spec.stderr.clone(),
        };

        info!(
            job = %spec.name,
            job_id = %id,
            pid = child.id(),
            cmd = %spec.command,
            "started local process"
        );

        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.insert(
            id,
            LocalJob {
                child,
                state: JobState::Running,
                exit_code: None,
                handle: handle.clone(),
            },
        );

        Ok(handle)
    }

    fn poll_now(&self, id: &str) -> Result<JobState, JobError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobError::Query(format!("unknown local job '{id}'")))?;

        if job.state.is_terminal() {
            return Ok(job.state);
        }

        if let Some(status) = job.child.try_wait()? {
            job.exit_code = status.code();
            job.state = if status.success() {
                JobState::Completed
            } else {
                JobState::Failed
            };
            debug!(
                job = %job.handle.name,
                job_id = %id,
                exit_code = ?job.exit_code,
                "local process exited"
            );
        }

        Ok(job.state)
    }

    fn cancel_now(&self, id: &str) -> Result<(), JobError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());

        // Already finalized: nothing left to cancel.
        let Some(job) = jobs.get_mut(id) else {
            return Ok(());
        };

        if job.state.is_terminal() {
            return Ok(());
        }

        // The process may have exited since the last poll.
        if let Ok(Some(status)) = job.child.try_wait() {
            job.exit_code = status.code();
            job.state = if status.success() {
                JobState::Completed
            } else {
                JobState::Failed
            };
            return Ok(());
        }

        info!(job = %job.handle.name, job_id = %id, "killing local process");
        job.child
            .start_kill()
            .map_err(|e| JobError::Cancel(format!("killing local job '{id}': {e}")))?;
        job.state = JobState::Cancelled;
        Ok(())
    }

    fn finalize_now(&self, id: &str) -> Result<JobCompletion, JobError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut job = jobs
            .remove(id)
            .ok_or_else(|| JobError::Query(format!("unknown local job '{id}'")))?;

        if !job.state.is_terminal() {
            warn!(
                job = %job.handle.name,
                job_id = %id,
                "finalizing a job that is still running; it will be killed"
            );
        } else if job.state == JobState::Cancelled {
            // Reap if the kill already took effect; otherwise kill_on_drop
            // and the runtime's orphan reaper take care of it.
            let _ = job.child.try_wait();
        }

        Ok(JobCompletion {
            exit_code: job.exit_code,
            stdout: job.handle.stdout,
            stderr: job.handle.stderr,
        })
    }
}

impl JobBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn submit<'a>(&'a self, spec: &'a JobSpec) -> BackendFuture<'a, JobHandle> {
        Box::pin(std::future::ready(self.spawn(spec)))
    }

    fn poll<'a>(&'a self, handle: &'a JobHandle) -> BackendFuture<'a, JobState> {
        Box::pin(std::future::ready(self.poll_now(&handle.id)))
    }

    fn cancel<'a>(&'a self, handle: &'a JobHandle) -> BackendFuture<'a, ()> {
        Box::pin(std::future::ready(self.cancel_now(&handle.id)))
    }

    fn finalize<'a>(&'a self, handle: &'a JobHandle) -> BackendFuture<'a, JobCompletion> {
        Box::pin(std::future::ready(self.finalize_now(&handle.id)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::job::backend::ResourceSpec;

    fn spec(dir: &std::path::Path, command: &str) -> JobSpec {
        JobSpec {
            name: "hostname".into(),
            command: command.into(),
            workdir: dir.to_path_buf(),
            stdout: dir.join("hostname.out"),
            stderr: dir.join("hostname.err"),
            resources: ResourceSpec::default(),
            env: BTreeMap::from([("GREETING".to_string(), "hi".to_string())]),
            access: Vec::new(),
        }
    }

    async fn wait_terminal(backend: &LocalBackend, handle: &JobHandle) -> JobState {
        for _ in 0..200 {
            let state = backend.poll(handle).await.expect("poll");
            if state.is_terminal() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job did not finish in time");
    }

    #[tokio::test]
    async fn successful_process_completes_and_captures_stdout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = LocalBackend::new();
        let spec = spec(dir.path(), "echo $GREETING");

        let handle = backend.submit(&spec).await.expect("submit");
        assert_eq!(wait_terminal(&backend, &handle).await, JobState::Completed);

        let done = backend.finalize(&handle).await.expect("finalize");
        assert_eq!(done.exit_code, Some(0));
        let out = std::fs::read_to_string(done.stdout).expect("stdout");
        assert_eq!(out.trim(), "hi");
    }

    #[tokio::test]
    async fn non_zero_exit_is_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = LocalBackend::new();
        let handle = backend
            .submit(&spec(dir.path(), "exit 3"))
            .await
            .expect("submit");

        assert_eq!(wait_terminal(&backend, &handle).await, JobState::Failed);
        let done = backend.finalize(&handle).await.expect("finalize");
        assert_eq!(done.exit_code, Some(3));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = LocalBackend::new();
        let handle = backend
            .submit(&spec(dir.path(), "sleep 30"))
            .await
            .expect("submit");

        backend.cancel(&handle).await.expect("first cancel");
        assert_eq!(backend.poll(&handle).await.expect("poll"), JobState::Cancelled);

        backend.cancel(&handle).await.expect("second cancel");
        assert_eq!(backend.poll(&handle).await.expect("poll"), JobState::Cancelled);

        backend.finalize(&handle).await.expect("finalize");
        backend.cancel(&handle).await.expect("cancel after finalize");
    }
}
