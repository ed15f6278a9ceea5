// src/job/container.rs

//! Container backend.
//!
//! Runs each job in a fresh, named container on the local host by wrapping
//! the command in `<runtime> run --rm --name <name> ...` and delegating the
//! client process to the [`LocalBackend`]. The stage directory is
//! bind-mounted at [`CONTAINER_WORKDIR`].
//!
//! Killing the client does not stop the container, so `cancel` removes the
//! container by name through the runtime first.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use super::backend::{
    BackendFuture, JobBackend, JobCompletion, JobError, JobHandle, JobSpec, JobState,
};
use super::batch::{CommandRequest, CommandRunner};
use super::local::LocalBackend;
use super::shell_quote;

/// Mount point of the stage directory inside the container.
pub const CONTAINER_WORKDIR: &str = "/hpctest";

pub struct ContainerBackend {
    runtime: String,
    image: String,
    local: LocalBackend,
    runner: Arc<dyn CommandRunner>,
    /// Container name per job id.
    containers: Mutex<HashMap<String, String>>,
    next_seq: AtomicU64,
}

impl std::fmt::Debug for ContainerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerBackend")
            .field("runtime", &self.runtime)
            .field("image", &self.image)
            .finish_non_exhaustive()
    }
}

impl ContainerBackend {
    pub fn new(
        runtime: impl Into<String>,
        image: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            runtime: runtime.into(),
            image: image.into(),
            local: LocalBackend::new(),
            runner,
            containers: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.containers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `hpctest-<job>-<pid>-<seq>`, restricted to the characters container
    /// runtimes accept in names.
    fn container_name(&self, spec: &JobSpec) -> String {
        let job: String = spec
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || "_.-".contains(c) { c } else { '-' })
            .collect();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        format!("hpctest-{job}-{}-{seq}", std::process::id())
    }

    /// The host-side command that runs `spec` inside container `name`.
    pub fn wrap_command(&self, spec: &JobSpec, name: &str) -> String {
        let mut parts = vec![
            shell_quote(&self.runtime),
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            shell_quote(name),
            "-v".to_string(),
            shell_quote(&format!("{}:{CONTAINER_WORKDIR}", display(&spec.workdir))),
            "-w".to_string(),
            CONTAINER_WORKDIR.to_string(),
        ];
        for (key, value) in spec.env.iter() {
            parts.push("-e".to_string());
            parts.push(shell_quote(&format!("{key}={value}")));
        }
        parts.push(shell_quote(&self.image));
        parts.push("sh".to_string());
        parts.push("-c".to_string());
        parts.push(shell_quote(&spec.command));
        parts.join(" ")
    }

    async fn submit_job(&self, spec: &JobSpec) -> Result<JobHandle, JobError> {
        let name = self.container_name(spec);
        let mut wrapped = spec.clone();
        wrapped.command = self.wrap_command(spec, &name);
        // Variables are passed with `-e`; the client process doesn't need them.
        wrapped.env.clear();

        let handle = self.local.submit(&wrapped).await?;
        debug!(job = %spec.name, job_id = %handle.id, container = %name, "container started");
        self.lock().insert(handle.id.clone(), name);
        Ok(handle)
    }

    async fn cancel_job(&self, handle: &JobHandle) -> Result<(), JobError> {
        if self.local.poll(handle).await.is_ok_and(|s| s.is_terminal()) {
            return Ok(());
        }

        let name = self.lock().get(&handle.id).cloned();
        if let Some(name) = name {
            let request = CommandRequest::new(
                &self.runtime,
                ["rm".to_string(), "-f".to_string(), name.clone()],
            );
            let out = self.runner.run(&request).await.map_err(|e| {
                JobError::Cancel(format!("running '{} rm -f {name}': {e}", self.runtime))
            })?;
            if !out.success() {
                return Err(JobError::Cancel(format!(
                    "'{} rm -f {name}' exited with {:?}: {}",
                    self.runtime,
                    out.code,
                    out.stderr.trim()
                )));
            }
            info!(job_id = %handle.id, container = %name, "removed container");
        }

        self.local.cancel(handle).await
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl JobBackend for ContainerBackend {
    fn name(&self) -> &str {
        "container"
    }

    fn submit<'a>(&'a self, spec: &'a JobSpec) -> BackendFuture<'a, JobHandle> {
        Box::pin(self.submit_job(spec))
    }

    fn poll<'a>(&'a self, handle: &'a JobHandle) -> BackendFuture<'a, JobState> {
        self.local.poll(handle)
    }

    fn cancel<'a>(&'a self, handle: &'a JobHandle) -> BackendFuture<'a, ()> {
        Box::pin(self.cancel_job(handle))
    }

    fn finalize<'a>(&'a self, handle: &'a JobHandle) -> BackendFuture<'a, JobCompletion> {
        Box::pin(async move {
            self.lock().remove(&handle.id);
            self.local.finalize(handle).await
        })
    }
}
