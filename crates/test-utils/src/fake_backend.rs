#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use hpctest::job::{
    BackendFuture, JobBackend, JobCompletion, JobError, JobHandle, JobSpec, JobState,
};

/// What a scripted job does.
///
/// `states` are returned by successive polls; the last one repeats forever.
#[derive(Debug, Clone)]
pub struct JobScript {
    pub states: Vec<JobState>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    /// Number of submissions rejected before one is accepted.
    pub reject_submissions: u32,
    /// Number of polls that fail before polling works.
    pub poll_errors: u32,
}

impl JobScript {
    pub fn succeed() -> Self {
        Self {
            states: vec![JobState::Running, JobState::Completed],
            exit_code: Some(0),
            stdout: String::new(),
            reject_submissions: 0,
            poll_errors: 0,
        }
    }

    pub fn fail(code: i32) -> Self {
        Self {
            states: vec![JobState::Running, JobState::Failed],
            exit_code: Some(code),
            ..Self::succeed()
        }
    }

    pub fn running_forever() -> Self {
        Self {
            states: vec![JobState::Running],
            exit_code: None,
            ..Self::succeed()
        }
    }

    /// Accepted but never scheduled: every poll says `Queued`.
    pub fn queued_forever() -> Self {
        Self {
            states: vec![JobState::Queued],
            exit_code: None,
            ..Self::succeed()
        }
    }

    /// Stay running for `polls` polls, then complete.
    pub fn running_for(polls: usize) -> Self {
        let mut states = vec![JobState::Running; polls.max(1)];
        states.push(JobState::Completed);
        Self {
            states,
            ..Self::succeed()
        }
    }

    pub fn with_stdout(mut self, stdout: &str) -> Self {
        self.stdout = stdout.to_string();
        self
    }

    pub fn with_rejected_submissions(mut self, n: u32) -> Self {
        self.reject_submissions = n;
        self
    }

    pub fn with_poll_errors(mut self, n: u32) -> Self {
        self.poll_errors = n;
        self
    }
}

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Submit { test: String, job: String },
    Poll { job: String },
    Cancel { job: String },
    Finalize { job: String },
}

#[derive(Debug)]
struct FakeJob {
    script: JobScript,
    polls: usize,
    cancelled: bool,
    stdout: std::path::PathBuf,
    stderr: std::path::PathBuf,
}

#[derive(Debug, Default)]
struct Inner {
    scripts: HashMap<(String, bool), JobScript>,
    rejected: HashMap<(String, bool), u32>,
    poll_failures: HashMap<String, u32>,
    jobs: HashMap<String, FakeJob>,
    calls: Vec<BackendCall>,
    next_id: u64,
}

/// In-memory [`JobBackend`] whose jobs follow per-test scripts.
///
/// Jobs are matched to scripts by the `HPCTEST_TEST` variable of their
/// environment; build jobs (names ending in `_build`) have their own
/// scripts. Tests without a script succeed.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    inner: Mutex<Inner>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the run job of `test`.
    pub fn script(&self, test: &str, script: JobScript) {
        self.lock().scripts.insert((test.to_string(), false), script);
    }

    /// Script the build job of `test`.
    pub fn script_build(&self, test: &str, script: JobScript) {
        self.lock().scripts.insert((test.to_string(), true), script);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    /// Test names of accepted run-job submissions, in order.
    pub fn submitted_tests(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                BackendCall::Submit { test, job } if !job.ends_with("_build") => Some(test.clone()),
                _ => None,
            })
            .collect()
    }

    /// Accepted run-job submissions of `test`.
    pub fn submissions_of(&self, test: &str) -> usize {
        self.submitted_tests().iter().filter(|t| *t == test).count()
    }

    /// Job names that were cancelled.
    pub fn cancelled(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                BackendCall::Cancel { job } => Some(job.clone()),
                _ => None,
            })
            .collect()
    }

    /// Job names that were finalized.
    pub fn finalized(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                BackendCall::Finalize { job } => Some(job.clone()),
                _ => None,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("fake backend mutex poisoned")
    }

    fn submit_now(&self, spec: &JobSpec) -> Result<JobHandle, JobError> {
        let test = spec.env.get("HPCTEST_TEST").cloned().unwrap_or_default();
        let is_build = spec.name.ends_with("_build");
        let key = (test.clone(), is_build);

        let mut inner = self.lock();
        let script = inner
            .scripts
            .get(&key)
            .cloned()
            .unwrap_or_else(JobScript::succeed);

        let rejected = inner.rejected.entry(key).or_insert(0);
        if *rejected < script.reject_submissions {
            *rejected += 1;
            return Err(JobError::Submission(format!("queue rejected '{}'", spec.name)));
        }

        std::fs::write(&spec.stdout, &script.stdout)?;
        std::fs::write(&spec.stderr, "")?;

        inner.next_id += 1;
        let id = format!("fake-{}", inner.next_id);
        inner.calls.push(BackendCall::Submit {
            test,
            job: spec.name.clone(),
        });
        inner.poll_failures.insert(id.clone(), 0);
        inner.jobs.insert(
            id.clone(),
            FakeJob {
                script,
                polls: 0,
                cancelled: false,
                stdout: spec.stdout.clone(),
                stderr: spec.stderr.clone(),
            },
        );

        Ok(JobHandle {
            id,
            name: spec.name.clone(),
            stdout: spec.stdout.clone(),
            stderr: spec.stderr.clone(),
        })
    }

    fn poll_now(&self, handle: &JobHandle) -> Result<JobState, JobError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.calls.push(BackendCall::Poll {
            job: handle.name.clone(),
        });

        let failures = inner.poll_failures.get(&handle.id).copied().unwrap_or(0);
        let Some(job) = inner.jobs.get_mut(&handle.id) else {
            return Err(JobError::Query(format!("unknown job {}", handle.id)));
        };
        if failures < job.script.poll_errors {
            inner.poll_failures.insert(handle.id.clone(), failures + 1);
            return Err(JobError::Transient(format!("queue unreachable for {}", handle.id)));
        }
        if job.cancelled {
            return Ok(JobState::Cancelled);
        }

        let idx = job.polls.min(job.script.states.len().saturating_sub(1));
        job.polls += 1;
        Ok(job.script.states.get(idx).copied().unwrap_or(JobState::Completed))
    }

    fn cancel_now(&self, handle: &JobHandle) -> Result<(), JobError> {
        let mut inner = self.lock();
        inner.calls.push(BackendCall::Cancel {
            job: handle.name.clone(),
        });
        if let Some(job) = inner.jobs.get_mut(&handle.id) {
            job.cancelled = true;
        }
        Ok(())
    }

    fn finalize_now(&self, handle: &JobHandle) -> Result<JobCompletion, JobError> {
        let mut inner = self.lock();
        inner.calls.push(BackendCall::Finalize {
            job: handle.name.clone(),
        });
        let Some(job) = inner.jobs.get(&handle.id) else {
            return Err(JobError::Query(format!("unknown job {}", handle.id)));
        };
        Ok(JobCompletion {
            exit_code: if job.cancelled { None } else { job.script.exit_code },
            stdout: job.stdout.clone(),
            stderr: job.stderr.clone(),
        })
    }
}

impl JobBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn submit<'a>(&'a self, spec: &'a JobSpec) -> BackendFuture<'a, JobHandle> {
        Box::pin(async move { self.submit_now(spec) })
    }

    fn poll<'a>(&'a self, handle: &'a JobHandle) -> BackendFuture<'a, JobState> {
        Box::pin(async move { self.poll_now(handle) })
    }

    fn cancel<'a>(&'a self, handle: &'a JobHandle) -> BackendFuture<'a, ()> {
        Box::pin(async move { self.cancel_now(handle) })
    }

    fn finalize<'a>(&'a self, handle: &'a JobHandle) -> BackendFuture<'a, JobCompletion> {
        Box::pin(async move { self.finalize_now(handle) })
    }
}
