// src/pipeline/mod.rs

//! Per-test-case pipeline state machine.
//!
//! A [`Pipeline`] drives one attempt of one test case through
//!
//! ```text
//! setup -> compile -> run -> wait -> sanity -> performance -> cleanup
//! ```
//!
//! The scheduling loop calls [`Pipeline::step`] repeatedly. Each call does at
//! most one stage's worth of work and returns promptly: jobs are submitted and
//! polled, never waited on. A failing stage jumps straight to cleanup, and
//! cleanup runs exactly once on every path, including aborts and timeouts.
//!
//! Retries are handled by the scheduler, which starts a fresh pipeline for
//! the next attempt.

pub mod hooks;
pub mod perf;
pub mod stagedir;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::dag::{TestCase, TestCaseId};
use crate::engine::ExecutionContext;
use crate::job::{Job, JobBackend, JobSpec, JobState, ResourceSpec};
use crate::types::{PerfFailureMode, Stage, TestStatus};

pub use self::hooks::{
    CapturedOutput, CheckHooks, CheckOutcome, CheckReport, Environment, EnvironmentHooks,
    PatternChecks, VariableEnvironments,
};
pub use self::perf::{PerfPattern, PerfReference, PerfValue};
pub use self::stagedir::{AttemptDirs, StageLayout};

/// What a single [`Pipeline::step`] call achieved.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    /// Waiting on something external (job, backoff); nothing changed.
    Pending,
    /// Moved to another state; stepping again right away may make progress.
    Progressed,
    /// The attempt is over and cleanup has run.
    Finished(AttemptOutcome),
}

/// Final record of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOutcome {
    /// `Pass`, `Fail` or `Aborted`.
    pub status: TestStatus,
    /// Stage at which the attempt became terminal.
    pub stage: Stage,
    pub reason: Option<String>,
    pub metrics: Vec<PerfValue>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub output_dir: PathBuf,
}

/// Verdict carried into cleanup.
#[derive(Debug, Clone)]
struct Verdict {
    status: TestStatus,
    stage: Stage,
    reason: Option<String>,
}

impl Verdict {
    fn pass() -> Self {
        Self {
            status: TestStatus::Pass,
            stage: Stage::Cleanup,
            reason: None,
        }
    }

    fn fail(stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Fail,
            stage,
            reason: Some(reason.into()),
        }
    }

    fn aborted(stage: Stage) -> Self {
        Self {
            status: TestStatus::Aborted,
            stage,
            reason: Some("aborted".to_string()),
        }
    }
}

enum State {
    Setup,
    Compile,
    CompileWait {
        job: Job,
        started: Instant,
    },
    Submit {
        failures: u32,
        not_before: Option<Instant>,
    },
    Wait {
        job: Job,
        submitted_at: Instant,
        /// First time the job was seen running; the wall-time clock starts here.
        running_since: Option<Instant>,
    },
    Sanity,
    Performance,
    Cleanup(Verdict),
    Finished(AttemptOutcome),
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Setup => "setup",
            State::Compile => "compile",
            State::CompileWait { .. } => "compile-wait",
            State::Submit { .. } => "submit",
            State::Wait { .. } => "wait",
            State::Sanity => "sanity",
            State::Performance => "performance",
            State::Cleanup(_) => "cleanup",
            State::Finished(_) => "finished",
        }
    }
}

/// One attempt of one test case.
pub struct Pipeline {
    case: TestCaseId,
    attempt: u32,
    dirs: AttemptDirs,
    state: State,
    stages: Vec<Stage>,
    /// Files copied to the output dir on cleanup.
    artifacts: Vec<PathBuf>,
    run_output: Option<(PathBuf, PathBuf)>,
    captured: Option<CapturedOutput>,
    metrics: Vec<PerfValue>,
    env_entered: bool,
    cleanup_runs: u32,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("case", &self.case)
            .field("attempt", &self.attempt)
            .field("state", &self.state.name())
            .field("stages", &self.stages)
            .finish_non_exhaustive()
    }
}

/// Run a blocking filesystem closure off the scheduling loop.
async fn blocking<F>(f: F) -> anyhow::Result<()>
where
    F: FnOnce() -> anyhow::Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("filesystem task panicked")?
}

impl Pipeline {
    /// Start the next attempt of `case`.
    pub fn start(case: &mut TestCase, ctx: &ExecutionContext) -> Self {
        case.attempt += 1;
        case.status = TestStatus::Running;
        case.stage = None;
        if case.started_at.is_none() {
            case.started_at = Some(Instant::now());
        }

        info!(test = %case.name, attempt = case.attempt, "starting attempt");

        Self {
            case: case.id,
            attempt: case.attempt,
            dirs: ctx.layout.dirs(case, case.attempt),
            state: State::Setup,
            stages: Vec::new(),
            artifacts: Vec::new(),
            run_output: None,
            captured: None,
            metrics: Vec::new(),
            env_entered: false,
            cleanup_runs: 0,
        }
    }

    pub fn case_id(&self) -> TestCaseId {
        self.case
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Stages entered during this attempt, in order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn cleanup_runs(&self) -> u32 {
        self.cleanup_runs
    }

    pub fn dirs(&self) -> &AttemptDirs {
        &self.dirs
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Finished(_))
    }

    /// Advance by at most one stage.
    ///
    /// With `abort` set, an in-flight job is cancelled and the pipeline moves
    /// to cleanup with an `aborted` verdict.
    pub async fn step(
        &mut self,
        case: &mut TestCase,
        ctx: &ExecutionContext,
        abort: bool,
    ) -> StepResult {
        let state = std::mem::replace(&mut self.state, State::Setup);

        let (next, progressed) = match state {
            State::Finished(outcome) => (State::Finished(outcome), false),
            State::Cleanup(verdict) => (self.cleanup(case, ctx, verdict).await, true),
            State::CompileWait { job, .. } | State::Wait { job, .. } if abort => {
                let stage = case.stage.unwrap_or(Stage::Wait);
                self.cancel_job(case, ctx, &job, stage).await;
                (State::Cleanup(Verdict::aborted(stage)), true)
            }
            other if abort => {
                let stage = match other {
                    State::Setup => Stage::Setup,
                    State::Compile => Stage::Compile,
                    State::Submit { .. } => Stage::Run,
                    State::Sanity => Stage::Sanity,
                    _ => Stage::Performance,
                };
                info!(test = %case.name, %stage, "abort requested; skipping to cleanup");
                (State::Cleanup(Verdict::aborted(stage)), true)
            }
            State::Setup => (self.setup(case, ctx).await, true),
            State::Compile => (self.compile(case, ctx).await, true),
            State::CompileWait { job, started } => self.compile_wait(case, ctx, job, started).await,
            State::Submit {
                failures,
                not_before,
            } => self.submit(case, ctx, failures, not_before).await,
            State::Wait {
                job,
                submitted_at,
                running_since,
            } => self.wait(case, ctx, job, submitted_at, running_since).await,
            State::Sanity => (self.sanity(case, ctx).await, true),
            State::Performance => (self.performance(case, ctx), true),
        };

        self.state = next;
        match &self.state {
            State::Finished(outcome) => StepResult::Finished(outcome.clone()),
            _ if progressed => StepResult::Progressed,
            _ => StepResult::Pending,
        }
    }

    fn enter(&mut self, case: &mut TestCase, stage: Stage) {
        if self.stages.last() != Some(&stage) {
            debug!(test = %case.name, attempt = self.attempt, %stage, "entering stage");
            self.stages.push(stage);
        }
        case.stage = Some(stage);
    }

    async fn setup(&mut self, case: &mut TestCase, ctx: &ExecutionContext) -> State {
        self.enter(case, Stage::Setup);

        let layout = ctx.layout.clone();
        let dirs = self.dirs.clone();
        let sources = case.definition.sources.clone();
        if let Err(e) = blocking(move || layout.prepare(&dirs, sources.as_deref())).await {
            warn!(test = %case.name, error = %format!("{e:#}"), "setup failed");
            return State::Cleanup(Verdict::fail(Stage::Setup, format!("{e:#}")));
        }

        let env = ctx.environment(&case.environment);
        if let Err(e) = ctx.env_hooks.enter(&env, case) {
            warn!(test = %case.name, environment = %env.name, error = %e, "entering environment failed");
            return State::Cleanup(Verdict::fail(
                Stage::Setup,
                format!("entering environment '{}': {e:#}", env.name),
            ));
        }
        self.env_entered = true;

        if case.definition.build_cmds.is_empty() {
            State::Submit {
                failures: 0,
                not_before: None,
            }
        } else {
            State::Compile
        }
    }

    async fn compile(&mut self, case: &mut TestCase, ctx: &ExecutionContext) -> State {
        self.enter(case, Stage::Compile);

        let name = format!("{}_build", case.job_name());
        let resources = ResourceSpec {
            time_limit: case.definition.resources.time_limit,
            ..ResourceSpec::default()
        };
        let spec = self.job_spec(case, ctx, name, case.definition.build_cmds.join(" && "), resources, Vec::new());
        let mut job = Job::new(&spec);

        match ctx.backends.build().submit(&spec).await {
            Ok(handle) => {
                debug!(test = %case.name, job_id = %handle.id, "build job submitted");
                job.submitted(handle);
                State::CompileWait {
                    job,
                    started: Instant::now(),
                }
            }
            Err(e) => State::Cleanup(Verdict::fail(
                Stage::Compile,
                format!("build submission failed: {e}"),
            )),
        }
    }

    async fn compile_wait(
        &mut self,
        case: &mut TestCase,
        ctx: &ExecutionContext,
        mut job: Job,
        started: Instant,
    ) -> (State, bool) {
        let backend = ctx.backends.build().as_ref();
        let Some(handle) = job.handle.clone() else {
            return (
                State::Cleanup(Verdict::fail(Stage::Compile, "build job has no handle")),
                true,
            );
        };

        let state = match backend.poll(&handle).await {
            Ok(state) => state,
            Err(e) => {
                self.cancel_job(case, ctx, &job, Stage::Compile).await;
                return (
                    State::Cleanup(Verdict::fail(Stage::Compile, format!("polling build job: {e}"))),
                    true,
                );
            }
        };
        job.state = state;

        if !state.is_terminal() {
            let limit = time_limit(case, ctx);
            if started.elapsed() > limit {
                self.cancel_job(case, ctx, &job, Stage::Compile).await;
                return (
                    State::Cleanup(Verdict::fail(
                        Stage::Compile,
                        format!("build timed out after {limit:?}"),
                    )),
                    true,
                );
            }
            return (State::CompileWait { job, started }, false);
        }

        let exit_code = match backend.finalize(&handle).await {
            Ok(done) => done.exit_code,
            Err(e) => {
                return (
                    State::Cleanup(Verdict::fail(Stage::Compile, format!("finalizing build job: {e}"))),
                    true,
                );
            }
        };

        if state == JobState::Completed && exit_code.unwrap_or(0) == 0 {
            info!(test = %case.name, "build succeeded");
            (
                State::Submit {
                    failures: 0,
                    not_before: None,
                },
                true,
            )
        } else {
            (
                State::Cleanup(Verdict::fail(
                    Stage::Compile,
                    format!("build {}", describe_job_failure(state, exit_code)),
                )),
                true,
            )
        }
    }

    async fn submit(
        &mut self,
        case: &mut TestCase,
        ctx: &ExecutionContext,
        failures: u32,
        not_before: Option<Instant>,
    ) -> (State, bool) {
        if not_before.is_some_and(|t| Instant::now() < t) {
            return (State::Submit { failures, not_before }, false);
        }

        self.enter(case, Stage::Run);

        let Some(backend) = ctx.backends.for_partition(&case.partition) else {
            return (
                State::Cleanup(Verdict::fail(
                    Stage::Run,
                    format!("no job backend for partition '{}'", case.partition),
                )),
                true,
            );
        };

        let access = ctx.access.get(&case.partition).cloned().unwrap_or_default();
        let spec = self.job_spec(
            case,
            ctx,
            case.job_name(),
            case.definition.cmd.clone(),
            case.definition.resources.clone(),
            access,
        );
        self.run_output = Some((spec.stdout.clone(), spec.stderr.clone()));
        let mut job = Job::new(&spec);

        match backend.submit(&spec).await {
            Ok(handle) => {
                info!(
                    test = %case.name,
                    backend = backend.name(),
                    job_id = %handle.id,
                    "job submitted"
                );
                job.submitted(handle);
                (
                    State::Wait {
                        job,
                        submitted_at: Instant::now(),
                        running_since: None,
                    },
                    true,
                )
            }
            Err(e) => {
                let failures = failures + 1;
                if failures > ctx.config.submission_retries {
                    warn!(test = %case.name, failures, error = %e, "giving up on job submission");
                    return (
                        State::Cleanup(Verdict::fail(
                            Stage::Run,
                            format!("job submission failed after {failures} attempts: {e}"),
                        )),
                        true,
                    );
                }
                let delay = backoff(ctx.config.submission_backoff, failures);
                warn!(
                    test = %case.name,
                    failures,
                    retry_in = ?delay,
                    error = %e,
                    "job submission failed; retrying"
                );
                (
                    State::Submit {
                        failures,
                        not_before: Some(Instant::now() + delay),
                    },
                    false,
                )
            }
        }
    }

    async fn wait(
        &mut self,
        case: &mut TestCase,
        ctx: &ExecutionContext,
        mut job: Job,
        submitted_at: Instant,
        mut running_since: Option<Instant>,
    ) -> (State, bool) {
        self.enter(case, Stage::Wait);

        let (Some(backend), Some(handle)) =
            (ctx.backends.for_partition(&case.partition), job.handle.clone())
        else {
            return (
                State::Cleanup(Verdict::fail(Stage::Wait, "job has no backend or handle")),
                true,
            );
        };

        let state = match backend.poll(&handle).await {
            Ok(state) => state,
            Err(e) => {
                warn!(test = %case.name, job_id = %handle.id, error = %e, "polling job failed");
                self.cancel_job(case, ctx, &job, Stage::Wait).await;
                return (
                    State::Cleanup(Verdict::fail(Stage::Wait, format!("polling job: {e}"))),
                    true,
                );
            }
        };

        if state != job.state {
            debug!(test = %case.name, job_id = %handle.id, ?state, "job state changed");
        }
        job.state = state;
        if running_since.is_none() && (state == JobState::Running || state.is_terminal()) {
            running_since = Some(Instant::now());
        }

        if !state.is_terminal() {
            let limit = time_limit(case, ctx);
            if running_since.is_some_and(|t| t.elapsed() > limit) {
                warn!(test = %case.name, job_id = %handle.id, ?limit, "wall-time limit exceeded; cancelling job");
                self.cancel_job(case, ctx, &job, Stage::Wait).await;
                return (
                    State::Cleanup(Verdict::fail(
                        Stage::Wait,
                        format!("timed out after {limit:?}"),
                    )),
                    true,
                );
            }
            let pending = ctx.config.max_pending_time;
            if running_since.is_none() && submitted_at.elapsed() > pending {
                warn!(test = %case.name, job_id = %handle.id, ?state, ?pending, "job never started; cancelling");
                self.cancel_job(case, ctx, &job, Stage::Wait).await;
                return (
                    State::Cleanup(Verdict::fail(
                        Stage::Wait,
                        format!("pending timeout: job did not start within {pending:?}"),
                    )),
                    true,
                );
            }
            return (
                State::Wait {
                    job,
                    submitted_at,
                    running_since,
                },
                false,
            );
        }

        let completion = match backend.finalize(&handle).await {
            Ok(done) => done,
            Err(e) => {
                return (
                    State::Cleanup(Verdict::fail(Stage::Wait, format!("finalizing job: {e}"))),
                    true,
                );
            }
        };
        job.exit_code = completion.exit_code;
        self.run_output = Some((completion.stdout, completion.stderr));

        info!(
            test = %case.name,
            job_id = %handle.id,
            ?state,
            exit_code = ?completion.exit_code,
            "job finished"
        );

        if state == JobState::Completed && completion.exit_code.unwrap_or(0) == 0 {
            (State::Sanity, true)
        } else {
            (
                State::Cleanup(Verdict::fail(
                    Stage::Wait,
                    format!("job {}", describe_job_failure(state, completion.exit_code)),
                )),
                true,
            )
        }
    }

    async fn sanity(&mut self, case: &mut TestCase, ctx: &ExecutionContext) -> State {
        self.enter(case, Stage::Sanity);

        let output = self.capture_output(case).await;
        let report = ctx.checks.sanity(case, &output);
        self.captured = Some(output);

        match report {
            Ok(report) => match report.outcome {
                CheckOutcome::Pass | CheckOutcome::Skip => {
                    if ctx.checks.has_performance(case) {
                        State::Performance
                    } else {
                        State::Cleanup(Verdict::pass())
                    }
                }
                CheckOutcome::Fail(reason) => State::Cleanup(Verdict::fail(Stage::Sanity, reason)),
            },
            Err(e) => State::Cleanup(Verdict::fail(Stage::Sanity, format!("sanity check error: {e:#}"))),
        }
    }

    fn performance(&mut self, case: &mut TestCase, ctx: &ExecutionContext) -> State {
        self.enter(case, Stage::Performance);

        let output = self.captured.take().unwrap_or_default();
        let report = match ctx.checks.performance(case, &output) {
            Ok(report) => report,
            Err(e) => {
                return State::Cleanup(Verdict::fail(
                    Stage::Performance,
                    format!("performance check error: {e:#}"),
                ));
            }
        };
        self.metrics = report.metrics;

        match report.outcome {
            CheckOutcome::Pass | CheckOutcome::Skip => State::Cleanup(Verdict::pass()),
            CheckOutcome::Fail(reason) => match ctx.config.perf_failure {
                PerfFailureMode::Fail => State::Cleanup(Verdict::fail(Stage::Performance, reason)),
                PerfFailureMode::Warn => {
                    warn!(test = %case.name, %reason, "performance check failed (warn only)");
                    State::Cleanup(Verdict::pass())
                }
            },
        }
    }

    async fn cleanup(&mut self, case: &mut TestCase, ctx: &ExecutionContext, mut verdict: Verdict) -> State {
        self.enter(case, Stage::Cleanup);
        self.cleanup_runs += 1;

        if self.env_entered {
            let env = ctx.environment(&case.environment);
            if let Err(e) = ctx.env_hooks.leave(&env, case) {
                warn!(test = %case.name, environment = %env.name, error = %e, "leaving environment failed");
            }
            self.env_entered = false;
        }

        let passed = verdict.status == TestStatus::Pass;
        let layout = ctx.layout.clone();
        let dirs = self.dirs.clone();
        let artifacts = self.artifacts.clone();
        let keep_files = case.definition.keep_files.clone();
        if let Err(e) = blocking(move || layout.cleanup(&dirs, &artifacts, &keep_files, passed)).await {
            warn!(test = %case.name, error = %format!("{e:#}"), "cleanup failed");
            if passed {
                verdict = Verdict::fail(Stage::Cleanup, format!("cleanup failed: {e:#}"));
            }
        }

        let relocate = |path: &PathBuf| {
            path.file_name()
                .map(|name| self.dirs.output.join(name))
                .filter(|copied| copied.is_file())
                .unwrap_or_else(|| path.clone())
        };
        let (stdout, stderr) = match &self.run_output {
            Some((out, err)) => (Some(relocate(out)), Some(relocate(err))),
            None => (None, None),
        };

        info!(
            test = %case.name,
            attempt = self.attempt,
            status = %verdict.status,
            stage = %verdict.stage,
            reason = verdict.reason.as_deref().unwrap_or(""),
            "attempt finished"
        );

        State::Finished(AttemptOutcome {
            status: verdict.status,
            stage: verdict.stage,
            reason: verdict.reason,
            metrics: std::mem::take(&mut self.metrics),
            stdout,
            stderr,
            output_dir: self.dirs.output.clone(),
        })
    }

    /// Best-effort cancellation of an in-flight job, followed by `finalize`
    /// so the backend drops its bookkeeping for it.
    async fn cancel_job(&self, case: &TestCase, ctx: &ExecutionContext, job: &Job, stage: Stage) {
        let Some(handle) = &job.handle else {
            return;
        };
        if job.state.is_terminal() {
            return;
        }
        let backend: &dyn JobBackend = if stage == Stage::Compile {
            ctx.backends.build().as_ref()
        } else {
            match ctx.backends.for_partition(&case.partition) {
                Some(b) => b.as_ref(),
                None => return,
            }
        };
        match backend.cancel(handle).await {
            Ok(()) => info!(test = %case.name, job_id = %handle.id, "job cancelled"),
            Err(e) => warn!(test = %case.name, job_id = %handle.id, error = %e, "cancelling job failed"),
        }
        if let Err(e) = backend.finalize(handle).await {
            debug!(test = %case.name, job_id = %handle.id, error = %e, "finalize after cancel failed");
        }
    }

    async fn capture_output(&self, case: &TestCase) -> CapturedOutput {
        let Some((stdout_path, stderr_path)) = self.run_output.clone() else {
            return CapturedOutput::default();
        };
        let read = |path: PathBuf| async move {
            match tokio::fs::read_to_string(&path).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(test = %case.name, path = ?path, error = %e, "could not read job output");
                    String::new()
                }
            }
        };
        CapturedOutput {
            stdout: read(stdout_path.clone()).await,
            stderr: read(stderr_path.clone()).await,
            stdout_path,
            stderr_path,
        }
    }

    fn job_spec(
        &mut self,
        case: &TestCase,
        ctx: &ExecutionContext,
        name: String,
        command: String,
        resources: ResourceSpec,
        access: Vec<String>,
    ) -> JobSpec {
        let mut env: BTreeMap<String, String> = ctx.environment(&case.environment).variables;
        env.extend(
            case.definition
                .variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        env.insert("HPCTEST_TEST".into(), case.test_name().to_string());
        env.insert("HPCTEST_PARTITION".into(), case.partition.clone());
        env.insert("HPCTEST_ENVIRON".into(), case.environment.clone());

        let stdout = self.dirs.stage.join(format!("{name}.out"));
        let stderr = self.dirs.stage.join(format!("{name}.err"));
        self.artifacts.push(stdout.clone());
        self.artifacts.push(stderr.clone());
        self.artifacts.push(self.dirs.stage.join(format!("{name}.job.sh")));

        JobSpec {
            name,
            command,
            workdir: self.dirs.stage.clone(),
            stdout,
            stderr,
            resources,
            env,
            access,
        }
    }
}

fn time_limit(case: &TestCase, ctx: &ExecutionContext) -> Duration {
    case.definition
        .resources
        .time_limit
        .unwrap_or(ctx.config.default_time_limit)
}

/// `base * 2^(n-1)` for the `n`-th consecutive failure.
fn backoff(base: Duration, failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1));
    base.saturating_mul(factor)
}

fn describe_job_failure(state: JobState, exit_code: Option<i32>) -> String {
    match (state, exit_code) {
        (JobState::TimedOut, _) => "exceeded its time limit".to_string(),
        (JobState::Cancelled, _) => "was cancelled".to_string(),
        (_, Some(code)) => format!("exited with code {code}"),
        (_, None) => "failed".to_string(),
    }
}
