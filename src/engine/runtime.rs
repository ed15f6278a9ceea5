// src/engine/runtime.rs

use std::fmt;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::dag::{TestCase, TestCaseId};
use crate::errors::Result;
use crate::pipeline::{AttemptOutcome, Pipeline, StepResult};
use crate::types::{Stage, TestStatus};

use super::context::ExecutionContext;
use super::control::ControlReceiver;
use super::core::{CoreScheduler, Limits};
use super::plan::ExecutionPlan;
use super::report::{RunReport, TestResult};

/// What happened during a run, beyond the final results.
#[derive(Debug, Clone, Default)]
pub struct ExecutionTrace {
    /// Test cases in the order they were admitted.
    pub admissions: Vec<TestCaseId>,
    /// Every attempt, in the order they finished.
    pub attempts: Vec<AttemptTrace>,
    /// Largest number of simultaneously admitted test cases.
    pub max_running: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptTrace {
    pub case: TestCaseId,
    pub attempt: u32,
    pub status: TestStatus,
    pub stages: Vec<Stage>,
    pub cleanup_runs: u32,
}

/// The scheduling loop.
///
/// An async shell around [`CoreScheduler`]: the core decides what to admit
/// and what a completion unlocks; this loop owns the pipelines and steps each
/// of them in admission order. It is the only writer of the running set,
/// ready queue and test cases.
pub struct Runtime {
    core: CoreScheduler,
    cases: Vec<TestCase>,
    outcomes: Vec<Option<AttemptOutcome>>,
    /// Reasons for test cases that end without an attempt (skip, abort).
    reasons: Vec<Option<String>>,
    running: Vec<Pipeline>,
    ctx: ExecutionContext,
    control: ControlReceiver,
    abort_handled: bool,
    trace: ExecutionTrace,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(plan: ExecutionPlan, ctx: ExecutionContext, control: ControlReceiver) -> Result<Self> {
        let limits = Limits {
            max_jobs: ctx.config.max_jobs.max(1),
            per_partition: ctx.config.partition_limits.clone(),
        };
        let partitions = plan.cases.iter().map(|c| c.partition.clone()).collect();
        let core = CoreScheduler::new(plan.graph, partitions, limits)?;
        let n = plan.cases.len();

        Ok(Self {
            core,
            cases: plan.cases,
            outcomes: vec![None; n],
            reasons: vec![None; n],
            running: Vec::new(),
            ctx,
            control,
            abort_handled: false,
            trace: ExecutionTrace::default(),
        })
    }

    pub async fn run(self) -> Result<RunReport> {
        self.run_traced().await.map(|(report, _)| report)
    }

    /// Run every test case to a terminal status.
    pub async fn run_traced(mut self) -> Result<(RunReport, ExecutionTrace)> {
        let started = Instant::now();
        info!(
            test_cases = self.cases.len(),
            max_jobs = self.core.limits().max_jobs,
            "hpctest runtime started"
        );

        for id in self.core.graph().roots() {
            self.cases[id.index()].queued_at = Some(started);
        }

        loop {
            let aborting = self.control.is_abort_requested();
            if aborting && !self.abort_handled {
                self.handle_abort();
            }
            if !aborting {
                self.admit();
            }

            if self.running.is_empty() {
                if self.core.is_finished() {
                    break;
                }
                if self.core.is_stalled() || aborting {
                    error!(progress = ?self.core.progress(), "nothing runnable but test cases remain");
                    self.abort_remaining("not scheduled: dependencies never resolved");
                    break;
                }
            }

            let progressed = self.step_running(aborting).await;
            self.control.publish(self.core.progress());

            if self.running.is_empty() && self.core.is_finished() {
                break;
            }

            if !progressed {
                let interval = self.ctx.config.poll_interval;
                if aborting {
                    tokio::time::sleep(interval).await;
                } else {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = self.control.aborted() => {
                            debug!("abort observed while idle");
                        }
                    }
                }
            }
        }

        self.control.publish(self.core.progress());
        let report = self.report(started);
        info!(
            pass = report.summary.pass,
            fail = report.summary.fail,
            skip = report.summary.skip,
            aborted = report.summary.aborted,
            "hpctest runtime finished"
        );
        Ok((report, self.trace))
    }

    fn admit(&mut self) {
        let admitted = self.core.admit();
        for id in admitted {
            self.trace.admissions.push(id);
            let case = &mut self.cases[id.index()];
            self.running.push(Pipeline::start(case, &self.ctx));
        }
        self.trace.max_running = self.trace.max_running.max(self.running.len());
    }

    /// Step every running pipeline once, in admission order. Returns whether
    /// anything moved.
    async fn step_running(&mut self, abort: bool) -> bool {
        let mut progressed = false;
        let mut finished: Vec<(usize, AttemptOutcome)> = Vec::new();

        for (slot, pipeline) in self.running.iter_mut().enumerate() {
            let case = &mut self.cases[pipeline.case_id().index()];
            match pipeline.step(case, &self.ctx, abort).await {
                StepResult::Pending => {}
                StepResult::Progressed => progressed = true,
                StepResult::Finished(outcome) => {
                    progressed = true;
                    self.trace.attempts.push(AttemptTrace {
                        case: pipeline.case_id(),
                        attempt: pipeline.attempt(),
                        status: outcome.status,
                        stages: pipeline.stages().to_vec(),
                        cleanup_runs: pipeline.cleanup_runs(),
                    });
                    finished.push((slot, outcome));
                }
            }
        }

        if finished.is_empty() {
            return progressed;
        }

        let mut finished = finished.into_iter().peekable();
        let mut still_running = Vec::with_capacity(self.running.len());
        for (slot, pipeline) in std::mem::take(&mut self.running).into_iter().enumerate() {
            match finished.next_if(|(s, _)| *s == slot) {
                Some((_, outcome)) => {
                    if let Some(retry) = self.attempt_finished(pipeline.case_id(), outcome) {
                        still_running.push(retry);
                    }
                }
                None => still_running.push(pipeline),
            }
        }
        self.running = still_running;
        progressed
    }

    /// Either start the next attempt (kept in the same running slot) or
    /// record the terminal status with the core.
    fn attempt_finished(&mut self, id: TestCaseId, outcome: AttemptOutcome) -> Option<Pipeline> {
        let aborting = self.control.is_abort_requested();
        let case = &mut self.cases[id.index()];

        let retry = outcome.status == TestStatus::Fail
            && case.definition.retryable
            && case.attempt <= self.ctx.config.max_retries
            && !aborting;

        if retry {
            warn!(
                test = %case.name,
                attempt = case.attempt,
                max_retries = self.ctx.config.max_retries,
                reason = outcome.reason.as_deref().unwrap_or(""),
                "attempt failed; retrying from setup"
            );
            self.outcomes[id.index()] = Some(outcome);
            return Some(Pipeline::start(case, &self.ctx));
        }

        let now = Instant::now();
        case.status = outcome.status;
        case.stage = Some(outcome.stage);
        case.finished_at = Some(now);
        let status = outcome.status;
        self.outcomes[id.index()] = Some(outcome);

        let step = self.core.complete(id, status);
        for ready in step.newly_ready {
            self.cases[ready.index()].queued_at = Some(now);
        }
        for skipped in step.newly_skipped {
            let cause = self.cases[skipped.cause.index()].name.clone();
            let case = &mut self.cases[skipped.id.index()];
            case.status = TestStatus::Skip;
            case.finished_at = Some(now);
            self.reasons[skipped.id.index()] = Some(format!("dependency '{cause}' did not pass"));
        }
        None
    }

    fn handle_abort(&mut self) {
        self.abort_handled = true;
        warn!(running = self.running.len(), "abort requested; cancelling in-flight test cases");
        let ids = self.core.abort_pending();
        self.mark_aborted(ids, "aborted before start");
    }

    fn abort_remaining(&mut self, reason: &str) {
        let ids = self.core.abort_pending();
        self.mark_aborted(ids, reason);
    }

    fn mark_aborted(&mut self, ids: Vec<TestCaseId>, reason: &str) {
        let now = Instant::now();
        for id in ids {
            let case = &mut self.cases[id.index()];
            case.status = TestStatus::Aborted;
            case.finished_at = Some(now);
            self.reasons[id.index()] = Some(reason.to_string());
        }
    }

    fn report(&self, started: Instant) -> RunReport {
        let results = self
            .cases
            .iter()
            .zip(self.outcomes.iter().zip(&self.reasons))
            .map(|(case, (outcome, reason))| TestResult {
                id: case.name.clone(),
                test: case.test_name().to_string(),
                partition: case.partition.clone(),
                environment: case.environment.clone(),
                status: case.status,
                stage: outcome.as_ref().map(|o| o.stage),
                attempts: case.attempt,
                duration_secs: case.duration().map(|d| d.as_secs_f64()),
                stdout: outcome.as_ref().and_then(|o| o.stdout.clone()),
                stderr: outcome.as_ref().and_then(|o| o.stderr.clone()),
                output_dir: outcome.as_ref().map(|o| o.output_dir.clone()),
                metrics: outcome.as_ref().map(|o| o.metrics.clone()).unwrap_or_default(),
                reason: outcome
                    .as_ref()
                    .and_then(|o| o.reason.clone())
                    .or_else(|| reason.clone()),
            })
            .collect();
        RunReport::new(results, started.elapsed())
    }
}
