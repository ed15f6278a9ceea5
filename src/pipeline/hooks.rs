// src/pipeline/hooks.rs

//! Collaborator hooks called by the pipeline.
//!
//! The engine doesn't load modules or evaluate check expressions itself. It
//! calls [`EnvironmentHooks`] around each attempt and [`CheckHooks`] on the
//! captured output; [`PatternChecks`] is the regex-based implementation used
//! by the binary.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;

use crate::dag::TestCase;
use crate::pipeline::perf::PerfValue;

/// A programming environment as the hooks see it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    pub name: String,
    /// Exported to build and run jobs.
    pub variables: BTreeMap<String, String>,
}

impl Environment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            variables: BTreeMap::new(),
        }
    }
}

/// Entered in setup and left in cleanup, once per attempt.
pub trait EnvironmentHooks: Send + Sync {
    fn enter(&self, env: &Environment, case: &TestCase) -> Result<()>;
    fn leave(&self, env: &Environment, case: &TestCase) -> Result<()>;
}

/// Environments that are nothing but exported variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct VariableEnvironments;

impl EnvironmentHooks for VariableEnvironments {
    fn enter(&self, _env: &Environment, _case: &TestCase) -> Result<()> {
        Ok(())
    }

    fn leave(&self, _env: &Environment, _case: &TestCase) -> Result<()> {
        Ok(())
    }
}

/// Output of the run job, read back after it finished.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    Pass,
    Fail(String),
    Skip,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckReport {
    pub outcome: CheckOutcome,
    pub metrics: Vec<PerfValue>,
}

impl CheckReport {
    pub fn pass() -> Self {
        Self {
            outcome: CheckOutcome::Pass,
            metrics: Vec::new(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            outcome: CheckOutcome::Fail(reason.into()),
            metrics: Vec::new(),
        }
    }

    pub fn skip() -> Self {
        Self {
            outcome: CheckOutcome::Skip,
            metrics: Vec::new(),
        }
    }
}

/// Sanity and performance checks over captured output.
///
/// An `Err` is treated like a failing check.
pub trait CheckHooks: Send + Sync {
    fn sanity(&self, case: &TestCase, output: &CapturedOutput) -> Result<CheckReport>;

    /// Whether the performance stage runs at all for `case`.
    fn has_performance(&self, case: &TestCase) -> bool;

    fn performance(&self, case: &TestCase, output: &CapturedOutput) -> Result<CheckReport>;
}

/// Checks driven by the test definition's `sanity` and `perf` patterns.
///
/// - sanity passes when the pattern matches stdout, or when there is none;
/// - every perf pattern must extract a number, and numbers with a reference
///   must be within its bounds. All violations are reported together.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternChecks;

impl CheckHooks for PatternChecks {
    fn sanity(&self, case: &TestCase, output: &CapturedOutput) -> Result<CheckReport> {
        let Some(pattern) = &case.definition.sanity else {
            return Ok(CheckReport::pass());
        };
        if pattern.is_match(&output.stdout) {
            Ok(CheckReport::pass())
        } else {
            Ok(CheckReport::fail(format!(
                "sanity pattern '{}' not found in stdout",
                pattern.as_str()
            )))
        }
    }

    fn has_performance(&self, case: &TestCase) -> bool {
        !case.definition.perf.is_empty()
    }

    fn performance(&self, case: &TestCase, output: &CapturedOutput) -> Result<CheckReport> {
        let mut metrics = Vec::new();
        let mut failures = Vec::new();

        for perf in &case.definition.perf {
            let value = match perf.extract(&output.stdout) {
                Ok(v) => v,
                Err(e) => {
                    failures.push(format!("{}: {e}", perf.name));
                    continue;
                }
            };
            if let Some(reference) = &perf.reference
                && let Err(e) = reference.check(value)
            {
                failures.push(format!("{}: {e}", perf.name));
            }
            metrics.push(PerfValue {
                name: perf.name.clone(),
                value,
                unit: perf.unit.clone(),
                reference: perf.reference.map(|r| r.value),
            });
        }

        let outcome = if failures.is_empty() {
            CheckOutcome::Pass
        } else {
            CheckOutcome::Fail(failures.join("; "))
        };
        Ok(CheckReport { outcome, metrics })
    }
}
