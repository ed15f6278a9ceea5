use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Result status of a test case.
///
/// `Pending` and `Running` are the only non-terminal states. Once a test case
/// reaches any other status it never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pending,
    Running,
    Pass,
    Fail,
    Skip,
    Aborted,
}

impl TestStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TestStatus::Pending | TestStatus::Running)
    }

    pub fn is_success(self) -> bool {
        self == TestStatus::Pass
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestStatus::Pending => "pending",
            TestStatus::Running => "running",
            TestStatus::Pass => "pass",
            TestStatus::Fail => "fail",
            TestStatus::Skip => "skip",
            TestStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Setup,
    Compile,
    Run,
    Wait,
    Sanity,
    Performance,
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Setup => "setup",
            Stage::Compile => "compile",
            Stage::Run => "run",
            Stage::Wait => "wait",
            Stage::Sanity => "sanity",
            Stage::Performance => "performance",
            Stage::Cleanup => "cleanup",
        };
        f.write_str(s)
    }
}

/// How a dependency edge constrains its dependent.
///
/// - `Strict`: the dependent is skipped if the dependency does not pass.
/// - `ByEnv`: like `Strict`, but the edge only exists between test cases that
///   share the same programming environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    Strict,
    ByEnv,
}

impl Default for DependencyKind {
    fn default() -> Self {
        DependencyKind::Strict
    }
}

impl FromStr for DependencyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "strict" => Ok(DependencyKind::Strict),
            "by_env" | "by-env" => Ok(DependencyKind::ByEnv),
            other => Err(format!(
                "invalid dependency kind: {other} (expected \"strict\" or \"by_env\")"
            )),
        }
    }
}

/// Execution substrate of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Slurm,
    Pbs,
    Lsf,
    Container,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Local
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendKind::Local => "local",
            BackendKind::Slurm => "slurm",
            BackendKind::Pbs => "pbs",
            BackendKind::Lsf => "lsf",
            BackendKind::Container => "container",
        };
        f.write_str(s)
    }
}

/// What to do when a performance reference is not met.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PerfFailureMode {
    /// Fail the test case at the performance stage.
    Fail,
    /// Log a warning and keep the test case passing.
    Warn,
}

impl Default for PerfFailureMode {
    fn default() -> Self {
        PerfFailureMode::Fail
    }
}

impl FromStr for PerfFailureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fail" => Ok(PerfFailureMode::Fail),
            "warn" | "warning" => Ok(PerfFailureMode::Warn),
            other => Err(format!(
                "invalid perf_failure: {other} (expected \"fail\" or \"warn\")"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!TestStatus::Pending.is_terminal());
        assert!(!TestStatus::Running.is_terminal());
        for s in [
            TestStatus::Pass,
            TestStatus::Fail,
            TestStatus::Skip,
            TestStatus::Aborted,
        ] {
            assert!(s.is_terminal(), "{s} should be terminal");
        }
    }

    #[test]
    fn dependency_kind_parses_both_spellings() {
        assert_eq!("by-env".parse::<DependencyKind>(), Ok(DependencyKind::ByEnv));
        assert_eq!(" BY_ENV ".parse::<DependencyKind>(), Ok(DependencyKind::ByEnv));
        assert!("loose".parse::<DependencyKind>().is_err());
    }

    #[test]
    fn stages_are_ordered() {
        assert!(Stage::Setup < Stage::Compile);
        assert!(Stage::Performance < Stage::Cleanup);
    }
}
