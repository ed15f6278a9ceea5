// src/dag/test_case.rs

//! Test definitions and their concrete (test × partition × environment)
//! instances.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;

use crate::job::ResourceSpec;
use crate::pipeline::perf::PerfPattern;
use crate::types::{DependencyKind, Stage, TestStatus};

/// Identifier of a test case: its position in declaration order.
///
/// Ordering by id is therefore ordering by declaration, which the scheduler
/// uses as its tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TestCaseId(pub usize);

impl TestCaseId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TestCaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A resolved test definition, shared by all of its test cases.
#[derive(Debug, Clone)]
pub struct TestDefinition {
    pub name: String,
    /// Copied into the stage directory during setup.
    pub sources: Option<PathBuf>,
    pub build_cmds: Vec<String>,
    pub cmd: String,
    pub resources: ResourceSpec,
    pub variables: BTreeMap<String, String>,
    pub sanity: Option<Regex>,
    pub perf: Vec<PerfPattern>,
    pub retryable: bool,
    pub keep_files: Vec<String>,
}

impl TestDefinition {
    /// A run-only definition with default resources and no checks.
    pub fn new(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sources: None,
            build_cmds: Vec::new(),
            cmd: cmd.into(),
            resources: ResourceSpec::default(),
            variables: BTreeMap::new(),
            sanity: None,
            perf: Vec::new(),
            retryable: false,
            keep_files: Vec::new(),
        }
    }
}

/// A declared dependency. Partition and environment may be left open, in
/// which case the reference expands to several concrete test cases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyRef {
    pub test: String,
    pub kind: DependencyKind,
    pub environment: Option<String>,
    pub partition: Option<String>,
}

impl DependencyRef {
    pub fn strict(test: impl Into<String>) -> Self {
        Self {
            test: test.into(),
            kind: DependencyKind::Strict,
            environment: None,
            partition: None,
        }
    }

    pub fn by_env(test: impl Into<String>) -> Self {
        Self {
            kind: DependencyKind::ByEnv,
            ..Self::strict(test)
        }
    }
}

/// One concrete unit of work.
///
/// Owned by the execution plan; only the pipeline driving it mutates its
/// stage, attempt and timestamps, and only the scheduler records its
/// terminal status.
#[derive(Debug, Clone)]
pub struct TestCase {
    pub id: TestCaseId,
    /// Display name, `test @partition+environment`.
    pub name: String,
    pub definition: Arc<TestDefinition>,
    pub partition: String,
    pub environment: String,
    pub dependencies: Vec<DependencyRef>,

    /// Stage currently (or last) executed.
    pub stage: Option<Stage>,
    pub status: TestStatus,
    /// 1-based attempt counter; 0 until the first attempt starts.
    pub attempt: u32,

    pub queued_at: Option<Instant>,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

impl TestCase {
    pub fn new(
        id: TestCaseId,
        definition: Arc<TestDefinition>,
        partition: impl Into<String>,
        environment: impl Into<String>,
        dependencies: Vec<DependencyRef>,
    ) -> Self {
        let partition = partition.into();
        let environment = environment.into();
        Self {
            id,
            name: format!("{} @{partition}+{environment}", definition.name),
            definition,
            partition,
            environment,
            dependencies,
            stage: None,
            status: TestStatus::Pending,
            attempt: 0,
            queued_at: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn test_name(&self) -> &str {
        &self.definition.name
    }

    /// File-system and scheduler friendly name.
    pub fn job_name(&self) -> String {
        format!(
            "{}_{}_{}",
            self.definition.name, self.partition, self.environment
        )
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
    }

    /// Wall-clock time from first start to terminal state.
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end.saturating_duration_since(start)),
            _ => None,
        }
    }
}
