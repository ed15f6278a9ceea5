// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::types::{BackendKind, DependencyKind, PerfFailureMode};

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [config]
/// max_jobs = 4
///
/// [partition.login]
/// backend = "local"
///
/// [environment.gnu]
/// variables = { CC = "gcc" }
///
/// [[test]]
/// name = "hello"
/// partitions = ["login"]
/// environments = ["gnu"]
/// cmd = "./hello"
/// ```
///
/// Tests are an array of tables so that declaration order survives
/// deserialization; it drives admission order in the scheduler.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub config: ConfigSection,

    #[serde(default)]
    pub partition: BTreeMap<String, PartitionConfig>,

    #[serde(default)]
    pub environment: BTreeMap<String, EnvironmentConfig>,

    #[serde(default)]
    pub test: Vec<TestConfig>,
}

/// Validated configuration.
///
/// Only constructed through `TryFrom<RawConfigFile>` (see `validate.rs`), so
/// holders can rely on references being resolvable and durations parsed.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub engine: EngineConfig,
    pub partition: BTreeMap<String, PartitionConfig>,
    pub environment: BTreeMap<String, EnvironmentConfig>,
    pub test: Vec<TestConfig>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        engine: EngineConfig,
        partition: BTreeMap<String, PartitionConfig>,
        environment: BTreeMap<String, EnvironmentConfig>,
        test: Vec<TestConfig>,
    ) -> Self {
        Self {
            engine,
            partition,
            environment,
            test,
        }
    }
}

/// `[config]` section, as written in TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigSection {
    /// Global limit on concurrently admitted test cases.
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,

    /// Sleep between scheduling rounds in which no pipeline made progress.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// How many times a rejected job submission is retried.
    #[serde(default = "default_submission_retries")]
    pub submission_retries: u32,

    /// Base delay of the exponential submission backoff.
    #[serde(default = "default_submission_backoff")]
    pub submission_backoff: String,

    /// Extra attempts granted to tests marked `retryable`.
    #[serde(default)]
    pub max_retries: u32,

    /// Transient queue-query failures tolerated per poll.
    #[serde(default = "default_poll_retries")]
    pub poll_retries: u32,

    /// Wall-time limit for tests that don't set `time_limit`.
    #[serde(default = "default_time_limit")]
    pub default_time_limit: String,

    /// How long a submitted job may sit in the queue without starting
    /// before it is cancelled.
    #[serde(default = "default_max_pending_time")]
    pub max_pending_time: String,

    /// Bound on each scheduler or container-runtime command (`sbatch`,
    /// `sacct`, `docker rm`, ...).
    #[serde(default = "default_command_timeout")]
    pub command_timeout: String,

    #[serde(default)]
    pub perf_failure: PerfFailureMode,

    #[serde(default = "default_stage_prefix")]
    pub stage_prefix: PathBuf,

    #[serde(default = "default_output_prefix")]
    pub output_prefix: PathBuf,

    /// Keep stage directories of passing tests.
    #[serde(default)]
    pub keep_stage_files: bool,
}

fn default_max_jobs() -> usize {
    8
}

fn default_poll_interval() -> String {
    "200ms".to_string()
}

fn default_submission_retries() -> u32 {
    3
}

fn default_submission_backoff() -> String {
    "1s".to_string()
}

fn default_poll_retries() -> u32 {
    3
}

fn default_time_limit() -> String {
    "10m".to_string()
}

fn default_max_pending_time() -> String {
    "1h".to_string()
}

fn default_command_timeout() -> String {
    "10s".to_string()
}

fn default_stage_prefix() -> PathBuf {
    PathBuf::from("stage")
}

fn default_output_prefix() -> PathBuf {
    PathBuf::from("output")
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            max_jobs: default_max_jobs(),
            poll_interval: default_poll_interval(),
            submission_retries: default_submission_retries(),
            submission_backoff: default_submission_backoff(),
            max_retries: 0,
            poll_retries: default_poll_retries(),
            default_time_limit: default_time_limit(),
            max_pending_time: default_max_pending_time(),
            command_timeout: default_command_timeout(),
            perf_failure: PerfFailureMode::default(),
            stage_prefix: default_stage_prefix(),
            output_prefix: default_output_prefix(),
            keep_stage_files: false,
        }
    }
}

/// Typed engine settings derived from `[config]` and the partition limits.
///
/// This is the already-validated structure the execution engine consumes.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_jobs: usize,
    pub partition_limits: BTreeMap<String, usize>,
    pub poll_interval: Duration,
    pub submission_retries: u32,
    pub submission_backoff: Duration,
    pub max_retries: u32,
    pub poll_retries: u32,
    pub default_time_limit: Duration,
    pub max_pending_time: Duration,
    pub command_timeout: Duration,
    pub perf_failure: PerfFailureMode,
    pub stage_prefix: PathBuf,
    pub output_prefix: PathBuf,
    pub keep_stage_files: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_jobs: default_max_jobs(),
            partition_limits: BTreeMap::new(),
            poll_interval: Duration::from_millis(200),
            submission_retries: default_submission_retries(),
            submission_backoff: Duration::from_secs(1),
            max_retries: 0,
            poll_retries: default_poll_retries(),
            default_time_limit: Duration::from_secs(600),
            max_pending_time: Duration::from_secs(3600),
            command_timeout: Duration::from_secs(10),
            perf_failure: PerfFailureMode::default(),
            stage_prefix: default_stage_prefix(),
            output_prefix: default_output_prefix(),
            keep_stage_files: false,
        }
    }
}

/// `[partition.<name>]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PartitionConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Optional per-partition concurrency limit.
    #[serde(default)]
    pub max_jobs: Option<usize>,

    /// Extra scheduler options emitted as job-script directives.
    #[serde(default)]
    pub access: Vec<String>,

    /// Container image (container backend only).
    #[serde(default)]
    pub image: Option<String>,

    /// Container runtime executable (container backend only).
    #[serde(default)]
    pub runtime: Option<String>,
}

/// `[environment.<name>]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EnvironmentConfig {
    /// Variables exported to build and run jobs.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// One `[[test]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct TestConfig {
    pub name: String,

    /// Partitions this test runs on.
    pub partitions: Vec<String>,

    /// Programming environments this test runs with.
    pub environments: Vec<String>,

    /// Directory copied into the stage directory during setup.
    #[serde(default)]
    pub sources: Option<PathBuf>,

    /// Build commands, joined with `&&` into a single build job.
    #[serde(default)]
    pub build_cmds: Vec<String>,

    /// The command to run.
    pub cmd: String,

    #[serde(default = "default_num_tasks")]
    pub num_tasks: u32,

    #[serde(default)]
    pub num_tasks_per_node: Option<u32>,

    #[serde(default)]
    pub num_cpus_per_task: Option<u32>,

    /// Wall-time limit (e.g. `"5m"`); falls back to `[config].default_time_limit`.
    #[serde(default)]
    pub time_limit: Option<String>,

    /// Test-specific variables, layered on top of the environment's.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,

    /// Regex that must match the job's stdout for the test to pass.
    #[serde(default)]
    pub sanity: Option<String>,

    /// Performance metrics extracted from stdout.
    #[serde(default)]
    pub perf: BTreeMap<String, PerfConfig>,

    /// Whether a failing attempt may be restarted from setup.
    #[serde(default)]
    pub retryable: bool,

    /// Files (relative to the stage dir) copied to the output dir on cleanup.
    #[serde(default)]
    pub keep_files: Vec<String>,

    #[serde(default)]
    pub depends_on: Vec<DependencySpec>,
}

fn default_num_tasks() -> u32 {
    1
}

/// One entry of `depends_on`.
#[derive(Debug, Clone, Deserialize)]
pub struct DependencySpec {
    pub test: String,

    #[serde(default)]
    pub kind: DependencyKind,

    /// Pin the dependency to one environment.
    #[serde(default)]
    pub environment: Option<String>,

    /// Pin the dependency to one partition (default: the dependent's own).
    #[serde(default)]
    pub partition: Option<String>,
}

/// `[test.perf.<metric>]`.
#[derive(Debug, Clone, Deserialize)]
pub struct PerfConfig {
    /// Regex whose first capture group is the metric value.
    pub pattern: String,

    #[serde(default)]
    pub reference: Option<f64>,

    /// Lower relative threshold, e.g. `-0.05` for "at most 5% below".
    #[serde(default)]
    pub lower: Option<f64>,

    /// Upper relative threshold.
    #[serde(default)]
    pub upper: Option<f64>,

    #[serde(default)]
    pub unit: Option<String>,
}
