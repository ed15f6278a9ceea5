#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use hpctest::config::{
    ConfigFile, ConfigSection, DependencySpec, EnvironmentConfig, PartitionConfig, PerfConfig,
    RawConfigFile, TestConfig,
};
use hpctest::types::{BackendKind, DependencyKind, PerfFailureMode};

/// Partition and environment every builder starts with.
pub const PARTITION: &str = "p";
pub const ENVIRONMENT: &str = "e";

/// Builder for `ConfigFile` to simplify test setup.
///
/// Starts with one local partition [`PARTITION`], one environment
/// [`ENVIRONMENT`] and fast polling/backoff so tests don't sleep long.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        let config = ConfigSection {
            poll_interval: "5ms".to_string(),
            submission_backoff: "5ms".to_string(),
            ..ConfigSection::default()
        };
        Self {
            config: RawConfigFile {
                config,
                partition: BTreeMap::from([(PARTITION.to_string(), local_partition())]),
                environment: BTreeMap::from([(ENVIRONMENT.to_string(), EnvironmentConfig::default())]),
                test: Vec::new(),
            },
        }
    }

    pub fn with_test(mut self, test: TestConfig) -> Self {
        self.config.test.push(test);
        self
    }

    pub fn with_partition(mut self, name: &str, partition: PartitionConfig) -> Self {
        self.config.partition.insert(name.to_string(), partition);
        self
    }

    pub fn with_environment(mut self, name: &str, vars: &[(&str, &str)]) -> Self {
        let variables = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.config
            .environment
            .insert(name.to_string(), EnvironmentConfig { variables });
        self
    }

    pub fn max_jobs(mut self, n: usize) -> Self {
        self.config.config.max_jobs = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.config.max_retries = n;
        self
    }

    pub fn submission_retries(mut self, n: u32) -> Self {
        self.config.config.submission_retries = n;
        self
    }

    pub fn poll_interval(mut self, d: &str) -> Self {
        self.config.config.poll_interval = d.to_string();
        self
    }

    pub fn default_time_limit(mut self, d: &str) -> Self {
        self.config.config.default_time_limit = d.to_string();
        self
    }

    pub fn max_pending_time(mut self, d: &str) -> Self {
        self.config.config.max_pending_time = d.to_string();
        self
    }

    pub fn perf_failure(mut self, mode: PerfFailureMode) -> Self {
        self.config.config.perf_failure = mode;
        self
    }

    pub fn keep_stage_files(mut self, keep: bool) -> Self {
        self.config.config.keep_stage_files = keep;
        self
    }

    /// Put stage and output directories under `root`.
    pub fn with_prefixes(mut self, root: &Path) -> Self {
        self.config.config.stage_prefix = root.join("stage");
        self.config.config.output_prefix = root.join("output");
        self
    }

    pub fn build_raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn local_partition() -> PartitionConfig {
    PartitionConfig::default()
}

pub fn partition(backend: BackendKind, max_jobs: Option<usize>) -> PartitionConfig {
    PartitionConfig {
        backend,
        max_jobs,
        ..PartitionConfig::default()
    }
}

/// Builder for `TestConfig`, defaulting to [`PARTITION`] and [`ENVIRONMENT`].
pub struct TestConfigBuilder {
    test: TestConfig,
}

impl TestConfigBuilder {
    pub fn new(name: &str, cmd: &str) -> Self {
        Self {
            test: TestConfig {
                name: name.to_string(),
                partitions: vec![PARTITION.to_string()],
                environments: vec![ENVIRONMENT.to_string()],
                sources: None,
                build_cmds: vec![],
                cmd: cmd.to_string(),
                num_tasks: 1,
                num_tasks_per_node: None,
                num_cpus_per_task: None,
                time_limit: None,
                variables: BTreeMap::new(),
                sanity: None,
                perf: BTreeMap::new(),
                retryable: false,
                keep_files: vec![],
                depends_on: vec![],
            },
        }
    }

    pub fn partitions(mut self, parts: &[&str]) -> Self {
        self.test.partitions = parts.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn environments(mut self, envs: &[&str]) -> Self {
        self.test.environments = envs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn depends_on(mut self, test: &str) -> Self {
        self.test.depends_on.push(DependencySpec {
            test: test.to_string(),
            kind: DependencyKind::Strict,
            environment: None,
            partition: None,
        });
        self
    }

    pub fn depends_on_by_env(mut self, test: &str) -> Self {
        self.test.depends_on.push(DependencySpec {
            test: test.to_string(),
            kind: DependencyKind::ByEnv,
            environment: None,
            partition: None,
        });
        self
    }

    pub fn build_cmd(mut self, cmd: &str) -> Self {
        self.test.build_cmds.push(cmd.to_string());
        self
    }

    pub fn sources(mut self, dir: impl Into<PathBuf>) -> Self {
        self.test.sources = Some(dir.into());
        self
    }

    pub fn sanity(mut self, pattern: &str) -> Self {
        self.test.sanity = Some(pattern.to_string());
        self
    }

    pub fn perf(mut self, metric: &str, pattern: &str, reference: f64, lower: f64, upper: f64) -> Self {
        self.test.perf.insert(
            metric.to_string(),
            PerfConfig {
                pattern: pattern.to_string(),
                reference: Some(reference),
                lower: Some(lower),
                upper: Some(upper),
                unit: None,
            },
        );
        self
    }

    pub fn time_limit(mut self, limit: &str) -> Self {
        self.test.time_limit = Some(limit.to_string());
        self
    }

    pub fn retryable(mut self) -> Self {
        self.test.retryable = true;
        self
    }

    pub fn keep_file(mut self, file: &str) -> Self {
        self.test.keep_files.push(file.to_string());
        self
    }

    pub fn variable(mut self, key: &str, value: &str) -> Self {
        self.test.variables.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> TestConfig {
        self.test
    }
}
