// src/config/validate.rs

use std::collections::{BTreeMap, HashSet};

use regex::Regex;

use crate::config::duration::parse_duration;
use crate::config::model::{ConfigFile, ConfigSection, EngineConfig, RawConfigFile};
use crate::errors::{HpctestError, Result};
use crate::types::{BackendKind, DependencyKind};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = HpctestError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_config(&raw)?;
        let engine = engine_config(&raw)?;
        Ok(ConfigFile::new_unchecked(
            engine,
            raw.partition,
            raw.environment,
            raw.test,
        ))
    }
}

/// Run every structural check on a raw config.
///
/// Dependency cycles are *not* checked here: they are a property of the
/// expanded test cases (a by-name dependency may be acyclic once partitions
/// are taken into account) and are detected when the dependency graph is
/// built.
pub fn validate_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_tests(cfg)?;
    validate_global_config(&cfg.config)?;
    validate_partitions(cfg)?;
    validate_tests(cfg)?;
    validate_test_dependencies(cfg)?;
    Ok(())
}

fn ensure_has_tests(cfg: &RawConfigFile) -> Result<()> {
    if cfg.test.is_empty() {
        return Err(HpctestError::ConfigError(
            "config must contain at least one [[test]] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_global_config(section: &ConfigSection) -> Result<()> {
    if section.max_jobs == 0 {
        return Err(HpctestError::ConfigError(
            "[config].max_jobs must be >= 1 (got 0)".to_string(),
        ));
    }

    for (key, value) in [
        ("poll_interval", &section.poll_interval),
        ("submission_backoff", &section.submission_backoff),
        ("default_time_limit", &section.default_time_limit),
        ("max_pending_time", &section.max_pending_time),
        ("command_timeout", &section.command_timeout),
    ] {
        let parsed = parse_duration(value)
            .map_err(|e| HpctestError::ConfigError(format!("[config].{key}: {e}")))?;
        if parsed.is_zero() && matches!(key, "max_pending_time" | "command_timeout") {
            return Err(HpctestError::ConfigError(format!(
                "[config].{key} must be greater than zero"
            )));
        }
    }

    Ok(())
}

fn validate_partitions(cfg: &RawConfigFile) -> Result<()> {
    for (name, part) in cfg.partition.iter() {
        if part.max_jobs == Some(0) {
            return Err(HpctestError::ConfigError(format!(
                "partition '{name}': max_jobs must be >= 1"
            )));
        }
        if part.backend == BackendKind::Container && part.image.is_none() {
            return Err(HpctestError::ConfigError(format!(
                "partition '{name}': container backend requires `image`"
            )));
        }
    }
    Ok(())
}

fn validate_tests(cfg: &RawConfigFile) -> Result<()> {
    let mut seen = HashSet::new();

    for test in cfg.test.iter() {
        let name = &test.name;
        if !seen.insert(name.as_str()) {
            return Err(HpctestError::ConfigError(format!(
                "duplicate test name '{name}'"
            )));
        }

        if test.partitions.is_empty() || test.environments.is_empty() {
            return Err(HpctestError::ConfigError(format!(
                "test '{name}' must list at least one partition and one environment"
            )));
        }

        for part in test.partitions.iter() {
            if !cfg.partition.contains_key(part) {
                return Err(HpctestError::ConfigError(format!(
                    "test '{name}' references unknown partition '{part}'"
                )));
            }
        }

        for env in test.environments.iter() {
            if !cfg.environment.contains_key(env) {
                return Err(HpctestError::ConfigError(format!(
                    "test '{name}' references unknown environment '{env}'"
                )));
            }
        }

        if test.num_tasks == 0 {
            return Err(HpctestError::ConfigError(format!(
                "test '{name}': num_tasks must be >= 1"
            )));
        }

        if let Some(ref limit) = test.time_limit {
            parse_duration(limit).map_err(|e| {
                HpctestError::ConfigError(format!("test '{name}': time_limit: {e}"))
            })?;
        }

        if let Some(ref pattern) = test.sanity {
            Regex::new(pattern).map_err(|e| {
                HpctestError::ConfigError(format!("test '{name}': invalid sanity regex: {e}"))
            })?;
        }

        for (metric, perf) in test.perf.iter() {
            let re = Regex::new(&perf.pattern).map_err(|e| {
                HpctestError::ConfigError(format!(
                    "test '{name}': invalid regex for metric '{metric}': {e}"
                ))
            })?;
            if re.captures_len() < 2 {
                return Err(HpctestError::ConfigError(format!(
                    "test '{name}': pattern for metric '{metric}' needs a capture group"
                )));
            }
        }
    }

    Ok(())
}

fn validate_test_dependencies(cfg: &RawConfigFile) -> Result<()> {
    let names: HashSet<&str> = cfg.test.iter().map(|t| t.name.as_str()).collect();

    for test in cfg.test.iter() {
        for dep in test.depends_on.iter() {
            if !names.contains(dep.test.as_str()) {
                return Err(HpctestError::UnknownDependency {
                    dependent: test.name.clone(),
                    dependency: dep.test.clone(),
                });
            }
            if dep.test == test.name {
                return Err(HpctestError::ConfigError(format!(
                    "test '{}' cannot depend on itself",
                    test.name
                )));
            }
            if dep.kind == DependencyKind::ByEnv
                && let Some(ref env) = dep.environment
                && !test.environments.contains(env)
            {
                return Err(HpctestError::ConfigError(format!(
                    "test '{}' pins by_env dependency '{}' to environment '{env}', \
                     which the test does not run with",
                    test.name, dep.test
                )));
            }
            if let Some(ref part) = dep.partition {
                if !cfg.partition.contains_key(part) {
                    return Err(HpctestError::ConfigError(format!(
                        "test '{}' pins dependency '{}' to unknown partition '{part}'",
                        test.name, dep.test
                    )));
                }
            }
        }
    }
    Ok(())
}

fn engine_config(raw: &RawConfigFile) -> Result<EngineConfig> {
    let c = &raw.config;
    let dur = |key: &str, value: &str| {
        parse_duration(value)
            .map_err(|e| HpctestError::ConfigError(format!("[config].{key}: {e}")))
    };

    let partition_limits: BTreeMap<String, usize> = raw
        .partition
        .iter()
        .filter_map(|(name, p)| p.max_jobs.map(|n| (name.clone(), n)))
        .collect();

    Ok(EngineConfig {
        max_jobs: c.max_jobs,
        partition_limits,
        poll_interval: dur("poll_interval", &c.poll_interval)?,
        submission_retries: c.submission_retries,
        submission_backoff: dur("submission_backoff", &c.submission_backoff)?,
        max_retries: c.max_retries,
        poll_retries: c.poll_retries,
        default_time_limit: dur("default_time_limit", &c.default_time_limit)?,
        max_pending_time: dur("max_pending_time", &c.max_pending_time)?,
        command_timeout: dur("command_timeout", &c.command_timeout)?,
        perf_failure: c.perf_failure,
        stage_prefix: c.stage_prefix.clone(),
        output_prefix: c.output_prefix.clone(),
        keep_stage_files: c.keep_stage_files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Result<ConfigFile> {
        let raw: RawConfigFile = toml::from_str(src)?;
        ConfigFile::try_from(raw)
    }

    const PARTS: &str = r#"
[partition.login]
backend = "local"
max_jobs = 2

[environment.gnu]
variables = { CC = "gcc" }
"#;

    #[test]
    fn valid_config_produces_engine_settings() {
        let src = format!(
            r#"
[config]
max_jobs = 3
poll_interval = "50ms"
{PARTS}
[[test]]
name = "hello"
partitions = ["login"]
environments = ["gnu"]
cmd = "echo hello"
"#
        );
        let cfg = parse(&src).expect("config should validate");
        assert_eq!(cfg.engine.max_jobs, 3);
        assert_eq!(cfg.engine.poll_interval.as_millis(), 50);
        assert_eq!(cfg.engine.partition_limits.get("login"), Some(&2));
        assert_eq!(cfg.engine.max_pending_time.as_secs(), 3600);
        assert_eq!(cfg.engine.command_timeout.as_secs(), 10);
    }

    #[test]
    fn zero_max_jobs_is_rejected() {
        let src = format!(
            "[config]\nmax_jobs = 0\n{PARTS}\n[[test]]\nname = \"a\"\npartitions = [\"login\"]\nenvironments = [\"gnu\"]\ncmd = \"true\"\n"
        );
        match parse(&src) {
            Err(HpctestError::ConfigError(msg)) => assert!(msg.contains("max_jobs")),
            other => panic!("expected ConfigError, got {other:?}"),
        }
    }

    #[test]
    fn perf_pattern_without_group_is_rejected() {
        let src = format!(
            r#"{PARTS}
[[test]]
name = "bw"
partitions = ["login"]
environments = ["gnu"]
cmd = "true"

[test.perf.bandwidth]
pattern = "BW: \\S+"
"#
        );
        match parse(&src) {
            Err(HpctestError::ConfigError(msg)) => assert!(msg.contains("capture group")),
            other => panic!("expected ConfigError, got {other:?}"),
        }
    }

    #[test]
    fn by_env_pin_outside_own_environments_is_rejected() {
        let src = format!(
            r#"{PARTS}
[environment.intel]

[[test]]
name = "build"
partitions = ["login"]
environments = ["gnu", "intel"]
cmd = "make"

[[test]]
name = "run"
partitions = ["login"]
environments = ["intel"]
cmd = "./a.out"
depends_on = [{{ test = "build", kind = "by_env", environment = "gnu" }}]
"#
        );
        match parse(&src) {
            Err(HpctestError::ConfigError(msg)) => {
                assert!(msg.contains("by_env dependency 'build'"), "{msg}")
            }
            other => panic!("expected ConfigError, got {other:?}"),
        }
    }

    #[test]
    fn zero_pending_time_is_rejected() {
        let src = format!(
            "[config]\nmax_pending_time = \"0s\"\n{PARTS}\n[[test]]\nname = \"a\"\npartitions = [\"login\"]\nenvironments = [\"gnu\"]\ncmd = \"true\"\n"
        );
        match parse(&src) {
            Err(HpctestError::ConfigError(msg)) => assert!(msg.contains("max_pending_time"), "{msg}"),
            other => panic!("expected ConfigError, got {other:?}"),
        }
    }

    #[test]
    fn unknown_environment_is_rejected() {
        let src = format!(
            "{PARTS}\n[[test]]\nname = \"a\"\npartitions = [\"login\"]\nenvironments = [\"intel\"]\ncmd = \"true\"\n"
        );
        assert!(matches!(parse(&src), Err(HpctestError::ConfigError(_))));
    }
}
