// src/dag/expand.rs

//! Expansion of `[[test]]` entries into concrete test cases.

use std::sync::Arc;

use regex::Regex;

use crate::config::{parse_duration, ConfigFile, DependencySpec, EngineConfig, TestConfig};
use crate::dag::test_case::{DependencyRef, TestCase, TestCaseId, TestDefinition};
use crate::errors::{HpctestError, Result};
use crate::job::ResourceSpec;
use crate::pipeline::perf::{PerfPattern, PerfReference};

/// One test case per (test × partition × environment), in declaration order.
pub fn expand_test_cases(cfg: &ConfigFile) -> Result<Vec<TestCase>> {
    let mut cases = Vec::new();

    for test in &cfg.test {
        let definition = Arc::new(definition_from_config(test, &cfg.engine)?);
        let dependencies: Vec<DependencyRef> =
            test.depends_on.iter().map(DependencyRef::from).collect();

        for partition in &test.partitions {
            for environment in &test.environments {
                let id = TestCaseId(cases.len());
                cases.push(TestCase::new(
                    id,
                    Arc::clone(&definition),
                    partition.as_str(),
                    environment.as_str(),
                    dependencies.clone(),
                ));
            }
        }
    }

    Ok(cases)
}

/// Resolve a `[[test]]` entry: parse durations, compile patterns.
pub fn definition_from_config(test: &TestConfig, engine: &EngineConfig) -> Result<TestDefinition> {
    let config_err = |what: &str, e: String| {
        HpctestError::ConfigError(format!("test '{}': {what}: {e}", test.name))
    };

    let time_limit = match &test.time_limit {
        Some(raw) => parse_duration(raw).map_err(|e| config_err("time_limit", e))?,
        None => engine.default_time_limit,
    };

    let sanity = test
        .sanity
        .as_deref()
        .map(Regex::new)
        .transpose()
        .map_err(|e| config_err("sanity", e.to_string()))?;

    let mut perf = Vec::with_capacity(test.perf.len());
    for (name, p) in &test.perf {
        let pattern =
            Regex::new(&p.pattern).map_err(|e| config_err(&format!("perf.{name}"), e.to_string()))?;
        perf.push(PerfPattern {
            name: name.clone(),
            pattern,
            unit: p.unit.clone(),
            reference: p.reference.map(|value| PerfReference {
                value,
                lower: p.lower,
                upper: p.upper,
            }),
        });
    }

    Ok(TestDefinition {
        name: test.name.clone(),
        sources: test.sources.clone(),
        build_cmds: test.build_cmds.clone(),
        cmd: test.cmd.clone(),
        resources: ResourceSpec {
            num_tasks: test.num_tasks,
            num_tasks_per_node: test.num_tasks_per_node,
            num_cpus_per_task: test.num_cpus_per_task,
            time_limit: Some(time_limit),
        },
        variables: test.variables.clone(),
        sanity,
        perf,
        retryable: test.retryable,
        keep_files: test.keep_files.clone(),
    })
}

impl From<&DependencySpec> for DependencyRef {
    fn from(spec: &DependencySpec) -> Self {
        Self {
            test: spec.test.clone(),
            kind: spec.kind,
            environment: spec.environment.clone(),
            partition: spec.partition.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::RawConfigFile;
    use crate::types::DependencyKind;

    fn config(toml_src: &str) -> ConfigFile {
        let raw: RawConfigFile = toml::from_str(toml_src).expect("toml");
        ConfigFile::try_from(raw).expect("valid config")
    }

    #[test]
    fn expands_in_declaration_order() {
        let cfg = config(
            r#"
            [partition.a]
            [partition.b]
            [environment.gnu]
            [environment.intel]

            [[test]]
            name = "build"
            partitions = ["b", "a"]
            environments = ["gnu", "intel"]
            cmd = "make"

            [[test]]
            name = "run"
            partitions = ["a"]
            environments = ["gnu"]
            cmd = "./run"
            time_limit = "30s"
            depends_on = [{ test = "build", kind = "by_env" }]
            "#,
        );

        let cases = expand_test_cases(&cfg).expect("expand");
        let names: Vec<&str> = cases.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "build @b+gnu",
                "build @b+intel",
                "build @a+gnu",
                "build @a+intel",
                "run @a+gnu",
            ]
        );
        assert!(cases.iter().enumerate().all(|(i, c)| c.id == TestCaseId(i)));

        let run = &cases[4];
        assert_eq!(run.dependencies[0].kind, DependencyKind::ByEnv);
        assert_eq!(
            run.definition.resources.time_limit,
            Some(Duration::from_secs(30))
        );
        // Default time limit applies when none is set.
        assert_eq!(
            cases[0].definition.resources.time_limit,
            Some(Duration::from_secs(600))
        );
        // Cases of one test share the definition.
        assert!(Arc::ptr_eq(&cases[0].definition, &cases[3].definition));
    }

    #[test]
    fn compiles_perf_patterns_with_references() {
        let cfg = config(
            r#"
            [partition.a]
            [environment.gnu]

            [[test]]
            name = "stream"
            partitions = ["a"]
            environments = ["gnu"]
            cmd = "./stream"
            sanity = "Solution Validates"

            [test.perf.triad]
            pattern = 'Triad:\s+(\S+)'
            reference = 100.0
            lower = -0.1
            unit = "GB/s"
            "#,
        );

        let cases = expand_test_cases(&cfg).expect("expand");
        let def = &cases[0].definition;
        assert!(def.sanity.as_ref().is_some_and(|r| r.is_match("Solution Validates")));
        assert_eq!(def.perf.len(), 1);
        let reference = def.perf[0].reference.expect("reference");
        assert_eq!(reference.lower_bound(), Some(90.0));
        assert_eq!(reference.upper_bound(), None);
    }
}
