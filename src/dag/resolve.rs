// src/dag/resolve.rs

//! Eager expansion of declared dependency references into concrete edges.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::dag::test_case::{TestCase, TestCaseId};
use crate::errors::{HpctestError, Result};
use crate::types::DependencyKind;

/// "`dependent` must not start before `dependency` passed."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyEdge {
    pub dependent: TestCaseId,
    pub dependency: TestCaseId,
    pub kind: DependencyKind,
}

/// Expand every test case's dependency references into a flat edge list.
///
/// A reference matches the test cases of the named test that
///
/// - run on the pinned partition, or the dependent's own partition;
/// - run with the pinned environment (`strict`), or with the dependent's
///   own environment (`by_env`). Unpinned `strict` references match every
///   environment. A pinned `by_env` reference only applies to the
///   dependent's test case in that environment.
///
/// If the same pair is produced twice, a `strict` edge wins over `by_env`.
/// The result is sorted by (dependent, dependency).
pub fn resolve_edges(cases: &[TestCase]) -> Result<Vec<DependencyEdge>> {
    let mut by_test: HashMap<&str, Vec<&TestCase>> = HashMap::new();
    for case in cases {
        by_test.entry(case.test_name()).or_default().push(case);
    }

    let mut edges: BTreeMap<(TestCaseId, TestCaseId), DependencyKind> = BTreeMap::new();

    for case in cases {
        for dep in &case.dependencies {
            let Some(candidates) = by_test.get(dep.test.as_str()) else {
                return Err(HpctestError::UnknownDependency {
                    dependent: case.test_name().to_string(),
                    dependency: dep.test.clone(),
                });
            };

            let partition = dep.partition.as_deref().unwrap_or(&case.partition);
            let environment = match dep.kind {
                DependencyKind::Strict => dep.environment.as_deref(),
                DependencyKind::ByEnv => {
                    if dep.environment.as_ref().is_some_and(|pin| *pin != case.environment) {
                        debug!(
                            test = %case.name,
                            dependency = %dep.test,
                            "by_env dependency pinned to another environment; no edge"
                        );
                        continue;
                    }
                    Some(case.environment.as_str())
                }
            };

            let mut matched = 0usize;
            for target in candidates {
                if target.partition != partition {
                    continue;
                }
                if environment.is_some_and(|env| target.environment != env) {
                    continue;
                }
                matched += 1;
                edges
                    .entry((case.id, target.id))
                    .and_modify(|kind| {
                        if dep.kind == DependencyKind::Strict {
                            *kind = DependencyKind::Strict;
                        }
                    })
                    .or_insert(dep.kind);
            }

            if matched == 0 {
                warn!(
                    test = %case.name,
                    dependency = %dep.test,
                    partition = %partition,
                    environment = environment.unwrap_or("*"),
                    "dependency matches no test case; ignoring"
                );
            }
        }
    }

    Ok(edges
        .into_iter()
        .map(|((dependent, dependency), kind)| DependencyEdge {
            dependent,
            dependency,
            kind,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dag::test_case::{DependencyRef, TestDefinition};

    fn case(id: usize, test: &str, part: &str, env: &str, deps: Vec<DependencyRef>) -> TestCase {
        let def = Arc::new(TestDefinition::new(test, "true"));
        TestCase::new(TestCaseId(id), def, part, env, deps)
    }

    #[test]
    fn strict_reference_expands_to_all_environments_on_same_partition() {
        let cases = vec![
            case(0, "build", "p1", "gnu", vec![]),
            case(1, "build", "p1", "intel", vec![]),
            case(2, "build", "p2", "gnu", vec![]),
            case(3, "run", "p1", "gnu", vec![DependencyRef::strict("build")]),
        ];
        let edges = resolve_edges(&cases).expect("resolve");
        let deps: Vec<usize> = edges.iter().map(|e| e.dependency.0).collect();
        assert_eq!(deps, vec![0, 1]);
        assert!(edges.iter().all(|e| e.dependent == TestCaseId(3)));
    }

    #[test]
    fn by_env_reference_matches_own_environment_only() {
        let cases = vec![
            case(0, "build", "p1", "gnu", vec![]),
            case(1, "build", "p1", "intel", vec![]),
            case(2, "run", "p1", "intel", vec![DependencyRef::by_env("build")]),
        ];
        let edges = resolve_edges(&cases).expect("resolve");
        assert_eq!(
            edges,
            vec![DependencyEdge {
                dependent: TestCaseId(2),
                dependency: TestCaseId(1),
                kind: DependencyKind::ByEnv,
            }]
        );
    }

    #[test]
    fn pinned_partition_and_environment() {
        let mut dep = DependencyRef::strict("build");
        dep.partition = Some("login".into());
        dep.environment = Some("gnu".into());
        let cases = vec![
            case(0, "build", "login", "gnu", vec![]),
            case(1, "build", "login", "intel", vec![]),
            case(2, "run", "compute", "intel", vec![dep]),
        ];
        let edges = resolve_edges(&cases).expect("resolve");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].dependency, TestCaseId(0));
    }

    #[test]
    fn pinned_by_env_never_crosses_environments() {
        let mut dep = DependencyRef::by_env("build");
        dep.environment = Some("gnu".into());
        let cases = vec![
            case(0, "build", "p1", "gnu", vec![]),
            case(1, "build", "p1", "intel", vec![]),
            case(2, "run", "p1", "intel", vec![dep.clone()]),
            case(3, "run", "p1", "gnu", vec![dep]),
        ];
        let edges = resolve_edges(&cases).expect("resolve");
        assert_eq!(
            edges,
            vec![DependencyEdge {
                dependent: TestCaseId(3),
                dependency: TestCaseId(0),
                kind: DependencyKind::ByEnv,
            }]
        );
    }

    #[test]
    fn strict_wins_over_by_env_for_the_same_pair() {
        let cases = vec![
            case(0, "build", "p1", "gnu", vec![]),
            case(
                1,
                "run",
                "p1",
                "gnu",
                vec![DependencyRef::by_env("build"), DependencyRef::strict("build")],
            ),
        ];
        let edges = resolve_edges(&cases).expect("resolve");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].kind, DependencyKind::Strict);
    }

    #[test]
    fn unknown_test_is_an_error_but_unmatched_case_is_not() {
        let cases = vec![case(0, "run", "p1", "gnu", vec![DependencyRef::strict("nope")])];
        assert!(matches!(
            resolve_edges(&cases),
            Err(HpctestError::UnknownDependency { .. })
        ));

        let cases = vec![
            case(0, "build", "p2", "gnu", vec![]),
            case(1, "run", "p1", "gnu", vec![DependencyRef::strict("build")]),
        ];
        assert!(resolve_edges(&cases).expect("resolve").is_empty());
    }
}
