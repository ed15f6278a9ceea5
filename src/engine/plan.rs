// src/engine/plan.rs

use crate::config::ConfigFile;
use crate::dag::{expand_test_cases, DependencyGraph, TestCase, TestCaseId};
use crate::errors::Result;

/// The working set of a run: every test case plus the validated graph
/// between them. Built once, before anything executes.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub cases: Vec<TestCase>,
    pub graph: DependencyGraph,
}

impl ExecutionPlan {
    /// Fails on unknown dependencies and dependency cycles.
    pub fn build(cases: Vec<TestCase>) -> Result<Self> {
        let graph = DependencyGraph::build(&cases)?;
        Ok(Self { cases, graph })
    }

    pub fn from_config(cfg: &ConfigFile) -> Result<Self> {
        Self::build(expand_test_cases(cfg)?)
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn case(&self, id: TestCaseId) -> Option<&TestCase> {
        self.cases.get(id.index())
    }

    /// Human-readable listing for `--dry-run`.
    pub fn describe(&self) -> String {
        let mut out = format!("{} test case(s):\n", self.cases.len());
        for case in &self.cases {
            let deps: Vec<&str> = self
                .graph
                .dependencies_of(case.id)
                .into_iter()
                .map(|d| self.graph.name_of(d))
                .collect();
            if deps.is_empty() {
                out.push_str(&format!("  {}\n", case.name));
            } else {
                out.push_str(&format!("  {}  <- {}\n", case.name, deps.join(", ")));
            }
        }
        out.push_str("execution order:\n");
        for (n, id) in self.graph.topological_order().into_iter().enumerate() {
            out.push_str(&format!("  {:>3}. {}\n", n + 1, self.graph.name_of(id)));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dag::{DependencyRef, TestDefinition};
    use crate::errors::HpctestError;

    fn case(id: usize, name: &str, deps: Vec<DependencyRef>) -> TestCase {
        TestCase::new(
            TestCaseId(id),
            Arc::new(TestDefinition::new(name, "true")),
            "p",
            "e",
            deps,
        )
    }

    #[test]
    fn describe_lists_cases_and_order() {
        let plan = ExecutionPlan::build(vec![
            case(0, "run", vec![DependencyRef::strict("build")]),
            case(1, "build", vec![]),
        ])
        .expect("plan");

        let text = plan.describe();
        assert!(text.contains("run @p+e  <- build @p+e"), "{text}");
        let build_pos = text.find("1. build").expect("build first");
        let run_pos = text.find("2. run").expect("run second");
        assert!(build_pos < run_pos);
    }

    #[test]
    fn cycles_are_rejected_before_execution() {
        let err = ExecutionPlan::build(vec![
            case(0, "a", vec![DependencyRef::strict("b")]),
            case(1, "b", vec![DependencyRef::strict("a")]),
        ])
        .expect_err("cycle");
        assert!(matches!(err, HpctestError::DependencyCycle { .. }));
        assert_eq!(err.to_string(), "dependency cycle: a @p+e -> b @p+e -> a @p+e");
    }
}
