// src/dag/mod.rs

//! Test cases and the dependency graph between them.
//!
//! - [`test_case`] holds the concrete (test × partition × environment) units.
//! - [`expand`] turns validated `[[test]]` entries into test cases.
//! - [`resolve`] expands declared dependency references into concrete edges.
//! - [`graph`] validates acyclicity and tracks readiness incrementally.

pub mod expand;
pub mod graph;
pub mod resolve;
pub mod test_case;

pub use expand::{definition_from_config, expand_test_cases};
pub use graph::DependencyGraph;
pub use resolve::{resolve_edges, DependencyEdge};
pub use test_case::{DependencyRef, TestCase, TestCaseId, TestDefinition};
