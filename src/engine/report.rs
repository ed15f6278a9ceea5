// src/engine/report.rs

//! Terminal result records, consumed by reporting layers.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::pipeline::perf::PerfValue;
use crate::types::{Stage, TestStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestResult {
    /// `test @partition+environment`.
    pub id: String,
    pub test: String,
    pub partition: String,
    pub environment: String,
    pub status: TestStatus,
    /// Stage at which the test case became terminal; `None` if it never ran.
    pub stage: Option<Stage>,
    pub attempts: u32,
    pub duration_secs: Option<f64>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub metrics: Vec<PerfValue>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub pass: usize,
    pub fail: usize,
    pub skip: usize,
    pub aborted: usize,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub results: Vec<TestResult>,
    pub summary: Summary,
}

impl RunReport {
    pub fn new(results: Vec<TestResult>, elapsed: Duration) -> Self {
        let mut summary = Summary {
            total: results.len(),
            duration_secs: elapsed.as_secs_f64(),
            ..Summary::default()
        };
        for r in &results {
            match r.status {
                TestStatus::Pass => summary.pass += 1,
                TestStatus::Fail => summary.fail += 1,
                TestStatus::Skip => summary.skip += 1,
                TestStatus::Aborted => summary.aborted += 1,
                TestStatus::Pending | TestStatus::Running => {}
            }
        }
        Self { results, summary }
    }

    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.status == TestStatus::Pass)
    }

    /// Look up a result by its `test @partition+environment` id.
    pub fn result(&self, id: &str) -> Option<&TestResult> {
        self.results.iter().find(|r| r.id == id)
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("serializing run report")?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating dir {:?}", parent))?;
        }
        std::fs::write(path, json).with_context(|| format!("writing report {:?}", path))?;
        Ok(())
    }

    /// Plain-text summary: one line per test case that did not pass, then
    /// the totals.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        for r in self.results.iter().filter(|r| r.status != TestStatus::Pass) {
            let stage = r.stage.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
            let _ = writeln!(
                out,
                "[{:>7}] {} (stage: {stage}, attempts: {}){}",
                r.status.to_string().to_uppercase(),
                r.id,
                r.attempts,
                r.reason
                    .as_deref()
                    .map(|reason| format!(": {reason}"))
                    .unwrap_or_default()
            );
        }
        let s = &self.summary;
        let _ = writeln!(
            out,
            "Ran {} test case(s) in {:.2}s: {} passed, {} failed, {} skipped, {} aborted",
            s.total, s.duration_secs, s.pass, s.fail, s.skip, s.aborted
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, status: TestStatus) -> TestResult {
        TestResult {
            id: id.to_string(),
            test: id.to_string(),
            partition: "p".into(),
            environment: "e".into(),
            status,
            stage: None,
            attempts: 1,
            duration_secs: None,
            stdout: None,
            stderr: None,
            output_dir: None,
            metrics: Vec::new(),
            reason: None,
        }
    }

    #[test]
    fn summary_counts_statuses() {
        let report = RunReport::new(
            vec![
                result("a", TestStatus::Pass),
                result("b", TestStatus::Fail),
                result("c", TestStatus::Skip),
            ],
            Duration::from_millis(1500),
        );
        assert_eq!(report.summary.pass, 1);
        assert_eq!(report.summary.fail, 1);
        assert_eq!(report.summary.skip, 1);
        assert!(!report.all_passed());
        let text = report.render_summary();
        assert!(text.contains("[   FAIL] b"), "{text}");
        assert!(text.contains("1 passed, 1 failed, 1 skipped, 0 aborted"), "{text}");
    }

    #[test]
    fn writes_json_report() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("reports/run.json");
        let report = RunReport::new(vec![result("a", TestStatus::Pass)], Duration::ZERO);
        report.write_json(&path).expect("write");

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(value["results"][0]["status"], "pass");
        assert_eq!(value["summary"]["total"], 1);
    }
}
