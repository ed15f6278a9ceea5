// src/pipeline/perf.rs

//! Performance metrics: extraction from captured output and evaluation
//! against reference values with relative thresholds.

use regex::Regex;
use serde::Serialize;

/// Reference value of a metric with optional relative thresholds.
///
/// `lower` and `upper` are fractions of the reference, e.g. `lower = -0.05`
/// accepts values down to 5% below the reference. Bounds are computed on the
/// magnitude of the reference, so they keep their meaning for negative
/// references.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerfReference {
    pub value: f64,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl PerfReference {
    pub fn lower_bound(&self) -> Option<f64> {
        self.lower.map(|t| self.value + self.value.abs() * t)
    }

    pub fn upper_bound(&self) -> Option<f64> {
        self.upper.map(|t| self.value + self.value.abs() * t)
    }

    /// Check `value` against the bounds. The error names the violated bound.
    pub fn check(&self, value: f64) -> Result<(), String> {
        if value.is_nan() {
            return Err("value is NaN".to_string());
        }
        if let Some(lo) = self.lower_bound()
            && value < lo
        {
            return Err(format!(
                "{value} is below lower bound {lo} (reference {})",
                self.value
            ));
        }
        if let Some(hi) = self.upper_bound()
            && value > hi
        {
            return Err(format!(
                "{value} is above upper bound {hi} (reference {})",
                self.value
            ));
        }
        Ok(())
    }
}

/// One metric extracted from stdout by the first capture group of `pattern`.
#[derive(Debug, Clone)]
pub struct PerfPattern {
    pub name: String,
    pub pattern: Regex,
    pub unit: Option<String>,
    pub reference: Option<PerfReference>,
}

impl PerfPattern {
    /// Extract the metric from `output`. The last match wins, as benchmarks
    /// commonly print intermediate results before the final one.
    pub fn extract(&self, output: &str) -> Result<f64, String> {
        let raw = self
            .pattern
            .captures_iter(output)
            .filter_map(|c| c.get(1))
            .last()
            .ok_or_else(|| format!("pattern '{}' did not match", self.pattern.as_str()))?;

        raw.as_str()
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("could not parse '{}' as a number: {e}", raw.as_str()))
    }
}

/// A metric value as reported in the run report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerfValue {
    pub name: String,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<f64>,
}
