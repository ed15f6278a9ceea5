// src/job/batch/slurm.rs

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use super::{parse_exit_code, CommandRequest, QueueDialect, QueueStatus};
use crate::config::duration::format_walltime;
use crate::job::backend::{JobSpec, JobState};

static JOB_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Submitted batch job (\d+)").expect("valid regex"));

/// Slurm: `sbatch` / `sacct` / `scancel`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Slurm;

impl QueueDialect for Slurm {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn directives(&self, spec: &JobSpec) -> Vec<String> {
        let r = &spec.resources;
        let mut out = vec![
            format!("#SBATCH --job-name=\"{}\"", spec.name),
            format!("#SBATCH --output={}", spec.stdout.display()),
            format!("#SBATCH --error={}", spec.stderr.display()),
            format!("#SBATCH --ntasks={}", r.num_tasks),
        ];
        if let Some(n) = r.num_tasks_per_node {
            out.push(format!("#SBATCH --ntasks-per-node={n}"));
        }
        if let Some(n) = r.num_cpus_per_task {
            out.push(format!("#SBATCH --cpus-per-task={n}"));
        }
        if let Some(limit) = r.time_limit {
            out.push(format!("#SBATCH --time={}", format_walltime(limit)));
        }
        out.extend(spec.access.iter().map(|opt| format!("#SBATCH {opt}")));
        out
    }

    fn submit_command(&self, script: &Path) -> CommandRequest {
        CommandRequest::new("sbatch", [script.display().to_string()])
    }

    fn parse_job_id(&self, stdout: &str) -> Option<String> {
        JOB_ID.captures(stdout).map(|c| c[1].to_string())
    }

    fn query_command(&self, ids: &[String]) -> CommandRequest {
        CommandRequest::new(
            "sacct",
            [
                "--parsable2".to_string(),
                "--noheader".to_string(),
                "--allocations".to_string(),
                "--format=JobID,State,ExitCode".to_string(),
                format!("--jobs={}", ids.join(",")),
            ],
        )
    }

    fn parse_query(&self, stdout: &str) -> HashMap<String, QueueStatus> {
        let mut out = HashMap::new();
        for line in stdout.lines() {
            let fields: Vec<&str> = line.trim().split('|').collect();
            if fields.len() < 3 {
                continue;
            }
            // `CANCELLED by 1234` -> `CANCELLED`
            let code = fields[1].split_whitespace().next().unwrap_or("");
            let Some(state) = map_state(code) else {
                continue;
            };
            // ExitCode is `<exit>:<signal>`.
            let exit_code = fields[2].split(':').next().and_then(parse_exit_code);
            out.insert(fields[0].to_string(), QueueStatus { state, exit_code });
        }
        out
    }

    fn cancel_command(&self, id: &str) -> CommandRequest {
        CommandRequest::new("scancel", [id.to_string()])
    }
}

fn map_state(code: &str) -> Option<JobState> {
    let state = match code {
        "PENDING" | "REQUEUED" | "CONFIGURING" | "RESIZING" | "SUSPENDED" => JobState::Queued,
        "RUNNING" | "COMPLETING" | "STAGE_OUT" => JobState::Running,
        "COMPLETED" => JobState::Completed,
        "FAILED" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL" | "DEADLINE" | "PREEMPTED" => {
            JobState::Failed
        }
        "CANCELLED" => JobState::Cancelled,
        "TIMEOUT" => JobState::TimedOut,
        _ => return None,
    };
    Some(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sbatch_output() {
        assert_eq!(
            Slurm.parse_job_id("Submitted batch job 123456\n"),
            Some("123456".to_string())
        );
        assert_eq!(Slurm.parse_job_id("error: invalid partition"), None);
    }

    #[test]
    fn parses_sacct_lines() {
        let out = "11|COMPLETED|0:0\n12|CANCELLED by 501|0:15\n13|TIMEOUT|0:1\n14|FAILED|2:0\n15|PENDING|0:0\n16|WEIRD|0:0\n";
        let parsed = Slurm.parse_query(out);
        assert_eq!(parsed["11"].state, JobState::Completed);
        assert_eq!(parsed["11"].exit_code, Some(0));
        assert_eq!(parsed["12"].state, JobState::Cancelled);
        assert_eq!(parsed["13"].state, JobState::TimedOut);
        assert_eq!(parsed["14"].state, JobState::Failed);
        assert_eq!(parsed["14"].exit_code, Some(2));
        assert_eq!(parsed["15"].state, JobState::Queued);
        assert!(!parsed.contains_key("16"));
    }
}
