// src/job/batch/lsf.rs

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use super::{parse_exit_code, CommandRequest, QueueDialect, QueueStatus};
use crate::job::backend::{JobSpec, JobState};

static JOB_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Job <(\d+)> is submitted").expect("valid regex"));

/// IBM Spectrum LSF: `bsub < script` / `bjobs` / `bkill`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lsf;

impl QueueDialect for Lsf {
    fn name(&self) -> &'static str {
        "lsf"
    }

    fn directives(&self, spec: &JobSpec) -> Vec<String> {
        let r = &spec.resources;
        let mut out = vec![
            format!("#BSUB -J {}", spec.name),
            format!("#BSUB -o {}", spec.stdout.display()),
            format!("#BSUB -e {}", spec.stderr.display()),
            format!("#BSUB -n {}", r.num_tasks),
        ];
        if let Some(n) = r.num_tasks_per_node {
            out.push(format!("#BSUB -R \"span[ptile={n}]\""));
        }
        if let Some(limit) = r.time_limit {
            // -W takes minutes.
            let minutes = limit.as_secs().div_ceil(60).max(1);
            out.push(format!("#BSUB -W {minutes}"));
        }
        out.extend(spec.access.iter().map(|opt| format!("#BSUB {opt}")));
        out
    }

    fn submit_command(&self, script: &Path) -> CommandRequest {
        CommandRequest::new("bsub", Vec::new()).with_stdin(script.to_path_buf())
    }

    fn parse_job_id(&self, stdout: &str) -> Option<String> {
        JOB_ID.captures(stdout).map(|c| c[1].to_string())
    }

    fn query_command(&self, ids: &[String]) -> CommandRequest {
        let mut args = vec![
            "-noheader".to_string(),
            "-o".to_string(),
            "jobid stat exit_code delimiter='|'".to_string(),
        ];
        args.extend(ids.iter().cloned());
        CommandRequest::new("bjobs", args)
    }

    fn parse_query(&self, stdout: &str) -> HashMap<String, QueueStatus> {
        let mut out = HashMap::new();
        for line in stdout.lines() {
            let fields: Vec<&str> = line.trim().split('|').collect();
            if fields.len() < 3 {
                continue;
            }
            let exit_code = parse_exit_code(fields[2]);
            let state = match fields[1].trim() {
                "PEND" | "PSUSP" | "WAIT" => JobState::Queued,
                "RUN" | "USUSP" | "SSUSP" | "PROV" => JobState::Running,
                "DONE" => JobState::Completed,
                "EXIT" => JobState::Failed,
                "ZOMBI" => JobState::Cancelled,
                _ => continue,
            };
            let exit_code = match state {
                JobState::Completed => exit_code.or(Some(0)),
                _ => exit_code,
            };
            out.insert(fields[0].trim().to_string(), QueueStatus { state, exit_code });
        }
        out
    }

    fn cancel_command(&self, id: &str) -> CommandRequest {
        CommandRequest::new("bkill", [id.to_string()])
    }
}
