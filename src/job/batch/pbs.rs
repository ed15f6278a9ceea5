// src/job/batch/pbs.rs

use std::collections::HashMap;
use std::path::Path;

use super::{parse_exit_code, CommandRequest, QueueDialect, QueueStatus};
use crate::config::duration::format_walltime;
use crate::job::backend::{JobSpec, JobState};

/// PBS Pro exit status for a job killed on wall-time.
const EXIT_WALLTIME: i32 = -29;
/// 256 + SIGTERM: the job was removed with `qdel`.
const EXIT_DELETED: i32 = 271;

/// PBS / Torque: `qsub` / `qstat -f -x` / `qdel`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pbs;

impl QueueDialect for Pbs {
    fn name(&self) -> &'static str {
        "pbs"
    }

    fn directives(&self, spec: &JobSpec) -> Vec<String> {
        let r = &spec.resources;
        let per_node = r.num_tasks_per_node.unwrap_or(r.num_tasks);
        let mut select = format!("select={}:mpiprocs={per_node}", r.num_nodes());
        if let Some(cpus) = r.num_cpus_per_task {
            select.push_str(&format!(":ncpus={}", per_node * cpus));
        }

        let mut out = vec![
            format!("#PBS -N {}", spec.name),
            format!("#PBS -o {}", spec.stdout.display()),
            format!("#PBS -e {}", spec.stderr.display()),
            format!("#PBS -l {select}"),
        ];
        if let Some(limit) = r.time_limit {
            out.push(format!("#PBS -l walltime={}", format_walltime(limit)));
        }
        out.extend(spec.access.iter().map(|opt| format!("#PBS {opt}")));
        out
    }

    fn submit_command(&self, script: &Path) -> CommandRequest {
        CommandRequest::new("qsub", [script.display().to_string()])
    }

    fn parse_job_id(&self, stdout: &str) -> Option<String> {
        stdout
            .lines()
            .map(str::trim)
            .find(|l| l.chars().next().is_some_and(|c| c.is_ascii_digit()))
            .map(str::to_string)
    }

    fn query_command(&self, ids: &[String]) -> CommandRequest {
        let mut args = vec!["-f".to_string(), "-x".to_string()];
        args.extend(ids.iter().cloned());
        CommandRequest::new("qstat", args)
    }

    fn parse_query(&self, stdout: &str) -> HashMap<String, QueueStatus> {
        let mut out = HashMap::new();
        let mut current: Option<(String, Option<String>, Option<i32>)> = None;

        let mut flush = |entry: Option<(String, Option<String>, Option<i32>)>| {
            if let Some((id, Some(code), exit)) = entry {
                if let Some(state) = map_state(&code, exit) {
                    out.insert(id, QueueStatus {
                        state,
                        exit_code: exit,
                    });
                }
            }
        };

        for line in stdout.lines() {
            let line = line.trim();
            if let Some(id) = line.strip_prefix("Job Id:") {
                flush(current.take());
                current = Some((id.trim().to_string(), None, None));
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if let Some(entry) = current.as_mut() {
                match key.trim() {
                    "job_state" => entry.1 = Some(value.trim().to_string()),
                    "Exit_status" => entry.2 = parse_exit_code(value),
                    _ => {}
                }
            }
        }
        flush(current.take());

        out
    }

    fn cancel_command(&self, id: &str) -> CommandRequest {
        CommandRequest::new("qdel", [id.to_string()])
    }
}

fn map_state(code: &str, exit: Option<i32>) -> Option<JobState> {
    let state = match code {
        "Q" | "H" | "W" | "S" | "T" | "U" => JobState::Queued,
        "R" | "E" | "B" => JobState::Running,
        "F" | "C" | "X" => match exit {
            None | Some(0) => JobState::Completed,
            Some(EXIT_WALLTIME) => JobState::TimedOut,
            Some(EXIT_DELETED) => JobState::Cancelled,
            Some(_) => JobState::Failed,
        },
        _ => return None,
    };
    Some(state)
}
