#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Mutex;

use hpctest::job::batch::runner::CommandFuture;
use hpctest::job::batch::{CommandOutput, CommandRequest, CommandRunner};

/// [`CommandRunner`] that replays canned replies per program, in order.
///
/// A program with no reply left fails with an I/O error, which the batch
/// backend treats like an unreachable scheduler.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    replies: Mutex<HashMap<String, VecDeque<CommandOutput>>>,
    calls: Mutex<Vec<CommandRequest>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, program: &str, code: i32, stdout: &str) -> &Self {
        let stderr = if code == 0 { "" } else { "slurmdbd: connection refused" };
        self.replies
            .lock()
            .expect("runner mutex poisoned")
            .entry(program.to_string())
            .or_default()
            .push_back(CommandOutput {
                code: Some(code),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            });
        self
    }

    pub fn calls(&self) -> Vec<CommandRequest> {
        self.calls.lock().expect("runner mutex poisoned").clone()
    }

    pub fn calls_to(&self, program: &str) -> usize {
        self.calls().iter().filter(|c| c.program == program).count()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, request: &'a CommandRequest) -> CommandFuture<'a> {
        self.calls
            .lock()
            .expect("runner mutex poisoned")
            .push(request.clone());
        let reply = self
            .replies
            .lock()
            .expect("runner mutex poisoned")
            .get_mut(&request.program)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| io::Error::other(format!("no reply scripted for '{}'", request.program)));
        Box::pin(std::future::ready(reply))
    }
}
