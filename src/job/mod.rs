// src/job/mod.rs

//! Job backends: the layer that actually gets work executed.
//!
//! - [`backend`] defines the four-operation [`JobBackend`] contract
//!   (submit / poll / cancel / finalize) plus the job data types.
//! - [`local`] runs jobs as local subprocesses.
//! - [`batch`] drives batch-queue schedulers (Slurm, PBS, LSF) through their
//!   command-line tools.
//! - [`container`] wraps the local backend to run jobs inside a container.
//! - [`registry`] maps partitions to backend instances.
//!
//! The pipeline and scheduler only ever talk to `dyn JobBackend`, so adding a
//! backend never touches them.

pub mod backend;
pub mod batch;
pub mod container;
pub mod local;
pub mod registry;

pub use backend::{
    BackendFuture, Job, JobBackend, JobCompletion, JobError, JobHandle, JobSpec, JobState,
    ResourceSpec,
};
pub use batch::{BatchOptions, BatchQueueBackend};
pub use container::ContainerBackend;
pub use local::LocalBackend;
pub use registry::Backends;

/// Quote a string for safe interpolation into a POSIX shell command.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}

#[cfg(test)]
mod tests {
    use super::shell_quote;

    #[test]
    fn quoting_leaves_plain_words_alone() {
        assert_eq!(shell_quote("CC=gcc"), "CC=gcc");
        assert_eq!(shell_quote("/tmp/a.out"), "/tmp/a.out");
    }

    #[test]
    fn quoting_wraps_and_escapes() {
        assert_eq!(shell_quote("echo hi"), "'echo hi'");
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
        assert_eq!(shell_quote(""), "''");
    }
}
