// src/pipeline/stagedir.rs

//! Stage and output directories of a test case attempt.
//!
//! ```text
//! <stage_prefix>/<partition>/<environment>/<test>[_retry<n>]
//! <output_prefix>/<partition>/<environment>/<test>[_retry<n>]
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::dag::TestCase;

#[derive(Debug, Clone)]
pub struct StageLayout {
    stage_prefix: PathBuf,
    output_prefix: PathBuf,
    keep_stage_files: bool,
}

/// Directories of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptDirs {
    pub stage: PathBuf,
    pub output: PathBuf,
}

impl StageLayout {
    pub fn new(stage_prefix: impl Into<PathBuf>, output_prefix: impl Into<PathBuf>) -> Self {
        Self {
            stage_prefix: stage_prefix.into(),
            output_prefix: output_prefix.into(),
            keep_stage_files: false,
        }
    }

    pub fn keep_stage_files(mut self, keep: bool) -> Self {
        self.keep_stage_files = keep;
        self
    }

    pub fn from_engine(cfg: &EngineConfig) -> Self {
        Self::new(&cfg.stage_prefix, &cfg.output_prefix).keep_stage_files(cfg.keep_stage_files)
    }

    /// Directories for `attempt` (1-based) of `case`.
    pub fn dirs(&self, case: &TestCase, attempt: u32) -> AttemptDirs {
        let leaf = if attempt > 1 {
            format!("{}_retry{}", case.test_name(), attempt - 1)
        } else {
            case.test_name().to_string()
        };
        let rel = Path::new(&case.partition).join(&case.environment).join(leaf);
        AttemptDirs {
            stage: self.stage_prefix.join(&rel),
            output: self.output_prefix.join(&rel),
        }
    }

    /// Wipe and recreate the stage directory, then copy `sources` into it.
    pub fn prepare(&self, dirs: &AttemptDirs, sources: Option<&Path>) -> Result<()> {
        if dirs.stage.exists() {
            fs::remove_dir_all(&dirs.stage)
                .with_context(|| format!("removing stale stage dir {:?}", dirs.stage))?;
        }
        fs::create_dir_all(&dirs.stage)
            .with_context(|| format!("creating stage dir {:?}", dirs.stage))?;

        if let Some(src) = sources {
            if !src.is_dir() {
                anyhow::bail!("sources {:?} is not a directory", src);
            }
            copy_dir_recursive(src, &dirs.stage)
                .with_context(|| format!("copying sources {:?} to {:?}", src, dirs.stage))?;
        }

        debug!(stage_dir = ?dirs.stage, "prepared stage directory");
        Ok(())
    }

    /// Copy `artifacts` (absolute paths) and `keep_files` (relative to the
    /// stage dir) to the output directory, then drop the stage directory if
    /// the attempt passed and stage files are not kept.
    ///
    /// Missing files are skipped; a job that never started has no output.
    pub fn cleanup(
        &self,
        dirs: &AttemptDirs,
        artifacts: &[PathBuf],
        keep_files: &[String],
        passed: bool,
    ) -> Result<()> {
        if dirs.output.exists() {
            fs::remove_dir_all(&dirs.output)
                .with_context(|| format!("removing stale output dir {:?}", dirs.output))?;
        }
        fs::create_dir_all(&dirs.output)
            .with_context(|| format!("creating output dir {:?}", dirs.output))?;

        for path in artifacts {
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name() else {
                continue;
            };
            fs::copy(path, dirs.output.join(name))
                .with_context(|| format!("copying {:?} to output dir", path))?;
        }

        for rel in keep_files {
            let src = dirs.stage.join(rel);
            if !src.exists() {
                warn!(file = %rel, stage_dir = ?dirs.stage, "keep file not found in stage dir");
                continue;
            }
            let dst = dirs.output.join(rel);
            if src.is_dir() {
                copy_dir_recursive(&src, &dst)
                    .with_context(|| format!("copying {:?} to output dir", src))?;
            } else {
                if let Some(parent) = dst.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("creating dir {:?}", parent))?;
                }
                fs::copy(&src, &dst).with_context(|| format!("copying {:?} to output dir", src))?;
            }
        }

        if passed && !self.keep_stage_files && dirs.stage.exists() {
            fs::remove_dir_all(&dirs.stage)
                .with_context(|| format!("removing stage dir {:?}", dirs.stage))?;
            debug!(stage_dir = ?dirs.stage, "removed stage directory");
        }

        Ok(())
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::*;
    use crate::dag::{TestCaseId, TestDefinition};

    fn case() -> TestCase {
        TestCase::new(
            TestCaseId(0),
            Arc::new(TestDefinition::new("hello", "./hello")),
            "login",
            "gnu",
            vec![],
        )
    }

    #[test]
    fn retry_attempts_get_their_own_directories() {
        let layout = StageLayout::new("/s", "/o");
        let first = layout.dirs(&case(), 1);
        assert_eq!(first.stage, PathBuf::from("/s/login/gnu/hello"));
        assert_eq!(first.output, PathBuf::from("/o/login/gnu/hello"));

        let third = layout.dirs(&case(), 3);
        assert_eq!(third.stage, PathBuf::from("/s/login/gnu/hello_retry2"));
    }

    #[test]
    fn prepare_wipes_and_copies_sources() {
        let tmp = tempdir().expect("tempdir");
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("sub")).expect("mkdir");
        fs::write(src.join("Makefile"), "all:\n").expect("write");
        fs::write(src.join("sub/data.txt"), "42").expect("write");

        let layout = StageLayout::new(tmp.path().join("stage"), tmp.path().join("out"));
        let dirs = layout.dirs(&case(), 1);
        fs::create_dir_all(&dirs.stage).expect("mkdir");
        fs::write(dirs.stage.join("stale"), "x").expect("write");

        layout.prepare(&dirs, Some(&src)).expect("prepare");
        assert!(!dirs.stage.join("stale").exists());
        assert!(dirs.stage.join("Makefile").is_file());
        assert_eq!(
            fs::read_to_string(dirs.stage.join("sub/data.txt")).expect("read"),
            "42"
        );
    }

    #[test]
    fn cleanup_copies_outputs_and_keeps_stage_on_failure() {
        let tmp = tempdir().expect("tempdir");
        let layout = StageLayout::new(tmp.path().join("stage"), tmp.path().join("out"));
        let dirs = layout.dirs(&case(), 1);
        layout.prepare(&dirs, None).expect("prepare");

        let stdout = dirs.stage.join("hello.out");
        fs::write(&stdout, "hi").expect("write");
        fs::write(dirs.stage.join("result.log"), "r").expect("write");

        let missing = dirs.stage.join("never-created.err");
        layout
            .cleanup(&dirs, &[stdout, missing], &["result.log".to_string()], false)
            .expect("cleanup");

        assert!(dirs.output.join("hello.out").is_file());
        assert!(dirs.output.join("result.log").is_file());
        assert!(dirs.stage.exists(), "stage dir kept for post-mortem");

        layout.cleanup(&dirs, &[], &[], true).expect("cleanup");
        assert!(!dirs.stage.exists(), "stage dir removed after success");
    }

    #[test]
    fn cleanup_tolerates_missing_stage_dir() {
        let tmp = tempdir().expect("tempdir");
        let layout = StageLayout::new(tmp.path().join("stage"), tmp.path().join("out"));
        let dirs = layout.dirs(&case(), 1);
        layout.cleanup(&dirs, &[], &["x".into()], true).expect("cleanup");
        assert!(dirs.output.is_dir());
    }
}
