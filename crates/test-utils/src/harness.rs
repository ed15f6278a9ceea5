#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use hpctest::config::ConfigFile;
use hpctest::engine::{
    control_channel, ExecutionContext, ExecutionControl, ExecutionPlan, ExecutionTrace, RunReport,
    Runtime,
};
use hpctest::job::{Backends, JobBackend};
use tempfile::TempDir;

use crate::builders::ConfigFileBuilder;
use crate::fake_backend::ScriptedBackend;

/// A runtime wired to a [`ScriptedBackend`] for every partition (and for
/// builds), with stage and output directories in a temp dir. Single
/// partitions can be pointed at another backend with
/// [`Harness::with_partition_backend`].
pub struct Harness {
    pub tmp: TempDir,
    pub backend: Arc<ScriptedBackend>,
    pub cfg: ConfigFile,
    overrides: HashMap<String, Arc<dyn JobBackend>>,
}

impl Harness {
    pub fn new(builder: ConfigFileBuilder) -> Self {
        let tmp = tempfile::tempdir().expect("create temp dir");
        let cfg = builder.with_prefixes(tmp.path()).build();
        Self {
            tmp,
            backend: Arc::new(ScriptedBackend::new()),
            cfg,
            overrides: HashMap::new(),
        }
    }

    pub fn with_partition_backend(mut self, partition: &str, backend: Arc<dyn JobBackend>) -> Self {
        self.overrides.insert(partition.to_string(), backend);
        self
    }

    pub fn root(&self) -> &Path {
        self.tmp.path()
    }

    pub fn context(&self) -> ExecutionContext {
        let shared: Arc<dyn JobBackend> = self.backend.clone();
        let backends = self
            .cfg
            .partition
            .keys()
            .fold(Backends::new(shared.clone()), |b, name| {
                let backend = self.overrides.get(name).unwrap_or(&shared).clone();
                b.with_partition(name.clone(), backend)
            });
        ExecutionContext::from_config(&self.cfg, backends)
    }

    pub fn runtime(&self) -> (Runtime, ExecutionControl) {
        let plan = ExecutionPlan::from_config(&self.cfg).expect("build execution plan");
        let (control, receiver) = control_channel();
        let runtime = Runtime::new(plan, self.context(), receiver).expect("create runtime");
        (runtime, control)
    }

    pub async fn run(&self) -> (RunReport, ExecutionTrace) {
        let (runtime, _control) = self.runtime();
        runtime.run_traced().await.expect("run completes")
    }
}
