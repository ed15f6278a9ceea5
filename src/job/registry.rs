// src/job/registry.rs

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::backend::JobBackend;
use super::batch::{
    BatchOptions, BatchQueueBackend, CommandRunner, Lsf, Pbs, Slurm, SystemCommandRunner,
};
use super::container::ContainerBackend;
use super::local::LocalBackend;
use crate::config::ConfigFile;
use crate::types::BackendKind;

const DEFAULT_CONTAINER_RUNTIME: &str = "docker";

/// Backends by partition, plus the backend used for build jobs.
///
/// Builds run on the host the engine runs on, so by default the build
/// backend is a [`LocalBackend`] regardless of the partition.
#[derive(Clone)]
pub struct Backends {
    build: Arc<dyn JobBackend>,
    partitions: HashMap<String, Arc<dyn JobBackend>>,
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<_> = self
            .partitions
            .iter()
            .map(|(name, b)| format!("{name}={}", b.name()))
            .collect();
        parts.sort();
        f.debug_struct("Backends")
            .field("build", &self.build.name())
            .field("partitions", &parts)
            .finish()
    }
}

impl Backends {
    pub fn new(build: Arc<dyn JobBackend>) -> Self {
        Self {
            build,
            partitions: HashMap::new(),
        }
    }

    pub fn with_partition(mut self, name: impl Into<String>, backend: Arc<dyn JobBackend>) -> Self {
        self.partitions.insert(name.into(), backend);
        self
    }

    /// Instantiate one backend per configured partition.
    pub fn from_config(cfg: &ConfigFile) -> Self {
        let options = BatchOptions {
            poll_retries: cfg.engine.poll_retries,
            retry_delay: cfg.engine.poll_interval,
            cache_ttl: cfg.engine.poll_interval,
        };
        let runner: Arc<dyn CommandRunner> =
            Arc::new(SystemCommandRunner::new(cfg.engine.command_timeout));

        let mut backends = Self::new(Arc::new(LocalBackend::new()));
        for (name, part) in cfg.partition.iter() {
            let backend: Arc<dyn JobBackend> = match part.backend {
                BackendKind::Local => Arc::new(LocalBackend::new()),
                BackendKind::Slurm => {
                    Arc::new(BatchQueueBackend::new(Box::new(Slurm), runner.clone(), options))
                }
                BackendKind::Pbs => {
                    Arc::new(BatchQueueBackend::new(Box::new(Pbs), runner.clone(), options))
                }
                BackendKind::Lsf => {
                    Arc::new(BatchQueueBackend::new(Box::new(Lsf), runner.clone(), options))
                }
                BackendKind::Container => Arc::new(ContainerBackend::new(
                    part.runtime
                        .clone()
                        .unwrap_or_else(|| DEFAULT_CONTAINER_RUNTIME.to_string()),
                    part.image.clone().unwrap_or_default(),
                    runner.clone(),
                )),
            };
            debug!(partition = %name, backend = %part.backend, "configured job backend");
            backends.partitions.insert(name.clone(), backend);
        }
        backends
    }

    pub fn build(&self) -> &Arc<dyn JobBackend> {
        &self.build
    }

    pub fn for_partition(&self, partition: &str) -> Option<&Arc<dyn JobBackend>> {
        self.partitions.get(partition)
    }
}
