// src/engine/context.rs

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::config::{ConfigFile, EngineConfig};
use crate::job::Backends;
use crate::pipeline::hooks::{
    CheckHooks, Environment, EnvironmentHooks, PatternChecks, VariableEnvironments,
};
use crate::pipeline::stagedir::StageLayout;

/// Everything a pipeline needs besides its own test case.
///
/// Built once per run and shared by reference; nothing in here is mutated
/// while the scheduling loop is running.
#[derive(Clone)]
pub struct ExecutionContext {
    pub config: EngineConfig,
    pub backends: Backends,
    pub layout: StageLayout,
    pub environments: BTreeMap<String, Environment>,
    /// Extra scheduler options per partition.
    pub access: BTreeMap<String, Vec<String>>,
    pub env_hooks: Arc<dyn EnvironmentHooks>,
    pub checks: Arc<dyn CheckHooks>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("config", &self.config)
            .field("backends", &self.backends)
            .field("layout", &self.layout)
            .field("environments", &self.environments.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ExecutionContext {
    /// Context with variable-only environments and pattern checks.
    pub fn new(config: EngineConfig, backends: Backends) -> Self {
        let layout = StageLayout::from_engine(&config);
        Self {
            config,
            backends,
            layout,
            environments: BTreeMap::new(),
            access: BTreeMap::new(),
            env_hooks: Arc::new(VariableEnvironments),
            checks: Arc::new(PatternChecks),
        }
    }

    pub fn from_config(cfg: &ConfigFile, backends: Backends) -> Self {
        let mut ctx = Self::new(cfg.engine.clone(), backends);
        ctx.environments = cfg
            .environment
            .iter()
            .map(|(name, env)| {
                (
                    name.clone(),
                    Environment {
                        name: name.clone(),
                        variables: env.variables.clone(),
                    },
                )
            })
            .collect();
        ctx.access = cfg
            .partition
            .iter()
            .filter(|(_, p)| !p.access.is_empty())
            .map(|(name, p)| (name.clone(), p.access.clone()))
            .collect();
        ctx
    }

    pub fn with_layout(mut self, layout: StageLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_environment(mut self, env: Environment) -> Self {
        self.environments.insert(env.name.clone(), env);
        self
    }

    pub fn with_env_hooks(mut self, hooks: Arc<dyn EnvironmentHooks>) -> Self {
        self.env_hooks = hooks;
        self
    }

    pub fn with_checks(mut self, checks: Arc<dyn CheckHooks>) -> Self {
        self.checks = checks;
        self
    }

    /// The named environment; unknown names resolve to an empty one.
    pub fn environment(&self, name: &str) -> Environment {
        self.environments
            .get(name)
            .cloned()
            .unwrap_or_else(|| Environment::new(name))
    }
}
