// src/config/mod.rs

//! Configuration loading and validation for hpctest.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate references, limits and durations (`validate.rs`).

pub mod duration;
pub mod loader;
pub mod model;
pub mod validate;

pub use duration::parse_duration;
pub use loader::{load_and_validate, load_from_path, parse_str};
pub use model::{
    ConfigFile, ConfigSection, DependencySpec, EngineConfig, EnvironmentConfig, PartitionConfig,
    PerfConfig, RawConfigFile, TestConfig,
};
pub use validate::validate_config;
