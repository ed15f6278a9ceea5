// src/engine/mod.rs

//! Execution engine.
//!
//! - [`core`] is the pure scheduler: readiness, admission under concurrency
//!   limits, skip cascades. No IO.
//! - [`runtime`] is the async loop that owns the pipelines and feeds their
//!   completions back into the core.
//! - [`control`] lets a UI/CLI layer request an abort and watch progress.
//! - [`report`] holds the per-test-case result records.

pub mod context;
pub mod control;
pub mod core;
pub mod event_handlers;
pub mod plan;
pub mod queue;
pub mod report;
pub mod runtime;

pub use context::ExecutionContext;
pub use control::{control_channel, ControlReceiver, ExecutionControl};
pub use self::core::{CoreScheduler, CoreStep, Limits, Progress, SkippedCase};
pub use plan::ExecutionPlan;
pub use queue::ReadyQueue;
pub use report::{RunReport, Summary, TestResult};
pub use runtime::{AttemptTrace, ExecutionTrace, Runtime};
