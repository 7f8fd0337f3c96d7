//! # Taskline Pipeline
//!
//! Runs a task's ordered steps over the work queue: resolves the step
//! queue, sweeps failed items back in on retry ticks, hands each batch to
//! its step handler and commits the result in one write per step.
//!
//! Steps run one after another, or as concurrent workers sharing a single
//! commit gate when `is_parallel` is set.

pub mod orchestrator;
pub mod registry;
pub mod retry;

pub use orchestrator::{PipelineOrchestrator, resolve_step_queue};
pub use registry::{HandlerCatalog, StepHandlerRegistry};
pub use retry::{RetryWindow, retry_window, should_retry};
