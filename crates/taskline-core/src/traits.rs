//! Collaborator contracts consumed by the engine.
//!
//! Persistence and step business logic live outside Taskline; the engine
//! only sees these narrow traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::{CommitBatch, RunContext, RunReport, StepDescriptor, WorkItem};

/// Source of the step catalog, read once per run.
#[async_trait]
pub trait StepCatalog: Send + Sync {
    /// Steps keyed by name.
    async fn step_catalog(&self) -> Result<HashMap<String, StepDescriptor>>;
}

/// Read side of the work queue.
#[async_trait]
pub trait WorkItemReader: Send + Sync {
    /// Items in `Ready` status queued for `step`.
    async fn fetch_processable(&self, step: &StepDescriptor, limit: usize) -> Result<Vec<WorkItem>>;

    /// Items in `Error` status for `step` last touched before `since` with
    /// fewer than `max_attempts` attempts.
    async fn fetch_retryable(
        &self,
        step: &StepDescriptor,
        limit: usize,
        since: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<WorkItem>>;
}

/// Write side of the work queue.
#[async_trait]
pub trait WorkItemWriter: Send + Sync {
    /// Persist a whole step batch. Must be atomic for the batch.
    async fn commit(&self, batch: CommitBatch) -> Result<()>;
}

/// Full data-access capability of a pipeline.
pub trait PipelineStore: StepCatalog + WorkItemReader + WorkItemWriter {}

impl<T> PipelineStore for T where T: StepCatalog + WorkItemReader + WorkItemWriter {}

/// Result of a step handler.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Handled items; individual items may be marked `Error`.
    Completed(Vec<WorkItem>),
    /// The whole batch failed with this message.
    Failed(String),
}

/// Business logic for one step.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn handle(&self, task: &str, step: &StepDescriptor, items: Vec<WorkItem>) -> StepOutcome;
}

/// One run of a task's pipeline, as seen by the runner.
#[async_trait]
pub trait TaskPipeline: Send + Sync {
    async fn run_once(&self, ctx: &RunContext, cancel: &CancellationToken) -> Result<RunReport>;
}
