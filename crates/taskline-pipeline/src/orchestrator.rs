//! Pipeline orchestrator: one run of a task's step chain.
//!
//! ```text
//! resolve queue ──> registry ──> [sequential | parallel workers]
//!                                  fetch (+ retry sweep) ──> handle ──> commit
//! ```
//!
//! Item failures are encoded into item status and committed. A handler
//! failing its whole batch still commits the batch as errored. Handler,
//! fetch and commit failures are isolated to their step and reported once
//! per run as [`TasklineError::Pipeline`].

use std::collections::VecDeque;
use std::future::Future;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use taskline_core::{
    Clock, CommitBatch, PipelineStore, Result, RunContext, RunReport, StepDescriptor,
    StepFailure, StepOutcome, StepReport, SystemClock, TaskPipeline, TaskSettings,
    TasklineError, WorkItem, panic_message,
};

use crate::registry::{HandlerCatalog, StepHandlerRegistry};
use crate::retry::{RetryWindow, retry_window, should_retry};

/// Runs a task's steps against a store and a handler catalog.
pub struct PipelineOrchestrator {
    store: Arc<dyn PipelineStore>,
    handlers: Arc<HandlerCatalog>,
    clock: Arc<dyn Clock>,
    max_workers: usize,
}

impl PipelineOrchestrator {
    pub fn new(store: Arc<dyn PipelineStore>, handlers: Arc<HandlerCatalog>) -> Self {
        let max_workers = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(4);
        Self {
            store,
            handlers,
            clock: Arc::new(SystemClock),
            max_workers,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Upper bound on concurrent step workers in parallel mode.
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Map configured step names to catalog entries, in configuration order.
    pub async fn resolve_step_queue(&self, steps: &[String]) -> Result<VecDeque<StepDescriptor>> {
        resolve_step_queue(self.store.as_ref(), steps).await
    }

    async fn run_sequential(&self, worker: StepWorker) -> Result<Vec<StepResult>> {
        let mut queue: VecDeque<usize> = (0..worker.steps.len()).collect();
        let mut results = Vec::with_capacity(queue.len());
        while let Some(index) = queue.pop_front() {
            results.push(worker.process(index).await?);
        }
        Ok(results)
    }

    async fn run_parallel(&self, worker: StepWorker) -> Result<Vec<StepResult>> {
        let count = worker.steps.len();
        let queue = Arc::new(Mutex::new((0..count).collect::<VecDeque<usize>>()));
        let permits = Arc::new(Semaphore::new(count.min(self.max_workers).max(1)));

        let mut workers = JoinSet::new();
        for _ in 0..count {
            let worker = worker.clone();
            let queue = Arc::clone(&queue);
            let permits = Arc::clone(&permits);
            workers.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return Ok(None);
                };
                let Some(index) = queue.lock().await.pop_front() else {
                    tracing::debug!("Worker found no step left for task '{}'", worker.task);
                    return Ok(None);
                };
                match AssertUnwindSafe(worker.process(index)).catch_unwind().await {
                    Ok(result) => result.map(Some),
                    Err(panic) => Ok(Some(StepResult::panicked(
                        &worker.steps[index],
                        index,
                        &panic_message(panic.as_ref()),
                    ))),
                }
            });
        }

        let mut results = Vec::with_capacity(count);
        let mut fatal: Option<TasklineError> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(Some(result))) => results.push(result),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    // Keep the most severe: configuration beats cancellation
                    if fatal.as_ref().is_none_or(|f| f.is_cancelled()) {
                        fatal = Some(e);
                    }
                }
                Err(e) => {
                    tracing::error!("💥 Step worker of task '{}' aborted: {e}", worker.task);
                    results.push(StepResult {
                        index: usize::MAX,
                        report: StepReport::default(),
                        failures: vec![StepFailure {
                            step: "<worker>".into(),
                            error: e.to_string(),
                        }],
                    });
                }
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }
        results.sort_by_key(|r| r.index);
        Ok(results)
    }
}

#[async_trait]
impl TaskPipeline for PipelineOrchestrator {
    async fn run_once(&self, ctx: &RunContext, cancel: &CancellationToken) -> Result<RunReport> {
        if cancel.is_cancelled() {
            return Err(TasklineError::Cancelled);
        }
        let settings = Arc::clone(&ctx.settings);

        let queue = cancellable(cancel, self.resolve_step_queue(&settings.steps)).await??;
        let steps: Vec<StepDescriptor> = queue.into_iter().collect();
        let registry = StepHandlerRegistry::for_run(&self.handlers, &steps)?;

        let retry = match settings.retry_policy.as_ref() {
            Some(policy) if should_retry(ctx.run_counter, Some(policy)) => {
                let window = retry_window(policy, settings.schedule.work_time()?, self.clock.now());
                tracing::debug!(
                    "🔁 Task '{}' run #{}: retry sweep since {}",
                    ctx.task_name,
                    ctx.run_counter,
                    window.since
                );
                Some(window)
            }
            _ => None,
        };

        let worker = StepWorker {
            task: ctx.task_name.clone(),
            run_counter: ctx.run_counter,
            settings: Arc::clone(&settings),
            store: Arc::clone(&self.store),
            registry: Arc::new(registry),
            steps: Arc::new(steps),
            retry,
            commit_gate: settings.is_parallel.then(|| Arc::new(Mutex::new(()))),
            cancel: cancel.clone(),
        };

        let results = if settings.is_parallel {
            self.run_parallel(worker).await?
        } else {
            self.run_sequential(worker).await?
        };

        let mut report = RunReport::new(ctx.task_name.clone(), ctx.run_counter);
        let mut failures = Vec::new();
        for result in results {
            if result.index != usize::MAX {
                report.steps.push(result.report);
            }
            failures.extend(result.failures);
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(TasklineError::Pipeline {
                task: ctx.task_name.clone(),
                failures,
            })
        }
    }
}

/// Catalog lookup preserving configuration order. An unknown name fails
/// the whole run.
pub async fn resolve_step_queue(
    store: &dyn PipelineStore,
    steps: &[String],
) -> Result<VecDeque<StepDescriptor>> {
    let catalog = store.step_catalog().await?;
    steps
        .iter()
        .map(|name| {
            catalog
                .get(name)
                .cloned()
                .ok_or_else(|| TasklineError::StepNotFound(name.clone()))
        })
        .collect()
}

async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TasklineError::Cancelled),
        out = fut => Ok(out),
    }
}

struct StepResult {
    index: usize,
    report: StepReport,
    failures: Vec<StepFailure>,
}

impl StepResult {
    fn fail(&mut self, step: &StepDescriptor, error: &TasklineError) {
        self.failures.push(StepFailure {
            step: step.name.clone(),
            error: error.to_string(),
        });
    }

    fn panicked(step: &StepDescriptor, index: usize, message: &str) -> Self {
        tracing::error!("💥 Step '{}' panicked: {message}", step.name);
        Self {
            index,
            report: StepReport {
                step: step.name.clone(),
                ..Default::default()
            },
            failures: vec![StepFailure {
                step: step.name.clone(),
                error: format!("panicked: {message}"),
            }],
        }
    }
}

/// Per-run state shared by every step of the run.
#[derive(Clone)]
struct StepWorker {
    task: String,
    run_counter: u32,
    settings: Arc<TaskSettings>,
    store: Arc<dyn PipelineStore>,
    registry: Arc<StepHandlerRegistry>,
    steps: Arc<Vec<StepDescriptor>>,
    retry: Option<RetryWindow>,
    /// Present in parallel mode: one commit at a time per run.
    commit_gate: Option<Arc<Mutex<()>>>,
    cancel: CancellationToken,
}

impl StepWorker {
    /// Fetch, handle and commit one step. `Err` is reserved for
    /// cancellation and configuration errors; everything else is recorded
    /// in the result.
    async fn process(&self, index: usize) -> Result<StepResult> {
        let step = &self.steps[index];
        let limit = self.settings.chunk_size;
        let mut result = StepResult {
            index,
            report: StepReport {
                step: step.name.clone(),
                ..Default::default()
            },
            failures: Vec::new(),
        };

        let mut items = match cancellable(&self.cancel, self.store.fetch_processable(step, limit)).await? {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(
                    "❌ Task '{}' run #{}: fetch failed for step '{}': {e}",
                    self.task,
                    self.run_counter,
                    step.name
                );
                result.fail(step, &e);
                return Ok(result);
            }
        };

        if let Some(window) = self.retry {
            let fetch = self
                .store
                .fetch_retryable(step, limit, window.since, window.max_attempts);
            match cancellable(&self.cancel, fetch).await? {
                Ok(retryable) => {
                    result.report.retried = retryable.len();
                    items.extend(retryable);
                }
                Err(e) => {
                    tracing::warn!(
                        "⚠️ Task '{}' run #{}: retry fetch failed for step '{}': {e}",
                        self.task,
                        self.run_counter,
                        step.name
                    );
                    result.fail(step, &e);
                }
            }
        }

        result.report.fetched = items.len();
        if items.is_empty() {
            tracing::debug!("Step '{}' has nothing to do", step.name);
            return Ok(result);
        }

        let (mut items, handler_error) = self.handle(step, items).await?;
        if let Some(message) = &handler_error {
            result.failures.push(StepFailure {
                step: step.name.clone(),
                error: format!("handler failed: {message}"),
            });
        }
        result.report.handler_error = handler_error;

        let next = self.next_step(index).await?;
        if next.is_some() {
            items.iter_mut().for_each(WorkItem::requeue);
        }
        let failed = items.iter().filter(|i| i.is_error()).count();
        result.report.failed = failed;
        result.report.processed = items.len() - failed;
        result.report.next = next.as_ref().map(|s| s.name.clone());

        let batch = CommitBatch {
            task: self.task.clone(),
            step: step.clone(),
            next,
            items,
        };

        let _gate = match &self.commit_gate {
            Some(gate) => Some(cancellable(&self.cancel, gate.lock()).await?),
            None => None,
        };
        match cancellable(&self.cancel, self.store.commit(batch)).await? {
            Ok(()) => {
                result.report.committed = true;
                tracing::info!(
                    "💾 Task '{}' step '{}': {} processed, {} unprocessed",
                    self.task,
                    step.name,
                    result.report.processed,
                    result.report.failed
                );
            }
            Err(e) => {
                tracing::error!(
                    "❌ Task '{}' run #{}: commit failed for step '{}': {e}",
                    self.task,
                    self.run_counter,
                    step.name
                );
                result.fail(step, &e);
            }
        }
        Ok(result)
    }

    /// Hand the batch to the step handler. A failed or panicking handler
    /// marks every item of the batch as errored.
    async fn handle(
        &self,
        step: &StepDescriptor,
        mut items: Vec<WorkItem>,
    ) -> Result<(Vec<WorkItem>, Option<String>)> {
        let handler = self.registry.resolve(step)?;
        items.iter_mut().for_each(WorkItem::mark_processing);
        let original = items.clone();

        let call = AssertUnwindSafe(handler.handle(&self.task, step, items)).catch_unwind();
        let message = match cancellable(&self.cancel, call).await? {
            Ok(StepOutcome::Completed(mut handled)) => {
                for item in handled.iter_mut().filter(|i| !i.is_error()) {
                    item.mark_processed();
                }
                return Ok((handled, None));
            }
            Ok(StepOutcome::Failed(message)) => message,
            Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
        };

        tracing::warn!(
            "⚠️ Task '{}' step '{}': batch of {} failed: {message}",
            self.task,
            step.name,
            original.len()
        );
        let mut failed = original;
        for item in &mut failed {
            item.mark_error(message.clone());
        }
        Ok((failed, Some(message)))
    }

    /// Configured successor; in infinite mode the last step loops back to
    /// the head of a freshly resolved queue.
    async fn next_step(&self, index: usize) -> Result<Option<StepDescriptor>> {
        if let Some(next) = self.steps.get(index + 1) {
            return Ok(Some(next.clone()));
        }
        if !self.settings.is_infinite {
            return Ok(None);
        }
        let resolve = resolve_step_queue(self.store.as_ref(), &self.settings.steps);
        let queue = cancellable(&self.cancel, resolve).await??;
        Ok(queue.front().cloned())
    }
}
