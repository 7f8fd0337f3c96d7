//! In-memory work queue. Same status and attempt semantics as the SQLite
//! store; every committed batch is kept for inspection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use taskline_core::{
    Clock, CommitBatch, Result, StepCatalog, StepDescriptor, SystemClock, TasklineError,
    WorkItem, WorkItemReader, WorkItemWriter, WorkStatus,
};

use crate::settle::settle;

#[derive(Default)]
struct MemoryState {
    steps: HashMap<String, StepDescriptor>,
    /// Insertion order is fetch order.
    items: Vec<WorkItem>,
    commits: Vec<CommitBatch>,
}

pub struct MemoryWorkStore {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
}

impl MemoryWorkStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Clock used for `updated_at` stamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Add a step to the catalog, or return the existing one.
    pub async fn add_step(&self, name: &str) -> StepDescriptor {
        let mut state = self.state.lock().await;
        let next_id = state.steps.len() as u32 + 1;
        state
            .steps
            .entry(name.to_string())
            .or_insert_with(|| StepDescriptor::new(next_id, name))
            .clone()
    }

    /// Queue a new Ready item on `step`. Returns its id.
    pub async fn enqueue(&self, step: &str, payload: serde_json::Value) -> Result<String> {
        let mut state = self.state.lock().await;
        if !state.steps.contains_key(step) {
            return Err(TasklineError::StepNotFound(step.to_string()));
        }
        let mut item = WorkItem::new(uuid::Uuid::new_v4().to_string(), step, payload);
        item.updated_at = self.clock.now();
        let id = item.id.clone();
        state.items.push(item);
        Ok(id)
    }

    /// Insert an item as-is, replacing one with the same id.
    pub async fn insert(&self, item: WorkItem) {
        let mut state = self.state.lock().await;
        match state.items.iter_mut().find(|i| i.id == item.id) {
            Some(existing) => *existing = item,
            None => state.items.push(item),
        }
    }

    pub async fn item(&self, id: &str) -> Option<WorkItem> {
        let state = self.state.lock().await;
        state.items.iter().find(|i| i.id == id).cloned()
    }

    pub async fn items(&self) -> Vec<WorkItem> {
        self.state.lock().await.items.clone()
    }

    /// Every successful commit, oldest first.
    pub async fn commits(&self) -> Vec<CommitBatch> {
        self.state.lock().await.commits.clone()
    }
}

impl Default for MemoryWorkStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepCatalog for MemoryWorkStore {
    async fn step_catalog(&self) -> Result<HashMap<String, StepDescriptor>> {
        Ok(self.state.lock().await.steps.clone())
    }
}

#[async_trait]
impl WorkItemReader for MemoryWorkStore {
    async fn fetch_processable(&self, step: &StepDescriptor, limit: usize) -> Result<Vec<WorkItem>> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .iter()
            .filter(|i| i.step == step.name && i.status == WorkStatus::Ready)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn fetch_retryable(
        &self,
        step: &StepDescriptor,
        limit: usize,
        since: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<WorkItem>> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .iter()
            .filter(|i| {
                i.step == step.name
                    && i.status == WorkStatus::Error
                    && i.updated_at < since
                    && i.attempts < max_attempts
            })
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WorkItemWriter for MemoryWorkStore {
    async fn commit(&self, batch: CommitBatch) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        // Resolve every position first so a bad id leaves the queue untouched
        let mut positions = Vec::with_capacity(batch.items.len());
        for item in &batch.items {
            let pos = state
                .items
                .iter()
                .position(|i| i.id == item.id)
                .ok_or_else(|| TasklineError::Commit {
                    step: batch.step.name.clone(),
                    message: format!("unknown work-item '{}'", item.id),
                })?;
            positions.push(pos);
        }
        for (item, pos) in batch.items.iter().zip(positions) {
            state.items[pos] = settle(&batch, item, now);
        }
        state.commits.push(batch);
        Ok(())
    }
}
