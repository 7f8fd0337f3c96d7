//! Work-item and step data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::TaskSettings;

/// Lifecycle status of a work-item.
///
/// ```text
/// Ready ──fetched──> Processing ──ok──> Processed ──(next step)──> Ready
///                               └─fail─> Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// New, or re-queued for the next step.
    Ready,
    /// In memory, handed to a step handler.
    Processing,
    /// Handled successfully; terminal after the last step.
    Processed,
    /// Handled unsuccessfully; eligible for the retry sweep.
    Error,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Ready => "ready",
            WorkStatus::Processing => "processing",
            WorkStatus::Processed => "processed",
            WorkStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(WorkStatus::Ready),
            "processing" => Ok(WorkStatus::Processing),
            "processed" => Ok(WorkStatus::Processed),
            "error" => Ok(WorkStatus::Error),
            other => Err(format!("unknown work status '{other}'")),
        }
    }
}

/// One unit of persisted pipeline data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    /// Step the item is currently queued for.
    pub step: String,
    /// Opaque payload, owned by the step handlers.
    pub payload: serde_json::Value,
    pub status: WorkStatus,
    pub error: Option<String>,
    /// Failed attempts so far, maintained by the store.
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// A fresh `Ready` item queued for `step`.
    pub fn new(id: impl Into<String>, step: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            step: step.into(),
            payload,
            status: WorkStatus::Ready,
            error: None,
            attempts: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn mark_processing(&mut self) {
        self.status = WorkStatus::Processing;
    }

    /// Successful handling; a pending error message is cleared.
    pub fn mark_processed(&mut self) {
        self.status = WorkStatus::Processed;
        self.error = None;
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = WorkStatus::Error;
        self.error = Some(message.into());
    }

    /// Processed -> Ready, for items forwarded to a next step.
    pub fn requeue(&mut self) {
        if self.status == WorkStatus::Processed {
            self.status = WorkStatus::Ready;
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == WorkStatus::Error
    }
}

/// A pipeline step as listed in the store's step catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub id: u32,
    /// Case-sensitive name used in `TaskSettings::steps`.
    pub name: String,
    /// Human label.
    pub label: String,
}

impl StepDescriptor {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id,
            label: name.clone(),
            name,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

impl std::fmt::Display for StepDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// One step's handled batch, written in a single call.
#[derive(Debug, Clone)]
pub struct CommitBatch {
    pub task: String,
    pub step: StepDescriptor,
    /// Destination for items that made it through, `None` at the chain end.
    pub next: Option<StepDescriptor>,
    pub items: Vec<WorkItem>,
}

impl CommitBatch {
    /// Where `item` goes after the commit. Only re-queued items move on.
    pub fn destination_of(&self, item: &WorkItem) -> Option<&StepDescriptor> {
        match item.status {
            WorkStatus::Ready => self.next.as_ref(),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.next.is_none()
    }

    pub fn error_count(&self) -> usize {
        self.items.iter().filter(|i| i.is_error()).count()
    }
}

/// Everything one tick of a task needs; created per tick.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub task_name: String,
    pub run_counter: u32,
    pub settings: Arc<TaskSettings>,
}

impl RunContext {
    pub fn new(task_name: impl Into<String>, run_counter: u32, settings: Arc<TaskSettings>) -> Self {
        Self {
            task_name: task_name.into(),
            run_counter,
            settings,
        }
    }
}

/// Outcome of one step within a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    pub step: String,
    /// Items handed to the handler, retried ones included.
    pub fetched: usize,
    /// Items picked up by the retry sweep.
    pub retried: usize,
    pub processed: usize,
    pub failed: usize,
    pub next: Option<String>,
    /// Batch-level handler failure, already encoded into the items.
    pub handler_error: Option<String>,
    pub committed: bool,
}

/// Summary of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub task: String,
    pub run_counter: u32,
    pub steps: Vec<StepReport>,
}

impl RunReport {
    pub fn new(task: impl Into<String>, run_counter: u32) -> Self {
        Self {
            task: task.into(),
            run_counter,
            steps: Vec::new(),
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step == name)
    }

    pub fn processed(&self) -> usize {
        self.steps.iter().map(|s| s.processed).sum()
    }

    pub fn failed(&self) -> usize {
        self.steps.iter().map(|s| s.failed).sum()
    }
}
