//! # Taskline Core
//!
//! Shared vocabulary of the Taskline engine: configuration, the work-item
//! model, the error taxonomy and the collaborator traits that persistence
//! and step handlers implement.
//!
//! ```text
//! BackgroundConfig ──> TaskSettings ──> ScheduleSettings / RetryPolicy
//! StepCatalog + WorkItemReader + WorkItemWriter = PipelineStore
//! StepHandler: (task, step, items) -> StepOutcome
//! TaskPipeline: (RunContext, CancellationToken) -> RunReport
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod model;
pub mod settings;
pub mod traits;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{BackgroundConfig, MAX_CHUNK_SIZE, RetryPolicy, ScheduleSettings, TaskSettings};
pub use error::{Result, StepFailure, TasklineError, panic_message};
pub use model::{
    CommitBatch, RunContext, RunReport, StepDescriptor, StepReport, WorkItem, WorkStatus,
};
pub use settings::{SettingsHandle, SettingsProvider};
pub use traits::{
    PipelineStore, StepCatalog, StepHandler, StepOutcome, TaskPipeline, WorkItemReader,
    WorkItemWriter,
};
