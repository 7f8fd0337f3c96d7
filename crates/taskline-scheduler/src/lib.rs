//! # Taskline Scheduler
//!
//! Decides *when* a task runs and keeps it running.
//!
//! ```text
//! TaskHost
//!   ├── TaskRunner "import"  ── TaskSchedule ── TaskPipeline::run_once
//!   ├── TaskRunner "cleanup" ── TaskSchedule ── TaskPipeline::run_once
//!   └── SettingsProvider (watch) ── restart on change
//! ```

pub mod file_settings;
pub mod host;
pub mod runner;
pub mod schedule;

pub use file_settings::FileSettingsProvider;
pub use host::TaskHost;
pub use runner::{RunnerExit, TaskRunner};
pub use schedule::{
    Readiness, StartDecision, StopDecision, TaskSchedule, WorkDays, parse_work_days,
};
