//! # Taskline Store
//!
//! Work-queue stores implementing the step catalog, reader and writer
//! contracts:
//! - `MemoryWorkStore`: in-process, keeps a log of committed batches
//! - `SqliteWorkStore`: durable, one transaction per step commit

pub mod memory;
mod settle;
pub mod sqlite;

pub use memory::MemoryWorkStore;
pub use sqlite::SqliteWorkStore;
