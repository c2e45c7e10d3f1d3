//! 领域模型模块
//!
//! 纯数据结构，不依赖 tokio

pub mod service;
pub mod sync;

// Re-exports for convenience
pub use service::{merge_rows, ChangeSummary, RowChange, ServiceRecord, SyncServiceRow};
pub use sync::{StageOutcome, SyncStep, SyncTask, TaskMatrix, TaskResult, TaskStatus};
