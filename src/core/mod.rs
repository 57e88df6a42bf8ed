//! 核心层：任务模型、调度器、人机协同、错误与恢复、任务存储、取消监管

pub mod error;
pub mod hitl;
pub mod recovery;
pub mod supervisor;
pub mod task;
pub mod task_scheduler;
pub mod task_store;

pub use error::{EngineError, FailureReason, RecoveryAction, StoreError};
pub use hitl::{HitlCoordinator, HitlError, HitlMode, HitlRequest, InputProvider};
pub use recovery::RecoveryEngine;
pub use supervisor::TaskSupervisor;
pub use task::{
    HitlPolicy, Task, TaskConfig, TaskId, TaskNotification, TaskRequest, TaskResult, TaskState,
};
pub use task_scheduler::{RecoveryReport, SchedulerBuilder, TaskScheduler};
#[cfg(feature = "async-sqlite")]
pub use task_store::SqliteTaskStore;
pub use task_store::{InMemoryTaskStore, TaskStore};
