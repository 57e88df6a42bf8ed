//! 检查点：策略、管理器与存储
//!
//! 推理循环在策略规定的阶段写入快照；调度器在启动恢复或显式恢复时读取最新一条。

pub mod manager;
pub mod store;
pub mod strategy;

pub use manager::{CheckpointManager, LoadOutcome, TaskCheckpointer};
#[cfg(feature = "async-sqlite")]
pub use store::SqliteCheckpointStore;
pub use store::{
    Checkpoint, CheckpointError, CheckpointStore, InMemoryCheckpointStore, PendingDispatch,
};
pub use strategy::{CheckpointPhase, CheckpointPolicy, CheckpointStrategy};
