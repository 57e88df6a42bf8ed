//! 引擎错误类型、失败原因与恢复动作
//!
//! 与 RecoveryEngine 配合：循环内的错误映射为 AppendAndContinue（写回记忆继续）或 FailTask（带原因码失败）。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::core::hitl::HitlError;
use crate::core::task::TaskState;
use crate::memory::Message;

/// 任务存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task already exists: {0}")]
    Duplicate(String),

    #[error("task serialization failed: {0}")]
    Serialization(String),

    #[error("task store error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// 对外接口（submit / cancel / resume / recover）的错误
#[derive(Error, Debug)]
pub enum EngineError {
    /// 工作池已满且没有排队位置，调用方可退避重试
    #[error("Capacity exceeded: {running} running, {queued} queued")]
    CapacityExceeded { running: usize, queued: usize },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid transition for task {task_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        task_id: String,
        from: TaskState,
        to: TaskState,
    },

    #[error("Task {0} is not waiting for input")]
    NotSuspended(String),

    #[error("Task {0} is not parked for recovery")]
    NotParked(String),

    #[error("No usable checkpoint for task {0}")]
    CheckpointLost(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Hitl(#[from] HitlError),
}

/// 终态 FAILED 的机器可读原因
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// 安全阀：达到最大轮数
    IterationLimitReached,
    ToolFatal,
    /// 超过任务总时限
    Timeout,
    HitlTimeout,
    RecoveryExpired,
    /// 检查点写入失败或缺失，无法安全恢复
    CheckpointLost,
    ModelError,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::IterationLimitReached => "iteration_limit_reached",
            FailureReason::ToolFatal => "tool_fatal",
            FailureReason::Timeout => "timeout",
            FailureReason::HitlTimeout => "hitl_timeout",
            FailureReason::RecoveryExpired => "recovery_expired",
            FailureReason::CheckpointLost => "checkpoint_lost",
            FailureReason::ModelError => "model_error",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 恢复引擎根据错误类型给出的动作
#[derive(Debug, Clone)]
pub enum RecoveryAction {
    /// 把消息写回记忆，循环继续（模型自行应对）
    AppendAndContinue(Message),
    /// 终止任务
    FailTask(FailureReason),
}
