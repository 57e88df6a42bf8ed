//! 任务模型：生命周期状态、任务级配置与结果
//!
//! CREATED → RUNNING → {COMPLETED, FAILED, CANCELLED, INPUT_REQUIRED}；
//! INPUT_REQUIRED → {RUNNING, FAILED, CANCELLED}。只有调度器写入状态。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointPolicy;
use crate::core::hitl::{HitlMode, HitlRequest};
use crate::core::FailureReason;
use crate::memory::MemoryStrategy;
use crate::react::TerminationCondition;

pub const DEFAULT_MAX_ITERATIONS: u32 = 100;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_INPUT_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_TOKEN_BUDGET: usize = 8000;
pub const DEFAULT_DEFAULT_INPUT: &str = "continue";

/// 任务 ID
pub type TaskId = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Created,
    Running,
    InputRequired,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn can_transition_to(&self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Created, Running | Cancelled | Failed)
                | (Running, Completed | Failed | Cancelled | InputRequired)
                | (InputRequired, Running | Failed | Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Created => "CREATED",
            TaskState::Running => "RUNNING",
            TaskState::InputRequired => "INPUT_REQUIRED",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::Cancelled => "CANCELLED",
        }
    }
}

/// 人机协同策略
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HitlPolicy {
    pub mode: HitlMode,
    /// auto 模式与超时自动恢复时使用的输入
    pub default_input: String,
}

impl Default for HitlPolicy {
    fn default() -> Self {
        Self {
            mode: HitlMode::Async,
            default_input: DEFAULT_DEFAULT_INPUT.to_string(),
        }
    }
}

/// 提交时确定的任务级配置（解析后的有效值，不含未设置状态）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub max_iterations: u32,
    /// 任务总时限（秒，自首次开始运行起算），0 表示不限
    pub timeout_secs: u64,
    /// INPUT_REQUIRED 等待时限（秒），0 表示不限
    pub input_timeout_secs: u64,
    pub memory: MemoryStrategy,
    pub checkpoint: CheckpointPolicy,
    pub hitl: HitlPolicy,
    pub termination: Vec<TerminationCondition>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            input_timeout_secs: DEFAULT_INPUT_TIMEOUT_SECS,
            memory: MemoryStrategy::TokenBudget {
                budget: DEFAULT_TOKEN_BUDGET,
                preserve_recent: 5,
            },
            checkpoint: CheckpointPolicy::default(),
            hitl: HitlPolicy::default(),
            termination: TerminationCondition::all(),
        }
    }
}

/// 任务结束时的结构化结果；escalate / transfer 交给调用方重新路由
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskResult {
    Answer { content: String },
    Escalated { content: String },
    Transferred { target: String, content: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub session_id: String,
    pub goal: String,
    pub state: TaskState,
    pub failure: Option<FailureReason>,
    pub failure_detail: Option<String>,
    pub result: Option<TaskResult>,
    pub config: TaskConfig,
    /// 已完成的轮数
    pub iterations: u32,
    /// 最近一次检查点写入失败，崩溃后不能假设可恢复
    pub unprotected: bool,
    pub last_checkpoint: Option<u64>,
    pub input_request: Option<HitlRequest>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(session_id: impl Into<String>, goal: impl Into<String>, config: TaskConfig) -> Self {
        let now = Utc::now();
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            session_id: session_id.into(),
            goal: goal.into(),
            state: TaskState::Created,
            failure: None,
            failure_detail: None,
            result: None,
            config,
            iterations: 0,
            unprotected: false,
            last_checkpoint: None,
            input_request: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// 总时限截止时间（未开始或不限时为 None）
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        if self.config.timeout_secs == 0 {
            return None;
        }
        self.started_at
            .map(|s| s + chrono::Duration::seconds(self.config.timeout_secs as i64))
    }
}

/// 提交请求
#[derive(Clone, Debug)]
pub struct TaskRequest {
    pub goal: String,
    pub session_id: Option<String>,
    pub config: Option<TaskConfig>,
}

impl TaskRequest {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            session_id: None,
            config: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = Some(config);
        self
    }
}

/// 任务状态变化通知
#[derive(Debug, Clone)]
pub struct TaskNotification {
    pub task_id: TaskId,
    pub state: TaskState,
    pub failure: Option<FailureReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use TaskState::*;
        assert!(Created.can_transition_to(Running));
        assert!(Running.can_transition_to(InputRequired));
        assert!(InputRequired.can_transition_to(Running));
        assert!(!InputRequired.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Cancelled));
    }

    #[test]
    fn test_task_id_and_deadline() {
        let mut task = Task::new("s1", "goal", TaskConfig::default());
        assert!(task.id.starts_with("task_"));
        assert!(task.deadline().is_none());
        let start = Utc::now();
        task.started_at = Some(start);
        assert_eq!(
            task.deadline(),
            Some(start + chrono::Duration::seconds(DEFAULT_TASK_TIMEOUT_SECS as i64))
        );
    }

    #[test]
    fn test_state_serializes_upper_case() {
        let json = serde_json::to_string(&TaskState::InputRequired).unwrap();
        assert_eq!(json, "\"INPUT_REQUIRED\"");
    }
}
