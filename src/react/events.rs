//! 推理循环过程事件：调度器据此维护检查点状态，也可序列化为 JSON 推给前端

use serde::Serialize;

/// 单步过程事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    /// 新一轮开始（iteration 为已完成轮数）
    IterationStarted { iteration: u32, max_iterations: u32 },
    /// 模型返回
    ModelResponded { iteration: u32, tool_calls: usize },
    /// 工具返回（预览，避免过长）
    ToolCompleted { tool: String, preview: String },
    /// 工具失败，已作为错误结果写回记忆
    ToolFailed { tool: String, reason: String },
    CheckpointWritten { sequence: u64, iteration: u32, phase: String },
    /// 检查点写入失败，任务标记为 unprotected
    CheckpointFailed { phase: String, error: String },
    /// 挂起等待人工输入
    Suspended { prompt: String, iteration: u32 },
    /// 循环结束（completed / failed / suspended / cancelled）
    Finished { iterations: u32, outcome: String },
}
