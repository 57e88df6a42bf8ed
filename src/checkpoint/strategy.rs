//! 检查点策略：event / interval / hybrid（封闭枚举，每种策略一个判定分支）

use serde::{Deserialize, Serialize};

/// 检查点所处的循环阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPhase {
    /// 调用模型之前
    BeforeModel,
    /// 单个工具调用完成之后
    PostTool,
    /// 一轮结束（iteration 已递增）
    IterationEnd,
    /// 挂起等待人工输入
    Suspend,
}

impl CheckpointPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointPhase::BeforeModel => "before_model",
            CheckpointPhase::PostTool => "post_tool",
            CheckpointPhase::IterationEnd => "iteration_end",
            CheckpointPhase::Suspend => "suspend",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointStrategy {
    /// 只在语义事件处写入
    Event { after_tools: bool, before_model: bool },
    /// 每 N 轮写入一次
    Interval { every: u32 },
    /// 二者的并集
    Hybrid {
        after_tools: bool,
        before_model: bool,
        every: u32,
    },
}

impl Default for CheckpointStrategy {
    fn default() -> Self {
        CheckpointStrategy::Event {
            after_tools: true,
            before_model: false,
        }
    }
}

fn event_fires(after_tools: bool, before_model: bool, phase: CheckpointPhase) -> bool {
    match phase {
        CheckpointPhase::PostTool => after_tools,
        CheckpointPhase::BeforeModel => before_model,
        CheckpointPhase::Suspend => true,
        CheckpointPhase::IterationEnd => false,
    }
}

fn interval_fires(every: u32, iteration: u32, phase: CheckpointPhase) -> bool {
    match phase {
        CheckpointPhase::IterationEnd => every > 0 && iteration > 0 && iteration % every == 0,
        CheckpointPhase::Suspend => true,
        CheckpointPhase::BeforeModel | CheckpointPhase::PostTool => false,
    }
}

impl CheckpointStrategy {
    /// iteration 为已完成的轮数；挂起总是写入
    pub fn should_checkpoint(&self, iteration: u32, phase: CheckpointPhase) -> bool {
        match *self {
            CheckpointStrategy::Event {
                after_tools,
                before_model,
            } => event_fires(after_tools, before_model, phase),
            CheckpointStrategy::Interval { every } => interval_fires(every, iteration, phase),
            CheckpointStrategy::Hybrid {
                after_tools,
                before_model,
                every,
            } => {
                event_fires(after_tools, before_model, phase)
                    || interval_fires(every, iteration, phase)
            }
        }
    }
}

/// 任务级检查点配置
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointPolicy {
    pub enabled: bool,
    pub strategy: CheckpointStrategy,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: CheckpointStrategy::default(),
        }
    }
}
