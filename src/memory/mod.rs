//! 记忆层：对话消息模型、Token 估算与有界 Working Memory

pub mod conversation;
pub mod token_budget;
pub mod working;

pub use conversation::{Message, Role, ToolCall};
pub use token_budget::{truncate_to_tokens, TokenEstimator};
pub use working::{
    MemoryStrategy, StrategyKind, Summarizer, SummarizingPolicy, WorkingMemory,
    WorkingMemoryState, SUMMARY_PREFIX,
};
