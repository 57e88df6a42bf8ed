//! 模型层：结构化模型接口、文本后端适配与 Mock 实现

pub mod adapter;
pub mod mock;
pub mod traits;

pub use adapter::{parse_llm_output, LlmSummarizer, TextModelClient};
pub use mock::{MockLlmClient, ScriptedModelClient};
pub use traits::{LlmClient, ModelClient, ModelError, ModelResponse, TokenStream, ToolSpec};
