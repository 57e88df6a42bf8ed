//! 模型调用抽象
//!
//! ModelClient：推理循环每轮调用一次的结构化接口（回复文本 + 工具调用 + 控制动作）。
//! LlmClient：纯文本后端（非流式 / 流式 Token），由 TextModelClient 适配为 ModelClient。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::memory::{Message, ToolCall};
use crate::react::ResponseActions;

/// 模型调用错误
#[derive(Error, Debug, Clone)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Request(String),

    #[error("model request timed out")]
    Timeout,

    #[error("model output unparseable: {0}")]
    Parse(String),
}

/// 交给模型的工具描述
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 单次模型调用的结构化结果
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub actions: ResponseActions,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn tool_call(call: ToolCall) -> Self {
        Self {
            tool_calls: vec![call],
            ..Self::default()
        }
    }

    pub fn with_actions(mut self, actions: ResponseActions) -> Self {
        self.actions = actions;
        self
    }
}

/// 推理循环使用的模型接口；实现可以内部流式，对循环而言是一次逻辑调用
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<ModelResponse, ModelError>;
}

/// 文本流
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, String>> + Send>>;

/// 文本 LLM 后端：非流式完成与流式完成（返回 Token 流）
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;

    /// 流式完成，返回 Token 流
    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, String>;
}
