//! 文本协议适配
//!
//! 把只会输出文本的 LlmClient 适配成 ModelClient：在 system 中列出可用工具，
//! 约定 `{"tool": "名称", "args": {...}}` 为工具调用，其余文本为最终回复。
//! 流式后端的 Token 在这里收集为一次完整回复。

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;

use crate::llm::{LlmClient, ModelClient, ModelError, ModelResponse, ToolSpec};
use crate::memory::{Message, Summarizer, ToolCall};

/// 文本中的工具调用（简化 JSON：{"tool": "echo", "args": {"text": "..."}}）
#[derive(Debug, Deserialize)]
struct TextToolCall {
    tool: String,
    #[serde(default)]
    args: serde_json::Value,
}

/// 解析 LLM 输出：若含有效 JSON 且 tool 非空则为工具调用，否则为直接回复
pub fn parse_llm_output(output: &str) -> Result<ModelResponse, ModelError> {
    let trimmed = output.trim();

    // 尝试提取 JSON 块（```json ... ``` 或纯 JSON）
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            &trimmed[start..=end]
        } else {
            return Ok(ModelResponse::text(trimmed));
        }
    } else {
        return Ok(ModelResponse::text(trimmed));
    };

    let parsed: TextToolCall = serde_json::from_str(json_str)
        .map_err(|e| ModelError::Parse(format!("{}: {}", e, json_str)))?;

    if parsed.tool.is_empty() {
        Ok(ModelResponse::text(trimmed))
    } else {
        Ok(ModelResponse::tool_call(ToolCall::new(parsed.tool, parsed.args)))
    }
}

fn tool_prompt(tools: &[ToolSpec]) -> String {
    let catalog = serde_json::to_string_pretty(tools).unwrap_or_else(|_| "[]".to_string());
    format!(
        "To call a tool, reply with exactly one JSON object: {{\"tool\": \"<name>\", \"args\": {{...}}}}.\n\
         Otherwise reply with your final answer in plain text.\n\nAvailable tools:\n{catalog}"
    )
}

/// 文本后端适配为 ModelClient
pub struct TextModelClient {
    llm: Arc<dyn LlmClient>,
    streaming: bool,
}

impl TextModelClient {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            streaming: false,
        }
    }

    /// 使用流式接口，收集全部 Token 后再解析
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    async fn collect(&self, messages: &[Message]) -> Result<String, ModelError> {
        if !self.streaming {
            return self.llm.complete(messages).await.map_err(ModelError::Request);
        }
        let mut stream = self
            .llm
            .complete_stream(messages)
            .await
            .map_err(ModelError::Request)?;
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            output.push_str(&chunk.map_err(ModelError::Request)?);
        }
        Ok(output)
    }
}

#[async_trait]
impl ModelClient for TextModelClient {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<ModelResponse, ModelError> {
        let mut prompt = Vec::with_capacity(messages.len() + 1);
        if !tools.is_empty() {
            prompt.push(Message::system(tool_prompt(tools)));
        }
        prompt.extend_from_slice(messages);
        let output = self.collect(&prompt).await?;
        parse_llm_output(&output)
    }
}

/// 基于文本后端的摘要器
pub struct LlmSummarizer {
    llm: Arc<dyn LlmClient>,
}

impl LlmSummarizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(
        &self,
        messages: &[Message],
        previous: Option<&str>,
    ) -> Result<String, ModelError> {
        let mut instruction = String::from(
            "Summarize the conversation below. Keep facts, decisions, tool results and open questions. \
             Reply with the summary only.",
        );
        if let Some(prev) = previous {
            instruction.push_str("\n\nExtend this earlier summary:\n");
            instruction.push_str(prev);
        }
        let mut prompt = Vec::with_capacity(messages.len() + 1);
        prompt.push(Message::system(instruction));
        prompt.extend_from_slice(messages);

        let summary = self.llm.complete(&prompt).await.map_err(ModelError::Request)?;
        let summary = summary.trim();
        if summary.is_empty() {
            return Err(ModelError::Parse("empty summary".to_string()));
        }
        Ok(summary.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[test]
    fn test_parse_tool_call() {
        let resp = parse_llm_output(r#"{"tool": "echo", "args": {"text": "hi"}}"#).unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "echo");
        assert_eq!(resp.tool_calls[0].args["text"], "hi");
    }

    #[test]
    fn test_parse_fenced_tool_call() {
        let out = "Let me check.\n```json\n{\"tool\": \"echo\", \"args\": {}}\n```";
        let resp = parse_llm_output(out).unwrap();
        assert_eq!(resp.tool_calls[0].name, "echo");
    }

    #[test]
    fn test_parse_plain_answer() {
        let resp = parse_llm_output("The answer is 42.").unwrap();
        assert!(resp.tool_calls.is_empty());
        assert_eq!(resp.content, "The answer is 42.");
    }

    #[test]
    fn test_parse_broken_json() {
        let err = parse_llm_output(r#"{"tool": "echo", "args": }"#).unwrap_err();
        assert!(matches!(err, ModelError::Parse(_)));
    }

    #[tokio::test]
    async fn test_streaming_collects_into_one_call() {
        let model = TextModelClient::new(Arc::new(MockLlmClient::default())).with_streaming(true);
        let resp = model.complete(&[Message::user("ping")], &[]).await.unwrap();
        assert_eq!(resp.tool_calls[0].name, "echo");
        assert_eq!(resp.tool_calls[0].args["text"], "ping");
    }
}
