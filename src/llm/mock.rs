//! Mock 模型（用于测试与本地演示，无需 API）
//!
//! MockLlmClient：文本后端，先把最后一条 User 消息交给 echo 工具，拿到工具结果后直接作答。
//! ScriptedModelClient：按脚本逐次返回 ModelResponse，记录调用次数与每次看到的上下文。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{LlmClient, ModelClient, ModelError, ModelResponse, TokenStream, ToolSpec};
use crate::memory::{Message, Role};

/// Mock 文本客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        if let Some(last) = messages.last().filter(|m| m.role == Role::Tool) {
            return Ok(format!("Done: {}", last.content));
        }
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        Ok(serde_json::json!({"tool": "echo", "args": {"text": last_user}}).to_string())
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, String> {
        let content = self.complete(messages).await?;
        let chunks: Vec<Result<String, String>> = content
            .chars()
            .collect::<Vec<_>>()
            .chunks(8)
            .map(|c| Ok(c.iter().collect()))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

/// 脚本化模型：脚本耗尽后重复 fallback
pub struct ScriptedModelClient {
    script: Mutex<VecDeque<Result<ModelResponse, ModelError>>>,
    fallback: Result<ModelResponse, ModelError>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedModelClient {
    pub fn new(script: Vec<Result<ModelResponse, ModelError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Ok(ModelResponse::text("done")),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// 每次都返回同一个回复
    pub fn repeating(response: ModelResponse) -> Self {
        Self::new(Vec::new()).with_fallback(Ok(response))
    }

    pub fn with_fallback(mut self, fallback: Result<ModelResponse, ModelError>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 每次调用时传入的上下文
    pub fn seen(&self) -> Vec<Vec<Message>> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn complete(
        &self,
        messages: &[Message],
        _tools: &[ToolSpec],
    ) -> Result<ModelResponse, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(messages.to_vec());
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_answers_after_tool_result() {
        let client = MockLlmClient;
        let first = client.complete(&[Message::user("hello")]).await.unwrap();
        assert!(first.contains("\"echo\""));

        let second = client
            .complete(&[Message::user("hello"), Message::tool_result("c1", "hello")])
            .await
            .unwrap();
        assert_eq!(second, "Done: hello");
    }

    #[tokio::test]
    async fn test_scripted_falls_back_when_exhausted() {
        let model = ScriptedModelClient::new(vec![Ok(ModelResponse::text("first"))]);
        let a = model.complete(&[], &[]).await.unwrap();
        let b = model.complete(&[], &[]).await.unwrap();
        assert_eq!(a.content, "first");
        assert_eq!(b.content, "done");
        assert_eq!(model.calls(), 2);
    }
}
