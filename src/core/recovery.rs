//! 错误恢复引擎
//!
//! 循环内的错误在这里被分类：工具失败与格式错误写回记忆让模型重试，
//! 致命工具错误与模型调用失败直接终止任务。

use crate::core::{FailureReason, RecoveryAction};
use crate::llm::ModelError;
use crate::memory::{Message, ToolCall};
use crate::tools::ToolError;

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle_tool_error(&self, call: &ToolCall, err: &ToolError) -> RecoveryAction {
        match err {
            ToolError::Fatal(_) => RecoveryAction::FailTask(FailureReason::ToolFatal),
            ToolError::UnknownTool(name) => RecoveryAction::AppendAndContinue(Message::tool_error(
                &call.id,
                format!("Error: tool '{name}' does not exist. Use one of the listed tools."),
            )),
            ToolError::Timeout(_) => RecoveryAction::AppendAndContinue(Message::tool_error(
                &call.id,
                format!("Error: tool '{}' timed out.", call.name),
            )),
            ToolError::InvalidArgs(_) | ToolError::Failed(_) => {
                RecoveryAction::AppendAndContinue(Message::tool_error(&call.id, format!("Error: {err}")))
            }
        }
    }

    pub fn handle_model_error(&self, err: &ModelError) -> RecoveryAction {
        match err {
            ModelError::Parse(raw) => RecoveryAction::AppendAndContinue(Message::user(format!(
                "Your previous output was not valid: {raw}. \
                 To call a tool, output only one JSON object of the form \
                 {{\"tool\": \"name\", \"args\": {{...}}}}; otherwise answer in plain text."
            ))),
            ModelError::Request(_) | ModelError::Timeout => {
                RecoveryAction::FailTask(FailureReason::ModelError)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Role;

    fn call() -> ToolCall {
        ToolCall::new("shell", serde_json::json!({})).with_id("c1")
    }

    #[test]
    fn test_recovery_tool_failure_appends_error() {
        let engine = RecoveryEngine::new();
        let action = engine.handle_tool_error(&call(), &ToolError::Failed("exit 1".to_string()));
        match action {
            RecoveryAction::AppendAndContinue(msg) => {
                assert_eq!(msg.role, Role::Tool);
                assert!(msg.is_error);
                assert!(msg.content.contains("exit 1"));
            }
            _ => panic!("Expected AppendAndContinue"),
        }
    }

    #[test]
    fn test_recovery_hallucinated_tool() {
        let engine = RecoveryEngine::new();
        let action = engine.handle_tool_error(&call(), &ToolError::UnknownTool("fake_tool".to_string()));
        match action {
            RecoveryAction::AppendAndContinue(msg) => assert!(msg.content.contains("fake_tool")),
            _ => panic!("Expected AppendAndContinue"),
        }
    }

    #[test]
    fn test_recovery_tool_fatal() {
        let engine = RecoveryEngine::new();
        let action = engine.handle_tool_error(&call(), &ToolError::Fatal("disk gone".to_string()));
        assert!(matches!(action, RecoveryAction::FailTask(FailureReason::ToolFatal)));
    }

    #[test]
    fn test_recovery_parse_error_retries() {
        let engine = RecoveryEngine::new();
        let action = engine.handle_model_error(&ModelError::Parse("invalid json".to_string()));
        match action {
            RecoveryAction::AppendAndContinue(msg) => assert!(msg.content.contains("JSON")),
            _ => panic!("Expected AppendAndContinue"),
        }
    }

    #[test]
    fn test_recovery_model_request_fails_task() {
        let engine = RecoveryEngine::new();
        let action = engine.handle_model_error(&ModelError::Timeout);
        assert!(matches!(action, RecoveryAction::FailTask(FailureReason::ModelError)));
    }
}
