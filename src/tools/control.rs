//! 控制类工具：escalate / transfer_to_<agent> / exit_loop / request_input
//!
//! 不做实际工作，只在 ToolOutput 上设置动作，由 TerminationEvaluator 决定是否结束本轮循环。

use async_trait::async_trait;
use serde_json::Value;

use crate::react::ResponseActions;
use crate::tools::{Tool, ToolError, ToolOutput, ToolRegistry};

pub const ESCALATE_TOOL: &str = "escalate";
pub const EXIT_LOOP_TOOL: &str = "exit_loop";
pub const REQUEST_INPUT_TOOL: &str = "request_input";
pub const TRANSFER_TOOL_PREFIX: &str = "transfer_to_";

fn reason_arg(args: &Value, key: &str) -> Option<String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// 上报：当前任务超出能力范围，交还给调用方
pub struct EscalateTool;

#[async_trait]
impl Tool for EscalateTool {
    fn name(&self) -> &str {
        ESCALATE_TOOL
    }

    fn description(&self) -> &str {
        "Escalate the task to the caller when it cannot be completed. Args: {\"reason\": \"...\"}"
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let reason = reason_arg(&args, "reason").unwrap_or_else(|| "escalated".to_string());
        Ok(ToolOutput::text(reason).with_actions(ResponseActions::escalate()))
    }
}

/// 转交给指定智能体（每个目标注册一个工具）
pub struct TransferTool {
    name: String,
    target: String,
    description: String,
}

impl TransferTool {
    pub fn new(target: impl Into<String>) -> Self {
        let target = target.into();
        Self {
            name: format!("{TRANSFER_TOOL_PREFIX}{target}"),
            description: format!(
                "Transfer the task to agent '{target}'. Args: {{\"message\": \"...\"}}"
            ),
            target,
        }
    }
}

#[async_trait]
impl Tool for TransferTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let message = reason_arg(&args, "message")
            .unwrap_or_else(|| format!("transferred to {}", self.target));
        Ok(ToolOutput::text(message).with_actions(ResponseActions::transfer(&self.target)))
    }
}

/// 显式结束循环
pub struct ExitLoopTool;

#[async_trait]
impl Tool for ExitLoopTool {
    fn name(&self) -> &str {
        EXIT_LOOP_TOOL
    }

    fn description(&self) -> &str {
        "Finish the task. Args: {\"answer\": \"final answer\"}"
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let answer = reason_arg(&args, "answer").unwrap_or_default();
        let mut actions = ResponseActions::complete();
        actions.skip_summarization = true;
        Ok(ToolOutput::text(answer).with_actions(actions))
    }
}

/// 请求人工输入，任务进入 INPUT_REQUIRED
pub struct RequestInputTool;

#[async_trait]
impl Tool for RequestInputTool {
    fn name(&self) -> &str {
        REQUEST_INPUT_TOOL
    }

    fn description(&self) -> &str {
        "Ask a human for input before continuing. Args: {\"prompt\": \"question\"}"
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let prompt = reason_arg(&args, "prompt")
            .ok_or_else(|| ToolError::InvalidArgs("missing 'prompt'".to_string()))?;
        Ok(ToolOutput::text(format!("waiting for input: {prompt}"))
            .with_actions(ResponseActions::input_required(prompt)))
    }
}

/// 注册全部控制工具；transfer_targets 为可转交的智能体名
pub fn register_control_tools(registry: &mut ToolRegistry, transfer_targets: &[String]) {
    registry.register(EscalateTool);
    registry.register(ExitLoopTool);
    registry.register(RequestInputTool);
    for target in transfer_targets {
        registry.register(TransferTool::new(target));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_transfer_sets_target() {
        let out = TransferTool::new("billing").execute(json!({})).await.unwrap();
        assert_eq!(out.actions.transfer_to.as_deref(), Some("billing"));
        assert_eq!(out.content, "transferred to billing");
    }

    #[tokio::test]
    async fn test_request_input_requires_prompt() {
        let err = RequestInputTool.execute(json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs(_)));
        let out = RequestInputTool
            .execute(json!({"prompt": "Which branch?"}))
            .await
            .unwrap();
        assert_eq!(out.actions.input_required.as_deref(), Some("Which branch?"));
    }

    #[test]
    fn test_register_control_tools() {
        let mut registry = ToolRegistry::new();
        register_control_tools(&mut registry, &["billing".to_string()]);
        assert_eq!(
            registry.tool_names(),
            vec!["escalate", "exit_loop", "request_input", "transfer_to_billing"]
        );
    }
}
