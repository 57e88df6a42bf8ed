//! 集成测试公共组件：计数工具、慢速模型、调度器组装

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bee_engine::config::EngineConfig;
use bee_engine::core::TaskScheduler;
use bee_engine::llm::{ModelClient, ModelError, ModelResponse, ToolSpec};
use bee_engine::memory::{Message, ToolCall};
use bee_engine::tools::{
    register_control_tools, EchoTool, Tool, ToolError, ToolExecutor, ToolOutput, ToolRegistry,
};
use serde_json::{json, Value};

/// 记录执行次数的工具
pub struct CountingTool {
    pub runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        "counter"
    }

    fn description(&self) -> &str {
        "counts its invocations"
    }

    async fn execute(&self, _args: Value) -> Result<ToolOutput, ToolError> {
        let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ToolOutput::text(format!("count={n}")))
    }
}

/// 每次调用先等待 delay，再请求一次 echo
pub struct SlowModel {
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl SlowModel {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ModelClient for SlowModel {
    async fn complete(
        &self,
        _messages: &[Message],
        _tools: &[ToolSpec],
    ) -> Result<ModelResponse, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(echo_call("tick"))
    }
}

pub fn echo_call(text: &str) -> ModelResponse {
    ModelResponse::tool_call(ToolCall::new("echo", json!({ "text": text })))
}

pub fn tool_call(name: &str, args: Value) -> ModelResponse {
    ModelResponse::tool_call(ToolCall::new(name, args))
}

/// echo + counter + 控制工具（含 transfer_to_billing）
pub fn executor(runs: Arc<AtomicUsize>) -> Arc<ToolExecutor> {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    registry.register(CountingTool { runs });
    register_control_tools(&mut registry, &["billing".to_string()]);
    Arc::new(ToolExecutor::new(registry, 5))
}

pub fn engine_config(capacity: usize, queue: usize) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.engine.worker_capacity = capacity;
    config.engine.queue_capacity = queue;
    config
}

pub fn scheduler(config: EngineConfig, model: Arc<dyn ModelClient>) -> TaskScheduler {
    TaskScheduler::builder(config, model, executor(Arc::new(AtomicUsize::new(0)))).build()
}
