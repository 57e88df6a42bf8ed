//! 推理循环控制器
//!
//! 每轮：调用模型 -> 若请求工具则逐个执行并把调用与结果写回记忆 -> 终止判定 -> 按策略写检查点。
//! 循环本身从不阻塞等待人工输入：需要输入时写入挂起检查点并返回 Suspended，由调度器释放工作槽。
//! 取消在每轮开始前检查；进行中的模型/工具调用会先完成。

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointPhase, PendingDispatch, TaskCheckpointer};
use crate::core::hitl::HitlMode;
use crate::core::task::{HitlPolicy, TaskResult};
use crate::core::{FailureReason, RecoveryAction, RecoveryEngine};
use crate::llm::ModelClient;
use crate::memory::{Message, WorkingMemory};
use crate::react::{LoopEvent, TerminationEvaluator, TerminationOutcome};
use crate::tools::ToolExecutor;

/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

/// 循环结束方式；终态由调度器写入
#[derive(Debug, Clone, PartialEq)]
pub enum LoopOutcome {
    Completed { result: TaskResult, iterations: u32 },
    Failed {
        reason: FailureReason,
        detail: String,
        iterations: u32,
    },
    /// 等待人工输入，iteration 为已完成轮数
    Suspended { prompt: String, iteration: u32 },
    Cancelled { iteration: u32 },
}

impl LoopOutcome {
    /// 结束时已完成的轮数
    pub fn iterations(&self) -> u32 {
        match self {
            LoopOutcome::Completed { iterations, .. } | LoopOutcome::Failed { iterations, .. } => {
                *iterations
            }
            LoopOutcome::Suspended { iteration, .. } | LoopOutcome::Cancelled { iteration } => {
                *iteration
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            LoopOutcome::Completed { .. } => "completed",
            LoopOutcome::Failed { .. } => "failed",
            LoopOutcome::Suspended { .. } => "suspended",
            LoopOutcome::Cancelled { .. } => "cancelled",
        }
    }
}

/// 单个任务的推理循环
pub struct ReasoningLoop {
    task_id: String,
    model: Arc<dyn ModelClient>,
    executor: Arc<ToolExecutor>,
    evaluator: TerminationEvaluator,
    recovery: RecoveryEngine,
    cancel_token: CancellationToken,
    checkpointer: Option<TaskCheckpointer>,
    event_tx: Option<UnboundedSender<LoopEvent>>,
    hitl: HitlPolicy,
}

impl ReasoningLoop {
    pub fn new(
        task_id: impl Into<String>,
        model: Arc<dyn ModelClient>,
        executor: Arc<ToolExecutor>,
        evaluator: TerminationEvaluator,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            model,
            executor,
            evaluator,
            recovery: RecoveryEngine::new(),
            cancel_token,
            checkpointer: None,
            event_tx: None,
            hitl: HitlPolicy::default(),
        }
    }

    pub fn with_checkpointer(mut self, checkpointer: TaskCheckpointer) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<LoopEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_hitl(mut self, hitl: HitlPolicy) -> Self {
        self.hitl = hitl;
        self
    }

    fn send_event(&self, ev: LoopEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(ev);
        }
    }

    fn limit_failure(&self, iterations: u32) -> LoopOutcome {
        tracing::warn!(
            task_id = %self.task_id,
            iterations,
            "iteration limit reached without a stop condition"
        );
        LoopOutcome::Failed {
            reason: FailureReason::IterationLimitReached,
            detail: format!("stopped after {iterations} iterations without a stop condition"),
            iterations,
        }
    }

    /// 按策略写检查点；失败只记录并上报事件，不打断循环
    async fn checkpoint(
        &self,
        phase: CheckpointPhase,
        iteration: u32,
        memory: &WorkingMemory,
        pending: Option<PendingDispatch>,
    ) {
        let Some(checkpointer) = &self.checkpointer else {
            return;
        };
        if !checkpointer.should_checkpoint(iteration, phase) {
            return;
        }
        match checkpointer.write(iteration, phase, memory.snapshot(), pending).await {
            Ok(cp) => self.send_event(LoopEvent::CheckpointWritten {
                sequence: cp.sequence,
                iteration,
                phase: phase.as_str().to_string(),
            }),
            Err(e) => {
                tracing::warn!(
                    task_id = %self.task_id,
                    phase = phase.as_str(),
                    error = %e,
                    "checkpoint write failed, task is unprotected"
                );
                self.send_event(LoopEvent::CheckpointFailed {
                    phase: phase.as_str().to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    /// 从 start_iteration 开始驱动循环；pending 为恢复时尚未分发完的工具调用
    pub async fn run(
        &self,
        memory: &mut WorkingMemory,
        start_iteration: u32,
        pending: Option<PendingDispatch>,
    ) -> LoopOutcome {
        let outcome = self.drive(memory, start_iteration, pending).await;
        self.send_event(LoopEvent::Finished {
            iterations: outcome.iterations(),
            outcome: outcome.label().to_string(),
        });
        outcome
    }

    async fn drive(
        &self,
        memory: &mut WorkingMemory,
        start_iteration: u32,
        pending: Option<PendingDispatch>,
    ) -> LoopOutcome {
        let specs = self.executor.specs();
        let max_iterations = self.evaluator.max_iterations();
        let mut iteration = start_iteration;
        let mut pending = pending;

        loop {
            if self.cancel_token.is_cancelled() {
                tracing::info!(task_id = %self.task_id, iteration, "cancelled at iteration boundary");
                return LoopOutcome::Cancelled { iteration };
            }

            let mut dispatch = match pending.take() {
                Some(p) => {
                    tracing::info!(
                        task_id = %self.task_id,
                        iteration,
                        remaining = p.remaining.len(),
                        "resuming interrupted tool dispatch"
                    );
                    p
                }
                None => {
                    if self.evaluator.limit_reached(iteration) {
                        return self.limit_failure(iteration);
                    }
                    self.send_event(LoopEvent::IterationStarted {
                        iteration,
                        max_iterations,
                    });
                    self.checkpoint(CheckpointPhase::BeforeModel, iteration, memory, None)
                        .await;

                    let response = match self.model.complete(&memory.context(), &specs).await {
                        Ok(r) => r,
                        Err(e) => match self.recovery.handle_model_error(&e) {
                            RecoveryAction::AppendAndContinue(msg) => {
                                tracing::warn!(task_id = %self.task_id, error = %e, "retrying after bad model output");
                                memory.append(msg).await;
                                iteration += 1;
                                if self.evaluator.limit_reached(iteration) {
                                    return self.limit_failure(iteration);
                                }
                                self.checkpoint(CheckpointPhase::IterationEnd, iteration, memory, None)
                                    .await;
                                continue;
                            }
                            RecoveryAction::FailTask(reason) => {
                                tracing::error!(task_id = %self.task_id, error = %e, "model call failed");
                                return LoopOutcome::Failed {
                                    reason,
                                    detail: e.to_string(),
                                    iterations: iteration,
                                };
                            }
                        },
                    };

                    self.send_event(LoopEvent::ModelResponded {
                        iteration,
                        tool_calls: response.tool_calls.len(),
                    });
                    memory
                        .append(Message::assistant_with_tools(
                            response.content.clone(),
                            response.tool_calls.clone(),
                        ))
                        .await;
                    PendingDispatch {
                        content: response.content,
                        has_tool_calls: !response.tool_calls.is_empty(),
                        remaining: response.tool_calls,
                        actions: response.actions,
                        last_tool_output: None,
                    }
                }
            };

            while !dispatch.remaining.is_empty() {
                let call = dispatch.remaining.remove(0);
                match self.executor.execute(&call).await {
                    Ok(output) => {
                        dispatch.actions.merge(&output.actions);
                        self.send_event(LoopEvent::ToolCompleted {
                            tool: call.name.clone(),
                            preview: output.content.chars().take(OBSERVATION_PREVIEW_CHARS).collect(),
                        });
                        memory
                            .append(Message::tool_result(&call.id, output.content.clone()))
                            .await;
                        dispatch.last_tool_output = Some(output.content);
                    }
                    Err(err) => match self.recovery.handle_tool_error(&call, &err) {
                        RecoveryAction::AppendAndContinue(msg) => {
                            tracing::warn!(task_id = %self.task_id, tool = %call.name, error = %err, "tool failed");
                            self.send_event(LoopEvent::ToolFailed {
                                tool: call.name.clone(),
                                reason: err.to_string(),
                            });
                            memory.append(msg).await;
                        }
                        RecoveryAction::FailTask(reason) => {
                            tracing::error!(task_id = %self.task_id, tool = %call.name, error = %err, "fatal tool error");
                            return LoopOutcome::Failed {
                                reason,
                                detail: err.to_string(),
                                iterations: iteration,
                            };
                        }
                    },
                }
                self.checkpoint(CheckpointPhase::PostTool, iteration, memory, Some(dispatch.clone()))
                    .await;
            }

            let completed = iteration + 1;
            match self
                .evaluator
                .evaluate(dispatch.has_tool_calls, &dispatch.actions, completed)
            {
                TerminationOutcome::Continue => {
                    iteration = completed;
                    self.checkpoint(CheckpointPhase::IterationEnd, iteration, memory, None)
                        .await;
                }
                TerminationOutcome::StopNormal => {
                    let content = if dispatch.actions.skip_summarization {
                        dispatch.last_tool_output.unwrap_or(dispatch.content)
                    } else {
                        dispatch.content
                    };
                    tracing::info!(task_id = %self.task_id, iterations = completed, "task completed");
                    return LoopOutcome::Completed {
                        result: TaskResult::Answer { content },
                        iterations: completed,
                    };
                }
                TerminationOutcome::StopEscalate => {
                    tracing::info!(task_id = %self.task_id, "task escalated");
                    return LoopOutcome::Completed {
                        result: TaskResult::Escalated {
                            content: dispatch.last_tool_output.unwrap_or(dispatch.content),
                        },
                        iterations: completed,
                    };
                }
                TerminationOutcome::StopTransfer(target) => {
                    tracing::info!(task_id = %self.task_id, target = %target, "task transferred");
                    return LoopOutcome::Completed {
                        result: TaskResult::Transferred {
                            target,
                            content: dispatch.last_tool_output.unwrap_or(dispatch.content),
                        },
                        iterations: completed,
                    };
                }
                TerminationOutcome::StopInputRequired(prompt) => {
                    if self.hitl.mode == HitlMode::Auto {
                        tracing::info!(task_id = %self.task_id, prompt = %prompt, "auto mode supplies default input");
                        memory.append(Message::user(self.hitl.default_input.clone())).await;
                        iteration = completed;
                        if self.evaluator.limit_reached(iteration) {
                            return self.limit_failure(iteration);
                        }
                        self.checkpoint(CheckpointPhase::IterationEnd, iteration, memory, None)
                            .await;
                        continue;
                    }
                    self.checkpoint(CheckpointPhase::Suspend, completed, memory, None)
                        .await;
                    self.send_event(LoopEvent::Suspended {
                        prompt: prompt.clone(),
                        iteration: completed,
                    });
                    return LoopOutcome::Suspended {
                        prompt,
                        iteration: completed,
                    };
                }
                TerminationOutcome::StopSafetyLimit => return self.limit_failure(completed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointManager, CheckpointStrategy, InMemoryCheckpointStore};
    use crate::llm::{ModelError, ModelResponse, ScriptedModelClient};
    use crate::memory::{MemoryStrategy, Role, ToolCall};
    use crate::react::{ResponseActions, TerminationCondition};
    use crate::tools::{register_control_tools, EchoTool, Tool, ToolError, ToolOutput, ToolRegistry};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct BrokenTool {
        fatal: bool,
    }

    #[async_trait]
    impl Tool for BrokenTool {
        fn name(&self) -> &str {
            "broken"
        }

        fn description(&self) -> &str {
            "always fails"
        }

        async fn execute(&self, _args: Value) -> Result<ToolOutput, ToolError> {
            if self.fatal {
                Err(ToolError::Fatal("sandbox gone".to_string()))
            } else {
                Err(ToolError::Failed("exit status 1".to_string()))
            }
        }
    }

    fn executor(fatal: bool) -> Arc<ToolExecutor> {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(BrokenTool { fatal });
        register_control_tools(&mut registry, &["billing".to_string()]);
        Arc::new(ToolExecutor::new(registry, 5))
    }

    fn echo_call() -> ModelResponse {
        ModelResponse::tool_call(ToolCall::new("echo", json!({"text": "again"})))
    }

    fn build(model: Arc<ScriptedModelClient>, max: u32, fatal: bool) -> ReasoningLoop {
        ReasoningLoop::new(
            "task_test",
            model,
            executor(fatal),
            TerminationEvaluator::new(TerminationCondition::all(), max),
            CancellationToken::new(),
        )
    }

    async fn memory_with_goal() -> WorkingMemory {
        let mut memory = WorkingMemory::new(MemoryStrategy::None);
        memory.append(Message::user("goal")).await;
        memory
    }

    #[tokio::test]
    async fn test_safety_limit_fails_after_exact_iterations() {
        let model = Arc::new(ScriptedModelClient::repeating(echo_call()));
        let lp = build(model.clone(), 5, false);
        let mut memory = memory_with_goal().await;

        let outcome = lp.run(&mut memory, 0, None).await;
        assert!(matches!(
            outcome,
            LoopOutcome::Failed {
                reason: FailureReason::IterationLimitReached,
                iterations: 5,
                ..
            }
        ));
        assert_eq!(model.calls(), 5);
    }

    #[tokio::test]
    async fn test_tool_failure_is_appended_and_loop_continues() {
        let model = Arc::new(ScriptedModelClient::new(vec![
            Ok(ModelResponse::tool_call(ToolCall::new("broken", json!({})))),
            Ok(ModelResponse::text("recovered")),
        ]));
        let lp = build(model.clone(), 10, false);
        let mut memory = memory_with_goal().await;

        let outcome = lp.run(&mut memory, 0, None).await;
        assert_eq!(
            outcome,
            LoopOutcome::Completed {
                result: TaskResult::Answer {
                    content: "recovered".to_string()
                },
                iterations: 2,
            }
        );
        let error = memory
            .messages()
            .find(|m| m.role == Role::Tool)
            .expect("tool error recorded");
        assert!(error.is_error);
    }

    #[tokio::test]
    async fn test_fatal_tool_error_fails_task() {
        let model = Arc::new(ScriptedModelClient::repeating(ModelResponse::tool_call(
            ToolCall::new("broken", json!({})),
        )));
        let lp = build(model, 10, true);
        let mut memory = memory_with_goal().await;
        let outcome = lp.run(&mut memory, 0, None).await;
        assert!(matches!(
            outcome,
            LoopOutcome::Failed {
                reason: FailureReason::ToolFatal,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_model_error_fails_task() {
        let model = Arc::new(ScriptedModelClient::new(vec![Err(ModelError::Request(
            "503".to_string(),
        ))]));
        let lp = build(model, 10, false);
        let mut memory = memory_with_goal().await;
        let outcome = lp.run(&mut memory, 0, None).await;
        assert!(matches!(
            outcome,
            LoopOutcome::Failed {
                reason: FailureReason::ModelError,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_transfer_returns_structured_result() {
        let model = Arc::new(ScriptedModelClient::new(vec![Ok(ModelResponse::tool_call(
            ToolCall::new("transfer_to_billing", json!({"message": "refund request"})),
        ))]));
        let lp = build(model, 10, false);
        let mut memory = memory_with_goal().await;
        let outcome = lp.run(&mut memory, 0, None).await;
        assert_eq!(
            outcome,
            LoopOutcome::Completed {
                result: TaskResult::Transferred {
                    target: "billing".to_string(),
                    content: "refund request".to_string(),
                },
                iterations: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_input_required_suspends_with_checkpoint() {
        let model = Arc::new(ScriptedModelClient::new(vec![
            Ok(echo_call()),
            Ok(ModelResponse::text("Which environment?")
                .with_actions(ResponseActions::input_required("Which environment?"))),
        ]));
        let store = Arc::new(InMemoryCheckpointStore::new());
        let manager = Arc::new(CheckpointManager::new(store.clone(), 0));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let lp = build(model, 10, false)
            .with_checkpointer(manager.for_task("task_test", CheckpointStrategy::default()))
            .with_event_tx(tx);
        let mut memory = memory_with_goal().await;

        let outcome = lp.run(&mut memory, 0, None).await;
        assert_eq!(
            outcome,
            LoopOutcome::Suspended {
                prompt: "Which environment?".to_string(),
                iteration: 2,
            }
        );
        // 一次工具调用后的检查点 + 挂起检查点
        assert_eq!(store.sequences("task_test").await, vec![1, 2]);
        let latest = manager.load_latest("task_test").await.unwrap();
        match latest {
            crate::checkpoint::LoadOutcome::Found(cp) => {
                assert_eq!(cp.iteration, 2);
                assert_eq!(cp.phase, CheckpointPhase::Suspend);
            }
            other => panic!("unexpected {other:?}"),
        }
        let mut saw_suspend = false;
        while let Ok(ev) = rx.try_recv() {
            saw_suspend |= matches!(ev, LoopEvent::Suspended { .. });
        }
        assert!(saw_suspend);
    }

    #[tokio::test]
    async fn test_auto_mode_continues_without_suspending() {
        let model = Arc::new(ScriptedModelClient::new(vec![
            Ok(ModelResponse::text("?").with_actions(ResponseActions::input_required("ok?"))),
            Ok(ModelResponse::text("finished")),
        ]));
        let lp = build(model.clone(), 10, false).with_hitl(HitlPolicy {
            mode: HitlMode::Auto,
            default_input: "yes".to_string(),
        });
        let mut memory = memory_with_goal().await;
        let outcome = lp.run(&mut memory, 0, None).await;
        assert!(matches!(outcome, LoopOutcome::Completed { iterations: 2, .. }));
        let seen = model.seen();
        assert_eq!(seen[1].last().map(|m| m.content.as_str()), Some("yes"));
    }

    #[tokio::test]
    async fn test_cancel_observed_at_boundary() {
        let model = Arc::new(ScriptedModelClient::repeating(echo_call()));
        let token = CancellationToken::new();
        token.cancel();
        let lp = ReasoningLoop::new(
            "task_test",
            model.clone(),
            executor(false),
            TerminationEvaluator::new(TerminationCondition::all(), 10),
            token,
        );
        let mut memory = memory_with_goal().await;
        assert_eq!(
            lp.run(&mut memory, 3, None).await,
            LoopOutcome::Cancelled { iteration: 3 }
        );
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_resume_pending_dispatch_skips_model() {
        let model = Arc::new(ScriptedModelClient::new(vec![Ok(ModelResponse::text("final"))]));
        let lp = build(model.clone(), 10, false);
        let mut memory = memory_with_goal().await;
        let pending = PendingDispatch {
            content: String::new(),
            remaining: vec![ToolCall::new("echo", json!({"text": "second"})).with_id("c2")],
            actions: ResponseActions::default(),
            has_tool_calls: true,
            last_tool_output: Some("first".to_string()),
        };
        let outcome = lp.run(&mut memory, 4, Some(pending)).await;
        assert!(matches!(outcome, LoopOutcome::Completed { iterations: 6, .. }));
        // 只为第 6 轮调用了一次模型
        assert_eq!(model.calls(), 1);
        assert!(memory
            .messages()
            .any(|m| m.tool_call_id.as_deref() == Some("c2")));
    }
}
