//! bee-engine 入口
//!
//! 加载配置、初始化日志、组装调度器（Mock LLM + echo / 控制工具），执行启动恢复，
//! 然后提交命令行给出的目标并跟随通知直到任务结束。Ctrl+C 取消任务。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bee_engine::config::load_config;
use bee_engine::core::{TaskScheduler, TaskState};
use bee_engine::llm::{LlmClient, LlmSummarizer, MockLlmClient, TextModelClient};
use bee_engine::observability;
use bee_engine::tools::{register_control_tools, EchoTool, ToolExecutor, ToolRegistry};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let raw = load_config(None).context("Failed to load config")?;
    let config = raw.resolve().context("Invalid config")?;
    observability::init();

    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    if config.control.enabled {
        register_control_tools(&mut registry, &config.control.transfer_targets);
    }
    let executor = Arc::new(ToolExecutor::new(registry, config.tool_timeout_secs));

    let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient);
    let model = Arc::new(TextModelClient::new(Arc::clone(&llm)).with_streaming(true));
    let summarizer = Arc::new(LlmSummarizer::new(llm));

    let sweep_interval = Duration::from_secs(config.engine.sweep_interval_secs.max(1));
    #[allow(unused_mut)]
    let mut builder = TaskScheduler::builder(config.clone(), model, executor)
        .with_summarizer(summarizer);

    #[cfg(feature = "async-sqlite")]
    {
        use bee_engine::checkpoint::SqliteCheckpointStore;
        use bee_engine::core::SqliteTaskStore;
        if let Some(path) = &config.engine.database_path {
            let tasks = SqliteTaskStore::new(path)
                .await
                .context("Failed to open task store")?;
            let checkpoints = SqliteCheckpointStore::new(path)
                .await
                .context("Failed to open checkpoint store")?;
            builder = builder
                .with_task_store(Arc::new(tasks))
                .with_checkpoint_store(Arc::new(checkpoints));
        }
    }

    let scheduler = builder.build();

    let report = scheduler
        .recover_on_startup()
        .await
        .context("Startup recovery failed")?;
    if !report.awaiting_input.is_empty() {
        tracing::info!(tasks = ?report.awaiting_input, "tasks waiting for input");
    }

    let sweeper_token = CancellationToken::new();
    let sweeper = scheduler.spawn_sweeper(sweep_interval, sweeper_token.clone());

    let goal = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let goal = if goal.trim().is_empty() {
        "Say hello".to_string()
    } else {
        goal
    };
    let task_id = scheduler.submit(goal).await.context("Failed to submit task")?;

    let task = tokio::select! {
        task = scheduler.wait_for_state(&task_id, |s| s.is_terminal() || s == TaskState::InputRequired) => task?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(task_id = %task_id, "interrupted, cancelling task");
            scheduler.cancel(&task_id).await?;
            scheduler.wait_for_state(&task_id, |s| s.is_terminal()).await?
        }
    };

    match task.state {
        TaskState::Completed => {
            let result = serde_json::to_string_pretty(&task.result)?;
            println!("{result}");
        }
        TaskState::InputRequired => {
            let prompt = task
                .input_request
                .as_ref()
                .map(|r| r.prompt.as_str())
                .unwrap_or_default();
            println!("Task {} is waiting for input: {}", task.id, prompt);
        }
        state => {
            println!(
                "Task {} ended {}: {}",
                task.id,
                state.as_str(),
                task.failure_detail.as_deref().unwrap_or("-")
            );
        }
    }

    sweeper_token.cancel();
    let _ = sweeper.await;
    Ok(())
}
