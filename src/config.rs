//! 引擎配置：从 config/default.toml 与环境变量加载，再解析为有效配置
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEE__*` 覆盖（双下划线表示嵌套，如 `BEE__TASK__MAX_ITERATIONS=20`）。
//! 原始配置中的三态开关为 `Option<bool>`；`AppConfig::resolve` 一次性把它们解析为明确的值并校验，
//! 之后每个任务只持有解析后的 TaskConfig。

use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

use crate::checkpoint::{CheckpointPolicy, CheckpointStrategy};
use crate::core::hitl::HitlMode;
use crate::core::task::{
    HitlPolicy, TaskConfig, DEFAULT_DEFAULT_INPUT, DEFAULT_INPUT_TIMEOUT_SECS,
    DEFAULT_MAX_ITERATIONS, DEFAULT_TASK_TIMEOUT_SECS, DEFAULT_TOKEN_BUDGET,
};
use crate::memory::{MemoryStrategy, StrategyKind, SummarizingPolicy};
use crate::react::TerminationCondition;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// 配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineSection,
    pub task: TaskSection,
    pub memory: MemorySection,
    pub checkpoint: CheckpointSection,
    pub hitl: HitlSection,
    pub reasoning: ReasoningSection,
    pub tools: ToolsSection,
}

/// [engine] 段：工作池、排队上限、超时扫描间隔
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// 同时运行的推理循环上限，0 表示不限
    pub worker_capacity: usize,
    /// 等待工作槽的任务上限
    pub queue_capacity: usize,
    pub sweep_interval_secs: u64,
    /// 设置后（且启用 async-sqlite）使用 SQLite 存储
    pub database_path: Option<PathBuf>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            worker_capacity: 8,
            queue_capacity: 32,
            sweep_interval_secs: 5,
            database_path: None,
        }
    }
}

/// [task] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskSection {
    pub max_iterations: u32,
    pub timeout_secs: u64,
    pub input_timeout_secs: u64,
}

impl Default for TaskSection {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            input_timeout_secs: DEFAULT_INPUT_TIMEOUT_SECS,
        }
    }
}

/// [memory] 段：策略及其参数（未用到的参数忽略）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub strategy: StrategyKind,
    pub window_size: usize,
    pub token_budget: usize,
    /// 未设置时 token_budget 为 5，summarizing 为 10
    pub preserve_recent: Option<usize>,
    pub threshold: f64,
    pub target: f64,
    /// 摘要失败时的回退窗口，未设置时取 window_size
    pub fallback_window: Option<usize>,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::TokenBudget,
            window_size: 20,
            token_budget: DEFAULT_TOKEN_BUDGET,
            preserve_recent: None,
            threshold: 0.85,
            target: 0.7,
            fallback_window: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStrategyKind {
    Event,
    Interval,
    Hybrid,
}

/// [checkpoint] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointSection {
    /// 未设置视为启用
    pub enabled: Option<bool>,
    pub strategy: CheckpointStrategyKind,
    pub interval: u32,
    /// 未设置视为 true
    pub after_tools: Option<bool>,
    /// 未设置视为 false
    pub before_model: Option<bool>,
    pub recovery: RecoverySection,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            enabled: None,
            strategy: CheckpointStrategyKind::Event,
            interval: 5,
            after_tools: None,
            before_model: None,
            recovery: RecoverySection::default(),
        }
    }
}

/// [checkpoint.recovery] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    /// 启动时自动从检查点继续 RUNNING 任务；否则停放等待 resume_recovered
    pub auto_resume: bool,
    /// INPUT_REQUIRED 超时后以默认输入自动恢复
    pub auto_resume_hitl: bool,
    /// 检查点超过该时限视为过期，0 表示不过期
    pub timeout_secs: u64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            auto_resume: true,
            auto_resume_hitl: false,
            timeout_secs: 3600,
        }
    }
}

/// [hitl] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HitlSection {
    pub mode: HitlMode,
    pub default_input: String,
}

impl Default for HitlSection {
    fn default() -> Self {
        Self {
            mode: HitlMode::Async,
            default_input: DEFAULT_DEFAULT_INPUT.to_string(),
        }
    }
}

/// [reasoning] 段：停止条件与控制工具
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReasoningSection {
    pub termination: Vec<TerminationCondition>,
    pub control_tools: bool,
    /// 每个目标注册一个 transfer_to_<name> 工具
    pub transfer_targets: Vec<String>,
}

impl Default for ReasoningSection {
    fn default() -> Self {
        Self {
            termination: TerminationCondition::all(),
            control_tools: true,
            transfer_targets: Vec::new(),
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒），0 表示不限
    pub timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

/// 引擎级设置（解析后）
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub worker_capacity: usize,
    pub queue_capacity: usize,
    pub sweep_interval_secs: u64,
    pub database_path: Option<PathBuf>,
}

/// 启动恢复与 HITL 超时策略（引擎级）
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryPolicy {
    pub auto_resume: bool,
    pub auto_resume_hitl: bool,
    pub timeout_secs: u64,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        let raw = RecoverySection::default();
        Self {
            auto_resume: raw.auto_resume,
            auto_resume_hitl: raw.auto_resume_hitl,
            timeout_secs: raw.timeout_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlToolsConfig {
    pub enabled: bool,
    pub transfer_targets: Vec<String>,
}

/// 解析后的有效配置
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub engine: EngineSettings,
    /// 新任务的默认配置（可被 submit_with_config 覆盖）
    pub task: TaskConfig,
    pub recovery: RecoveryPolicy,
    pub tool_timeout_secs: u64,
    pub control: ControlToolsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let engine = EngineSection::default();
        Self {
            engine: EngineSettings {
                worker_capacity: engine.worker_capacity,
                queue_capacity: engine.queue_capacity,
                sweep_interval_secs: engine.sweep_interval_secs,
                database_path: None,
            },
            task: TaskConfig::default(),
            recovery: RecoveryPolicy::default(),
            tool_timeout_secs: ToolsSection::default().timeout_secs,
            control: ControlToolsConfig {
                enabled: true,
                transfer_targets: Vec::new(),
            },
        }
    }
}

fn check_fraction(name: &str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be within [0, 1], got {value}"
        )));
    }
    Ok(())
}

fn check_positive(name: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
    }
    Ok(())
}

impl MemorySection {
    fn resolve(&self) -> Result<MemoryStrategy, ConfigError> {
        check_fraction("memory.threshold", self.threshold)?;
        check_fraction("memory.target", self.target)?;
        if self.target >= self.threshold {
            return Err(ConfigError::Invalid(format!(
                "memory.target ({}) must be below memory.threshold ({})",
                self.target, self.threshold
            )));
        }
        check_positive("memory.window_size", self.window_size as u64)?;
        check_positive("memory.token_budget", self.token_budget as u64)?;
        let fallback_window = self.fallback_window.unwrap_or(self.window_size);
        check_positive("memory.fallback_window", fallback_window as u64)?;

        Ok(match self.strategy {
            StrategyKind::None => MemoryStrategy::None,
            StrategyKind::FixedWindow => MemoryStrategy::FixedWindow {
                window_size: self.window_size,
            },
            StrategyKind::TokenBudget => MemoryStrategy::TokenBudget {
                budget: self.token_budget,
                preserve_recent: self.preserve_recent.unwrap_or(5),
            },
            StrategyKind::Summarizing => MemoryStrategy::Summarizing(SummarizingPolicy {
                budget: self.token_budget,
                threshold: self.threshold,
                target: self.target,
                preserve_recent: self.preserve_recent.unwrap_or(10),
                fallback_window,
            }),
        })
    }
}

impl CheckpointSection {
    fn resolve(&self) -> Result<CheckpointPolicy, ConfigError> {
        let after_tools = self.after_tools.unwrap_or(true);
        let before_model = self.before_model.unwrap_or(false);
        let strategy = match self.strategy {
            CheckpointStrategyKind::Event => CheckpointStrategy::Event {
                after_tools,
                before_model,
            },
            CheckpointStrategyKind::Interval => {
                check_positive("checkpoint.interval", self.interval as u64)?;
                CheckpointStrategy::Interval {
                    every: self.interval,
                }
            }
            CheckpointStrategyKind::Hybrid => {
                check_positive("checkpoint.interval", self.interval as u64)?;
                CheckpointStrategy::Hybrid {
                    after_tools,
                    before_model,
                    every: self.interval,
                }
            }
        };
        Ok(CheckpointPolicy {
            enabled: self.enabled.unwrap_or(true),
            strategy,
        })
    }
}

impl AppConfig {
    /// 把原始配置解析为有效配置；未设置的值在这里落定，非法组合返回 Invalid
    pub fn resolve(&self) -> Result<EngineConfig, ConfigError> {
        check_positive("task.max_iterations", self.task.max_iterations as u64)?;
        let memory = self.memory.resolve()?;
        let checkpoint = self.checkpoint.resolve()?;

        Ok(EngineConfig {
            engine: EngineSettings {
                worker_capacity: self.engine.worker_capacity,
                queue_capacity: self.engine.queue_capacity,
                sweep_interval_secs: self.engine.sweep_interval_secs,
                database_path: self.engine.database_path.clone(),
            },
            task: TaskConfig {
                max_iterations: self.task.max_iterations,
                timeout_secs: self.task.timeout_secs,
                input_timeout_secs: self.task.input_timeout_secs,
                memory,
                checkpoint,
                hitl: HitlPolicy {
                    mode: self.hitl.mode,
                    default_input: self.hitl.default_input.clone(),
                },
                termination: self.reasoning.termination.clone(),
            },
            recovery: RecoveryPolicy {
                auto_resume: self.checkpoint.recovery.auto_resume,
                auto_resume_hitl: self.checkpoint.recovery.auto_resume_hitl,
                timeout_secs: self.checkpoint.recovery.timeout_secs,
            },
            tool_timeout_secs: self.tools.timeout_secs,
            control: ControlToolsConfig {
                enabled: self.reasoning.control_tools,
                transfer_targets: self.reasoning.transfer_targets.clone(),
            },
        })
    }
}

/// 从默认路径 + 可选路径 + 环境变量加载配置
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    Ok(c.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_defaults_resolve() {
        let resolved = AppConfig::default().resolve().unwrap();
        assert_eq!(resolved.task.max_iterations, 100);
        assert_eq!(resolved.task.input_timeout_secs, 600);
        assert_eq!(
            resolved.task.memory,
            MemoryStrategy::TokenBudget {
                budget: 8000,
                preserve_recent: 5
            }
        );
        assert!(resolved.task.checkpoint.enabled);
        assert_eq!(
            resolved.task.checkpoint.strategy,
            CheckpointStrategy::Event {
                after_tools: true,
                before_model: false
            }
        );
        assert_eq!(resolved.recovery.timeout_secs, 3600);
        assert_eq!(resolved, EngineConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let (_dir, path) = write_config(
            r#"
[task]
max_iterations = 7

[memory]
strategy = "summarizing"
token_budget = 1000

[checkpoint]
strategy = "hybrid"
interval = 3
before_model = true

[hitl]
mode = "auto"
default_input = "go on"

[reasoning]
termination = ["no_tool_calls", "escalate"]
transfer_targets = ["billing"]
"#,
        );
        let resolved = load_config(Some(path)).unwrap().resolve().unwrap();
        assert_eq!(resolved.task.max_iterations, 7);
        assert_eq!(
            resolved.task.memory,
            MemoryStrategy::Summarizing(SummarizingPolicy {
                budget: 1000,
                threshold: 0.85,
                target: 0.7,
                preserve_recent: 10,
                fallback_window: 20,
            })
        );
        assert_eq!(
            resolved.task.checkpoint.strategy,
            CheckpointStrategy::Hybrid {
                after_tools: true,
                before_model: true,
                every: 3
            }
        );
        assert_eq!(resolved.task.hitl.mode, HitlMode::Auto);
        assert_eq!(resolved.task.hitl.default_input, "go on");
        assert_eq!(
            resolved.task.termination,
            vec![TerminationCondition::NoToolCalls, TerminationCondition::Escalate]
        );
        assert_eq!(resolved.control.transfer_targets, vec!["billing".to_string()]);
    }

    #[test]
    fn test_target_must_be_below_threshold() {
        let mut raw = AppConfig::default();
        raw.memory.threshold = 0.5;
        raw.memory.target = 0.6;
        assert!(matches!(raw.resolve(), Err(ConfigError::Invalid(_))));

        raw.memory.threshold = 1.5;
        raw.memory.target = 0.6;
        assert!(matches!(raw.resolve(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut raw = AppConfig::default();
        raw.checkpoint.strategy = CheckpointStrategyKind::Interval;
        raw.checkpoint.interval = 0;
        assert!(matches!(raw.resolve(), Err(ConfigError::Invalid(_))));

        let mut raw = AppConfig::default();
        raw.memory.strategy = StrategyKind::FixedWindow;
        raw.memory.window_size = 0;
        assert!(matches!(raw.resolve(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_disabled_checkpointing() {
        let mut raw = AppConfig::default();
        raw.checkpoint.enabled = Some(false);
        assert!(!raw.resolve().unwrap().task.checkpoint.enabled);
    }
}
