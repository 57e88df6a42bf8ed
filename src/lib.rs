//! Bee Engine - 可恢复的智能体任务执行引擎
//!
//! 模块划分：
//! - **checkpoint**: 检查点策略、按任务串行的写入管理、内存 / SQLite 存储
//! - **config**: 配置加载（TOML + 环境变量）与解析校验
//! - **core**: 任务模型、调度器、人机协同、错误恢复、任务存储
//! - **llm**: 模型接口、文本后端适配、Mock 实现
//! - **memory**: 消息模型、Token 估算、有界 Working Memory
//! - **observability**: 日志初始化
//! - **react**: 推理循环、终止判定、过程事件
//! - **tools**: 工具注册表、带超时与审计的执行器、控制类工具

pub mod checkpoint;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;
