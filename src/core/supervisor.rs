//! 任务监管：取消令牌
//!
//! 持有根 CancellationToken，每个任务一个子 token；取消是协作式的，推理循环在轮次边界检查。
//! 进程关闭时取消根 token，所有任务一并收到信号。

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct TaskSupervisor {
    root: CancellationToken,
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取（必要时创建）任务的取消令牌
    pub fn token_for(&self, task_id: &str) -> CancellationToken {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens
            .entry(task_id.to_string())
            .or_insert_with(|| self.root.child_token())
            .clone()
    }

    /// 请求取消；任务没有令牌时返回 false
    pub fn cancel(&self, task_id: &str) -> bool {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        match tokens.get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// 任务进入终态后释放令牌
    pub fn release(&self, task_id: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id);
    }

    /// 取消全部任务（进程关闭）
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn root_token(&self) -> CancellationToken {
        self.root.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_single_task() {
        let supervisor = TaskSupervisor::new();
        let a = supervisor.token_for("a");
        let b = supervisor.token_for("b");
        assert!(supervisor.cancel("a"));
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!supervisor.cancel("missing"));
    }

    #[test]
    fn test_shutdown_cancels_children() {
        let supervisor = TaskSupervisor::new();
        let a = supervisor.token_for("a");
        supervisor.shutdown();
        assert!(a.is_cancelled());
        assert!(supervisor.root_token().is_cancelled());
    }
}
