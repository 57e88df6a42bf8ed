//! 人机协同（HITL）
//!
//! 每个 INPUT_REQUIRED 任务恰好有一个待处理请求；resume 或超时都会把它解决掉。
//! 协调器本身不阻塞任何线程：blocking 模式由调用方通过 InputProvider 同步提供输入，
//! async 模式等待单独的 resume 调用，auto 模式由引擎直接补一条默认输入。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitlMode {
    Auto,
    Blocking,
    Async,
}

#[derive(Error, Debug)]
pub enum HitlError {
    #[error("task {0} already has a pending input request")]
    AlreadyPending(String),

    #[error("task {0} has no pending input request")]
    NoPendingRequest(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HitlRequest {
    pub id: String,
    pub task_id: String,
    pub prompt: String,
    pub mode: HitlMode,
    pub created_at: DateTime<Utc>,
    /// None 表示不限时
    pub expires_at: Option<DateTime<Utc>>,
}

impl HitlRequest {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| now >= e).unwrap_or(false)
    }
}

/// blocking 模式下同步提供输入的一方；返回 None 表示放弃（任务被取消）
#[async_trait]
pub trait InputProvider: Send + Sync {
    async fn provide(&self, request: &HitlRequest) -> Option<String>;
}

#[derive(Default)]
pub struct HitlCoordinator {
    pending: RwLock<HashMap<String, HitlRequest>>,
}

impl HitlCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记挂起请求；timeout_secs 为 0 表示不限时
    pub async fn suspend(
        &self,
        task_id: &str,
        prompt: impl Into<String>,
        mode: HitlMode,
        timeout_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<HitlRequest, HitlError> {
        let mut pending = self.pending.write().await;
        if pending.contains_key(task_id) {
            return Err(HitlError::AlreadyPending(task_id.to_string()));
        }
        let request = HitlRequest {
            id: format!("hitl_{}", uuid::Uuid::new_v4()),
            task_id: task_id.to_string(),
            prompt: prompt.into(),
            mode,
            created_at: now,
            expires_at: (timeout_secs > 0)
                .then(|| now + chrono::Duration::seconds(timeout_secs as i64)),
        };
        pending.insert(task_id.to_string(), request.clone());
        tracing::info!(task_id, request_id = %request.id, mode = ?mode, "task waiting for input");
        Ok(request)
    }

    /// 解决请求（收到输入或被取消），返回被解决的请求
    pub async fn resume(&self, task_id: &str) -> Result<HitlRequest, HitlError> {
        self.pending
            .write()
            .await
            .remove(task_id)
            .ok_or_else(|| HitlError::NoPendingRequest(task_id.to_string()))
    }

    /// 取出所有已过期的请求
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Vec<HitlRequest> {
        let mut pending = self.pending.write().await;
        let expired: Vec<String> = pending
            .iter()
            .filter(|(_, r)| r.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| pending.remove(&id))
            .collect()
    }

    pub async fn pending(&self, task_id: &str) -> Option<HitlRequest> {
        self.pending.read().await.get(task_id).cloned()
    }

    /// 启动恢复时重新登记已持久化的请求
    pub async fn restore(&self, request: HitlRequest) -> Result<(), HitlError> {
        let mut pending = self.pending.write().await;
        if pending.contains_key(&request.task_id) {
            return Err(HitlError::AlreadyPending(request.task_id));
        }
        pending.insert(request.task_id.clone(), request);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exactly_one_pending_request() {
        let hitl = HitlCoordinator::new();
        let now = Utc::now();
        hitl.suspend("t1", "which file?", HitlMode::Async, 10, now)
            .await
            .unwrap();
        let err = hitl
            .suspend("t1", "again", HitlMode::Async, 10, now)
            .await
            .unwrap_err();
        assert!(matches!(err, HitlError::AlreadyPending(_)));

        let resolved = hitl.resume("t1").await.unwrap();
        assert_eq!(resolved.prompt, "which file?");
        assert!(hitl.pending("t1").await.is_none());
        assert!(matches!(
            hitl.resume("t1").await,
            Err(HitlError::NoPendingRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_expire_overdue() {
        let hitl = HitlCoordinator::new();
        let now = Utc::now();
        hitl.suspend("short", "?", HitlMode::Async, 10, now).await.unwrap();
        hitl.suspend("long", "?", HitlMode::Async, 100, now).await.unwrap();
        hitl.suspend("forever", "?", HitlMode::Async, 0, now).await.unwrap();

        assert!(hitl
            .expire_overdue(now + chrono::Duration::seconds(5))
            .await
            .is_empty());
        let expired = hitl.expire_overdue(now + chrono::Duration::seconds(10)).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].task_id, "short");
        assert!(hitl.pending("long").await.is_some());
        assert!(hitl.pending("forever").await.is_some());
    }
}
