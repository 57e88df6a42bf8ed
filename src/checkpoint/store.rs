//! 检查点存储
//!
//! 按 (task_id, sequence) 追加写入、读取最新一条；同一任务的 sequence 必须严格递增。
//! 内存版以序列化后的字节保存，读取时反序列化，两次读取得到完全相同的内容。
//! SQLite 版需要启用 `async-sqlite` feature。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::checkpoint::CheckpointPhase;
use crate::memory::{ToolCall, WorkingMemoryState};
use crate::react::ResponseActions;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint sequence {got} for task {task_id} is not after {last}")]
    SequenceConflict { task_id: String, last: u64, got: u64 },

    #[error("checkpoint serialization failed: {0}")]
    Serialization(String),

    #[error("checkpoint store error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for CheckpointError {
    fn from(e: serde_json::Error) -> Self {
        CheckpointError::Serialization(e.to_string())
    }
}

/// 工具分发进行到一半时的状态：本轮模型回复已写入记忆，remaining 为尚未执行的调用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingDispatch {
    pub content: String,
    pub remaining: Vec<ToolCall>,
    pub actions: ResponseActions,
    pub has_tool_calls: bool,
    pub last_tool_output: Option<String>,
}

/// 不可变的执行快照
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: String,
    /// 每个任务内从 1 开始严格递增
    pub sequence: u64,
    /// 已完成的轮数（恢复时从这里继续）
    pub iteration: u32,
    pub phase: CheckpointPhase,
    pub memory: WorkingMemoryState,
    pub pending: Option<PendingDispatch>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 追加写入；sequence 不大于已有最大值时拒绝
    async fn append(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    async fn latest(&self, task_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;
}

/// 内存版检查点存储
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    entries: RwLock<HashMap<String, Vec<(u64, Vec<u8>)>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 某任务已写入的全部 sequence（按写入顺序）
    pub async fn sequences(&self, task_id: &str) -> Vec<u64> {
        self.entries
            .read()
            .await
            .get(task_id)
            .map(|v| v.iter().map(|(seq, _)| *seq).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn append(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec(checkpoint)?;
        let mut entries = self.entries.write().await;
        let list = entries.entry(checkpoint.task_id.clone()).or_default();
        if let Some((last, _)) = list.last() {
            if checkpoint.sequence <= *last {
                return Err(CheckpointError::SequenceConflict {
                    task_id: checkpoint.task_id.clone(),
                    last: *last,
                    got: checkpoint.sequence,
                });
            }
        }
        list.push((checkpoint.sequence, bytes));
        Ok(())
    }

    async fn latest(&self, task_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let entries = self.entries.read().await;
        match entries.get(task_id).and_then(|v| v.last()) {
            Some((_, bytes)) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }
}

#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteCheckpointStore;

#[cfg(feature = "async-sqlite")]
mod sqlite {
    use std::path::Path;

    use async_trait::async_trait;
    use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
    use sqlx::Row;

    use super::{Checkpoint, CheckpointError, CheckpointStore};

    impl From<sqlx::Error> for CheckpointError {
        fn from(e: sqlx::Error) -> Self {
            CheckpointError::Backend(e.to_string())
        }
    }

    /// SQLite 检查点存储：主键 (task_id, sequence)，只追加
    pub struct SqliteCheckpointStore {
        pool: SqlitePool,
    }

    impl SqliteCheckpointStore {
        pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
            let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&db_url)
                .await?;
            Self::from_pool(pool).await
        }

        pub async fn from_pool(pool: SqlitePool) -> Result<Self, CheckpointError> {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS checkpoints (
                    task_id TEXT NOT NULL,
                    sequence INTEGER NOT NULL,
                    iteration INTEGER NOT NULL,
                    phase TEXT NOT NULL,
                    state TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (task_id, sequence)
                )",
            )
            .execute(&pool)
            .await?;
            Ok(Self { pool })
        }
    }

    #[async_trait]
    impl CheckpointStore for SqliteCheckpointStore {
        async fn append(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
            let mut tx = self.pool.begin().await?;
            let last: Option<i64> =
                sqlx::query("SELECT MAX(sequence) AS last FROM checkpoints WHERE task_id = ?")
                    .bind(&checkpoint.task_id)
                    .fetch_one(&mut *tx)
                    .await?
                    .get("last");
            if let Some(last) = last {
                if checkpoint.sequence as i64 <= last {
                    return Err(CheckpointError::SequenceConflict {
                        task_id: checkpoint.task_id.clone(),
                        last: last as u64,
                        got: checkpoint.sequence,
                    });
                }
            }
            sqlx::query(
                "INSERT INTO checkpoints (task_id, sequence, iteration, phase, state, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&checkpoint.task_id)
            .bind(checkpoint.sequence as i64)
            .bind(checkpoint.iteration as i64)
            .bind(checkpoint.phase.as_str())
            .bind(serde_json::to_string(checkpoint)?)
            .bind(checkpoint.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        }

        async fn latest(&self, task_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
            let row = sqlx::query(
                "SELECT state FROM checkpoints WHERE task_id = ? ORDER BY sequence DESC LIMIT 1",
            )
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
            match row {
                Some(row) => {
                    let state: String = row.get("state");
                    Ok(Some(serde_json::from_str(&state)?))
                }
                None => Ok(None),
            }
        }
    }
}
