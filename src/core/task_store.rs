//! 任务存储
//!
//! 任务记录的持久化：插入、读取、状态转换写回、扫描非终态任务（启动恢复用）。
//! 内存版用于测试与单进程部署；SQLite 版需要启用 `async-sqlite` feature。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::task::{Task, TaskId};
use crate::core::StoreError;

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: &Task) -> Result<(), StoreError>;

    async fn get(&self, task_id: &str) -> Result<Option<Task>, StoreError>;

    /// 覆盖写回（任务必须已存在）
    async fn update(&self, task: &Task) -> Result<(), StoreError>;

    async fn list_non_terminal(&self) -> Result<Vec<Task>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: &Task) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(StoreError::Duplicate(task.id.clone()));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().await.get(task_id).cloned())
    }

    async fn update(&self, task: &Task) -> Result<(), StoreError> {
        match self.tasks.write().await.get_mut(&task.id) {
            Some(slot) => {
                *slot = task.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(task.id.clone())),
        }
    }

    async fn list_non_terminal(&self) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| !t.is_finished())
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }
}

#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteTaskStore;

#[cfg(feature = "async-sqlite")]
mod sqlite {
    use std::path::Path;

    use async_trait::async_trait;
    use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
    use sqlx::Row;

    use super::TaskStore;
    use crate::core::task::Task;
    use crate::core::StoreError;

    impl From<sqlx::Error> for StoreError {
        fn from(e: sqlx::Error) -> Self {
            StoreError::Backend(e.to_string())
        }
    }

    /// SQLite 任务表：状态单独成列以便扫描，完整记录以 JSON 保存
    pub struct SqliteTaskStore {
        pool: SqlitePool,
    }

    impl SqliteTaskStore {
        pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
            let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
            let pool = SqlitePoolOptions::new()
                .max_connections(3)
                .connect(&db_url)
                .await?;
            Self::from_pool(pool).await
        }

        pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL,
                    state TEXT NOT NULL,
                    data TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
            )
            .execute(&pool)
            .await?;
            sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state)")
                .execute(&pool)
                .await?;
            Ok(Self { pool })
        }
    }

    #[async_trait]
    impl TaskStore for SqliteTaskStore {
        async fn insert(&self, task: &Task) -> Result<(), StoreError> {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO tasks (id, session_id, state, data, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&task.id)
            .bind(&task.session_id)
            .bind(task.state.as_str())
            .bind(serde_json::to_string(task)?)
            .bind(task.created_at.to_rfc3339())
            .bind(task.updated_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::Duplicate(task.id.clone()));
            }
            Ok(())
        }

        async fn get(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
            let row = sqlx::query("SELECT data FROM tasks WHERE id = ?")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
            match row {
                Some(row) => {
                    let data: String = row.get("data");
                    Ok(Some(serde_json::from_str(&data)?))
                }
                None => Ok(None),
            }
        }

        async fn update(&self, task: &Task) -> Result<(), StoreError> {
            let result =
                sqlx::query("UPDATE tasks SET state = ?, data = ?, updated_at = ? WHERE id = ?")
                    .bind(task.state.as_str())
                    .bind(serde_json::to_string(task)?)
                    .bind(task.updated_at.to_rfc3339())
                    .bind(&task.id)
                    .execute(&self.pool)
                    .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound(task.id.clone()));
            }
            Ok(())
        }

        async fn list_non_terminal(&self) -> Result<Vec<Task>, StoreError> {
            let rows = sqlx::query(
                "SELECT data FROM tasks
                 WHERE state IN ('CREATED', 'RUNNING', 'INPUT_REQUIRED')
                 ORDER BY created_at ASC",
            )
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter()
                .map(|row| {
                    let data: String = row.get("data");
                    serde_json::from_str(&data).map_err(StoreError::from)
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::{TaskConfig, TaskState};

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryTaskStore::new();
        let mut task = Task::new("s1", "write a report", TaskConfig::default());
        store.insert(&task).await.unwrap();
        assert!(matches!(
            store.insert(&task).await,
            Err(StoreError::Duplicate(_))
        ));

        task.state = TaskState::Running;
        store.update(&task).await.unwrap();
        assert_eq!(
            store.get(&task.id).await.unwrap().unwrap().state,
            TaskState::Running
        );

        let mut done = Task::new("s1", "done", TaskConfig::default());
        done.state = TaskState::Completed;
        store.insert(&done).await.unwrap();

        let open = store.list_non_terminal().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, task.id);
    }

    #[tokio::test]
    async fn test_update_missing_task() {
        let store = InMemoryTaskStore::new();
        let task = Task::new("s1", "ghost", TaskConfig::default());
        assert!(matches!(
            store.update(&task).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[cfg(feature = "async-sqlite")]
    mod sqlite_store {
        use super::*;
        use tempfile::TempDir;

        #[tokio::test]
        async fn test_sqlite_insert_update_and_scan() {
            let dir = TempDir::new().unwrap();
            let store = SqliteTaskStore::new(dir.path().join("tasks.db"))
                .await
                .unwrap();

            let mut running = Task::new("s1", "write a report", TaskConfig::default());
            store.insert(&running).await.unwrap();
            assert!(matches!(
                store.insert(&running).await,
                Err(StoreError::Duplicate(_))
            ));

            running.state = TaskState::Running;
            running.iterations = 4;
            store.update(&running).await.unwrap();
            let loaded = store.get(&running.id).await.unwrap().unwrap();
            assert_eq!(loaded.state, TaskState::Running);
            assert_eq!(loaded.iterations, 4);

            let mut waiting = Task::new("s1", "ask first", TaskConfig::default());
            waiting.state = TaskState::InputRequired;
            store.insert(&waiting).await.unwrap();
            for state in [TaskState::Completed, TaskState::Failed, TaskState::Cancelled] {
                let mut done = Task::new("s2", "done", TaskConfig::default());
                done.state = state;
                store.insert(&done).await.unwrap();
            }

            let open = store.list_non_terminal().await.unwrap();
            let mut ids: Vec<_> = open.iter().map(|t| t.id.clone()).collect();
            ids.sort();
            let mut expected = vec![running.id.clone(), waiting.id.clone()];
            expected.sort();
            assert_eq!(ids, expected);
        }

        #[tokio::test]
        async fn test_sqlite_update_missing_task() {
            let dir = TempDir::new().unwrap();
            let store = SqliteTaskStore::new(dir.path().join("tasks.db"))
                .await
                .unwrap();
            let task = Task::new("s1", "ghost", TaskConfig::default());
            assert!(matches!(
                store.update(&task).await,
                Err(StoreError::NotFound(_))
            ));
            assert!(store.get(&task.id).await.unwrap().is_none());
        }
    }
}
