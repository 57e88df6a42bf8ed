//! 检查点管理
//!
//! 同一任务的写入通过任务级异步锁串行化：后到的写请求等待前一个完成，sequence 只在写入成功后前进。
//! 不同任务互不阻塞。load_latest 把超过恢复时限的检查点视为过期。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;

use crate::checkpoint::{
    Checkpoint, CheckpointError, CheckpointPhase, CheckpointStore, CheckpointStrategy,
    PendingDispatch,
};
use crate::memory::WorkingMemoryState;

/// load_latest 的结果
#[derive(Clone, Debug, PartialEq)]
pub enum LoadOutcome {
    Found(Checkpoint),
    /// 存在但超过恢复时限，不可信任
    Expired(Checkpoint),
    Absent,
}

type SequenceSlot = Arc<AsyncMutex<Option<u64>>>;

pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    /// 每个任务一把锁，锁内缓存最近写入的 sequence
    slots: Mutex<HashMap<String, SequenceSlot>>,
    /// None 表示永不过期
    recovery_timeout: Option<chrono::Duration>,
}

impl CheckpointManager {
    /// recovery_timeout_secs 为 0 表示检查点永不过期
    pub fn new(store: Arc<dyn CheckpointStore>, recovery_timeout_secs: u64) -> Self {
        Self {
            store,
            slots: Mutex::new(HashMap::new()),
            recovery_timeout: (recovery_timeout_secs > 0)
                .then(|| chrono::Duration::seconds(recovery_timeout_secs as i64)),
        }
    }

    fn slot(&self, task_id: &str) -> SequenceSlot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(slots.entry(task_id.to_string()).or_default())
    }

    /// 绑定到单个任务与策略
    pub fn for_task(self: &Arc<Self>, task_id: &str, strategy: CheckpointStrategy) -> TaskCheckpointer {
        TaskCheckpointer {
            manager: Arc::clone(self),
            task_id: task_id.to_string(),
            strategy,
        }
    }

    pub async fn write(
        &self,
        task_id: &str,
        iteration: u32,
        phase: CheckpointPhase,
        memory: WorkingMemoryState,
        pending: Option<PendingDispatch>,
    ) -> Result<Checkpoint, CheckpointError> {
        let slot = self.slot(task_id);
        let mut last = slot.lock().await;
        let previous = match *last {
            Some(seq) => seq,
            None => self
                .store
                .latest(task_id)
                .await?
                .map(|c| c.sequence)
                .unwrap_or(0),
        };

        let checkpoint = Checkpoint {
            task_id: task_id.to_string(),
            sequence: previous + 1,
            iteration,
            phase,
            memory,
            pending,
            created_at: Utc::now(),
        };
        self.store.append(&checkpoint).await?;
        *last = Some(checkpoint.sequence);

        tracing::debug!(
            task_id,
            sequence = checkpoint.sequence,
            iteration,
            phase = phase.as_str(),
            "checkpoint written"
        );
        Ok(checkpoint)
    }

    pub async fn load_latest(&self, task_id: &str) -> Result<LoadOutcome, CheckpointError> {
        self.load_latest_at(task_id, Utc::now()).await
    }

    pub async fn load_latest_at(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> Result<LoadOutcome, CheckpointError> {
        let Some(checkpoint) = self.store.latest(task_id).await? else {
            return Ok(LoadOutcome::Absent);
        };
        match self.recovery_timeout {
            Some(limit) if now - checkpoint.created_at > limit => {
                tracing::warn!(
                    task_id,
                    sequence = checkpoint.sequence,
                    created_at = %checkpoint.created_at,
                    "checkpoint older than recovery timeout"
                );
                Ok(LoadOutcome::Expired(checkpoint))
            }
            _ => Ok(LoadOutcome::Found(checkpoint)),
        }
    }

    /// 任务结束后释放锁槽
    pub fn release(&self, task_id: &str) {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id);
    }
}

/// 单个任务的检查点写入器（由推理循环持有）
#[derive(Clone)]
pub struct TaskCheckpointer {
    manager: Arc<CheckpointManager>,
    task_id: String,
    strategy: CheckpointStrategy,
}

impl TaskCheckpointer {
    pub fn should_checkpoint(&self, iteration: u32, phase: CheckpointPhase) -> bool {
        self.strategy.should_checkpoint(iteration, phase)
    }

    pub async fn write(
        &self,
        iteration: u32,
        phase: CheckpointPhase,
        memory: WorkingMemoryState,
        pending: Option<PendingDispatch>,
    ) -> Result<Checkpoint, CheckpointError> {
        self.manager
            .write(&self.task_id, iteration, phase, memory, pending)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::memory::{Message, StrategyKind};

    fn memory() -> WorkingMemoryState {
        WorkingMemoryState {
            messages: vec![Message::user("goal")],
            estimated_tokens: 5,
            strategy: StrategyKind::None,
            summary: None,
        }
    }

    #[tokio::test]
    async fn test_concurrent_writes_are_contiguous() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let manager = Arc::new(CheckpointManager::new(store.clone(), 0));

        let handles: Vec<_> = (0..100)
            .map(|i| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    manager
                        .write("task_a", i, CheckpointPhase::PostTool, memory(), None)
                        .await
                        .map(|c| c.sequence)
                })
            })
            .collect();
        let mut returned = Vec::new();
        for h in handles {
            returned.push(h.await.unwrap().unwrap());
        }
        returned.sort_unstable();
        assert_eq!(returned, (1..=100).collect::<Vec<u64>>());
        // 存储中的写入顺序本身严格递增
        assert_eq!(store.sequences("task_a").await, (1..=100).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_sequence_continues_from_store() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let first = CheckpointManager::new(store.clone(), 0);
        for i in 0..3 {
            first
                .write("t", i, CheckpointPhase::IterationEnd, memory(), None)
                .await
                .unwrap();
        }
        // 模拟进程重启：新的管理器从存储中的最大 sequence 继续
        let second = CheckpointManager::new(store, 0);
        let cp = second
            .write("t", 3, CheckpointPhase::IterationEnd, memory(), None)
            .await
            .unwrap();
        assert_eq!(cp.sequence, 4);
    }

    #[tokio::test]
    async fn test_load_latest_is_idempotent() {
        let manager = CheckpointManager::new(Arc::new(InMemoryCheckpointStore::new()), 0);
        manager
            .write("t", 2, CheckpointPhase::Suspend, memory(), None)
            .await
            .unwrap();
        let a = manager.load_latest("t").await.unwrap();
        let b = manager.load_latest("t").await.unwrap();
        let (LoadOutcome::Found(a), LoadOutcome::Found(b)) = (a, b) else {
            panic!("expected checkpoints");
        };
        assert_eq!(serde_json::to_vec(&a).unwrap(), serde_json::to_vec(&b).unwrap());
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_expired_and_absent() {
        let manager = CheckpointManager::new(Arc::new(InMemoryCheckpointStore::new()), 60);
        assert_eq!(manager.load_latest("t").await.unwrap(), LoadOutcome::Absent);
        manager
            .write("t", 1, CheckpointPhase::IterationEnd, memory(), None)
            .await
            .unwrap();
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert!(matches!(
            manager.load_latest_at("t", later).await.unwrap(),
            LoadOutcome::Expired(_)
        ));
        assert!(matches!(
            manager.load_latest("t").await.unwrap(),
            LoadOutcome::Found(_)
        ));
    }
}
