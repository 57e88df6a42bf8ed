//! 任务调度：工作池、生命周期、人机协同挂起/恢复、启动恢复
//!
//! 每个任务的推理循环是一个独立的 tokio 任务，同一任务内严格串行。运行中的循环数受 Semaphore 限制，
//! 没有空闲许可时进入有界队列；队列也满时 submit 直接返回 CapacityExceeded。
//! INPUT_REQUIRED 任务不占许可，resume 时重新申请。只有调度器写入任务状态，所有写入经过同一把锁并广播通知。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{
    broadcast, mpsc, Mutex as AsyncMutex, OwnedSemaphorePermit, RwLock, Semaphore,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{
    Checkpoint, CheckpointManager, CheckpointStore, InMemoryCheckpointStore, LoadOutcome,
    PendingDispatch,
};
use crate::config::EngineConfig;
use crate::core::hitl::{HitlCoordinator, HitlMode, InputProvider};
use crate::core::supervisor::TaskSupervisor;
use crate::core::task::{
    Task, TaskConfig, TaskId, TaskNotification, TaskRequest, TaskResult, TaskState,
};
use crate::core::task_store::{InMemoryTaskStore, TaskStore};
use crate::core::{EngineError, FailureReason};
use crate::llm::ModelClient;
use crate::memory::{Message, Summarizer, WorkingMemory, WorkingMemoryState};
use crate::react::{LoopEvent, LoopOutcome, ReasoningLoop, TerminationEvaluator};
use crate::tools::ToolExecutor;

const NOTIFICATION_CAPACITY: usize = 256;

/// 可以继续执行的位置：停放的内存快照或最新检查点
#[derive(Clone, Debug)]
struct ResumePoint {
    memory: WorkingMemoryState,
    iteration: u32,
    pending: Option<PendingDispatch>,
}

impl From<Checkpoint> for ResumePoint {
    fn from(cp: Checkpoint) -> Self {
        Self {
            memory: cp.memory,
            iteration: cp.iteration,
            pending: cp.pending,
        }
    }
}

enum Start {
    Fresh,
    Resume {
        point: ResumePoint,
        input: Option<String>,
    },
}

/// 启动恢复报告
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecoveryReport {
    /// 从检查点自动继续的任务（RUNNING，或开启 auto_resume_hitl 时的 INPUT_REQUIRED）
    pub resumed: Vec<TaskId>,
    /// 停放等待 resume_recovered 的任务
    pub parked: Vec<TaskId>,
    /// 从未开始、重新排队的 CREATED 任务
    pub requeued: Vec<TaskId>,
    pub failed: Vec<(TaskId, FailureReason)>,
    /// 重新登记了输入请求的 INPUT_REQUIRED 任务
    pub awaiting_input: Vec<TaskId>,
}

enum Admission {
    Immediate(Option<OwnedSemaphorePermit>),
    Queued(QueueSlot),
}

/// 排队名额，丢弃时归还
struct QueueSlot {
    semaphore: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
}

impl QueueSlot {
    /// 等待工作许可；任务在排队期间被取消时返回 None
    async fn acquire(self, token: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            _ = token.cancelled() => None,
            permit = self.semaphore.clone().acquire_owned() => permit.ok(),
        }
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 有界工作池：capacity 为 0 表示不限
struct WorkerPool {
    semaphore: Option<Arc<Semaphore>>,
    capacity: usize,
    queue_capacity: usize,
    queued: Arc<AtomicUsize>,
}

impl WorkerPool {
    fn new(capacity: usize, queue_capacity: usize) -> Self {
        Self {
            semaphore: (capacity > 0).then(|| Arc::new(Semaphore::new(capacity))),
            capacity,
            queue_capacity,
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn running(&self) -> usize {
        self.semaphore
            .as_ref()
            .map(|s| self.capacity.saturating_sub(s.available_permits()))
            .unwrap_or(0)
    }

    fn admit(&self) -> Result<Admission, EngineError> {
        let Some(semaphore) = &self.semaphore else {
            return Ok(Admission::Immediate(None));
        };
        if let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() {
            return Ok(Admission::Immediate(Some(permit)));
        }
        let queue_capacity = self.queue_capacity;
        match self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |q| {
                (q < queue_capacity).then_some(q + 1)
            }) {
            Ok(_) => Ok(Admission::Queued(QueueSlot {
                semaphore: Arc::clone(semaphore),
                queued: Arc::clone(&self.queued),
            })),
            Err(queued) => Err(EngineError::CapacityExceeded {
                running: self.running(),
                queued,
            }),
        }
    }
}

struct SchedulerInner {
    config: EngineConfig,
    model: Arc<dyn ModelClient>,
    executor: Arc<ToolExecutor>,
    summarizer: Option<Arc<dyn Summarizer>>,
    tasks: Arc<dyn TaskStore>,
    checkpoints: Arc<CheckpointManager>,
    hitl: HitlCoordinator,
    supervisor: TaskSupervisor,
    pool: WorkerPool,
    /// 没有推理循环在跑、但保留了可继续位置的任务（INPUT_REQUIRED 或恢复后停放）
    parked: RwLock<HashMap<TaskId, ResumePoint>>,
    /// 任务记录读改写的互斥
    state_lock: AsyncMutex<()>,
    notify_tx: broadcast::Sender<TaskNotification>,
}

pub struct SchedulerBuilder {
    config: EngineConfig,
    model: Arc<dyn ModelClient>,
    executor: Arc<ToolExecutor>,
    task_store: Option<Arc<dyn TaskStore>>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl SchedulerBuilder {
    pub fn with_task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.task_store = Some(store);
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    /// summarizing 记忆策略使用的摘要器
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn build(self) -> TaskScheduler {
        let tasks = self
            .task_store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()));
        let checkpoint_store = self
            .checkpoint_store
            .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new()));
        let checkpoints = Arc::new(CheckpointManager::new(
            checkpoint_store,
            self.config.recovery.timeout_secs,
        ));
        let pool = WorkerPool::new(
            self.config.engine.worker_capacity,
            self.config.engine.queue_capacity,
        );
        let (notify_tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        TaskScheduler {
            inner: Arc::new(SchedulerInner {
                config: self.config,
                model: self.model,
                executor: self.executor,
                summarizer: self.summarizer,
                tasks,
                checkpoints,
                hitl: HitlCoordinator::new(),
                supervisor: TaskSupervisor::new(),
                pool,
                parked: RwLock::new(HashMap::new()),
                state_lock: AsyncMutex::new(()),
                notify_tx,
            }),
        }
    }
}

/// 任务调度器（可克隆句柄）
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    pub fn builder(
        config: EngineConfig,
        model: Arc<dyn ModelClient>,
        executor: Arc<ToolExecutor>,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            model,
            executor,
            task_store: None,
            checkpoint_store: None,
            summarizer: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// 订阅任务状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<TaskNotification> {
        self.inner.notify_tx.subscribe()
    }

    /// 用引擎默认任务配置提交
    pub async fn submit(&self, goal: impl Into<String>) -> Result<TaskId, EngineError> {
        self.submit_request(TaskRequest::new(goal)).await
    }

    pub async fn submit_with_config(
        &self,
        goal: impl Into<String>,
        config: TaskConfig,
    ) -> Result<TaskId, EngineError> {
        self.submit_request(TaskRequest::new(goal).with_config(config))
            .await
    }

    pub async fn submit_request(&self, request: TaskRequest) -> Result<TaskId, EngineError> {
        let admission = self.inner.pool.admit()?;
        let config = request
            .config
            .unwrap_or_else(|| self.inner.config.task.clone());
        let session_id = request
            .session_id
            .unwrap_or_else(|| format!("session_{}", uuid::Uuid::new_v4()));
        let task = Task::new(session_id, request.goal, config);
        self.inner.tasks.insert(&task).await?;
        self.notify(&task);
        tracing::info!(
            task_id = %task.id,
            queued = matches!(admission, Admission::Queued(_)),
            "task submitted"
        );

        self.spawn_run(task.id.clone(), admission, Start::Fresh);
        Ok(task.id)
    }

    pub async fn task(&self, task_id: &str) -> Result<Task, EngineError> {
        self.inner
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))
    }

    /// 等待任务记录满足条件（先检查当前值，再跟随通知）
    pub async fn wait_for<F>(&self, task_id: &str, pred: F) -> Result<Task, EngineError>
    where
        F: Fn(&Task) -> bool,
    {
        let mut rx = self.subscribe();
        loop {
            let task = self.task(task_id).await?;
            if pred(&task) {
                return Ok(task);
            }
            loop {
                match rx.recv().await {
                    Ok(n) if n.task_id == task_id => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => return Ok(task),
                }
            }
        }
    }

    pub async fn wait_for_state<F>(&self, task_id: &str, pred: F) -> Result<Task, EngineError>
    where
        F: Fn(TaskState) -> bool,
    {
        self.wait_for(task_id, |t| pred(t.state)).await
    }

    /// 请求取消；任务已处于终态时返回 false
    ///
    /// 运行中的任务在下一个轮次边界停止；INPUT_REQUIRED、排队中或停放的任务直接进入 CANCELLED。
    pub async fn cancel(&self, task_id: &str) -> Result<bool, EngineError> {
        let task = self.task(task_id).await?;
        if task.is_finished() {
            return Ok(false);
        }
        if task.state == TaskState::InputRequired {
            let _ = self.inner.hitl.resume(task_id).await;
        }
        if self.unpark(task_id).await.is_some() {
            self.finish(task_id, TaskState::Cancelled, None, None, None)
                .await?;
            return Ok(true);
        }
        if self.inner.supervisor.cancel(task_id) {
            tracing::info!(task_id, "cancellation requested");
            return Ok(true);
        }
        self.finish(task_id, TaskState::Cancelled, None, None, None)
            .await?;
        Ok(true)
    }

    /// 为 INPUT_REQUIRED 任务提供输入并重新进入工作池
    pub async fn resume(&self, task_id: &str, input: impl Into<String>) -> Result<(), EngineError> {
        let task = self.task(task_id).await?;
        if task.state != TaskState::InputRequired {
            return Err(EngineError::NotSuspended(task_id.to_string()));
        }
        let admission = self.inner.pool.admit()?;
        self.inner
            .hitl
            .resume(task_id)
            .await
            .map_err(|_| EngineError::NotSuspended(task_id.to_string()))?;

        match self.resume_point(&task).await? {
            Ok(point) => {
                tracing::info!(task_id, iteration = point.iteration, "resuming with input");
                self.spawn_run(
                    task_id.to_string(),
                    admission,
                    Start::Resume {
                        point,
                        input: Some(input.into()),
                    },
                );
                Ok(())
            }
            Err(reason) => {
                self.finish(
                    task_id,
                    TaskState::Failed,
                    Some(reason),
                    Some("no usable checkpoint to resume from".to_string()),
                    None,
                )
                .await?;
                Err(EngineError::CheckpointLost(task_id.to_string()))
            }
        }
    }

    /// 继续一个启动恢复后停放的 RUNNING 任务
    pub async fn resume_recovered(&self, task_id: &str) -> Result<(), EngineError> {
        let task = self.task(task_id).await?;
        let parked = self.inner.parked.read().await.contains_key(task_id);
        if task.state != TaskState::Running || !parked {
            return Err(EngineError::NotParked(task_id.to_string()));
        }
        let admission = self.inner.pool.admit()?;
        let Some(point) = self.unpark(task_id).await else {
            return Err(EngineError::NotParked(task_id.to_string()));
        };
        tracing::info!(task_id, iteration = point.iteration, "resuming recovered task");
        self.spawn_run(
            task_id.to_string(),
            admission,
            Start::Resume { point, input: None },
        );
        Ok(())
    }

    pub async fn expire_overdue(&self) -> Result<Vec<TaskId>, EngineError> {
        self.expire_overdue_at(Utc::now()).await
    }

    /// 超时扫描：先处理超过总时限的挂起/停放任务（FAILED timeout），再处理输入等待超时
    ///
    /// 输入超时后，配置了 auto_resume_hitl 且存在可用检查点时以默认输入继续，否则 FAILED hitl_timeout。
    /// 单个任务出错只记录日志，不影响同批其它任务。
    pub async fn expire_overdue_at(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>, EngineError> {
        let mut handled = self.expire_deadlines(now).await?;

        for request in self.inner.hitl.expire_overdue(now).await {
            let task_id = request.task_id.clone();
            match self.expire_input(&task_id, now).await {
                Ok(true) => handled.push(task_id),
                Ok(false) => {}
                Err(e) => match self.task(&task_id).await {
                    Ok(task) if task.is_finished() => {
                        tracing::debug!(task_id = %task_id, state = task.state.as_str(), "task finished before its input wait expired");
                    }
                    Ok(task) if task.state == TaskState::InputRequired => {
                        tracing::warn!(task_id = %task_id, error = %e, "failed to expire input wait, retrying on next sweep");
                        let _ = self.inner.hitl.restore(request).await;
                    }
                    _ => {
                        tracing::warn!(task_id = %task_id, error = %e, "failed to expire input wait");
                    }
                },
            }
        }
        Ok(handled)
    }

    /// INPUT_REQUIRED 或停放中的任务不在推理循环里，总时限只能由扫描执行
    async fn expire_deadlines(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>, EngineError> {
        let mut handled = Vec::new();
        for task in self.inner.tasks.list_non_terminal().await? {
            if !task.deadline().is_some_and(|d| now >= d) {
                continue;
            }
            let idle = match task.state {
                TaskState::InputRequired => true,
                TaskState::Running => self.inner.parked.read().await.contains_key(&task.id),
                _ => false,
            };
            if !idle {
                continue;
            }
            tracing::warn!(task_id = %task.id, timeout_secs = task.config.timeout_secs, "task timed out while idle");
            match self
                .finish(
                    &task.id,
                    TaskState::Failed,
                    Some(FailureReason::Timeout),
                    Some(format!(
                        "exceeded overall timeout of {}s",
                        task.config.timeout_secs
                    )),
                    None,
                )
                .await
            {
                Ok(_) => handled.push(task.id),
                Err(e) => tracing::warn!(task_id = %task.id, error = %e, "failed to time out task"),
            }
        }
        Ok(handled)
    }

    /// 处理一个已超时的输入请求；任务已结束时返回 false
    async fn expire_input(&self, task_id: &str, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let task = self.task(task_id).await?;
        if task.is_finished() {
            return Ok(false);
        }
        let mut detail = format!("no input within {}s", task.config.input_timeout_secs);

        if self.inner.config.recovery.auto_resume_hitl {
            match self.checkpoint_point(&task, now).await? {
                Ok(point) => match self.inner.pool.admit() {
                    Ok(admission) => {
                        // 停放的快照与挂起时写下的检查点一致，优先使用内存中的那份
                        let point = self.unpark(task_id).await.unwrap_or(point);
                        tracing::info!(task_id, "input wait expired, resuming with default input");
                        self.spawn_run(
                            task_id.to_string(),
                            admission,
                            Start::Resume {
                                point,
                                input: Some(task.config.hitl.default_input.clone()),
                            },
                        );
                        return Ok(true);
                    }
                    Err(e) => {
                        tracing::warn!(task_id, error = %e, "auto-resume refused");
                        detail = format!("input wait expired and auto-resume was refused: {e}");
                    }
                },
                Err(reason) => {
                    detail = format!("input wait expired and no checkpoint to resume from: {reason}");
                }
            }
        }

        tracing::warn!(task_id, "input wait expired");
        self.finish(
            task_id,
            TaskState::Failed,
            Some(FailureReason::HitlTimeout),
            Some(detail),
            None,
        )
        .await?;
        Ok(true)
    }

    /// 周期性调用 expire_overdue，直到 token 被取消
    pub fn spawn_sweeper(&self, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = this.expire_overdue().await {
                            tracing::warn!(error = %e, "input timeout sweep failed");
                        }
                    }
                }
            }
            tracing::debug!("sweeper stopped");
        })
    }

    /// 启动时扫描所有非终态任务
    pub async fn recover_on_startup(&self) -> Result<RecoveryReport, EngineError> {
        let now = Utc::now();
        let mut report = RecoveryReport::default();

        for task in self.inner.tasks.list_non_terminal().await? {
            let task_id = task.id.clone();
            match task.state {
                TaskState::Created => match self.inner.pool.admit() {
                    Ok(admission) => {
                        self.spawn_run(task_id.clone(), admission, Start::Fresh);
                        report.requeued.push(task_id);
                    }
                    Err(e) => {
                        tracing::warn!(task_id = %task_id, error = %e, "cannot requeue task, left in CREATED");
                    }
                },
                TaskState::Running => match self.checkpoint_point(&task, now).await? {
                    Err(reason) => {
                        self.fail_recovery(&task_id, reason).await?;
                        report.failed.push((task_id, reason));
                    }
                    Ok(point) => {
                        let admission = if self.inner.config.recovery.auto_resume {
                            self.inner.pool.admit().ok()
                        } else {
                            None
                        };
                        match admission {
                            Some(admission) => {
                                tracing::info!(task_id = %task_id, iteration = point.iteration, "resuming task from checkpoint");
                                self.spawn_run(
                                    task_id.clone(),
                                    admission,
                                    Start::Resume { point, input: None },
                                );
                                report.resumed.push(task_id);
                            }
                            None => {
                                tracing::info!(task_id = %task_id, "task parked for manual resume");
                                self.park(&task_id, point).await;
                                report.parked.push(task_id);
                            }
                        }
                    }
                },
                TaskState::InputRequired => match self.checkpoint_point(&task, now).await? {
                    Err(reason) => {
                        self.fail_recovery(&task_id, reason).await?;
                        report.failed.push((task_id, reason));
                    }
                    Ok(point) => {
                        let admission = if self.inner.config.recovery.auto_resume_hitl {
                            self.inner.pool.admit().ok()
                        } else {
                            None
                        };
                        if let Some(admission) = admission {
                            tracing::info!(task_id = %task_id, iteration = point.iteration, "resuming suspended task with default input");
                            self.spawn_run(
                                task_id.clone(),
                                admission,
                                Start::Resume {
                                    point,
                                    input: Some(task.config.hitl.default_input.clone()),
                                },
                            );
                            report.resumed.push(task_id);
                            continue;
                        }
                        self.park(&task_id, point).await;
                        match task.input_request.clone() {
                            Some(request) => self.inner.hitl.restore(request).await?,
                            None => {
                                let request = self
                                    .inner
                                    .hitl
                                    .suspend(
                                        &task_id,
                                        "",
                                        task.config.hitl.mode,
                                        task.config.input_timeout_secs,
                                        now,
                                    )
                                    .await?;
                                self.write_task(&task_id, None, |t| t.input_request = Some(request))
                                    .await?;
                            }
                        }
                        report.awaiting_input.push(task_id);
                    }
                },
                TaskState::Completed | TaskState::Failed | TaskState::Cancelled => {}
            }
        }

        tracing::info!(
            resumed = report.resumed.len(),
            parked = report.parked.len(),
            requeued = report.requeued.len(),
            failed = report.failed.len(),
            awaiting_input = report.awaiting_input.len(),
            "startup recovery finished"
        );
        Ok(report)
    }

    /// blocking 模式：每次挂起都同步向 provider 要输入，直到任务结束；provider 返回 None 时取消任务
    pub async fn run_interactive(
        &self,
        goal: impl Into<String>,
        provider: &dyn InputProvider,
    ) -> Result<Task, EngineError> {
        let mut config = self.inner.config.task.clone();
        config.hitl.mode = HitlMode::Blocking;
        let task_id = self.submit_with_config(goal, config).await?;

        let mut answered: Option<String> = None;
        loop {
            let last = answered.clone();
            let task = self
                .wait_for(&task_id, move |t| {
                    t.is_finished()
                        || (t.state == TaskState::InputRequired
                            && t
                                .input_request
                                .as_ref()
                                .is_some_and(|r| Some(&r.id) != last.as_ref()))
                })
                .await?;
            if task.is_finished() {
                return Ok(task);
            }
            let Some(request) = task.input_request else {
                continue;
            };
            answered = Some(request.id.clone());
            match provider.provide(&request).await {
                Some(input) => self.resume(&task_id, input).await?,
                None => {
                    self.cancel(&task_id).await?;
                }
            }
        }
    }

    /// 取消所有任务（进程关闭）
    pub fn shutdown(&self) {
        self.inner.supervisor.shutdown();
    }

    fn notify(&self, task: &Task) {
        let _ = self.inner.notify_tx.send(TaskNotification {
            task_id: task.id.clone(),
            state: task.state,
            failure: task.failure,
        });
    }

    async fn park(&self, task_id: &str, point: ResumePoint) {
        self.inner
            .parked
            .write()
            .await
            .insert(task_id.to_string(), point);
    }

    async fn unpark(&self, task_id: &str) -> Option<ResumePoint> {
        self.inner.parked.write().await.remove(task_id)
    }

    /// 最新检查点对应的恢复位置；unprotected 任务的检查点不可信
    async fn checkpoint_point(
        &self,
        task: &Task,
        now: DateTime<Utc>,
    ) -> Result<Result<ResumePoint, FailureReason>, EngineError> {
        if task.unprotected {
            return Ok(Err(FailureReason::CheckpointLost));
        }
        Ok(
            match self.inner.checkpoints.load_latest_at(&task.id, now).await? {
                LoadOutcome::Found(cp) => Ok(ResumePoint::from(cp)),
                LoadOutcome::Expired(_) => Err(FailureReason::RecoveryExpired),
                LoadOutcome::Absent => Err(FailureReason::CheckpointLost),
            },
        )
    }

    /// 优先取停放的内存快照，否则回退到检查点
    async fn resume_point(
        &self,
        task: &Task,
    ) -> Result<Result<ResumePoint, FailureReason>, EngineError> {
        if let Some(point) = self.unpark(&task.id).await {
            return Ok(Ok(point));
        }
        self.checkpoint_point(task, Utc::now()).await
    }

    async fn fail_recovery(&self, task_id: &str, reason: FailureReason) -> Result<(), EngineError> {
        tracing::warn!(task_id, reason = %reason, "task cannot be recovered");
        let detail = match reason {
            FailureReason::RecoveryExpired => "latest checkpoint is older than the recovery timeout",
            _ => "no trustworthy checkpoint to recover from",
        };
        self.finish(task_id, TaskState::Failed, Some(reason), Some(detail.to_string()), None)
            .await?;
        Ok(())
    }

    /// 读改写任务记录；to 为 Some 时校验状态转换，状态变化时广播通知
    async fn write_task<F>(
        &self,
        task_id: &str,
        to: Option<TaskState>,
        mutate: F,
    ) -> Result<Task, EngineError>
    where
        F: FnOnce(&mut Task),
    {
        let _guard = self.inner.state_lock.lock().await;
        let mut task = self
            .inner
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        let from = task.state;
        let now = Utc::now();

        if let Some(to) = to {
            let allowed = if from == to {
                !from.is_terminal()
            } else {
                from.can_transition_to(to)
            };
            if !allowed {
                return Err(EngineError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from,
                    to,
                });
            }
            task.state = to;
            if to.is_terminal() {
                task.finished_at = Some(now);
            }
        }
        mutate(&mut task);
        task.updated_at = now;
        self.inner.tasks.update(&task).await?;

        if task.state != from {
            tracing::info!(
                task_id,
                from = from.as_str(),
                to = task.state.as_str(),
                failure = ?task.failure,
                "task state changed"
            );
            self.notify(&task);
        }
        Ok(task)
    }

    /// 写入终态并释放任务持有的资源
    async fn finish(
        &self,
        task_id: &str,
        state: TaskState,
        failure: Option<FailureReason>,
        detail: Option<String>,
        result: Option<TaskResult>,
    ) -> Result<Task, EngineError> {
        let task = self
            .write_task(task_id, Some(state), |t| {
                t.failure = failure;
                t.failure_detail = detail;
                t.result = result;
                t.input_request = None;
            })
            .await?;
        self.inner.supervisor.release(task_id);
        self.inner.checkpoints.release(task_id);
        self.unpark(task_id).await;
        // 挂起与取消交错时可能留下请求
        let _ = self.inner.hitl.resume(task_id).await;
        Ok(task)
    }

    fn spawn_run(&self, task_id: TaskId, admission: Admission, start: Start) {
        let token = self.inner.supervisor.token_for(&task_id);
        let this = self.clone();
        tokio::spawn(async move {
            let _permit = match admission {
                Admission::Immediate(permit) => permit,
                Admission::Queued(slot) => match slot.acquire(&token).await {
                    Some(permit) => Some(permit),
                    None => {
                        tracing::info!(task_id = %task_id, "task cancelled while queued");
                        if let Err(e) = this
                            .finish(&task_id, TaskState::Cancelled, None, None, None)
                            .await
                        {
                            tracing::error!(task_id = %task_id, error = %e, "failed to record cancellation");
                        }
                        return;
                    }
                },
            };
            if let Err(e) = this.drive(&task_id, start, token).await {
                tracing::error!(task_id = %task_id, error = %e, "task driver aborted");
            }
        });
    }

    async fn apply_event(&self, task_id: &str, event: LoopEvent) -> Result<(), EngineError> {
        match event {
            LoopEvent::IterationStarted { iteration, .. } => {
                self.write_task(task_id, None, |t| t.iterations = iteration)
                    .await?;
            }
            LoopEvent::CheckpointWritten { sequence, .. } => {
                self.write_task(task_id, None, |t| {
                    t.last_checkpoint = Some(sequence);
                    t.unprotected = false;
                })
                .await?;
            }
            LoopEvent::CheckpointFailed { .. } => {
                self.write_task(task_id, None, |t| t.unprotected = true)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// 驱动一次运行：标记 RUNNING，重建记忆，在总时限内跑推理循环，再把结果写回任务
    async fn drive(
        &self,
        task_id: &str,
        start: Start,
        token: CancellationToken,
    ) -> Result<(), EngineError> {
        let started = Utc::now();
        let task = self
            .write_task(task_id, Some(TaskState::Running), |t| {
                if t.started_at.is_none() {
                    t.started_at = Some(started);
                }
                t.input_request = None;
            })
            .await?;
        let config = task.config.clone();

        let mut memory = WorkingMemory::new(config.memory.clone());
        if let Some(summarizer) = &self.inner.summarizer {
            memory = memory.with_summarizer(Arc::clone(summarizer));
        }
        let (start_iteration, pending) = match start {
            Start::Fresh => {
                memory.append(Message::user(task.goal.clone())).await;
                (0, None)
            }
            Start::Resume { point, input } => {
                memory.restore(point.memory);
                if let Some(input) = input {
                    memory.append(Message::user(input)).await;
                }
                (point.iteration, point.pending)
            }
        };

        let cancelled = token.clone();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut reasoning = ReasoningLoop::new(
            task_id,
            Arc::clone(&self.inner.model),
            Arc::clone(&self.inner.executor),
            TerminationEvaluator::new(config.termination.clone(), config.max_iterations),
            token,
        )
        .with_event_tx(event_tx)
        .with_hitl(config.hitl.clone());
        if config.checkpoint.enabled {
            reasoning = reasoning.with_checkpointer(
                self.inner
                    .checkpoints
                    .for_task(task_id, config.checkpoint.strategy.clone()),
            );
        }

        let remaining = task
            .deadline()
            .map(|d| (d - Utc::now()).to_std().unwrap_or(Duration::ZERO));

        // None 表示超过总时限
        let outcome = {
            let run = async {
                match remaining {
                    Some(limit) => {
                        tokio::time::timeout(limit, reasoning.run(&mut memory, start_iteration, pending))
                            .await
                            .ok()
                    }
                    None => Some(reasoning.run(&mut memory, start_iteration, pending).await),
                }
            };
            tokio::pin!(run);
            loop {
                tokio::select! {
                    outcome = &mut run => break outcome,
                    Some(event) = event_rx.recv() => self.apply_event(task_id, event).await?,
                }
            }
        };
        while let Ok(event) = event_rx.try_recv() {
            self.apply_event(task_id, event).await?;
        }

        match outcome {
            None => {
                tracing::warn!(task_id, timeout_secs = config.timeout_secs, "task timed out");
                self.finish(
                    task_id,
                    TaskState::Failed,
                    Some(FailureReason::Timeout),
                    Some(format!("exceeded overall timeout of {}s", config.timeout_secs)),
                    None,
                )
                .await?;
            }
            Some(LoopOutcome::Completed { result, iterations }) => {
                self.write_task(task_id, None, |t| t.iterations = iterations)
                    .await?;
                self.finish(task_id, TaskState::Completed, None, None, Some(result))
                    .await?;
            }
            Some(LoopOutcome::Failed {
                reason,
                detail,
                iterations,
            }) => {
                self.write_task(task_id, None, |t| t.iterations = iterations)
                    .await?;
                self.finish(task_id, TaskState::Failed, Some(reason), Some(detail), None)
                    .await?;
            }
            Some(LoopOutcome::Cancelled { iteration }) => {
                self.write_task(task_id, None, |t| t.iterations = iteration)
                    .await?;
                self.finish(task_id, TaskState::Cancelled, None, None, None)
                    .await?;
            }
            Some(LoopOutcome::Suspended { prompt, iteration }) => {
                let request = self
                    .inner
                    .hitl
                    .suspend(
                        task_id,
                        prompt,
                        config.hitl.mode,
                        config.input_timeout_secs,
                        Utc::now(),
                    )
                    .await?;
                self.park(
                    task_id,
                    ResumePoint {
                        memory: memory.snapshot(),
                        iteration,
                        pending: None,
                    },
                )
                .await;
                self.write_task(task_id, Some(TaskState::InputRequired), |t| {
                    t.iterations = iteration;
                    t.input_request = Some(request);
                })
                .await?;
                // cancel 在挂起前只能取消 token，这里补上终态
                if cancelled.is_cancelled() {
                    if let Err(e) = self
                        .finish(task_id, TaskState::Cancelled, None, None, None)
                        .await
                    {
                        tracing::debug!(task_id, error = %e, "task already finished by cancel");
                    }
                }
            }
        }
        Ok(())
    }
}
