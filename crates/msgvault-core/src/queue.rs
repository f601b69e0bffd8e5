//! Task queues and the periodic scheduler
//!
//! One [`TaskQueue`] exists per direction. A scheduler tick evicts settled
//! tasks whose grace period has passed and promotes QUEUED tasks while fewer
//! than `max_running` workers are active. Every state transition, and every
//! ledger write made by a running worker, happens under the queue's single
//! mutex.
//!
//! ```text
//!   QUEUED ──▶ RUNNING ──▶ COMPLETED
//!     ▲  │       │  └────▶ FAILED ──┐
//!     │  └──▶ PAUSED ◀─┘            │
//!     └──────────┴──────────────────┘   (resume)
//!   any non-terminal ──▶ CANCELLED
//! ```

use crate::{
    config::QueueConfig,
    coordinator::{PriorityHints, TransferContext},
    ledger::{ChunkLedger, LedgerState, LedgerUpdate},
    metadata::{Direction, TaskId, TaskStatus, TransferTask},
    store::MetadataStore,
    CoreError, Result,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Status change or progress update of one task
#[derive(Clone, Debug, PartialEq)]
pub struct QueueEvent {
    /// Task identifier
    pub task_id: TaskId,
    /// Queue the task belongs to
    pub direction: Direction,
    /// Status after the change
    pub status: TaskStatus,
    /// Progress after the change
    pub progress: f64,
    /// Failure message, if failed
    pub error: Option<String>,
}

impl QueueEvent {
    fn of(task: &TransferTask) -> Self {
        Self {
            task_id: task.id,
            direction: task.direction,
            status: task.status,
            progress: task.progress,
            error: task.error.clone(),
        }
    }
}

/// Runs the work behind a task
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run until done, failed, or `ctx.cancel` fires
    async fn execute(&self, task: TransferTask, ctx: TransferContext) -> Result<()>;

    /// Release whatever a cancelled task left behind
    async fn discard(&self, task: &TransferTask);
}

struct Entry {
    task: TransferTask,
    cancel: Option<CancellationToken>,
    worker_active: bool,
    discard_on_exit: bool,
    settled_at: Option<Instant>,
    progress: Arc<watch::Sender<LedgerState>>,
    hints: PriorityHints,
}

impl Entry {
    fn new(task: TransferTask) -> Self {
        let (progress, _) = watch::channel(LedgerState::of(&task));
        let settled_at = task.status.is_settled().then(Instant::now);
        Self {
            task,
            cancel: None,
            worker_active: false,
            discard_on_exit: false,
            settled_at,
            progress: Arc::new(progress),
            hints: PriorityHints::new(),
        }
    }
}

#[derive(Default)]
struct QueueState {
    entries: Vec<Entry>,
}

impl QueueState {
    fn position(&self, id: &TaskId) -> Option<usize> {
        self.entries.iter().position(|e| &e.task.id == id)
    }

    fn locate(&self, id: &TaskId) -> Result<usize> {
        self.position(id)
            .ok_or_else(|| CoreError::TaskNotFound(id.to_string()))
    }

    fn active_workers(&self) -> usize {
        self.entries.iter().filter(|e| e.worker_active).count()
    }
}

struct Shared {
    direction: Direction,
    config: QueueConfig,
    state: Mutex<QueueState>,
    store: Arc<dyn MetadataStore>,
    executor: Arc<dyn TaskExecutor>,
    events: broadcast::Sender<QueueEvent>,
    shutdown: CancellationToken,
}

/// A queue of tasks of one direction
#[derive(Clone)]
pub struct TaskQueue {
    shared: Arc<Shared>,
}

impl TaskQueue {
    /// Create a queue; call [`start`](Self::start) to run its scheduler
    pub fn new(
        direction: Direction,
        config: QueueConfig,
        store: Arc<dyn MetadataStore>,
        executor: Arc<dyn TaskExecutor>,
        events: broadcast::Sender<QueueEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                direction,
                config,
                state: Mutex::new(QueueState::default()),
                store,
                executor,
                events,
                shutdown,
            }),
        }
    }

    /// Queue direction
    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    fn emit(&self, event: QueueEvent) {
        // no subscribers is fine
        let _ = self.shared.events.send(event);
    }

    /// Persist `status` for the entry at `pos` and commit it in memory
    async fn transition(
        &self,
        state: &mut QueueState,
        pos: usize,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<QueueEvent> {
        let mut next = state.entries[pos].task.clone();
        next.set_status(status);
        next.error = error;
        self.shared.store.put_task(&next).await?;

        let entry = &mut state.entries[pos];
        entry.settled_at = status.is_settled().then(Instant::now);
        entry.task = next;
        Ok(QueueEvent::of(&entry.task))
    }

    fn invalid(task: &TransferTask, action: &'static str) -> CoreError {
        CoreError::InvalidTransition {
            task_id: task.id.to_string(),
            status: task.status.to_string(),
            action,
        }
    }

    /// Add a new task as QUEUED
    pub async fn add(&self, task: TransferTask) -> Result<TaskId> {
        self.admit(task, TaskStatus::Queued).await
    }

    /// Put a persisted task back into the visible queue with `status`
    pub async fn admit(&self, mut task: TransferTask, status: TaskStatus) -> Result<TaskId> {
        if task.direction != self.shared.direction {
            return Err(CoreError::InvalidInput(format!(
                "{} task {} offered to the {} queue",
                task.direction, task.id, self.shared.direction
            )));
        }
        task.set_status(status);
        if status == TaskStatus::Queued {
            task.error = None;
        }

        let mut state = self.shared.state.lock().await;
        if state.position(&task.id).is_some() {
            return Err(CoreError::InvalidInput(format!("task {} is already queued", task.id)));
        }
        self.shared.store.put_task(&task).await?;
        let id = task.id;
        let event = QueueEvent::of(&task);
        state.entries.push(Entry::new(task));
        drop(state);

        debug!(task_id = %id, %status, "Task admitted");
        self.emit(event);
        Ok(id)
    }

    /// Evict settled tasks past their grace period and start queued ones
    pub async fn tick(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;

        let delay = self.shared.config.eviction_delay;
        let now = Instant::now();
        state.entries.retain(|e| {
            let expired = matches!(e.task.status, TaskStatus::Completed | TaskStatus::Failed)
                && !e.worker_active
                && e.settled_at
                    .is_some_and(|at| now.duration_since(at) >= delay);
            !expired
        });

        let mut events = Vec::new();
        while state.active_workers() < self.shared.config.max_running {
            let Some(pos) = state
                .entries
                .iter()
                .position(|e| e.task.status == TaskStatus::Queued && !e.worker_active)
            else {
                break;
            };
            events.push(self.transition(&mut state, pos, TaskStatus::Running, None).await?);

            let token = self.shared.shutdown.child_token();
            let entry = &mut state.entries[pos];
            entry.cancel = Some(token.clone());
            entry.worker_active = true;
            let ctx = TransferContext {
                cancel: token,
                ledger: Arc::new(QueueLedger {
                    queue: self.clone(),
                    task_id: entry.task.id,
                    progress: entry.progress.clone(),
                }),
                hints: entry.hints.clone(),
                received: Default::default(),
            };
            self.spawn_worker(entry.task.clone(), ctx);
        }
        drop(state);

        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    fn spawn_worker(&self, task: TransferTask, ctx: TransferContext) {
        let queue = self.clone();
        let executor = self.shared.executor.clone();
        let id = task.id;
        info!(task_id = %id, direction = %task.direction, file = %task.file_name, "Task started");
        tokio::spawn(async move {
            let outcome = tokio::spawn(async move { executor.execute(task, ctx).await }).await;
            let result = outcome.unwrap_or_else(|e| Err(CoreError::Worker(e.to_string())));
            if let Err(e) = queue.finish(id, result).await {
                error!(task_id = %id, error = %e, "Failed to record task outcome");
            }
        });
    }

    async fn finish(&self, id: TaskId, result: Result<()>) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        let Some(pos) = state.position(&id) else {
            return Ok(());
        };
        let entry = &mut state.entries[pos];
        entry.worker_active = false;
        entry.cancel = None;
        let discard = entry.discard_on_exit;
        let status = entry.task.status;

        if discard {
            let (task, event) = self.retire(&mut state, pos).await?;
            drop(state);
            self.discard(task, event).await;
            return Ok(());
        }

        let event = match (status, result) {
            (TaskStatus::Running, Ok(())) => {
                info!(task_id = %id, "Task completed");
                Some(self.transition(&mut state, pos, TaskStatus::Completed, None).await?)
            }
            (TaskStatus::Running, Err(CoreError::Cancelled)) => {
                // shutdown; the persisted RUNNING status is picked up on restore
                None
            }
            (TaskStatus::Running, Err(e)) => {
                warn!(task_id = %id, error = %e, "Task failed");
                Some(
                    self.transition(&mut state, pos, TaskStatus::Failed, Some(e.to_string()))
                        .await?,
                )
            }
            _ => None,
        };
        drop(state);

        if let Some(event) = event {
            self.emit(event);
        }
        Ok(())
    }

    /// Persist the CANCELLED record of the entry at `pos` and take it out of the queue
    async fn retire(
        &self,
        state: &mut QueueState,
        pos: usize,
    ) -> Result<(TransferTask, QueueEvent)> {
        let mut record = state.entries[pos].task.clone();
        record.clear_ledger();
        record.set_status(TaskStatus::Cancelled);
        self.shared.store.put_task(&record).await?;
        let task = state.entries.remove(pos).task;
        Ok((task, QueueEvent::of(&record)))
    }

    async fn discard(&self, task: TransferTask, event: QueueEvent) {
        self.shared.executor.discard(&task).await;
        info!(task_id = %task.id, "Task cancelled");
        self.emit(event);
    }

    /// RUNNING or QUEUED → PAUSED, stopping in-flight work and keeping the ledger
    pub async fn pause(&self, id: &TaskId) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        let pos = state.locate(id)?;
        let entry = &mut state.entries[pos];
        if !matches!(entry.task.status, TaskStatus::Running | TaskStatus::Queued) {
            return Err(Self::invalid(&entry.task, "pause"));
        }
        if let Some(token) = entry.cancel.take() {
            token.cancel();
        }
        let event = self.transition(&mut state, pos, TaskStatus::Paused, None).await?;
        drop(state);
        self.emit(event);
        Ok(())
    }

    /// PAUSED or FAILED → QUEUED
    pub async fn resume(&self, id: &TaskId) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        let pos = state.locate(id)?;
        let task = &state.entries[pos].task;
        if !matches!(task.status, TaskStatus::Paused | TaskStatus::Failed) {
            return Err(Self::invalid(task, "resume"));
        }
        let event = self.transition(&mut state, pos, TaskStatus::Queued, None).await?;
        drop(state);
        self.emit(event);
        Ok(())
    }

    /// Any non-terminal state → CANCELLED, discarding the partial ledger
    pub async fn cancel(&self, id: &TaskId) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        let pos = state.locate(id)?;
        let entry = &mut state.entries[pos];
        if entry.task.status.is_terminal() {
            return Err(Self::invalid(&entry.task, "cancel"));
        }
        if let Some(token) = entry.cancel.take() {
            token.cancel();
        }
        entry.task.set_status(TaskStatus::Cancelled);
        if entry.worker_active {
            entry.discard_on_exit = true;
            return Ok(());
        }
        let (task, event) = self.retire(&mut state, pos).await?;
        drop(state);
        self.discard(task, event).await;
        Ok(())
    }

    /// Drop a task from the visible queue; its persisted record is kept
    pub async fn remove(&self, id: &TaskId) -> Result<TransferTask> {
        let mut state = self.shared.state.lock().await;
        let pos = state.locate(id)?;
        if state.entries[pos].worker_active {
            return Err(Self::invalid(&state.entries[pos].task, "remove"));
        }
        Ok(state.entries.remove(pos).task)
    }

    /// RUNNING → COMPLETED
    pub async fn complete(&self, id: &TaskId) -> Result<()> {
        self.settle(id, TaskStatus::Completed, None, "complete").await
    }

    /// RUNNING → FAILED with `error` recorded
    pub async fn fail(&self, id: &TaskId, error: impl Into<String>) -> Result<()> {
        self.settle(id, TaskStatus::Failed, Some(error.into()), "fail").await
    }

    async fn settle(
        &self,
        id: &TaskId,
        status: TaskStatus,
        error: Option<String>,
        action: &'static str,
    ) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        let pos = state.locate(id)?;
        let entry = &mut state.entries[pos];
        if entry.task.status != TaskStatus::Running {
            return Err(Self::invalid(&entry.task, action));
        }
        if let Some(token) = entry.cancel.take() {
            token.cancel();
        }
        let event = self.transition(&mut state, pos, status, error).await?;
        drop(state);
        self.emit(event);
        Ok(())
    }

    /// Snapshot of one visible task
    pub async fn get(&self, id: &TaskId) -> Option<TransferTask> {
        let state = self.shared.state.lock().await;
        state.position(id).map(|pos| state.entries[pos].task.clone())
    }

    /// Whether a task is in the visible queue
    pub async fn contains(&self, id: &TaskId) -> bool {
        self.shared.state.lock().await.position(id).is_some()
    }

    /// Snapshot of all visible tasks in admission order
    pub async fn tasks(&self) -> Vec<TransferTask> {
        let state = self.shared.state.lock().await;
        state.entries.iter().map(|e| e.task.clone()).collect()
    }

    /// Number of tasks with an active worker
    pub async fn running(&self) -> usize {
        self.shared.state.lock().await.active_workers()
    }

    /// Watch a visible task's ledger
    pub async fn progress(&self, id: &TaskId) -> Option<watch::Receiver<LedgerState>> {
        let state = self.shared.state.lock().await;
        state
            .position(id)
            .map(|pos| state.entries[pos].progress.subscribe())
    }

    /// Priority hints routed to a visible task's transfer
    pub async fn hints(&self, id: &TaskId) -> Option<PriorityHints> {
        let state = self.shared.state.lock().await;
        state.position(id).map(|pos| state.entries[pos].hints.clone())
    }

    /// Wait until a task is COMPLETED, FAILED or CANCELLED
    pub async fn wait(&self, id: &TaskId) -> Result<TransferTask> {
        let mut events = self.shared.events.subscribe();
        loop {
            if let Some(task) = self.settled(id).await? {
                return Ok(task);
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(CoreError::Worker("event channel closed".to_string()))
                }
            }
        }
    }

    async fn settled(&self, id: &TaskId) -> Result<Option<TransferTask>> {
        {
            let state = self.shared.state.lock().await;
            if let Some(pos) = state.position(id) {
                let entry = &state.entries[pos];
                let done = entry.task.status.is_settled() && !entry.worker_active;
                return Ok(done.then(|| entry.task.clone()));
            }
        }
        match self.shared.store.get_task(id).await? {
            Some(task) if task.status.is_settled() => Ok(Some(task)),
            Some(task) => Err(Self::invalid(&task, "wait for")),
            None => Err(CoreError::TaskNotFound(id.to_string())),
        }
    }

    /// Run the scheduler until shutdown
    pub fn start(&self) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(queue.shared.config.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = queue.shared.shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = queue.tick().await {
                            error!(direction = %queue.shared.direction, error = %e, "Scheduler tick failed");
                        }
                    }
                }
            }
            debug!(direction = %queue.shared.direction, "Scheduler stopped");
        })
    }
}

/// Ledger of a queued task; writes go through the queue mutex
struct QueueLedger {
    queue: TaskQueue,
    task_id: TaskId,
    progress: Arc<watch::Sender<LedgerState>>,
}

#[async_trait]
impl ChunkLedger for QueueLedger {
    async fn record(&self, update: LedgerUpdate) -> Result<LedgerState> {
        let shared = &self.queue.shared;
        let mut state = shared.state.lock().await;
        let pos = state.locate(&self.task_id)?;
        let mut next = state.entries[pos].task.clone();
        update.apply(&mut next);
        shared.store.put_task(&next).await?;

        let entry = &mut state.entries[pos];
        entry.task = next;
        let snapshot = LedgerState::of(&entry.task);
        let event = QueueEvent::of(&entry.task);
        drop(state);

        self.progress.send_replace(snapshot.clone());
        self.queue.emit(event);
        Ok(snapshot)
    }

    async fn task(&self) -> Result<TransferTask> {
        let state = self.queue.shared.state.lock().await;
        let pos = state.locate(&self.task_id)?;
        Ok(state.entries[pos].task.clone())
    }

    fn subscribe(&self) -> watch::Receiver<LedgerState> {
        self.progress.subscribe()
    }
}

/// Upload and download queues sharing one store, executor and event stream
pub struct TaskQueueManager {
    uploads: TaskQueue,
    downloads: TaskQueue,
    store: Arc<dyn MetadataStore>,
    events: broadcast::Sender<QueueEvent>,
    shutdown: CancellationToken,
    schedulers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl TaskQueueManager {
    /// Create both queues
    pub fn new(
        config: QueueConfig,
        store: Arc<dyn MetadataStore>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let shutdown = CancellationToken::new();
        let queue = |direction| {
            TaskQueue::new(
                direction,
                config.clone(),
                store.clone(),
                executor.clone(),
                events.clone(),
                shutdown.clone(),
            )
        };
        Self {
            uploads: queue(Direction::Upload),
            downloads: queue(Direction::Download),
            store,
            events,
            shutdown,
            schedulers: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Start both scheduler loops
    pub fn start(&self) {
        let mut schedulers = self.schedulers.lock();
        if schedulers.is_empty() {
            schedulers.push(self.uploads.start());
            schedulers.push(self.downloads.start());
        }
    }

    /// Stop the schedulers and interrupt running workers.
    ///
    /// Interrupted tasks stay RUNNING in the store and are re-queued by
    /// [`restore`](Self::restore).
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Queue for a direction
    pub fn queue(&self, direction: Direction) -> &TaskQueue {
        match direction {
            Direction::Upload => &self.uploads,
            Direction::Download => &self.downloads,
        }
    }

    async fn locate(&self, id: &TaskId) -> Option<&TaskQueue> {
        if self.uploads.contains(id).await {
            Some(&self.uploads)
        } else if self.downloads.contains(id).await {
            Some(&self.downloads)
        } else {
            None
        }
    }

    async fn located(&self, id: &TaskId) -> Result<&TaskQueue> {
        self.locate(id)
            .await
            .ok_or_else(|| CoreError::TaskNotFound(id.to_string()))
    }

    /// Add a task to its direction's queue
    pub async fn enqueue(&self, task: TransferTask) -> Result<TaskId> {
        self.queue(task.direction).add(task).await
    }

    /// Pause a task
    pub async fn pause(&self, id: &TaskId) -> Result<()> {
        self.located(id).await?.pause(id).await
    }

    /// Resume a paused or failed task, reloading it from the store if it was evicted
    pub async fn resume(&self, id: &TaskId) -> Result<()> {
        if let Some(queue) = self.locate(id).await {
            return queue.resume(id).await;
        }
        let task = self
            .store
            .get_task(id)
            .await?
            .ok_or_else(|| CoreError::TaskNotFound(id.to_string()))?;
        if task.status.is_terminal() {
            return Err(TaskQueue::invalid(&task, "resume"));
        }
        self.queue(task.direction)
            .admit(task, TaskStatus::Queued)
            .await
            .map(|_| ())
    }

    /// Cancel a task
    pub async fn cancel(&self, id: &TaskId) -> Result<()> {
        self.located(id).await?.cancel(id).await
    }

    /// Drop a task from the visible queues
    pub async fn remove(&self, id: &TaskId) -> Result<TransferTask> {
        self.located(id).await?.remove(id).await
    }

    /// Re-admit every incomplete persisted task; returns how many were restored
    pub async fn restore(&self) -> Result<usize> {
        let mut restored = 0;
        for task in self.store.incomplete_tasks().await? {
            if self.locate(&task.id).await.is_some() {
                continue;
            }
            let status = match task.status {
                TaskStatus::Queued | TaskStatus::Running => TaskStatus::Queued,
                other => other,
            };
            self.queue(task.direction).admit(task, status).await?;
            restored += 1;
        }
        if restored > 0 {
            info!(restored, "Restored incomplete tasks");
        }
        Ok(restored)
    }

    /// Subscribe to events from both queues
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Watch a visible task's ledger
    pub async fn progress(&self, id: &TaskId) -> Option<watch::Receiver<LedgerState>> {
        self.locate(id).await?.progress(id).await
    }

    /// Priority hints of a visible task
    pub async fn hints(&self, id: &TaskId) -> Option<PriorityHints> {
        self.locate(id).await?.hints(id).await
    }

    /// Visible tasks of both queues
    pub async fn tasks(&self) -> Vec<TransferTask> {
        let mut all = self.uploads.tasks().await;
        all.extend(self.downloads.tasks().await);
        all
    }

    /// Current record of a task, visible or persisted
    pub async fn task(&self, id: &TaskId) -> Result<TransferTask> {
        if let Some(queue) = self.locate(id).await {
            if let Some(task) = queue.get(id).await {
                return Ok(task);
            }
        }
        self.store
            .get_task(id)
            .await?
            .ok_or_else(|| CoreError::TaskNotFound(id.to_string()))
    }

    /// Wait for a task to settle
    pub async fn wait(&self, id: &TaskId) -> Result<TransferTask> {
        let direction = self.task(id).await?.direction;
        self.queue(direction).wait(id).await
    }
}

impl Drop for TaskQueueManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
