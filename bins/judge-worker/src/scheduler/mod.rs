/// Task Scheduler - Priority Queue and Worker Pool
///
/// **Core Responsibility:**
/// Own every task from submit to its terminal state: order pending work,
/// hand it to a fixed pool of workers, and keep a registry for lookup,
/// cancellation and retention.
///
/// **Moving parts:**
/// - Priority queue of pending tasks behind one mutex
/// - One capacity-1 handoff channel per worker, plus an idle flag
/// - Dispatcher: ticks every `dispatch_interval_ms`, pops and hands off
/// - Distributor: drains requeued tasks (retries) and hands them off
/// - Sweeper: evicts tasks terminal for longer than `retention_hours`
///
/// **State path:** pending → running → completed | failed | cancelled.
/// A failed task with retries left goes back to pending after
/// `retry_interval_secs` with a fresh cancellation handle and deadline.
///
/// **Shutdown order:** stop accepting → stop dispatcher and distributor →
/// close worker channels and await in-flight tasks → stop deadline timers
/// and the sweeper.
pub mod queue;
pub mod task;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use judge_common::config::SchedulerConfig;
use judge_common::types::{JudgeResult, TaskState};

use crate::cancel::{cancel_pair, CancelReason};
use crate::engine::EngineError;
use queue::PriorityQueue;
pub use task::{JudgeTask, TaskContext, TaskEntry, TaskSnapshot};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("max_workers must be greater than zero")]
    NoWorkers,
    #[error("queue_size must be greater than zero")]
    NoQueue,
    #[error("queue is full")]
    QueueFull,
    #[error("scheduler is shutting down")]
    ShuttingDown,
    #[error("task not found: {0}")]
    NotFound(String),
}

/// Runs one task to completion. Implemented by the verdict engine.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(&self, task: Arc<JudgeTask>, ctx: TaskContext) -> Result<JudgeResult, EngineError>;
}

/// Completion hook, invoked on every final terminal transition
pub trait TaskObserver: Send + Sync {
    fn on_terminal(&self, snapshot: &TaskSnapshot);
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SchedulerStats {
    pub workers: usize,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total: u64,
    pub retried: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedTask {
    pub position: usize,
    pub task_id: String,
    pub submission_id: i64,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub estimated_wait_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub workers: usize,
    pub pending: u64,
    pub running: u64,
    pub items: Vec<QueuedTask>,
}

#[derive(Default)]
struct Counters {
    pending: AtomicU64,
    running: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    total: AtomicU64,
    retried: AtomicU64,
}

fn decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1)));
}

fn increment(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::AcqRel);
}

struct WorkerSlot {
    tx: mpsc::Sender<Arc<TaskEntry>>,
    idle: Arc<AtomicBool>,
}

struct Inner {
    config: SchedulerConfig,
    processor: Arc<dyn TaskProcessor>,
    queue: Mutex<PriorityQueue<Arc<TaskEntry>>>,
    registry: RwLock<HashMap<String, Arc<TaskEntry>>>,
    counters: Counters,
    workers: Mutex<Vec<WorkerSlot>>,
    requeue_tx: mpsc::UnboundedSender<Arc<TaskEntry>>,
    observers: RwLock<Vec<Arc<dyn TaskObserver>>>,
    accepting: AtomicBool,
    next_id: AtomicU64,
}

struct Handles {
    dispatcher: JoinHandle<()>,
    distributor: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

pub struct Scheduler {
    inner: Arc<Inner>,
    handles: tokio::sync::Mutex<Option<Handles>>,
}

impl Scheduler {
    /// Validate the configuration and spawn workers and background loops
    pub fn start(config: SchedulerConfig, processor: Arc<dyn TaskProcessor>) -> Result<Self, SchedulerError> {
        if config.max_workers == 0 {
            return Err(SchedulerError::NoWorkers);
        }
        if config.queue_size == 0 {
            return Err(SchedulerError::NoQueue);
        }

        let (requeue_tx, requeue_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            config: config.clone(),
            processor,
            queue: Mutex::new(PriorityQueue::new()),
            registry: RwLock::new(HashMap::new()),
            counters: Counters::default(),
            workers: Mutex::new(Vec::new()),
            requeue_tx,
            observers: RwLock::new(Vec::new()),
            accepting: AtomicBool::new(true),
            next_id: AtomicU64::new(0),
        });

        let mut worker_handles = Vec::with_capacity(config.max_workers);
        {
            let mut slots = inner.lock_workers();
            for worker_id in 0..config.max_workers {
                let (tx, rx) = mpsc::channel(1);
                let idle = Arc::new(AtomicBool::new(true));
                slots.push(WorkerSlot { tx, idle: idle.clone() });
                worker_handles.push(tokio::spawn(worker_loop(inner.clone(), worker_id, rx, idle)));
            }
        }

        let dispatcher = tokio::spawn(dispatch_loop(inner.clone(), shutdown_rx.clone()));
        let distributor = tokio::spawn(distribute_loop(inner.clone(), requeue_rx, shutdown_rx.clone()));
        let sweeper = tokio::spawn(sweep_loop(inner.clone(), shutdown_rx));

        info!(
            workers = config.max_workers,
            queue_size = config.queue_size,
            task_timeout_secs = config.task_timeout_secs,
            "Scheduler started"
        );

        Ok(Scheduler {
            inner,
            handles: tokio::sync::Mutex::new(Some(Handles {
                dispatcher,
                distributor,
                sweeper,
                workers: worker_handles,
                shutdown_tx,
            })),
        })
    }

    pub fn add_observer(&self, observer: Arc<dyn TaskObserver>) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Queue a task; returns the assigned task id
    pub fn submit(&self, mut task: JudgeTask) -> Result<String, SchedulerError> {
        let inner = &self.inner;
        if !inner.accepting.load(Ordering::Acquire) {
            return Err(SchedulerError::ShuttingDown);
        }
        if inner.counters.pending.load(Ordering::Acquire) >= inner.config.queue_size as u64 {
            warn!(submission_id = task.submission_id, "Queue is full, rejecting task");
            return Err(SchedulerError::QueueFull);
        }

        let seq = inner.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        task.task_id = format!("task_{}_{}", task.submission_id, seq);
        let task_id = task.task_id.clone();
        let entry = Arc::new(TaskEntry::new(task, seq));

        inner
            .registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id.clone(), entry.clone());
        inner.arm_deadline(&entry);
        increment(&inner.counters.pending);
        increment(&inner.counters.total);
        inner.push_pending(entry.clone());

        info!(
            task_id = %task_id,
            submission_id = entry.task.submission_id,
            priority = entry.task.priority,
            "Task submitted"
        );
        Ok(task_id)
    }

    /// Cancel a task. Cancelling a terminal task is a successful no-op.
    pub fn cancel(&self, task_id: &str) -> Result<(), SchedulerError> {
        self.inner.cancel(task_id)
    }

    pub fn get_by_task_id(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.inner.lookup(task_id).map(|entry| entry.snapshot())
    }

    /// Most recent task for a submission
    pub fn find_by_submission_id(&self, submission_id: i64) -> Option<TaskSnapshot> {
        let queued = self
            .inner
            .lock_queue()
            .find(|e| e.task.submission_id == submission_id)
            .cloned();

        let registered = self
            .inner
            .registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|e| e.task.submission_id == submission_id)
            .max_by_key(|e| e.seq)
            .cloned();

        let latest = match (queued, registered) {
            (Some(a), Some(b)) => Some(if a.seq >= b.seq { a } else { b }),
            (a, b) => a.or(b),
        };
        latest.map(|entry| entry.snapshot())
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.inner.counters;
        SchedulerStats {
            workers: self.inner.config.max_workers,
            pending: c.pending.load(Ordering::Acquire),
            running: c.running.load(Ordering::Acquire),
            completed: c.completed.load(Ordering::Acquire),
            failed: c.failed.load(Ordering::Acquire),
            cancelled: c.cancelled.load(Ordering::Acquire),
            total: c.total.load(Ordering::Acquire),
            retried: c.retried.load(Ordering::Acquire),
        }
    }

    /// Pending tasks in dispatch order with estimated waits
    pub fn queue_status(&self) -> QueueStatus {
        let workers = self.inner.config.max_workers;
        let avg = self.inner.config.avg_task_seconds;
        let pending: Vec<Arc<TaskEntry>> = self
            .inner
            .lock_queue()
            .ordered()
            .into_iter()
            .filter(|e| e.state() == TaskState::Pending)
            .cloned()
            .collect();

        let items = pending
            .iter()
            .enumerate()
            .map(|(position, entry)| QueuedTask {
                position,
                task_id: entry.task.task_id.clone(),
                submission_id: entry.task.submission_id,
                priority: entry.task.priority,
                created_at: entry.task.created_at,
                estimated_wait_secs: (position / workers) as u64 * avg,
            })
            .collect();

        let stats = self.stats();
        QueueStatus {
            workers,
            pending: stats.pending,
            running: stats.running,
            items,
        }
    }

    /// Drop registry entries terminal since before `now - retention`
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        self.inner.sweep_expired(now)
    }

    pub async fn shutdown(&self) {
        let Some(handles) = self.handles.lock().await.take() else {
            return;
        };
        info!("Scheduler shutting down");

        self.inner.accepting.store(false, Ordering::Release);
        let _ = handles.shutdown_tx.send(true);
        let _ = handles.dispatcher.await;
        let _ = handles.distributor.await;

        // dropping the senders lets each worker finish its current task and exit
        self.inner.lock_workers().clear();
        for joined in join_all(handles.workers).await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task failed during shutdown");
            }
        }

        for entry in self.inner.registry.read().unwrap_or_else(|e| e.into_inner()).values() {
            if let Some(timer) = entry.lock().deadline.take() {
                timer.abort();
            }
        }
        handles.sweeper.abort();
        info!("Scheduler stopped");
    }
}

impl Inner {
    fn lock_queue(&self) -> MutexGuard<'_, PriorityQueue<Arc<TaskEntry>>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<WorkerSlot>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push_pending(&self, entry: Arc<TaskEntry>) {
        let priority = entry.task.priority;
        let created_at = entry.task.created_at;
        self.lock_queue().push(priority, created_at, entry);
    }

    fn lookup(&self, task_id: &str) -> Option<Arc<TaskEntry>> {
        if let Some(entry) = self.lock_queue().find(|e| e.task_id() == task_id) {
            return Some(entry.clone());
        }
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .cloned()
    }

    fn arm_deadline(&self, entry: &Arc<TaskEntry>) {
        let timeout = Duration::from_secs(self.config.task_timeout_secs);
        let weak = Arc::downgrade(entry);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(entry) = weak.upgrade() {
                if entry.fire_cancel(CancelReason::Deadline) {
                    warn!(task_id = %entry.task_id(), "Task deadline exceeded");
                }
            }
        });
        if let Some(previous) = entry.lock().deadline.replace(timer) {
            previous.abort();
        }
    }

    /// Try to hand a task to an idle worker; gives it back if none is free
    fn hand_off(&self, mut entry: Arc<TaskEntry>) -> Result<(), Arc<TaskEntry>> {
        let slots = self.lock_workers();
        for slot in slots.iter() {
            if slot
                .idle
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            match slot.tx.try_send(entry) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Full(e)) | Err(mpsc::error::TrySendError::Closed(e)) => {
                    slot.idle.store(true, Ordering::Release);
                    entry = e;
                }
            }
        }
        Err(entry)
    }

    fn dispatch_pending(&self) {
        loop {
            let Some(entry) = self.lock_queue().pop() else {
                return;
            };
            if entry.state() != TaskState::Pending {
                debug!(task_id = %entry.task_id(), "Dropping non-pending task from queue");
                continue;
            }
            if let Err(entry) = self.hand_off(entry) {
                self.push_pending(entry);
                return;
            }
        }
    }

    /// pending → running; false if the task was cancelled in the meantime
    fn mark_running(&self, entry: &TaskEntry) -> bool {
        let mut status = entry.lock();
        if status.state != TaskState::Pending {
            return false;
        }
        status.state = TaskState::Running;
        status.started_at = Some(Utc::now());
        decrement(&self.counters.pending);
        increment(&self.counters.running);
        true
    }

    fn finish(self: &Arc<Self>, entry: &Arc<TaskEntry>, outcome: Result<JudgeResult, EngineError>) {
        let mut retry = false;
        {
            let mut status = entry.lock();
            if status.state != TaskState::Running {
                // cancelled while running; cancel already did the bookkeeping
                return;
            }
            decrement(&self.counters.running);
            status.completed_at = Some(Utc::now());
            if let Some(timer) = status.deadline.take() {
                timer.abort();
            }

            match outcome {
                Ok(result) => {
                    info!(
                        task_id = %entry.task_id(),
                        submission_id = entry.task.submission_id,
                        verdict = %result.status,
                        score = result.score,
                        "Task completed"
                    );
                    status.state = TaskState::Completed;
                    status.result = Some(result);
                    increment(&self.counters.completed);
                }
                Err(EngineError::Cancelled) => {
                    info!(task_id = %entry.task_id(), "Task cancelled");
                    status.state = TaskState::Cancelled;
                    increment(&self.counters.cancelled);
                }
                Err(e) => {
                    status.state = TaskState::Failed;
                    status.error = Some(e.to_string());
                    if status.retry_count < self.config.retry_times
                        && self.accepting.load(Ordering::Acquire)
                    {
                        warn!(
                            task_id = %entry.task_id(),
                            retry_count = status.retry_count,
                            error = %e,
                            "Task failed, retry scheduled"
                        );
                        status.retry_pending = true;
                        retry = true;
                    } else {
                        error!(task_id = %entry.task_id(), error = %e, "Task failed");
                        increment(&self.counters.failed);
                    }
                }
            }
        }

        if retry {
            let inner = self.clone();
            let entry = entry.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(inner.config.retry_interval_secs)).await;
                inner.requeue(entry);
            });
        } else {
            self.notify(entry);
        }
    }

    /// failed (retry pending) → pending, with a fresh cancellation handle
    fn requeue(&self, entry: Arc<TaskEntry>) {
        let accepting = self.accepting.load(Ordering::Acquire);
        {
            let mut status = entry.lock();
            if status.state != TaskState::Failed || !status.retry_pending {
                return;
            }
            status.retry_pending = false;
            if !accepting {
                increment(&self.counters.failed);
            } else {
                status.state = TaskState::Pending;
                status.retry_count += 1;
                status.started_at = None;
                status.completed_at = None;
                status.error = None;
                let (handle, _) = cancel_pair();
                status.cancel = handle;
            }
        }
        if !accepting {
            self.notify(&entry);
            return;
        }

        entry.reset_progress();
        self.arm_deadline(&entry);
        increment(&self.counters.pending);
        increment(&self.counters.retried);
        info!(task_id = %entry.task_id(), "Task requeued for retry");

        if let Err(mpsc::error::SendError(entry)) = self.requeue_tx.send(entry) {
            self.push_pending(entry);
        }
    }

    fn cancel(&self, task_id: &str) -> Result<(), SchedulerError> {
        let entry = self
            .lookup(task_id)
            .ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))?;

        {
            let mut status = entry.lock();
            match status.state {
                TaskState::Pending => decrement(&self.counters.pending),
                TaskState::Running => decrement(&self.counters.running),
                TaskState::Failed if status.retry_pending => status.retry_pending = false,
                _ => {
                    debug!(task_id, state = %status.state, "Cancel on terminal task ignored");
                    return Ok(());
                }
            }
            status.cancel.cancel(CancelReason::User);
            status.state = TaskState::Cancelled;
            status.completed_at = Some(Utc::now());
            if let Some(timer) = status.deadline.take() {
                timer.abort();
            }
            increment(&self.counters.cancelled);
        }

        info!(task_id, submission_id = entry.task.submission_id, "Task cancelled");
        self.notify(&entry);
        Ok(())
    }

    fn notify(&self, entry: &TaskEntry) {
        let observers = self.observers.read().unwrap_or_else(|e| e.into_inner()).clone();
        if observers.is_empty() {
            return;
        }
        let snapshot = entry.snapshot();
        for observer in observers {
            observer.on_terminal(&snapshot);
        }
    }

    fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - ChronoDuration::hours(self.config.retention_hours as i64);
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        let before = registry.len();
        registry.retain(|_, entry| {
            let status = entry.lock();
            let expired = status.state.is_terminal()
                && !status.retry_pending
                && status.completed_at.map_or(false, |at| at < cutoff);
            !expired
        });
        before - registry.len()
    }
}

async fn worker_loop(
    inner: Arc<Inner>,
    worker_id: usize,
    mut rx: mpsc::Receiver<Arc<TaskEntry>>,
    idle: Arc<AtomicBool>,
) {
    debug!(worker_id, "Worker started");
    while let Some(entry) = rx.recv().await {
        if inner.mark_running(&entry) {
            debug!(worker_id, task_id = %entry.task_id(), "Worker picked up task");
            let ctx = entry.context();
            let processor = inner.processor.clone();
            let task = entry.task.clone();

            // a panicking processor fails the task, not the worker
            let outcome = match tokio::spawn(async move { processor.process(task, ctx).await }).await {
                Ok(outcome) => outcome,
                Err(e) => Err(EngineError::Internal(format!("processor panicked: {}", e))),
            };
            inner.finish(&entry, outcome);
        }
        idle.store(true, Ordering::Release);
    }
    debug!(worker_id, "Worker stopped");
}

async fn dispatch_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(inner.config.dispatch_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => inner.dispatch_pending(),
            _ = shutdown.changed() => break,
        }
    }
    debug!("Dispatcher stopped");
}

async fn distribute_loop(
    inner: Arc<Inner>,
    mut requeued: mpsc::UnboundedReceiver<Arc<TaskEntry>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            next = requeued.recv() => {
                let Some(entry) = next else { break };
                if entry.state() != TaskState::Pending {
                    continue;
                }
                if let Err(entry) = inner.hand_off(entry) {
                    inner.push_pending(entry);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    // anything still buffered goes back to the queue
    while let Ok(entry) = requeued.try_recv() {
        inner.push_pending(entry);
    }
    debug!("Distributor stopped");
}

async fn sweep_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(inner.config.sweep_interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = inner.sweep_expired(Utc::now());
                if removed > 0 {
                    info!(removed, "Evicted expired tasks from registry");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::task::tests::sample_task;
    use super::*;
    use judge_common::types::{TestCase, Verdict};
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Notify;

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            max_workers: 1,
            queue_size: 100,
            task_timeout_secs: 300,
            retry_times: 0,
            retry_interval_secs: 0,
            dispatch_interval_ms: 10,
            retention_hours: 24,
            sweep_interval_secs: 600,
            avg_task_seconds: 5,
        }
    }

    fn ok_result(task: &JudgeTask) -> JudgeResult {
        let mut result = JudgeResult::system_error(task.submission_id, "test-node", "1", "unused");
        result.status = Verdict::Accepted;
        result.score = 100;
        result.message = None;
        result
    }

    /// Records submission order and succeeds
    struct Recorder {
        seen: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl TaskProcessor for Recorder {
        async fn process(&self, task: Arc<JudgeTask>, _ctx: TaskContext) -> Result<JudgeResult, EngineError> {
            self.seen.lock().unwrap().push(task.submission_id);
            Ok(ok_result(&task))
        }
    }

    /// Waits for cancellation and reports it the way the engine does
    struct Blocker {
        started: Notify,
    }

    #[async_trait]
    impl TaskProcessor for Blocker {
        async fn process(&self, _task: Arc<JudgeTask>, mut ctx: TaskContext) -> Result<JudgeResult, EngineError> {
            self.started.notify_one();
            match ctx.cancel.cancelled().await {
                CancelReason::User => Err(EngineError::Cancelled),
                CancelReason::Deadline => Err(EngineError::DeadlineExceeded),
            }
        }
    }

    /// Fails the first `failures` attempts
    struct Flaky {
        failures: u32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl TaskProcessor for Flaky {
        async fn process(&self, task: Arc<JudgeTask>, _ctx: TaskContext) -> Result<JudgeResult, EngineError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                Err(EngineError::Internal("sandbox unavailable".to_string()))
            } else {
                Ok(ok_result(&task))
            }
        }
    }

    struct Panicker;

    #[async_trait]
    impl TaskProcessor for Panicker {
        async fn process(&self, _task: Arc<JudgeTask>, _ctx: TaskContext) -> Result<JudgeResult, EngineError> {
            panic!("boom");
        }
    }

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<(String, TaskState)>>,
    }

    impl TaskObserver for Collect {
        fn on_terminal(&self, snapshot: &TaskSnapshot) {
            self.seen.lock().unwrap().push((snapshot.task_id.clone(), snapshot.state));
        }
    }

    async fn wait_for_state(scheduler: &Scheduler, task_id: &str, state: TaskState) -> TaskSnapshot {
        for _ in 0..500 {
            if let Some(snap) = scheduler.get_by_task_id(task_id) {
                if snap.state == state {
                    return snap;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never reached {:?}", task_id, state);
    }

    #[tokio::test]
    async fn test_refuses_zero_workers_or_queue() {
        let recorder = Arc::new(Recorder { seen: Mutex::new(vec![]) });

        let mut config = test_config();
        config.max_workers = 0;
        assert_eq!(
            Scheduler::start(config, recorder.clone()).err(),
            Some(SchedulerError::NoWorkers)
        );

        let mut config = test_config();
        config.queue_size = 0;
        assert_eq!(Scheduler::start(config, recorder).err(), Some(SchedulerError::NoQueue));
    }

    #[tokio::test]
    async fn test_submit_runs_to_completion() {
        let scheduler = Scheduler::start(test_config(), Arc::new(Recorder { seen: Mutex::new(vec![]) })).unwrap();
        let task_id = scheduler.submit(sample_task(42, 3)).unwrap();
        assert!(task_id.starts_with("task_42_"));

        let snap = wait_for_state(&scheduler, &task_id, TaskState::Completed).await;
        assert!(snap.result.is_some());
        let started = snap.started_at.unwrap();
        let completed = snap.completed_at.unwrap();
        assert!(snap.created_at <= started && started <= completed);

        let stats = scheduler.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.running, 0);
        assert_eq!(stats.total, 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_identical_submissions_get_distinct_ids() {
        let scheduler = Scheduler::start(test_config(), Arc::new(Recorder { seen: Mutex::new(vec![]) })).unwrap();
        let a = scheduler.submit(sample_task(7, 3)).unwrap();
        let b = scheduler.submit(sample_task(7, 3)).unwrap();
        assert_ne!(a, b);

        wait_for_state(&scheduler, &b, TaskState::Completed).await;
        assert_eq!(scheduler.find_by_submission_id(7).unwrap().task_id, b);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_contest_priority_dispatched_first() {
        let recorder = Arc::new(Recorder { seen: Mutex::new(vec![]) });
        let scheduler = Scheduler::start(test_config(), recorder.clone()).unwrap();

        // submit is synchronous: nothing is dispatched until this test yields
        let normal = scheduler.submit(sample_task(1, 3)).unwrap();
        scheduler.submit(sample_task(2, 2)).unwrap();
        scheduler.submit(sample_task(3, 1)).unwrap();

        wait_for_state(&scheduler, &normal, TaskState::Completed).await;
        assert_eq!(*recorder.seen.lock().unwrap(), vec![3, 2, 1]);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_queue_full_rejected() {
        let mut config = test_config();
        config.queue_size = 2;
        let scheduler = Scheduler::start(config, Arc::new(Blocker { started: Notify::new() })).unwrap();

        scheduler.submit(sample_task(1, 3)).unwrap();
        scheduler.submit(sample_task(2, 3)).unwrap();
        let err = scheduler.submit(sample_task(3, 3)).unwrap_err();
        assert_eq!(err.to_string(), "queue is full");
    }

    #[tokio::test]
    async fn test_queue_status_estimates_wait() {
        let mut config = test_config();
        config.max_workers = 2;
        let scheduler = Scheduler::start(config, Arc::new(Blocker { started: Notify::new() })).unwrap();
        for sid in 1..=5 {
            scheduler.submit(sample_task(sid, 3)).unwrap();
        }

        let status = scheduler.queue_status();
        assert_eq!(status.workers, 2);
        assert_eq!(status.pending, 5);
        let waits: Vec<u64> = status.items.iter().map(|i| i.estimated_wait_secs).collect();
        assert_eq!(waits, vec![0, 0, 5, 5, 10]);
        let order: Vec<i64> = status.items.iter().map(|i| i.submission_id).collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_cancel_pending_is_idempotent() {
        let scheduler = Scheduler::start(test_config(), Arc::new(Blocker { started: Notify::new() })).unwrap();
        let first = scheduler.submit(sample_task(1, 3)).unwrap();
        let second = scheduler.submit(sample_task(2, 3)).unwrap();

        scheduler.cancel(&second).unwrap();
        let snap = scheduler.get_by_task_id(&second).unwrap();
        assert_eq!(snap.state, TaskState::Cancelled);
        assert!(snap.completed_at.is_some());
        assert!(snap.started_at.is_none());

        scheduler.cancel(&second).unwrap();
        assert_eq!(scheduler.stats().cancelled, 1);
        assert_eq!(scheduler.stats().pending, 1);

        assert_eq!(
            scheduler.cancel("task_0_0"),
            Err(SchedulerError::NotFound("task_0_0".to_string()))
        );

        scheduler.cancel(&first).unwrap();
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let blocker = Arc::new(Blocker { started: Notify::new() });
        let scheduler = Scheduler::start(test_config(), blocker.clone()).unwrap();
        let collect = Arc::new(Collect::default());
        scheduler.add_observer(collect.clone());

        let task_id = scheduler.submit(sample_task(9, 3)).unwrap();
        blocker.started.notified().await;
        assert_eq!(scheduler.get_by_task_id(&task_id).unwrap().state, TaskState::Running);

        scheduler.cancel(&task_id).unwrap();
        assert_eq!(scheduler.get_by_task_id(&task_id).unwrap().state, TaskState::Cancelled);

        // the processor's own Cancelled return must not double count
        scheduler.shutdown().await;
        let stats = scheduler.stats();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.running, 0);
        assert_eq!(*collect.seen.lock().unwrap(), vec![(task_id, TaskState::Cancelled)]);
    }

    #[tokio::test]
    async fn test_failed_task_is_retried() {
        let mut config = test_config();
        config.retry_times = 2;
        let flaky = Arc::new(Flaky {
            failures: 1,
            attempts: AtomicU32::new(0),
        });
        let scheduler = Scheduler::start(config, flaky.clone()).unwrap();

        let task_id = scheduler.submit(sample_task(5, 3)).unwrap();
        let snap = wait_for_state(&scheduler, &task_id, TaskState::Completed).await;
        assert_eq!(snap.retry_count, 1);
        assert!(snap.error.is_none());
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.stats().retried, 1);
        assert_eq!(scheduler.stats().failed, 0);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_retries_exhausted_ends_failed() {
        let mut config = test_config();
        config.retry_times = 1;
        let scheduler = Scheduler::start(
            config,
            Arc::new(Flaky {
                failures: u32::MAX,
                attempts: AtomicU32::new(0),
            }),
        )
        .unwrap();
        let collect = Arc::new(Collect::default());
        scheduler.add_observer(collect.clone());

        let task_id = scheduler.submit(sample_task(5, 3)).unwrap();
        let mut snap = wait_for_state(&scheduler, &task_id, TaskState::Failed).await;
        for _ in 0..500 {
            if !snap.retry_pending && snap.retry_count == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            snap = scheduler.get_by_task_id(&task_id).unwrap();
        }
        assert_eq!(snap.state, TaskState::Failed);
        assert_eq!(snap.retry_count, 1);
        assert!(!snap.retry_pending);
        assert_eq!(snap.error.as_deref(), Some("internal error: sandbox unavailable"));
        assert!(snap.result.is_none());
        assert_eq!(scheduler.stats().failed, 1);
        assert_eq!(collect.seen.lock().unwrap().len(), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_deadline_fails_task() {
        let mut config = test_config();
        config.task_timeout_secs = 1;
        let scheduler = Scheduler::start(config, Arc::new(Blocker { started: Notify::new() })).unwrap();

        let task_id = scheduler.submit(sample_task(3, 3)).unwrap();
        let snap = wait_for_state(&scheduler, &task_id, TaskState::Failed).await;
        assert_eq!(snap.error.as_deref(), Some("task deadline exceeded"));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_processor_fails_task() {
        let scheduler = Scheduler::start(test_config(), Arc::new(Panicker)).unwrap();
        let task_id = scheduler.submit(sample_task(4, 3)).unwrap();
        let snap = wait_for_state(&scheduler, &task_id, TaskState::Failed).await;
        assert!(snap.error.unwrap().contains("panicked"));

        // the worker survives
        let next = scheduler.submit(sample_task(5, 3)).unwrap();
        wait_for_state(&scheduler, &next, TaskState::Failed).await;
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_old_terminal_tasks() {
        let scheduler = Scheduler::start(test_config(), Arc::new(Recorder { seen: Mutex::new(vec![]) })).unwrap();
        let done = scheduler.submit(sample_task(1, 3)).unwrap();
        wait_for_state(&scheduler, &done, TaskState::Completed).await;

        assert_eq!(scheduler.sweep_expired(Utc::now()), 0);
        assert_eq!(scheduler.sweep_expired(Utc::now() + ChronoDuration::hours(25)), 1);
        assert!(scheduler.get_by_task_id(&done).is_none());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let scheduler = Scheduler::start(test_config(), Arc::new(Recorder { seen: Mutex::new(vec![]) })).unwrap();
        scheduler.shutdown().await;
        assert_eq!(scheduler.submit(sample_task(1, 3)), Err(SchedulerError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_empty_case_list_still_schedules() {
        let scheduler = Scheduler::start(test_config(), Arc::new(Recorder { seen: Mutex::new(vec![]) })).unwrap();
        let mut task = sample_task(8, 3);
        task.test_cases = Vec::<TestCase>::new();
        let task_id = scheduler.submit(task).unwrap();
        let snap = wait_for_state(&scheduler, &task_id, TaskState::Completed).await;
        assert_eq!(snap.progress.total_test_cases, 0);
        scheduler.shutdown().await;
    }
}
