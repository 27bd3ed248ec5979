// Judge task and its mutable lifecycle record
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

use judge_common::types::{JudgeResult, Progress, TaskState, TestCase};

use crate::cancel::{cancel_pair, CancelHandle, CancelReason, CancelToken};

/// Immutable description of one submission's work
#[derive(Debug, Clone, Serialize)]
pub struct JudgeTask {
    /// Assigned by the scheduler on submit
    pub task_id: String,
    pub submission_id: i64,
    pub problem_id: i64,
    pub user_id: i64,
    pub language: String,
    #[serde(skip)]
    pub code: String,
    pub time_limit_ms: u64,
    pub memory_limit_mb: u64,
    #[serde(skip)]
    pub test_cases: Vec<TestCase>,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
}

/// Progress sink handed to the processor
#[derive(Clone)]
pub struct ProgressHandle {
    current: Arc<AtomicU32>,
}

impl ProgressHandle {
    /// Record the 1-based case currently executing
    pub fn set_current(&self, case_index: u32) {
        self.current.store(case_index, Ordering::Relaxed);
    }

    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Relaxed)
    }
}

/// What a worker hands the processor along with the task
#[derive(Clone)]
pub struct TaskContext {
    pub cancel: CancelToken,
    pub progress: ProgressHandle,
}

pub(crate) struct TaskStatus {
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<JudgeResult>,
    pub error: Option<String>,
    pub retry_count: u32,
    /// Failed, with a retry scheduled
    pub retry_pending: bool,
    pub cancel: CancelHandle,
    pub deadline: Option<JoinHandle<()>>,
}

/// Point-in-time view of a task for lookups and the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub submission_id: i64,
    pub problem_id: i64,
    pub user_id: i64,
    pub language: String,
    pub priority: u8,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub retry_pending: bool,
    pub progress: Progress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JudgeResult>,
}

/// Registry entry: the task plus its lifecycle, mutated only by the scheduler
pub struct TaskEntry {
    pub task: Arc<JudgeTask>,
    /// Submission order within this node
    pub(crate) seq: u64,
    status: Mutex<TaskStatus>,
    progress: Arc<AtomicU32>,
}

impl TaskEntry {
    pub(crate) fn new(task: JudgeTask, seq: u64) -> Self {
        let (cancel, _) = cancel_pair();
        TaskEntry {
            task: Arc::new(task),
            seq,
            status: Mutex::new(TaskStatus {
                state: TaskState::Pending,
                started_at: None,
                completed_at: None,
                result: None,
                error: None,
                retry_count: 0,
                retry_pending: false,
                cancel,
                deadline: None,
            }),
            progress: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task.task_id
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TaskStatus> {
        // a poisoned lock only means a panic elsewhere; the record itself is consistent
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> TaskState {
        self.lock().state
    }

    pub(crate) fn context(&self) -> TaskContext {
        TaskContext {
            cancel: self.lock().cancel.token(),
            progress: ProgressHandle {
                current: self.progress.clone(),
            },
        }
    }

    pub(crate) fn reset_progress(&self) {
        self.progress.store(0, Ordering::Relaxed);
    }

    /// Fire the cancellation handle; returns false if it already fired
    pub(crate) fn fire_cancel(&self, reason: CancelReason) -> bool {
        self.lock().cancel.cancel(reason)
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let status = self.lock();
        TaskSnapshot {
            task_id: self.task.task_id.clone(),
            submission_id: self.task.submission_id,
            problem_id: self.task.problem_id,
            user_id: self.task.user_id,
            language: self.task.language.clone(),
            priority: self.task.priority,
            state: status.state,
            created_at: self.task.created_at,
            started_at: status.started_at,
            completed_at: status.completed_at,
            retry_count: status.retry_count,
            retry_pending: status.retry_pending,
            progress: Progress {
                current_test_case: self.progress.load(Ordering::Relaxed),
                total_test_cases: self.task.test_cases.len() as u32,
            },
            error: status.error.clone(),
            result: status.result.clone(),
        }
    }
}
