/// Task Intake - Bus Consumer and Task Monitor
///
/// **Core Responsibility:**
/// Read judge tasks from the task stream as part of a consumer group,
/// turn each message into a `JudgeTask` and submit it to the scheduler.
///
/// **Workflow:**
/// 1. `XREADGROUP` a batch (consumer name = node id)
/// 2. Parse and validate each message
/// 3. Fetch problem metadata unless the message carries its own cases and limits
/// 4. Submit to the scheduler and spawn a monitor for the task
/// 5. Any failure along the way becomes a dead letter; the entry is acked regardless
///
/// **Monitor:** polls the task every `poll_interval_ms`. Running ticks
/// publish progress; the terminal state publishes the final result. A
/// monitor that outlives `deadline_secs` cancels the task and reports
/// system_error.
///
/// **Read errors:** exponential backoff, exit after `max_read_failures`
/// consecutive failures (the process supervisor restarts the node).
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use judge_common::bus::{self, StreamEntry};
use judge_common::config::{BusConfig, MonitorConfig};
use judge_common::types::{
    DeadLetter, JudgeResult, JudgeTaskMessage, ProblemDetail, StatusUpdate, TaskState, PRIORITY_CONTEST,
    PRIORITY_NORMAL,
};

use crate::config::LanguageRegistry;
use crate::problem_client::{backoff_delay, ProblemClient, ProblemClientError};
use crate::publisher::Publisher;
use crate::scheduler::{JudgeTask, Scheduler, SchedulerError, TaskSnapshot};

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("invalid message: {0}")]
    Invalid(String),
    #[error("problem metadata unavailable: {0}")]
    Metadata(#[from] ProblemClientError),
    #[error("submit rejected: {0}")]
    Rejected(#[from] SchedulerError),
}

/// Source of problem metadata
#[async_trait]
pub trait ProblemSource: Send + Sync {
    async fn problem_detail(&self, problem_id: i64) -> Result<ProblemDetail, ProblemClientError>;
}

#[async_trait]
impl ProblemSource for ProblemClient {
    async fn problem_detail(&self, problem_id: i64) -> Result<ProblemDetail, ProblemClientError> {
        self.get_problem_detail(problem_id).await
    }
}

pub fn parse_message(payload: Option<&str>) -> Result<JudgeTaskMessage, IntakeError> {
    let payload = payload.ok_or_else(|| IntakeError::Malformed("entry has no payload field".to_string()))?;
    serde_json::from_str(payload).map_err(|e| IntakeError::Malformed(e.to_string()))
}

pub fn validate_message(msg: &JudgeTaskMessage, registry: &LanguageRegistry) -> Result<(), IntakeError> {
    if msg.submission_id <= 0 {
        return Err(IntakeError::Invalid("submission_id must be positive".to_string()));
    }
    if msg.problem_id <= 0 {
        return Err(IntakeError::Invalid("problem_id must be positive".to_string()));
    }
    if msg.user_id <= 0 {
        return Err(IntakeError::Invalid("user_id must be positive".to_string()));
    }
    if msg.code.trim().is_empty() {
        return Err(IntakeError::Invalid("code is empty".to_string()));
    }
    if !registry.contains(&msg.language) {
        return Err(IntakeError::Invalid(format!("unsupported language: {}", msg.language)));
    }
    Ok(())
}

/// True when the message alone is enough to judge it
pub fn is_self_contained(msg: &JudgeTaskMessage) -> bool {
    msg.time_limit.is_some()
        && msg.memory_limit.is_some()
        && msg.test_cases.as_ref().is_some_and(|cases| !cases.is_empty())
}

/// Merge a message with problem metadata. Metadata limits win; its cases
/// win unless it has none.
pub fn build_task(msg: JudgeTaskMessage, detail: Option<ProblemDetail>) -> Result<JudgeTask, IntakeError> {
    let (time_limit_ms, memory_limit_mb, test_cases) = match detail {
        Some(detail) => {
            if !detail.languages.is_empty() && !detail.languages.contains(&msg.language) {
                return Err(IntakeError::Invalid(format!(
                    "language {} not allowed for problem {}",
                    msg.language, msg.problem_id
                )));
            }
            let cases = if detail.test_cases.is_empty() {
                msg.test_cases.unwrap_or_default()
            } else {
                detail.test_cases
            };
            (detail.time_limit, detail.memory_limit, cases)
        }
        None => (
            msg.time_limit.unwrap_or_default(),
            msg.memory_limit.unwrap_or_default(),
            msg.test_cases.unwrap_or_default(),
        ),
    };

    Ok(JudgeTask {
        task_id: String::new(),
        submission_id: msg.submission_id,
        problem_id: msg.problem_id,
        user_id: msg.user_id,
        language: msg.language,
        code: msg.code,
        time_limit_ms,
        memory_limit_mb,
        test_cases,
        priority: msg.priority.clamp(PRIORITY_CONTEST, PRIORITY_NORMAL),
        created_at: msg.created_at,
    })
}

pub struct Intake {
    node_id: String,
    bus: BusConfig,
    monitor: MonitorConfig,
    registry: LanguageRegistry,
    scheduler: Arc<Scheduler>,
    publisher: Arc<Publisher>,
    problems: Arc<dyn ProblemSource>,
}

impl Intake {
    pub fn new(
        node_id: String,
        bus: BusConfig,
        monitor: MonitorConfig,
        registry: LanguageRegistry,
        scheduler: Arc<Scheduler>,
        publisher: Arc<Publisher>,
        problems: Arc<dyn ProblemSource>,
    ) -> Self {
        Intake {
            node_id,
            bus,
            monitor,
            registry,
            scheduler,
            publisher,
            problems,
        }
    }

    /// Consume the task stream until shutdown or too many read failures
    pub async fn run(self: Arc<Self>, mut conn: ConnectionManager, shutdown: watch::Receiver<bool>) -> Result<()> {
        let stream = self.bus.task_stream.clone();
        let group = self.bus.consumer_group.clone();

        bus::ensure_group(&mut conn, &stream, &group)
            .await
            .with_context(|| format!("Failed to create consumer group {} on {}", group, stream))?;
        info!(stream = %stream, group = %group, consumer = %self.node_id, "Task consumer started");

        let commit_interval = Duration::from_millis(self.bus.commit_interval_ms);
        let mut pending_acks: Vec<String> = Vec::new();
        let mut last_commit = Instant::now();
        let mut failures: u32 = 0;

        while !*shutdown.borrow() {
            let entries = match bus::read_group(
                &mut conn,
                &stream,
                &group,
                &self.node_id,
                self.bus.read_count,
                self.bus.read_block_ms,
            )
            .await
            {
                Ok(entries) => {
                    failures = 0;
                    entries
                }
                Err(e) => {
                    failures += 1;
                    if failures >= self.bus.max_read_failures {
                        self.commit(&mut conn, &mut pending_acks).await;
                        bail!("Task stream read failed {} times in a row: {}", failures, e);
                    }
                    let delay = backoff_delay(self.bus.read_backoff_ms, self.bus.max_read_backoff_ms, failures - 1);
                    warn!(failures, delay_ms = delay.as_millis() as u64, error = %e, "Task stream read failed");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            for entry in entries {
                self.handle_entry(&entry).await;
                pending_acks.push(entry.id);
            }

            if last_commit.elapsed() >= commit_interval {
                self.commit(&mut conn, &mut pending_acks).await;
                last_commit = Instant::now();
            }
        }

        self.commit(&mut conn, &mut pending_acks).await;
        info!("Task consumer stopped");
        Ok(())
    }

    async fn commit(&self, conn: &mut ConnectionManager, pending: &mut Vec<String>) {
        if pending.is_empty() {
            return;
        }
        match bus::ack(conn, &self.bus.task_stream, &self.bus.consumer_group, pending).await {
            Ok(count) => {
                debug!(count, "Acknowledged task entries");
                pending.clear();
            }
            // kept for the next commit
            Err(e) => warn!(count = pending.len(), error = %e, "Ack failed"),
        }
    }

    /// Accept one entry or dead-letter it. Never fails: the entry is acked either way.
    pub async fn handle_entry(self: &Arc<Self>, entry: &StreamEntry) {
        if let Err(e) = self.accept(entry).await {
            warn!(entry_id = %entry.id, error = %e, "Rejecting task message");
            let letter = DeadLetter {
                original_message: entry.payload.clone().unwrap_or_default(),
                error: e.to_string(),
                topic: entry.stream.clone(),
                partition: bus::PARTITION,
                offset: entry.id.clone(),
                timestamp: Utc::now(),
            };
            if let Err(e) = self.publisher.publish_dead_letter(&letter).await {
                error!(entry_id = %entry.id, error = %e, "Failed to write dead letter");
            }
        }
    }

    #[instrument(skip(self, entry), fields(entry_id = %entry.id))]
    async fn accept(self: &Arc<Self>, entry: &StreamEntry) -> Result<String, IntakeError> {
        let msg = parse_message(entry.payload.as_deref())?;
        validate_message(&msg, &self.registry)?;

        let detail = if is_self_contained(&msg) {
            None
        } else {
            Some(self.problems.problem_detail(msg.problem_id).await?)
        };
        let task = build_task(msg, detail)?;
        let submission_id = task.submission_id;
        let language = task.language.clone();

        let task_id = self.scheduler.submit(task)?;
        info!(submission_id, task_id = %task_id, language = %language, "Task accepted");

        let this = Arc::clone(self);
        let monitored = task_id.clone();
        tokio::spawn(async move { this.monitor_task(monitored, submission_id, language).await });
        Ok(task_id)
    }

    fn language_version(&self, language: &str) -> String {
        self.registry.get(language).map(|r| r.version.clone()).unwrap_or_default()
    }

    fn publish_status(&self, snapshot: &TaskSnapshot) {
        let update = StatusUpdate {
            submission_id: snapshot.submission_id,
            status: snapshot.state,
            progress: snapshot.progress,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.publisher.publish_status(&update) {
            warn!(submission_id = snapshot.submission_id, error = %e, "Status update dropped");
        }
    }

    async fn publish_system_error(&self, submission_id: i64, language: &str, message: &str) {
        let result = JudgeResult::system_error(submission_id, &self.node_id, &self.language_version(language), message);
        if let Err(e) = self.publisher.publish_result(&result).await {
            error!(submission_id, error = %e, "Failed to publish system error result");
        }
    }

    /// Follow one task until its final result is published
    #[instrument(skip(self, language))]
    pub async fn monitor_task(&self, task_id: String, submission_id: i64, language: String) {
        let deadline = Instant::now() + Duration::from_secs(self.monitor.deadline_secs);
        let mut ticker = tokio::time::interval(Duration::from_millis(self.monitor.poll_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(task_id = %task_id, "Monitor deadline exceeded");
                    let _ = self.scheduler.cancel(&task_id);
                    self.publish_system_error(submission_id, &language, "judge monitor deadline exceeded").await;
                    return;
                }
            }

            let Some(snapshot) = self.scheduler.get_by_task_id(&task_id) else {
                self.publish_system_error(submission_id, &language, "task disappeared from scheduler").await;
                return;
            };

            match snapshot.state {
                TaskState::Pending => {}
                TaskState::Running => self.publish_status(&snapshot),
                TaskState::Failed if snapshot.retry_pending => {
                    debug!(task_id = %task_id, retry_count = snapshot.retry_count, "Waiting for retry");
                }
                TaskState::Completed => {
                    self.publish_status(&snapshot);
                    match snapshot.result {
                        Some(result) => {
                            if let Err(e) = self.publisher.publish_result(&result).await {
                                error!(submission_id, error = %e, "Failed to publish result");
                            }
                        }
                        None => {
                            self.publish_system_error(submission_id, &language, "completed task has no result").await
                        }
                    }
                    return;
                }
                TaskState::Failed => {
                    self.publish_status(&snapshot);
                    let message = snapshot.error.as_deref().unwrap_or("task failed");
                    self.publish_system_error(submission_id, &language, message).await;
                    return;
                }
                TaskState::Cancelled => {
                    self.publish_status(&snapshot);
                    info!(task_id = %task_id, "Task cancelled, no result published");
                    return;
                }
            }
        }
    }
}
