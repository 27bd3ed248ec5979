// Result publisher: final results, status updates and dead letters
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::RedisResult;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use judge_common::bus;
use judge_common::config::BusConfig;
use judge_common::types::{DeadLetter, JudgeResult, ResultMessage, StatusUpdate};

const RESULT_ATTEMPTS: u32 = 3;
const RESULT_RETRY_DELAY_MS: u64 = 200;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("bus write failed: {0}")]
    Bus(#[from] redis::RedisError),
    #[error("status update queue is full")]
    QueueFull,
    #[error("publisher is closed")]
    Closed,
}

/// Where published entries land
#[async_trait]
pub trait BusSink: Send + Sync {
    /// Append `(key, payload)` pairs to a stream in order
    async fn append(&self, stream: &str, entries: Vec<(String, String)>) -> RedisResult<()>;
    /// Overwrite the stored final result of a submission
    async fn store_result(&self, result: &ResultMessage) -> RedisResult<()>;
}

pub struct RedisSink {
    conn: ConnectionManager,
    max_len: usize,
    result_ttl_secs: u64,
}

impl RedisSink {
    pub fn new(conn: ConnectionManager, bus: &BusConfig) -> Self {
        RedisSink {
            conn,
            max_len: bus.stream_max_len,
            result_ttl_secs: bus.result_ttl_secs,
        }
    }
}

#[async_trait]
impl BusSink for RedisSink {
    async fn append(&self, stream: &str, entries: Vec<(String, String)>) -> RedisResult<()> {
        let mut conn = self.conn.clone();
        bus::append_batch(&mut conn, stream, self.max_len, &entries).await
    }

    async fn store_result(&self, result: &ResultMessage) -> RedisResult<()> {
        let mut conn = self.conn.clone();
        bus::store_result(&mut conn, result, self.result_ttl_secs).await
    }
}

enum StatusCommand {
    Update { key: String, payload: String },
    Flush(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
}

pub struct Publisher {
    sink: Arc<dyn BusSink>,
    bus: BusConfig,
    status_tx: mpsc::Sender<StatusCommand>,
    batcher: Mutex<Option<JoinHandle<()>>>,
}

impl Publisher {
    pub fn start(sink: Arc<dyn BusSink>, bus: BusConfig) -> Self {
        let (status_tx, status_rx) = mpsc::channel(bus.status_queue_size.max(1));
        let batcher = tokio::spawn(batch_loop(
            sink.clone(),
            bus.status_stream.clone(),
            bus.status_batch_size.max(1),
            Duration::from_millis(bus.status_batch_timeout_ms),
            status_rx,
        ));
        Publisher {
            sink,
            bus,
            status_tx,
            batcher: Mutex::new(Some(batcher)),
        }
    }

    /// Queue a status update. Best effort: a full queue is reported, not awaited.
    pub fn publish_status(&self, update: &StatusUpdate) -> Result<(), PublishError> {
        let command = StatusCommand::Update {
            key: update.submission_id.to_string(),
            payload: serde_json::to_string(update)?,
        };
        self.status_tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PublishError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => PublishError::Closed,
        })
    }

    /// Wait until every status update queued so far has been written
    pub async fn flush_status(&self) -> Result<(), PublishError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.status_tx
            .send(StatusCommand::Flush(done_tx))
            .await
            .map_err(|_| PublishError::Closed)?;
        done_rx.await.map_err(|_| PublishError::Closed)
    }

    /// Publish a final result. Queued status updates go out first.
    pub async fn publish_result(&self, result: &JudgeResult) -> Result<(), PublishError> {
        if let Err(e) = self.flush_status().await {
            warn!(submission_id = result.submission_id, error = %e, "Status flush before result failed");
        }

        let message = ResultMessage::from(result);
        let entry = (result.submission_id.to_string(), serde_json::to_string(&message)?);

        let mut attempt = 1;
        loop {
            let written = match self.sink.append(&self.bus.result_stream, vec![entry.clone()]).await {
                Ok(()) => self.sink.store_result(&message).await,
                Err(e) => Err(e),
            };
            match written {
                Ok(()) => {
                    info!(
                        submission_id = result.submission_id,
                        status = %result.status,
                        score = result.score,
                        "Result published"
                    );
                    return Ok(());
                }
                Err(e) if attempt < RESULT_ATTEMPTS => {
                    warn!(submission_id = result.submission_id, attempt, error = %e, "Result publish failed, retrying");
                    tokio::time::sleep(Duration::from_millis(RESULT_RETRY_DELAY_MS * attempt as u64)).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(submission_id = result.submission_id, error = %e, "Result publish failed");
                    return Err(e.into());
                }
            }
        }
    }

    pub async fn publish_dead_letter(&self, letter: &DeadLetter) -> Result<(), PublishError> {
        let entry = (letter.offset.clone(), serde_json::to_string(letter)?);
        self.sink.append(&self.bus.dead_letter_stream, vec![entry]).await?;
        warn!(topic = %letter.topic, offset = %letter.offset, error = %letter.error, "Message dead-lettered");
        Ok(())
    }

    /// Flush pending status updates and stop the batcher
    pub async fn shutdown(&self) {
        let Some(handle) = self.batcher.lock().await.take() else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if self.status_tx.send(StatusCommand::Stop(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
        let _ = handle.await;
        debug!("Publisher stopped");
    }
}

async fn write_batch(sink: &Arc<dyn BusSink>, stream: &str, batch: &mut Vec<(String, String)>) {
    if batch.is_empty() {
        return;
    }
    let entries = std::mem::take(batch);
    let count = entries.len();
    if let Err(e) = sink.append(stream, entries).await {
        // status updates are best effort
        warn!(stream, count, error = %e, "Dropping status update batch");
    }
}

async fn batch_loop(
    sink: Arc<dyn BusSink>,
    stream: String,
    batch_size: usize,
    batch_timeout: Duration,
    mut rx: mpsc::Receiver<StatusCommand>,
) {
    let mut batch: Vec<(String, String)> = Vec::with_capacity(batch_size);
    let mut deadline: Option<Instant> = None;

    loop {
        let next = match deadline {
            Some(at) => match tokio::time::timeout_at(at, rx.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    write_batch(&sink, &stream, &mut batch).await;
                    deadline = None;
                    continue;
                }
            },
            None => rx.recv().await,
        };

        match next {
            Some(StatusCommand::Update { key, payload }) => {
                if batch.is_empty() {
                    deadline = Some(Instant::now() + batch_timeout);
                }
                batch.push((key, payload));
                if batch.len() >= batch_size {
                    write_batch(&sink, &stream, &mut batch).await;
                    deadline = None;
                }
            }
            Some(StatusCommand::Flush(done)) => {
                write_batch(&sink, &stream, &mut batch).await;
                deadline = None;
                let _ = done.send(());
            }
            Some(StatusCommand::Stop(done)) => {
                write_batch(&sink, &stream, &mut batch).await;
                let _ = done.send(());
                break;
            }
            None => {
                write_batch(&sink, &stream, &mut batch).await;
                break;
            }
        }
    }
}
