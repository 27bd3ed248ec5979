use crate::types::ResultMessage;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamId, StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, RedisResult};
use serde::Serialize;

/// Message bus semantics on top of Redis Streams.
///
/// A topic is a stream key, the consumer group is a stream consumer group and
/// every entry carries two fields: `payload` (the JSON document) and `key`
/// (the submission id used as the ordering key). Streams are single ordered
/// logs, so the partition reported in dead letters is always 0 and the offset
/// is the entry id.

pub const PAYLOAD_FIELD: &str = "payload";
pub const KEY_FIELD: &str = "key";
pub const RESULT_PREFIX: &str = "judge:result";
pub const PARTITION: i32 = 0;

/// Key under which the latest final result of a submission is stored
pub fn result_key(submission_id: i64) -> String {
    format!("{}:{}", RESULT_PREFIX, submission_id)
}

/// One entry read back from a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub stream: String,
    pub id: String,
    pub key: Option<String>,
    pub payload: Option<String>,
}

impl StreamEntry {
    fn from_stream_id(stream: &str, entry: &StreamId) -> Self {
        StreamEntry {
            stream: stream.to_string(),
            id: entry.id.clone(),
            key: entry.get(KEY_FIELD),
            payload: entry.get(PAYLOAD_FIELD),
        }
    }
}

fn serialization_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((
        redis::ErrorKind::TypeError,
        "serialization error",
        e.to_string(),
    ))
}

/// Create the consumer group (and the stream) if it does not exist yet
pub async fn ensure_group(
    conn: &mut ConnectionManager,
    stream: &str,
    group: &str,
) -> RedisResult<()> {
    let created: RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "$").await;
    match created {
        Ok(()) => Ok(()),
        Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
        Err(e) => Err(e),
    }
}

/// Read new entries for this consumer.
///
/// Blocks for at most `block_ms`; a timeout yields an empty batch.
pub async fn read_group(
    conn: &mut ConnectionManager,
    stream: &str,
    group: &str,
    consumer: &str,
    count: usize,
    block_ms: usize,
) -> RedisResult<Vec<StreamEntry>> {
    let options = StreamReadOptions::default()
        .group(group, consumer)
        .count(count)
        .block(block_ms);
    let reply: Option<StreamReadReply> = conn.xread_options(&[stream], &[">"], &options).await?;

    Ok(flatten_read_reply(reply))
}

/// Read entries of several streams after the given ids (no consumer group)
pub async fn read_after(
    conn: &mut ConnectionManager,
    streams: &[&str],
    ids: &[String],
    block_ms: usize,
) -> RedisResult<Vec<StreamEntry>> {
    let options = StreamReadOptions::default().block(block_ms);
    let reply: Option<StreamReadReply> = conn.xread_options(streams, ids, &options).await?;

    Ok(flatten_read_reply(reply))
}

fn flatten_read_reply(reply: Option<StreamReadReply>) -> Vec<StreamEntry> {
    let mut entries = Vec::new();
    if let Some(reply) = reply {
        for stream in reply.keys {
            for entry in &stream.ids {
                entries.push(StreamEntry::from_stream_id(&stream.key, entry));
            }
        }
    }
    entries
}

/// Latest `count` entries of a stream, newest first
pub async fn tail(
    conn: &mut ConnectionManager,
    stream: &str,
    count: usize,
) -> RedisResult<Vec<StreamEntry>> {
    let reply: StreamRangeReply = conn.xrevrange_count(stream, "+", "-", count).await?;
    Ok(reply
        .ids
        .iter()
        .map(|entry| StreamEntry::from_stream_id(stream, entry))
        .collect())
}

/// Acknowledge processed entries
pub async fn ack(
    conn: &mut ConnectionManager,
    stream: &str,
    group: &str,
    ids: &[String],
) -> RedisResult<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    conn.xack(stream, group, ids).await
}

/// Append one JSON payload to a stream, returning the entry id
pub async fn append<T: Serialize>(
    conn: &mut ConnectionManager,
    stream: &str,
    max_len: usize,
    key: &str,
    payload: &T,
) -> RedisResult<String> {
    let payload = serde_json::to_string(payload).map_err(serialization_error)?;
    conn.xadd_maxlen(
        stream,
        StreamMaxlen::Approx(max_len),
        "*",
        &[(PAYLOAD_FIELD, payload.as_str()), (KEY_FIELD, key)],
    )
    .await
}

/// Append already-serialized `(key, payload)` pairs in one round trip,
/// preserving their order
pub async fn append_batch(
    conn: &mut ConnectionManager,
    stream: &str,
    max_len: usize,
    entries: &[(String, String)],
) -> RedisResult<()> {
    if entries.is_empty() {
        return Ok(());
    }

    let mut pipe = redis::pipe();
    for (key, payload) in entries {
        pipe.cmd("XADD")
            .arg(stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(max_len)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .arg(KEY_FIELD)
            .arg(key)
            .ignore();
    }
    pipe.query_async(conn).await
}

/// Store the final result of a submission, overwriting any previous copy
pub async fn store_result(
    conn: &mut ConnectionManager,
    result: &ResultMessage,
    ttl_secs: u64,
) -> RedisResult<()> {
    let key = result_key(result.submission_id);
    let payload = serde_json::to_string(result).map_err(serialization_error)?;
    conn.set_ex(&key, payload, ttl_secs).await
}

/// Retrieve the stored final result of a submission
pub async fn get_result(
    conn: &mut ConnectionManager,
    submission_id: i64,
) -> RedisResult<Option<ResultMessage>> {
    let payload: Option<String> = conn.get(result_key(submission_id)).await?;

    match payload {
        Some(data) => {
            let result: ResultMessage = serde_json::from_str(&data).map_err(|e| {
                redis::RedisError::from((
                    redis::ErrorKind::TypeError,
                    "deserialization error",
                    e.to_string(),
                ))
            })?;
            Ok(Some(result))
        }
        None => Ok(None),
    }
}
