//! Consumer-group log access.
//!
//! [`StreamLog`] is the narrow capability the consumer loop needs from the
//! durable log: idempotent group creation, blocking batched claims, reclaiming
//! entries idle past the visibility timeout, lease renewal, per-entry
//! acknowledgement and appends to the work or dead-letter stream.
//! [`RedisStreamLog`] implements it on Redis Streams.

use crate::config::RedisConfig;
use crate::work_item::{ClaimSource, ClaimedEntry};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::streams::{StreamAutoClaimReply, StreamId, StreamPendingReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Log connectivity or command failure; never tied to a single item
#[derive(Error, Debug)]
pub enum LogError {
    #[error("log connection failed: {0}")]
    Connection(String),

    #[error("log command {command} failed: {message}")]
    Command { command: &'static str, message: String },
}

impl LogError {
    fn command(command: &'static str, err: redis::RedisError) -> Self {
        LogError::Command {
            command,
            message: err.to_string(),
        }
    }
}

/// Which stream an append targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTarget {
    /// The work stream the group consumes
    Work,
    /// The terminal dead-letter stream
    DeadLetter,
}

/// Group-level view of the log
#[derive(Debug, Clone, serde::Serialize)]
pub struct GroupStatus {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub dead_letter_stream: String,
    /// Entries delivered to the group but not yet acknowledged
    pub pending: u64,
}

#[async_trait]
pub trait StreamLog: Send + Sync {
    /// Create the consumer group (and stream) if missing
    async fn ensure_group(&self) -> Result<(), LogError>;

    /// Claim up to `count` new entries, waiting at most `block` for any
    async fn claim(&self, count: usize, block: Duration) -> Result<Vec<ClaimedEntry>, LogError>;

    /// Take over up to `count` entries idle for at least `min_idle`
    async fn reclaim(&self, min_idle: Duration, count: usize) -> Result<Vec<ClaimedEntry>, LogError>;

    /// Reset an entry's idle time so no other consumer reclaims it.
    ///
    /// Returns false when the entry is no longer pending.
    async fn touch(&self, entry_id: &str) -> Result<bool, LogError>;

    /// Acknowledge an entry, removing it from the pending list
    async fn ack(&self, entry_id: &str) -> Result<(), LogError>;

    /// Append an entry, returning its id
    async fn append(&self, target: StreamTarget, fields: &[(String, String)]) -> Result<String, LogError>;

    /// Pending-list summary for the group
    async fn group_status(&self) -> Result<GroupStatus, LogError>;

    /// This consumer's name within the group
    fn consumer_name(&self) -> &str;
}

/// Redis Streams backed log
pub struct RedisStreamLog {
    conn: ConnectionManager,
    /// Carries only the blocking `XREADGROUP`; everything else uses `conn`
    blocking_conn: ConnectionManager,
    stream: String,
    group: String,
    consumer: String,
    dead_letter_stream: String,
}

impl RedisStreamLog {
    /// Connect to Redis and verify the connection
    pub async fn connect(url: &str, config: &RedisConfig) -> Result<Self, LogError> {
        let client = redis::Client::open(url).map_err(|e| LogError::Connection(e.to_string()))?;
        let mut conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| LogError::Connection(e.to_string()))?;
        let blocking_conn = ConnectionManager::new(client)
            .await
            .map_err(|e| LogError::Connection(e.to_string()))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| LogError::Connection(e.to_string()))?;

        let consumer = config
            .consumer_name
            .clone()
            .unwrap_or_else(|| format!("worker_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));

        info!(
            stream = %config.stream,
            group = %config.group,
            consumer = %consumer,
            "Connected to Redis"
        );

        Ok(Self {
            conn,
            blocking_conn,
            stream: config.stream.clone(),
            group: config.group.clone(),
            consumer,
            dead_letter_stream: config.dead_letter_stream.clone(),
        })
    }

    fn to_entry(&self, id: StreamId, source: ClaimSource) -> ClaimedEntry {
        let fields = id
            .map
            .iter()
            .filter_map(|(k, v)| match redis::from_redis_value::<String>(v) {
                Ok(value) => Some((k.clone(), value)),
                Err(e) => {
                    warn!(entry_id = %id.id, field = %k, error = %e, "Dropping non-string field");
                    None
                }
            })
            .collect::<BTreeMap<_, _>>();

        ClaimedEntry {
            entry_id: id.id,
            consumer_id: self.consumer.clone(),
            claimed_at: Utc::now(),
            source,
            fields,
        }
    }
}

#[async_trait]
impl StreamLog for RedisStreamLog {
    async fn ensure_group(&self) -> Result<(), LogError> {
        let mut conn = self.conn.clone();
        let created: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(&self.stream, &self.group, "$")
            .await;

        match created {
            Ok(()) => {
                info!(stream = %self.stream, group = %self.group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream = %self.stream, group = %self.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(LogError::command("XGROUP CREATE", e)),
        }
    }

    #[instrument(skip(self), fields(stream = %self.stream))]
    async fn claim(&self, count: usize, block: Duration) -> Result<Vec<ClaimedEntry>, LogError> {
        let mut conn = self.blocking_conn.clone();
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream], &[">"], &options)
            .await
            .map_err(|e| LogError::command("XREADGROUP", e))?;

        let entries: Vec<ClaimedEntry> = reply
            .map(|r| r.keys)
            .unwrap_or_default()
            .into_iter()
            .flat_map(|key| key.ids)
            .map(|id| self.to_entry(id, ClaimSource::Fresh))
            .collect();

        if !entries.is_empty() {
            debug!(count = entries.len(), "Claimed entries");
        }
        Ok(entries)
    }

    #[instrument(skip(self), fields(stream = %self.stream))]
    async fn reclaim(&self, min_idle: Duration, count: usize) -> Result<Vec<ClaimedEntry>, LogError> {
        let mut conn = self.conn.clone();
        let reply: StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| LogError::command("XAUTOCLAIM", e))?;

        if !reply.deleted_ids.is_empty() {
            warn!(
                count = reply.deleted_ids.len(),
                "Pending entries were trimmed from the stream before they could be reclaimed"
            );
        }

        let entries: Vec<ClaimedEntry> = reply
            .claimed
            .into_iter()
            .map(|id| self.to_entry(id, ClaimSource::Reclaimed))
            .collect();

        if !entries.is_empty() {
            info!(count = entries.len(), "Reclaimed idle entries");
        }
        Ok(entries)
    }

    async fn touch(&self, entry_id: &str) -> Result<bool, LogError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("XCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(0)
            .arg(entry_id)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await
            .map_err(|e| LogError::command("XCLAIM", e))?;
        Ok(!ids.is_empty())
    }

    async fn ack(&self, entry_id: &str) -> Result<(), LogError> {
        let mut conn = self.conn.clone();
        let _: u64 = conn
            .xack(&self.stream, &self.group, &[entry_id])
            .await
            .map_err(|e| LogError::command("XACK", e))?;
        Ok(())
    }

    async fn append(&self, target: StreamTarget, fields: &[(String, String)]) -> Result<String, LogError> {
        let stream = match target {
            StreamTarget::Work => &self.stream,
            StreamTarget::DeadLetter => &self.dead_letter_stream,
        };
        let mut conn = self.conn.clone();
        conn.xadd(stream, "*", fields)
            .await
            .map_err(|e| LogError::command("XADD", e))
    }

    async fn group_status(&self) -> Result<GroupStatus, LogError> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingReply = conn
            .xpending(&self.stream, &self.group)
            .await
            .map_err(|e| LogError::command("XPENDING", e))?;

        Ok(GroupStatus {
            stream: self.stream.clone(),
            group: self.group.clone(),
            consumer: self.consumer.clone(),
            dead_letter_stream: self.dead_letter_stream.clone(),
            pending: reply.count() as u64,
        })
    }

    fn consumer_name(&self) -> &str {
        &self.consumer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn test_log() -> RedisStreamLog {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let run = uuid::Uuid::new_v4().simple().to_string();
        let config = RedisConfig {
            url: url.clone(),
            password: None,
            stream: format!("stream:test:{run}"),
            group: "workers".to_string(),
            consumer_name: Some("it-consumer".to_string()),
            block_ms: 5000,
            batch_count: 10,
            visibility_timeout_secs: 300,
            reclaim_interval_secs: 30,
            max_retry: 3,
            dead_letter_stream: format!("stream:test:{run}:dlq"),
            retry_delay_ms: 0,
        };
        let log = RedisStreamLog::connect(&url, &config).await.unwrap();
        log.ensure_group().await.unwrap();
        log
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis
    async fn test_ack_does_not_wait_behind_blocking_claim() {
        let log = Arc::new(test_log().await);
        log.append(StreamTarget::Work, &[("sourceId".to_string(), "cam1".to_string())])
            .await
            .unwrap();
        let claimed = log.claim(1, Duration::from_millis(100)).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let blocked = {
            let log = log.clone();
            tokio::spawn(async move { log.claim(10, Duration::from_secs(3)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        log.ack(&claimed[0].entry_id).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(log.group_status().await.unwrap().pending, 0);

        assert!(blocked.await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis
    async fn test_touch_reports_whether_entry_is_pending() {
        let log = test_log().await;
        log.append(StreamTarget::Work, &[("sourceId".to_string(), "cam1".to_string())])
            .await
            .unwrap();
        let claimed = log.claim(1, Duration::from_millis(100)).await.unwrap();
        let entry_id = &claimed[0].entry_id;

        assert!(log.touch(entry_id).await.unwrap());
        // a fresh lease means nothing is idle long enough to reclaim
        assert!(log.reclaim(Duration::from_secs(60), 10).await.unwrap().is_empty());

        log.ack(entry_id).await.unwrap();
        assert!(!log.touch(entry_id).await.unwrap());
    }
}
