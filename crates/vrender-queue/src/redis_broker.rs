//! Broker over Redis Streams.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingId, StreamReadReply};
use redis::{AsyncCommands, Script};
use tracing::{debug, info, warn};

use crate::broker::{payload_digest, Broker, CompletionCursor, Delivery, QueueDepth, QueueState, RejectOutcome};
use crate::config::{QueueConfig, COMPLETION_TOKEN, DEAD_LETTER_QUEUE, RESPONSE_QUEUE, WORK_QUEUE};
use crate::error::{is_stream_reset, QueueError, QueueResult};

/// Field holding the job payload in work and dead-letter entries.
const JOB_FIELD: &str = "job";
/// Retry counters expire after a day.
const RETRY_KEY_TTL_SECS: i64 = 86_400;
const CLAIM_BATCH: usize = 16;

// Settlement scripts act only when XACK removes the entry from the group's
// pending list, so a delivery settled twice (late holder, re-claimed copy,
// purged stage) changes nothing the second time.

/// KEYS: work, response, retry counter. ARGV: group, id, token.
const ACK_SCRIPT: &str = r#"
if redis.call('XACK', KEYS[1], ARGV[1], ARGV[2]) == 0 then
    return 0
end
redis.call('XDEL', KEYS[1], ARGV[2])
redis.call('XADD', KEYS[2], '*', 'token', ARGV[3])
redis.call('DEL', KEYS[3])
return 1
"#;

/// KEYS: work, dead letters, retry counter.
/// ARGV: group, id, payload, max attempts, counter ttl, reason.
/// Returns `{attempts, dead_lettered}`; zero attempts means stale.
const REJECT_SCRIPT: &str = r#"
if redis.call('XACK', KEYS[1], ARGV[1], ARGV[2]) == 0 then
    return {0, 0}
end
redis.call('XDEL', KEYS[1], ARGV[2])
local attempts = redis.call('INCR', KEYS[3])
local max = tonumber(ARGV[4])
if max > 0 and attempts >= max then
    redis.call('DEL', KEYS[3])
    redis.call('XADD', KEYS[2], '*', 'job', ARGV[3], 'error', ARGV[6], 'original_id', ARGV[2])
    return {attempts, 1}
end
redis.call('EXPIRE', KEYS[3], ARGV[5])
redis.call('XADD', KEYS[1], '*', 'job', ARGV[3])
return {attempts, 0}
"#;

/// KEYS: work, dead letters, retry counter. ARGV: group, id, payload, reason.
const DEAD_LETTER_SCRIPT: &str = r#"
if redis.call('XACK', KEYS[1], ARGV[1], ARGV[2]) == 0 then
    return 0
end
redis.call('XDEL', KEYS[1], ARGV[2])
redis.call('XADD', KEYS[2], '*', 'job', ARGV[3], 'error', ARGV[4], 'original_id', ARGV[2])
redis.call('DEL', KEYS[3])
return 1
"#;

/// Decode the `{attempts, dead_lettered}` reply of [`REJECT_SCRIPT`].
fn reject_outcome(attempts: i64, dead_lettered: i64) -> RejectOutcome {
    let Ok(attempts) = u32::try_from(attempts) else {
        return RejectOutcome::Stale;
    };
    match (attempts, dead_lettered) {
        (0, _) => RejectOutcome::Stale,
        (attempts, 1) => RejectOutcome::DeadLettered { attempts },
        (attempts, _) => RejectOutcome::Requeued { attempts },
    }
}

/// Pending entries whose holder is no longer heartbeating.
fn orphaned_entries<'a>(pending: &'a [StreamPendingId], live: &HashSet<String>) -> Vec<&'a str> {
    pending
        .iter()
        .filter(|entry| !live.contains(&entry.consumer))
        .map(|entry| entry.id.as_str())
        .collect()
}

/// Redis Streams broker.
///
/// The work and response queues are streams. Workers read the work stream
/// through a consumer group; an ack deletes the entry and appends a completion
/// token to the response stream.
pub struct RedisBroker {
    client: redis::Client,
    config: QueueConfig,
}

impl RedisBroker {
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    async fn conn(&self) -> QueueResult<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Create the consumer group on the work stream if it does not exist.
    async fn ensure_group(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(WORK_QUEUE)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group: {}", self.config.consumer_group),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists: {}", self.config.consumer_group);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    fn retry_key(digest: &str) -> String {
        format!("vrender:retry:{digest}")
    }

    fn to_delivery(entry: &StreamId) -> Delivery {
        Delivery {
            id: entry.id.clone(),
            payload: entry.get::<String>(JOB_FIELD).unwrap_or_default(),
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn heartbeat_cutoff(&self) -> i64 {
        Self::now_ms() - self.config.heartbeat_ttl.as_millis() as i64
    }

    /// Consumers whose last heartbeat is younger than the TTL.
    async fn live_consumers(&self, conn: &mut MultiplexedConnection) -> QueueResult<HashSet<String>> {
        let live: Vec<String> = conn
            .zrangebyscore(&self.config.worker_registry, self.heartbeat_cutoff(), "+inf")
            .await?;
        Ok(live.into_iter().collect())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn init(&self) -> QueueResult<()> {
        self.ensure_group().await
    }

    /// Empty both queues and recreate the consumer group.
    ///
    /// The work stream is trimmed rather than deleted so workers blocked on it
    /// keep waiting; recreating the group drops the previous stage's pending
    /// entries, so late settlements of those are stale.
    async fn purge(&self) -> QueueResult<()> {
        // XGROUP DESTROY needs the stream to exist
        self.ensure_group().await?;
        let mut conn = self.conn().await?;

        redis::pipe()
            .atomic()
            .cmd("XTRIM")
            .arg(WORK_QUEUE)
            .arg("MAXLEN")
            .arg(0)
            .ignore()
            .cmd("DEL")
            .arg(RESPONSE_QUEUE)
            .ignore()
            .cmd("XGROUP")
            .arg("DESTROY")
            .arg(WORK_QUEUE)
            .arg(&self.config.consumer_group)
            .ignore()
            .cmd("XGROUP")
            .arg("CREATE")
            .arg(WORK_QUEUE)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        debug!("Purged {} and {}", WORK_QUEUE, RESPONSE_QUEUE);
        Ok(())
    }

    async fn publish(&self, payload: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let message_id: String = redis::cmd("XADD")
            .arg(WORK_QUEUE)
            .arg("*")
            .arg(JOB_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::publish_failed(e.to_string()))?;
        debug!("Published job with message ID {}", message_id);
        Ok(())
    }

    async fn state(&self) -> QueueResult<QueueState> {
        let mut conn = self.conn().await?;

        conn.zrembyscore::<_, _, _, ()>(&self.config.worker_registry, "-inf", self.heartbeat_cutoff())
            .await?;
        let consumers: u64 = conn.zcard(&self.config.worker_registry).await?;
        let work: u64 = conn.xlen(WORK_QUEUE).await?;
        let response: u64 = conn.xlen(RESPONSE_QUEUE).await?;
        let dead_lettered: u64 = conn.xlen(DEAD_LETTER_QUEUE).await?;

        Ok(QueueState {
            work: QueueDepth {
                pending: work,
                consumers,
            },
            response: QueueDepth {
                pending: response,
                consumers: 0,
            },
            dead_lettered,
        })
    }

    async fn wait_for_completions(&self, cursor: &mut CompletionCursor, timeout: Duration) -> QueueResult<u64> {
        // Blocking reads get their own connection so they never stall other commands
        let mut conn = self.conn().await?;
        let block_ms = timeout.as_millis().max(1) as u64;

        let reply: Option<StreamReadReply> = redis::cmd("XREAD")
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(RESPONSE_QUEUE)
            .arg(&cursor.0)
            .query_async(&mut conn)
            .await?;

        let mut received = 0u64;
        for stream in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in stream.ids {
                received += 1;
                cursor.0 = entry.id;
            }
        }
        Ok(received)
    }

    async fn heartbeat(&self, consumer: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        conn.zadd::<_, _, _, ()>(&self.config.worker_registry, consumer, Self::now_ms())
            .await?;
        Ok(())
    }

    async fn deregister(&self, consumer: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        conn.zrem::<_, _, ()>(&self.config.worker_registry, consumer).await?;
        Ok(())
    }

    async fn fetch(&self, consumer: &str, block: Duration) -> QueueResult<Option<Delivery>> {
        let mut conn = self.conn().await?;

        let result: Result<Option<StreamReadReply>, redis::RedisError> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block.as_millis().max(1) as u64)
            .arg("STREAMS")
            .arg(WORK_QUEUE)
            .arg(">")
            .query_async(&mut conn)
            .await;

        let reply = match result {
            Ok(reply) => reply,
            Err(e) if is_stream_reset(&e) => {
                debug!("Work stream was purged during fetch: {}", e);
                self.ensure_group().await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        Ok(reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|stream| stream.ids)
            .next()
            .map(|entry| Self::to_delivery(&entry)))
    }

    async fn claim_stale(&self, consumer: &str) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.conn().await?;
        let min_idle = self.config.claim_min_idle.as_millis() as u64;

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(WORK_QUEUE)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(min_idle)
            .arg("-")
            .arg("+")
            .arg(CLAIM_BATCH)
            .query_async(&mut conn)
            .await?;
        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut live = self.live_consumers(&mut conn).await?;
        live.insert(consumer.to_string());
        let orphaned = orphaned_entries(&pending.ids, &live);
        if orphaned.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(WORK_QUEUE)
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(min_idle);
        for id in &orphaned {
            cmd.arg(*id);
        }
        let claimed: StreamClaimReply = cmd.query_async(&mut conn).await?;

        let deliveries: Vec<Delivery> = claimed.ids.iter().map(Self::to_delivery).collect();
        if !deliveries.is_empty() {
            info!("Claimed {} deliveries from expired consumers", deliveries.len());
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<bool> {
        let mut conn = self.conn().await?;

        let acked: i64 = Script::new(ACK_SCRIPT)
            .key(WORK_QUEUE)
            .key(RESPONSE_QUEUE)
            .key(Self::retry_key(&delivery.digest()))
            .arg(&self.config.consumer_group)
            .arg(&delivery.id)
            .arg(COMPLETION_TOKEN)
            .invoke_async(&mut conn)
            .await?;

        if acked == 0 {
            debug!("Delivery {} was already settled", delivery.id);
            return Ok(false);
        }
        debug!("Acknowledged delivery: {}", delivery.id);
        Ok(true)
    }

    async fn reject(&self, delivery: &Delivery, reason: &str) -> QueueResult<RejectOutcome> {
        let mut conn = self.conn().await?;

        let (attempts, dead_lettered): (i64, i64) = Script::new(REJECT_SCRIPT)
            .key(WORK_QUEUE)
            .key(DEAD_LETTER_QUEUE)
            .key(Self::retry_key(&payload_digest(&delivery.payload)))
            .arg(&self.config.consumer_group)
            .arg(&delivery.id)
            .arg(&delivery.payload)
            .arg(self.config.max_attempts)
            .arg(RETRY_KEY_TTL_SECS)
            .arg(reason)
            .invoke_async(&mut conn)
            .await?;

        let outcome = reject_outcome(attempts, dead_lettered);
        match outcome {
            RejectOutcome::Requeued { attempts } => {
                debug!("Requeued delivery {} (attempt {})", delivery.id, attempts)
            }
            RejectOutcome::DeadLettered { .. } => {
                warn!("Moved delivery {} to dead-letter queue: {}", delivery.id, reason)
            }
            RejectOutcome::Stale => debug!("Delivery {} was already settled", delivery.id),
        }
        Ok(outcome)
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> QueueResult<bool> {
        let mut conn = self.conn().await?;

        let moved: i64 = Script::new(DEAD_LETTER_SCRIPT)
            .key(WORK_QUEUE)
            .key(DEAD_LETTER_QUEUE)
            .key(Self::retry_key(&delivery.digest()))
            .arg(&self.config.consumer_group)
            .arg(&delivery.id)
            .arg(&delivery.payload)
            .arg(reason)
            .invoke_async(&mut conn)
            .await?;

        if moved == 0 {
            debug!("Delivery {} was already settled", delivery.id);
            return Ok(false);
        }
        warn!("Moved delivery {} to dead-letter queue: {}", delivery.id, reason);
        Ok(true)
    }
}
