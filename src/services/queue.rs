use chrono::Utc;
use redis::AsyncCommands;
use std::time::Duration;
use uuid::Uuid;

use crate::models::message::QueueMessage;

const PENDING_KEY: &str = "churn_predict:pending";
const PAYLOADS_KEY: &str = "churn_predict:payloads";
const DELIVERIES_KEY: &str = "churn_predict:deliveries";
const LEASES_KEY: &str = "churn_predict:leases";
const DEAD_KEY: &str = "churn_predict:dead";

/// A message pulled from the queue. The payload stays raw so a poison
/// message still carries its delivery count to the disposition logic.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: Uuid,
    pub payload: String,
    /// How many times this message has been delivered, this one included.
    /// Authoritative for retry limits.
    pub delivery_count: u32,
}

/// Redis-backed durable queue with at-least-once delivery.
///
/// Layout: a pending list of message ids, a payload hash, a delivery-count
/// hash, and a lease zset scored by expiry. A message is in flight while its
/// id sits in the lease zset; expired leases are swept back onto the pending
/// list at the top of each receive, which is what turns a worker crash into
/// an ordinary redelivery.
///
/// Every move between the pending list and the lease zset runs as a Lua
/// script, so a message is always in exactly one of the two. A crash mid-call
/// can therefore only duplicate a delivery, never lose one.
pub struct JobQueue {
    client: redis::Client,
    claim_script: redis::Script,
    release_script: redis::Script,
    reclaim_script: redis::Script,
}

/// Pop one id off pending and lease it, in one step. Ids whose payload was
/// already acked away are dropped and the pop retried.
const CLAIM_SCRIPT: &str = r#"
while true do
    local id = redis.call('RPOP', KEYS[1])
    if not id then
        return nil
    end
    local payload = redis.call('HGET', KEYS[2], id)
    if payload then
        local count = redis.call('HINCRBY', KEYS[3], id, 1)
        redis.call('ZADD', KEYS[4], ARGV[1], id)
        return {id, payload, count}
    end
end
"#;

/// Move one leased id back onto pending. ZREM arbitrates between racing
/// workers; only the caller that held the lease re-queues the id.
const RELEASE_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) > 0 then
    redis.call('LPUSH', KEYS[2], ARGV[1])
    return 1
end
return 0
"#;

/// Sweep every expired lease back onto pending.
const RECLAIM_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(expired) do
    redis.call('ZREM', KEYS[1], id)
    redis.call('LPUSH', KEYS[2], id)
end
return #expired
"#;

impl JobQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            claim_script: redis::Script::new(CLAIM_SCRIPT),
            release_script: redis::Script::new(RELEASE_SCRIPT),
            reclaim_script: redis::Script::new(RECLAIM_SCRIPT),
        })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    /// Publish a message and return its queue-assigned id.
    pub async fn publish(&self, message: &QueueMessage) -> Result<Uuid, QueueError> {
        let mut conn = self.conn().await?;
        let message_id = Uuid::new_v4();
        let payload = message
            .encode()
            .map_err(|e| QueueError::Serialize(e.to_string()))?;

        conn.hset::<_, _, _, ()>(PAYLOADS_KEY, message_id.to_string(), &payload)
            .await?;
        conn.lpush::<_, _, ()>(PENDING_KEY, message_id.to_string())
            .await?;
        Ok(message_id)
    }

    /// Pull up to `max` messages, leasing each for `lease`. Expired leases
    /// are reclaimed first so crashed consumers cannot strand messages.
    pub async fn receive(&self, max: usize, lease: Duration) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self.conn().await?;
        self.reclaim_expired(&mut conn).await?;

        let deadline = Utc::now().timestamp_millis() + lease.as_millis() as i64;
        let mut deliveries = Vec::new();

        for _ in 0..max {
            let claimed: Option<(String, String, i64)> = self
                .claim_script
                .key(PENDING_KEY)
                .key(PAYLOADS_KEY)
                .key(DELIVERIES_KEY)
                .key(LEASES_KEY)
                .arg(deadline)
                .invoke_async(&mut conn)
                .await?;
            let Some((id, payload, delivery_count)) = claimed else {
                break;
            };

            let message_id = Uuid::parse_str(&id)
                .map_err(|_| QueueError::Corrupt(format!("bad message id '{id}'")))?;
            deliveries.push(Delivery {
                message_id,
                payload,
                delivery_count: delivery_count.max(0) as u32,
            });
        }

        Ok(deliveries)
    }

    /// Push an in-flight message's lease deadline forward. Only updates an
    /// existing lease; a message already reclaimed stays reclaimed.
    pub async fn extend_lease(&self, message_id: Uuid, lease: Duration) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let deadline = Utc::now().timestamp_millis() + lease.as_millis() as i64;
        redis::cmd("ZADD")
            .arg(LEASES_KEY)
            .arg("XX")
            .arg(deadline)
            .arg(message_id.to_string())
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Remove a message permanently; processing is finished either way.
    pub async fn ack(&self, message_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let id = message_id.to_string();
        conn.zrem::<_, _, ()>(LEASES_KEY, &id).await?;
        conn.hdel::<_, _, ()>(PAYLOADS_KEY, &id).await?;
        conn.hdel::<_, _, ()>(DELIVERIES_KEY, &id).await?;
        Ok(())
    }

    /// Release a message for immediate redelivery.
    pub async fn abandon(&self, message_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        self.release_script
            .key(LEASES_KEY)
            .key(PENDING_KEY)
            .arg(message_id.to_string())
            .invoke_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    /// Park a message on the dead-letter list for offline inspection and
    /// drop it from the live queue.
    pub async fn dead_letter(&self, message_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let id = message_id.to_string();
        let payload: Option<String> = conn.hget(PAYLOADS_KEY, &id).await?;
        if let Some(payload) = payload {
            conn.lpush::<_, _, ()>(DEAD_KEY, &payload).await?;
        }
        conn.zrem::<_, _, ()>(LEASES_KEY, &id).await?;
        conn.hdel::<_, _, ()>(PAYLOADS_KEY, &id).await?;
        conn.hdel::<_, _, ()>(DELIVERIES_KEY, &id).await?;
        Ok(())
    }

    /// Pending messages, not counting in-flight leases.
    pub async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn().await?;
        let depth: u64 = conn.llen(PENDING_KEY).await?;
        Ok(depth)
    }

    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    async fn reclaim_expired(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<(), QueueError> {
        let now = Utc::now().timestamp_millis();
        let reclaimed: i64 = self
            .reclaim_script
            .key(LEASES_KEY)
            .key(PENDING_KEY)
            .arg(now)
            .invoke_async(conn)
            .await?;
        if reclaimed > 0 {
            tracing::debug!(reclaimed, "reclaimed expired leases");
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("corrupt queue state: {0}")]
    Corrupt(String),
}
