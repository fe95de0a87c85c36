//! Redis-backed queue and resume locks.
//!
//! Keys for a queue named `q`:
//! - `q:ready`   list, LPUSH to enqueue, RPOP to dequeue
//! - `q:leased`  sorted set, member = lease id, score = lease deadline (ms)
//! - `q:leases`  hash, lease id -> payload
//! - `q:delayed` sorted set, member = payload, score = ready-at (ms)
//! - `q:lock:<resume_id>` string holding the lock token, with PX expiry
//!
//! Every multi-key step runs as a Lua script so a crash can never leave a job
//! popped but unleased. Each dequeue mints a new lease id, so a worker whose
//! lease expired can't ack or nack the lease of whoever got the job next.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::queue::{
    CustomizationJob, Delivery, JobHandle, JobQueue, LockToken, QueueError, ResumeLocks,
};

/// Max jobs moved per dequeue when promoting delayed or expired entries.
const SWEEP_BATCH: usize = 100;

const DEQUEUE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local due = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now, 'LIMIT', 0, tonumber(ARGV[3]))
for _, job in ipairs(due) do
    redis.call('ZREM', KEYS[3], job)
    redis.call('LPUSH', KEYS[1], job)
end
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now, 'LIMIT', 0, tonumber(ARGV[3]))
for _, lease in ipairs(expired) do
    local job = redis.call('HGET', KEYS[4], lease)
    redis.call('ZREM', KEYS[2], lease)
    redis.call('HDEL', KEYS[4], lease)
    if job then
        redis.call('RPUSH', KEYS[1], job)
    end
end
local job = redis.call('RPOP', KEYS[1])
if job then
    redis.call('ZADD', KEYS[2], now + tonumber(ARGV[2]), ARGV[4])
    redis.call('HSET', KEYS[4], ARGV[4], job)
end
return job
"#;

const ACK_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
    redis.call('HDEL', KEYS[2], ARGV[1])
    return 1
end
return 0
"#;

const NACK_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
    redis.call('HDEL', KEYS[2], ARGV[1])
    redis.call('ZADD', KEYS[3], tonumber(ARGV[3]), ARGV[2])
    return 1
end
return 0
"#;

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const EXTEND_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], tonumber(ARGV[2]))
end
return 0
"#;

/// Lazily connected multiplexed connection, dropped on error so the next
/// call reconnects.
struct Connection {
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl Connection {
    fn new(client: redis::Client) -> Self {
        Self {
            client,
            conn: Mutex::new(None),
        }
    }

    async fn get(&self) -> Result<MultiplexedConnection, QueueError> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        debug!("Redis connection established");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_on_error<T>(&self, result: redis::RedisResult<T>) -> Result<T, QueueError> {
        match result {
            Ok(v) => Ok(v),
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                    warn!("Redis connection lost: {e}");
                    *self.conn.lock().await = None;
                }
                Err(e.into())
            }
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

// ────────────────────────────────────────────────────────────────────────────
// Queue
// ────────────────────────────────────────────────────────────────────────────

pub struct RedisJobQueue {
    connection: Connection,
    ready_key: String,
    leased_key: String,
    leases_key: String,
    delayed_key: String,
    dequeue_script: Script,
    ack_script: Script,
    nack_script: Script,
}

impl RedisJobQueue {
    pub fn new(client: redis::Client, queue_name: &str) -> Self {
        Self {
            connection: Connection::new(client),
            ready_key: format!("{queue_name}:ready"),
            leased_key: format!("{queue_name}:leased"),
            leases_key: format!("{queue_name}:leases"),
            delayed_key: format!("{queue_name}:delayed"),
            dequeue_script: Script::new(DEQUEUE_SCRIPT),
            ack_script: Script::new(ACK_SCRIPT),
            nack_script: Script::new(NACK_SCRIPT),
        }
    }

    /// Drops a lease and its payload. `false` when the lease had already
    /// expired or been settled.
    async fn remove_lease(&self, lease_id: &str) -> Result<bool, QueueError> {
        let mut conn = self.connection.get().await?;
        let result: redis::RedisResult<i64> = self
            .ack_script
            .key(&self.leased_key)
            .key(&self.leases_key)
            .arg(lease_id)
            .invoke_async(&mut conn)
            .await;
        Ok(self.connection.reset_on_error(result).await? == 1)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: CustomizationJob) -> Result<JobHandle, QueueError> {
        let payload = serde_json::to_string(&job)?;
        let mut conn = self.connection.get().await?;
        let result: redis::RedisResult<i64> = conn.lpush(&self.ready_key, payload).await;
        self.connection.reset_on_error(result).await?;

        Ok(JobHandle {
            job_id: job.job_id,
            resume_id: job.resume_id,
        })
    }

    async fn dequeue(&self, lease: Duration) -> Result<Option<Delivery>, QueueError> {
        let lease_id = Uuid::new_v4().to_string();
        let mut conn = self.connection.get().await?;
        let result: redis::RedisResult<Option<String>> = self
            .dequeue_script
            .key(&self.ready_key)
            .key(&self.leased_key)
            .key(&self.delayed_key)
            .key(&self.leases_key)
            .arg(now_ms())
            .arg(millis(lease))
            .arg(SWEEP_BATCH)
            .arg(&lease_id)
            .invoke_async(&mut conn)
            .await;

        let Some(payload) = self.connection.reset_on_error(result).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<CustomizationJob>(&payload) {
            Ok(job) => Ok(Some(Delivery {
                job,
                receipt: lease_id,
            })),
            Err(e) => {
                // Poison message: drop it rather than redeliver it forever.
                warn!("Discarding malformed queue payload {payload:?}: {e}");
                self.remove_lease(&lease_id).await?;
                Err(QueueError::Payload(e))
            }
        }
    }

    async fn extend_lease(
        &self,
        delivery: &Delivery,
        lease: Duration,
    ) -> Result<bool, QueueError> {
        let mut conn = self.connection.get().await?;
        let result: redis::RedisResult<i64> = redis::cmd("ZADD")
            .arg(&self.leased_key)
            .arg("XX")
            .arg("CH")
            .arg(now_ms() + millis(lease))
            .arg(&delivery.receipt)
            .query_async(&mut conn)
            .await;
        Ok(self.connection.reset_on_error(result).await? == 1)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        self.remove_lease(&delivery.receipt).await
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<bool, QueueError> {
        let next = serde_json::to_string(&delivery.job.redelivery())?;
        let mut conn = self.connection.get().await?;
        let result: redis::RedisResult<i64> = self
            .nack_script
            .key(&self.leased_key)
            .key(&self.leases_key)
            .key(&self.delayed_key)
            .arg(&delivery.receipt)
            .arg(next)
            .arg(now_ms() + millis(delay))
            .invoke_async(&mut conn)
            .await;
        Ok(self.connection.reset_on_error(result).await? == 1)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.connection.get().await?;
        let result: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        self.connection.reset_on_error(result).await.map(|_| ())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Locks
// ────────────────────────────────────────────────────────────────────────────

pub struct RedisResumeLocks {
    connection: Connection,
    prefix: String,
    release_script: Script,
    extend_script: Script,
}

impl RedisResumeLocks {
    pub fn new(client: redis::Client, queue_name: &str) -> Self {
        Self {
            connection: Connection::new(client),
            prefix: format!("{queue_name}:lock"),
            release_script: Script::new(RELEASE_LOCK_SCRIPT),
            extend_script: Script::new(EXTEND_LOCK_SCRIPT),
        }
    }

    fn key(&self, resume_id: Uuid) -> String {
        format!("{}:{}", self.prefix, resume_id)
    }
}

#[async_trait]
impl ResumeLocks for RedisResumeLocks {
    async fn try_acquire(
        &self,
        resume_id: Uuid,
        ttl: Duration,
    ) -> Result<Option<LockToken>, QueueError> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.connection.get().await?;
        let result: redis::RedisResult<Option<String>> = redis::cmd("SET")
            .arg(self.key(resume_id))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await;

        Ok(self
            .connection
            .reset_on_error(result)
            .await?
            .map(|_| LockToken { resume_id, token }))
    }

    async fn extend(&self, token: &LockToken, ttl: Duration) -> Result<bool, QueueError> {
        let mut conn = self.connection.get().await?;
        let result: redis::RedisResult<i64> = self
            .extend_script
            .key(self.key(token.resume_id))
            .arg(&token.token)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await;
        Ok(self.connection.reset_on_error(result).await? == 1)
    }

    async fn release(&self, token: &LockToken) -> Result<bool, QueueError> {
        let mut conn = self.connection.get().await?;
        let result: redis::RedisResult<i64> = self
            .release_script
            .key(self.key(token.resume_id))
            .arg(&token.token)
            .invoke_async(&mut conn)
            .await;
        Ok(self.connection.reset_on_error(result).await? == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let queue = RedisJobQueue::new(client.clone(), "resume-customization");
        assert_eq!(queue.ready_key, "resume-customization:ready");
        assert_eq!(queue.leased_key, "resume-customization:leased");
        assert_eq!(queue.leases_key, "resume-customization:leases");
        assert_eq!(queue.delayed_key, "resume-customization:delayed");

        let locks = RedisResumeLocks::new(client, "resume-customization");
        let id = Uuid::nil();
        assert_eq!(
            locks.key(id),
            "resume-customization:lock:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_secs(2)), 2000);
        assert_eq!(millis(Duration::MAX), i64::MAX);
    }

    #[tokio::test]
    #[ignore] // Requires Redis at REDIS_URL
    async fn test_expired_receipt_cannot_settle_the_next_lease() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let client = redis::Client::open(url).unwrap();
        let queue = RedisJobQueue::new(client, &format!("test-{}", Uuid::new_v4()));
        let job = CustomizationJob::new(Uuid::new_v4());
        queue.enqueue(job.clone()).await.unwrap();

        let stale = queue.dequeue(Duration::from_millis(1)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let current = queue.dequeue(Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(current.job, job);
        assert_ne!(current.receipt, stale.receipt);

        assert!(!queue.ack(&stale).await.unwrap());
        assert!(!queue.nack(&stale, Duration::ZERO).await.unwrap());
        assert!(queue.ack(&current).await.unwrap());
        assert!(queue.dequeue(Duration::from_secs(30)).await.unwrap().is_none());
    }
}

