//! Job Queue — at-least-once delivery of customization jobs.
//!
//! The queue is a delivery mechanism only. It does not deduplicate and knows
//! nothing about resume state; mutual exclusion per resume is provided by
//! [`ResumeLocks`], and outcomes live on the resume record.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod redis;

pub use self::redis::{RedisJobQueue, RedisResumeLocks};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("malformed job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<::redis::RedisError> for QueueError {
    fn from(e: ::redis::RedisError) -> Self {
        QueueError::Unavailable(e.to_string())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Messages
// ────────────────────────────────────────────────────────────────────────────

/// Queue message. `attempt` counts deliveries of this message and is only
/// used for logging; the durable attempt counter lives on the resume record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomizationJob {
    pub job_id: Uuid,
    pub resume_id: Uuid,
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl CustomizationJob {
    pub fn new(resume_id: Uuid) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            resume_id,
            attempt: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// The message that goes back on the queue after a nack.
    pub fn redelivery(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobHandle {
    pub job_id: Uuid,
    pub resume_id: Uuid,
}

/// A leased job. `receipt` identifies the lease to the broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: CustomizationJob,
    pub receipt: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Traits
// ────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: CustomizationJob) -> Result<JobHandle, QueueError>;

    /// Leases the next ready job for `lease`. `Ok(None)` when the queue is empty.
    async fn dequeue(&self, lease: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Pushes the lease deadline out. `false` when the lease was already lost.
    async fn extend_lease(&self, delivery: &Delivery, lease: Duration)
        -> Result<bool, QueueError>;

    /// Removes the job for good. `false` when the lease had expired first.
    async fn ack(&self, delivery: &Delivery) -> Result<bool, QueueError>;

    /// Releases the job for redelivery after `delay`.
    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<bool, QueueError>;

    /// Connectivity check for health reporting.
    async fn ping(&self) -> Result<(), QueueError>;
}

/// Token proving ownership of a resume lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub resume_id: Uuid,
    pub token: String,
}

/// Per-resume mutual exclusion across every worker process.
#[async_trait]
pub trait ResumeLocks: Send + Sync {
    /// `Ok(None)` when another worker holds the lock.
    async fn try_acquire(&self, resume_id: Uuid, ttl: Duration)
        -> Result<Option<LockToken>, QueueError>;

    async fn extend(&self, token: &LockToken, ttl: Duration) -> Result<bool, QueueError>;

    /// Only releases a lock still owned by `token`.
    async fn release(&self, token: &LockToken) -> Result<bool, QueueError>;
}

/// Entry point used by the Status API after an upload.
pub async fn enqueue_customization(
    queue: &dyn JobQueue,
    resume_id: Uuid,
) -> Result<JobHandle, QueueError> {
    let handle = queue.enqueue(CustomizationJob::new(resume_id)).await?;
    tracing::info!(
        resume_id = %handle.resume_id,
        job_id = %handle.job_id,
        "Customization job enqueued"
    );
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redelivery_keeps_identity_and_bumps_attempt() {
        let job = CustomizationJob::new(Uuid::new_v4());
        let next = job.redelivery();
        assert_eq!(next.job_id, job.job_id);
        assert_eq!(next.resume_id, job.resume_id);
        assert_eq!(next.attempt, 1);
        assert_ne!(
            serde_json::to_string(&job).unwrap(),
            serde_json::to_string(&next).unwrap()
        );
    }

    #[test]
    fn test_job_payload_shape() {
        let job = CustomizationJob::new(Uuid::new_v4());
        let value = serde_json::to_value(&job).unwrap();
        assert!(value.get("resume_id").is_some());
        assert_eq!(value["attempt"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_receipt_cannot_settle_the_next_lease() {
        let queue = crate::testing::MemoryQueue::new();
        let job = CustomizationJob::new(Uuid::new_v4());
        queue.enqueue(job.clone()).await.unwrap();

        let stale = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        let current = queue.dequeue(Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(current.job, job);
        assert_ne!(current.receipt, stale.receipt);

        assert!(!queue.ack(&stale).await.unwrap());
        assert!(!queue.nack(&stale, Duration::ZERO).await.unwrap());
        assert_eq!(queue.outstanding(), 1);
        assert!(queue.ack(&current).await.unwrap());
        assert_eq!(queue.outstanding(), 0);
    }
}
