//! Durable FIFO job queue with a dead-letter list.
//!
//! Producers push JSON jobs onto the tail of a named list; consumers pop from
//! the head with a bounded block. Popping removes the job, so each job is
//! handed to exactly one consumer. Jobs that fail processing (or cannot even
//! be decoded) are appended to the dead-letter list with their original
//! payload text, and are only ever re-queued by an explicit
//! [`JobQueue::replay_dead_letter`].

mod memory;
mod redis_backend;

pub use self::memory::MemoryQueueBackend;
pub use self::redis_backend::RedisQueueBackend;

use crate::error::QueueError;
use crate::model::{DeadLetterRecord, Job};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// List operations the queue needs from its backend.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Appends to the tail.
    async fn push(&self, list: &str, payload: String) -> Result<(), QueueError>;

    /// Removes and returns the head, waiting up to `timeout` for one.
    async fn pop(&self, list: &str, timeout: Duration) -> Result<Option<String>, QueueError>;

    async fn len(&self, list: &str) -> Result<usize, QueueError>;

    /// Up to `limit` entries from the head, without removing them.
    async fn range(&self, list: &str, limit: usize) -> Result<Vec<String>, QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;
}

/// A job popped from the queue together with the exact text it arrived as.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub job: Job,
    pub payload: String,
}

pub struct JobQueue {
    backend: Arc<dyn QueueBackend>,
    queue_key: String,
    dead_letter_key: String,
}

impl JobQueue {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        queue_key: impl Into<String>,
        dead_letter_key: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            queue_key: queue_key.into(),
            dead_letter_key: dead_letter_key.into(),
        }
    }

    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    pub fn dead_letter_key(&self) -> &str {
        &self.dead_letter_key
    }

    pub async fn try_enqueue(&self, job: &Job) -> Result<(), QueueError> {
        let payload = job.to_payload()?;
        self.backend.push(&self.queue_key, payload).await?;
        debug!(job_id = %job.job_id, subject = %job.subject, "job enqueued");
        Ok(())
    }

    /// Appends a job and reports whether it was accepted.
    ///
    /// `false` means no asynchronous processing will happen for this job.
    pub async fn enqueue(&self, job: &Job) -> bool {
        match self.try_enqueue(job).await {
            Ok(()) => true,
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "failed to enqueue job");
                false
            }
        }
    }

    /// Pops the next job, blocking up to `timeout`.
    ///
    /// A payload that does not decode as a [`Job`] is moved to the
    /// dead-letter list and `None` is returned in its place.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let Some(payload) = self.backend.pop(&self.queue_key, timeout).await? else {
            return Ok(None);
        };

        match Job::from_payload(&payload) {
            Ok(mut job) => {
                job.attempts += 1;
                Ok(Some(Delivery { job, payload }))
            }
            Err(e) => {
                let reason = format!("undecodable job payload: {}", e);
                if let Err(dead_letter_err) = self.dead_letter(&payload, &reason, "").await {
                    self.put_back(&payload, &reason).await;
                    return Err(dead_letter_err);
                }
                Ok(None)
            }
        }
    }

    /// Returns a popped payload that could not be dead-lettered to the live
    /// queue. If that fails as well, the payload is written to the error log.
    async fn put_back(&self, payload: &str, reason: &str) {
        match self.backend.push(&self.queue_key, payload.to_string()).await {
            Ok(()) => warn!(reason, "dead-letter list unavailable, payload returned to queue"),
            Err(e) => error!(
                payload,
                reason,
                error = %e,
                "payload dropped: could not dead-letter or requeue it"
            ),
        }
    }

    /// Appends a failed payload, verbatim, to the dead-letter list.
    pub async fn dead_letter(
        &self,
        payload: &str,
        error_message: &str,
        stack_trace: &str,
    ) -> Result<DeadLetterRecord, QueueError> {
        let record = DeadLetterRecord::new(payload, error_message, stack_trace);
        let text = serde_json::to_string(&record)?;
        self.backend.push(&self.dead_letter_key, text).await?;
        error!(
            job_id = record.job_id().unwrap_or("unknown"),
            error = error_message,
            "job moved to dead-letter list"
        );
        Ok(record)
    }

    pub async fn pending_count(&self) -> Result<usize, QueueError> {
        self.backend.len(&self.queue_key).await
    }

    pub async fn dead_letter_count(&self) -> Result<usize, QueueError> {
        self.backend.len(&self.dead_letter_key).await
    }

    /// Oldest dead letters first. Entries that fail to decode are skipped.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, QueueError> {
        let raw = self.backend.range(&self.dead_letter_key, limit).await?;
        Ok(raw
            .into_iter()
            .filter_map(|text| match serde_json::from_str(&text) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "skipping undecodable dead-letter entry");
                    None
                }
            })
            .collect())
    }

    /// Puts the original payload of a dead letter back on the live queue.
    /// The dead-letter entry itself is kept.
    pub async fn replay_dead_letter(&self, record: &DeadLetterRecord) -> Result<(), QueueError> {
        self.backend
            .push(&self.queue_key, record.original_payload.clone())
            .await
    }

    pub async fn ping(&self) -> Result<(), QueueError> {
        self.backend.ping().await
    }
}
