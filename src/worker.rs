//! Long-running queue consumer.
//!
//! A worker pops one job at a time, runs it to completion in its own task and
//! moves it to the dead-letter list if processing returns an error or panics.
//! Shutdown is only observed between jobs, so a dequeued job is never
//! abandoned halfway.

use crate::agent::Progress;
use crate::error::PipelineError;
use crate::model::Job;
use crate::orchestrator::PipelineOrchestrator;
use crate::queue::{Delivery, JobQueue};
use anyhow::Context;
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const DEAD_LETTER_ATTEMPTS: u32 = 3;

/// Processes one dequeued job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> anyhow::Result<()>;
}

#[async_trait]
impl JobHandler for PipelineOrchestrator {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let request = job.request();
        let result = self
            .run(&request, &Progress::noop())
            .await
            .with_context(|| format!("job {} for {}", job.job_id, request))?;
        debug!(
            job_id = %job.job_id,
            vulnerabilities = result.reports.len(),
            "pipeline result stored"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// How long one dequeue blocks before shutdown is checked again.
    pub block_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            block_timeout: Duration::from_secs(2),
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub dead_lettered: u64,
    pub reconnects: u64,
}

pub struct Worker {
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(queue: Arc<JobQueue>, handler: Arc<dyn JobHandler>, config: WorkerConfig) -> Self {
        Self {
            queue,
            handler,
            config,
        }
    }

    /// Consumes jobs until `shutdown` turns true (or its sender goes away).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> WorkerStats {
        let mut stats = WorkerStats::default();
        info!(queue = self.queue.queue_key(), "worker started");

        while !stopping(&shutdown) {
            match self.queue.dequeue(self.config.block_timeout).await {
                Ok(Some(delivery)) => self.process(delivery, &mut stats, &mut shutdown).await,
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "queue backend unavailable");
                    stats.reconnects += 1;
                    if !self.reconnect(&mut shutdown).await {
                        break;
                    }
                }
            }
        }

        info!(
            processed = stats.processed,
            dead_lettered = stats.dead_lettered,
            reconnects = stats.reconnects,
            "worker stopped"
        );
        stats
    }

    async fn process(
        &self,
        delivery: Delivery,
        stats: &mut WorkerStats,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let Delivery { job, payload } = delivery;
        info!(job_id = %job.job_id, subject = %job.subject, attempts = job.attempts, "processing job");

        let handler = self.handler.clone();
        let task_job = job.clone();
        let joined = tokio::spawn(async move { handler.handle(&task_job).await }).await;

        let (message, trace) = match joined {
            Ok(Ok(())) => {
                stats.processed += 1;
                info!(job_id = %job.job_id, "job completed");
                return;
            }
            Ok(Err(e)) => (format!("{:#}", e), format!("{:?}", e)),
            Err(e) if e.is_panic() => {
                let reason = panic_message(e.into_panic());
                (
                    format!("job processing panicked: {}", reason),
                    format!("panic in job task for {}: {}", job.job_id, reason),
                )
            }
            Err(e) => {
                let e = PipelineError::Aborted(e.to_string());
                (e.to_string(), format!("{:?}", e))
            }
        };

        for attempt in 1..=DEAD_LETTER_ATTEMPTS {
            match self.queue.dead_letter(&payload, &message, &trace).await {
                Ok(_) => {
                    stats.dead_lettered += 1;
                    return;
                }
                Err(e) if attempt < DEAD_LETTER_ATTEMPTS => {
                    warn!(job_id = %job.job_id, attempt, error = %e, "dead-letter write failed");
                    stats.reconnects += 1;
                    if !self.reconnect(shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(job_id = %job.job_id, attempt, error = %e, "dead-letter write failed");
                }
            }
        }

        // Last resort: the payload survives in the logs.
        error!(
            job_id = %job.job_id,
            error = %message,
            payload = %payload,
            "failed job could not be dead-lettered"
        );
    }

    /// Waits for the queue backend to answer a ping again, backing off
    /// exponentially. Returns `false` if shutdown was requested meanwhile.
    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut delay = self.config.reconnect_initial;
        loop {
            debug!(?delay, "waiting before reconnecting to queue backend");
            if sleep_or_shutdown(shutdown, delay).await {
                return false;
            }
            match self.queue.ping().await {
                Ok(()) => {
                    info!("queue backend reachable again");
                    return true;
                }
                Err(e) => debug!(error = %e, "queue backend still unavailable"),
            }
            delay = (delay * 2).min(self.config.reconnect_max);
        }
    }
}

fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Sleeps for `delay`; returns `true` early if shutdown is requested.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return stopping(shutdown),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return true;
                }
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
