//! Front door that turns an asynchronous pipeline into a bounded wait.
//!
//! [`PollingGateway::resolve`] answers from the response cache or the store
//! when it can. Otherwise it enqueues a job and polls the store at a fixed
//! interval until the result shows up or the maximum wait runs out, in which
//! case the caller gets [`Resolution::InProgress`] and should ask again later.

use crate::cache::KeyedCache;
use crate::error::GatewayError;
use crate::model::{AnalysisRequest, Job, PipelineResult, VulnerabilityId, DEFAULT_JOB_SOURCE};
use crate::queue::JobQueue;
use crate::store::{Lookup, ResultQuery, ResultStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const RESPONSE_NAMESPACE: &str = "query";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayConfig {
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub response_cache_ttl: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_wait: Duration::from_secs(120),
            response_cache_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Ready(PipelineResult),
    /// The job is queued or running; retry later.
    InProgress { waited: Duration },
}

pub struct PollingGateway {
    store: Arc<dyn ResultStore>,
    queue: Arc<JobQueue>,
    cache: Arc<KeyedCache>,
    config: GatewayConfig,
}

impl PollingGateway {
    pub fn new(
        store: Arc<dyn ResultStore>,
        queue: Arc<JobQueue>,
        cache: Arc<KeyedCache>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            store,
            queue,
            cache,
            config,
        }
    }

    pub async fn resolve(&self, request: &AnalysisRequest) -> Result<Resolution, GatewayError> {
        request.validate()?;
        let scope = request.scope_key();

        if !request.force_refresh {
            if let Some(result) = self.cache.get(RESPONSE_NAMESPACE, &scope).await {
                debug!(request = %request, "served from response cache");
                return Ok(Resolution::Ready(result));
            }
            match self.store.find_result(&ResultQuery::for_request(request)).await {
                Lookup::Found(result) => {
                    debug!(request = %request, "served from store");
                    self.remember(&scope, &result).await;
                    return Ok(Resolution::Ready(result));
                }
                Lookup::NotFound => {}
                Lookup::Error(e) => warn!(request = %request, error = %e, "store lookup failed"),
            }
        } else {
            match self
                .store
                .delete_result(
                    &request.subject,
                    &request.ecosystem,
                    Some(&request.version_selector),
                )
                .await
            {
                Ok(removed) => debug!(request = %request, removed, "dropped stored result"),
                Err(e) => warn!(request = %request, error = %e, "could not drop stored result"),
            }
        }

        let job = Job::new(request, DEFAULT_JOB_SOURCE);
        if !self.queue.enqueue(&job).await {
            return Err(GatewayError::ServiceUnavailable {
                service: "queue".to_string(),
                reason: "job could not be enqueued".to_string(),
            });
        }
        info!(job_id = %job.job_id, request = %request, "job enqueued, waiting for result");

        // A forced run must not be answered by a result that predates it.
        let not_before = request.force_refresh.then_some(job.enqueued_at);
        self.poll(request, &scope, not_before).await
    }

    async fn poll(
        &self,
        request: &AnalysisRequest,
        scope: &str,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<Resolution, GatewayError> {
        let query = ResultQuery::for_request(request);
        let started = Instant::now();
        let deadline = started + self.config.max_wait;

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;

            match self.store.find_result(&query).await {
                Lookup::Found(result) if not_before.map_or(true, |t| result.generated_at >= t) => {
                    info!(request = %request, waited = ?started.elapsed(), "result ready");
                    self.remember(scope, &result).await;
                    return Ok(Resolution::Ready(result));
                }
                Lookup::Found(_) | Lookup::NotFound => {}
                Lookup::Error(e) => debug!(error = %e, "store poll failed, will retry"),
            }
        }

        let waited = started.elapsed();
        info!(request = %request, ?waited, "result not ready yet");
        Ok(Resolution::InProgress { waited })
    }

    /// Newest stored result reporting `id`. Never enqueues anything.
    pub async fn find_by_vulnerability(
        &self,
        id: &VulnerabilityId,
    ) -> Result<Option<PipelineResult>, GatewayError> {
        let key = format!("vuln:{}", id);
        if let Some(result) = self.cache.get(RESPONSE_NAMESPACE, &key).await {
            return Ok(Some(result));
        }

        match self
            .store
            .find_result(&ResultQuery::Vulnerability(id.clone()))
            .await
        {
            Lookup::Found(result) => {
                self.remember(&key, &result).await;
                Ok(Some(result))
            }
            Lookup::NotFound => Ok(None),
            Lookup::Error(e) => Err(GatewayError::ServiceUnavailable {
                service: "store".to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn remember(&self, key: &str, result: &PipelineResult) {
        self.cache
            .set(RESPONSE_NAMESPACE, key, result, self.config.response_cache_ttl)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheBackend;
    use crate::fallback;
    use crate::model::VulnerabilityReport;
    use crate::queue::MemoryQueueBackend;
    use crate::store::MemoryResultStore;

    struct Harness {
        store: Arc<MemoryResultStore>,
        queue_backend: Arc<MemoryQueueBackend>,
        queue: Arc<JobQueue>,
        gateway: PollingGateway,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryResultStore::new());
        let queue_backend = Arc::new(MemoryQueueBackend::new());
        let queue = Arc::new(JobQueue::new(
            queue_backend.clone(),
            "analysis_tasks",
            "analysis_tasks:dead",
        ));
        let cache = Arc::new(KeyedCache::new(
            Arc::new(MemoryCacheBackend::new()),
            Duration::from_millis(500),
        ));
        let gateway = PollingGateway::new(
            store.clone(),
            queue.clone(),
            cache,
            GatewayConfig {
                poll_interval: Duration::from_secs(2),
                max_wait: Duration::from_secs(10),
                response_cache_ttl: Duration::from_secs(300),
            },
        );
        Harness {
            store,
            queue_backend,
            queue,
            gateway,
        }
    }

    fn stored(request: &AnalysisRequest) -> PipelineResult {
        let id = fallback::placeholder_id(&request.subject);
        PipelineResult::new(
            request.clone().force_refresh(false),
            vec![VulnerabilityReport {
                vulnerability_id: id.clone(),
                stage_records: vec![fallback::mapping_record(
                    &id,
                    &request.subject,
                    &request.ecosystem,
                )],
                synthesis: fallback::synthesis(&id),
            }],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_with_in_progress_after_max_wait() {
        let h = harness();
        let request = AnalysisRequest::new("pkg-a", "latest", "x");

        let started = Instant::now();
        let resolution = h.gateway.resolve(&request).await.unwrap();
        let elapsed = started.elapsed();

        assert!(matches!(resolution, Resolution::InProgress { .. }));
        assert!(elapsed >= Duration::from_secs(8), "returned too early: {:?}", elapsed);
        assert!(elapsed <= Duration::from_secs(12), "waited too long: {:?}", elapsed);
        assert_eq!(h.queue.pending_count().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_result_once_worker_stores_it() {
        let h = harness();
        let request = AnalysisRequest::new("lodash", "4.17.20", "npm");

        let consumer = {
            let queue = h.queue.clone();
            let store = h.store.clone();
            tokio::spawn(async move {
                let delivery = queue.dequeue(Duration::from_secs(5)).await.unwrap().unwrap();
                tokio::time::sleep(Duration::from_secs(3)).await;
                store.save_result(&stored(&delivery.job.request())).await.unwrap();
            })
        };

        let resolution = h.gateway.resolve(&request).await.unwrap();
        consumer.await.unwrap();
        match resolution {
            Resolution::Ready(result) => assert_eq!(result.request.subject, "lodash"),
            other => panic!("expected a result, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_existing_result_returned_without_enqueueing() {
        let h = harness();
        let request = AnalysisRequest::new("lodash", "latest", "npm");
        h.store.save_result(&stored(&request)).await.unwrap();

        let resolution = h.gateway.resolve(&request).await.unwrap();
        assert!(matches!(resolution, Resolution::Ready(_)));
        assert_eq!(h.queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stored_result_served_while_queue_is_down() {
        let h = harness();
        h.queue_backend.set_available(false);
        let request = AnalysisRequest::new("lodash", "latest", "npm");
        let result = stored(&request);
        h.store.save_result(&result).await.unwrap();

        let resolution = h.gateway.resolve(&request).await.unwrap();
        assert!(matches!(resolution, Resolution::Ready(_)));

        let id = result.reports[0].vulnerability_id.clone();
        assert!(h.gateway.find_by_vulnerability(&id).await.unwrap().is_some());

        let err = h
            .gateway
            .resolve(&AnalysisRequest::new("express", "latest", "npm"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ServiceUnavailable { ref service, .. } if service == "queue"));
    }

    #[tokio::test]
    async fn test_response_cache_answers_repeat_queries() {
        let h = harness();
        let request = AnalysisRequest::new("lodash", "latest", "npm");
        h.store.save_result(&stored(&request)).await.unwrap();
        h.gateway.resolve(&request).await.unwrap();

        h.store.set_available(false);
        let resolution = h.gateway.resolve(&request).await.unwrap();
        assert!(matches!(resolution, Resolution::Ready(_)));
        assert_eq!(h.queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refresh_drops_stale_result_and_enqueues() {
        let h = harness();
        let request = AnalysisRequest::new("lodash", "latest", "npm");
        h.store.save_result(&stored(&request)).await.unwrap();

        let resolution = h
            .gateway
            .resolve(&request.clone().force_refresh(true))
            .await
            .unwrap();

        assert!(matches!(resolution, Resolution::InProgress { .. }));
        assert_eq!(h.store.result_count().await, 0);
        let delivery = h
            .queue
            .dequeue(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert!(delivery.job.force_refresh);
    }

    #[tokio::test]
    async fn test_enqueue_failure_is_service_unavailable() {
        let h = harness();
        h.queue_backend.set_available(false);

        let err = h
            .gateway
            .resolve(&AnalysisRequest::new("lodash", "latest", "npm"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ServiceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_invalid_request_rejected_before_enqueue() {
        let h = harness();
        let err = h
            .gateway
            .resolve(&AnalysisRequest::new("left pad", "latest", "npm"))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::InvalidInput(_)));
        assert_eq!(h.queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_outage_during_polling_is_not_fatal() {
        let h = harness();
        h.store.set_available(false);

        let resolution = h
            .gateway
            .resolve(&AnalysisRequest::new("lodash", "latest", "npm"))
            .await
            .unwrap();
        assert!(matches!(resolution, Resolution::InProgress { .. }));
    }

    #[tokio::test]
    async fn test_find_by_vulnerability() {
        let h = harness();
        let request = AnalysisRequest::new("lodash", "latest", "npm");
        let result = stored(&request);
        let id = result.reports[0].vulnerability_id.clone();

        assert_eq!(h.gateway.find_by_vulnerability(&id).await.unwrap(), None);
        h.store.save_result(&result).await.unwrap();
        assert_eq!(h.gateway.find_by_vulnerability(&id).await.unwrap(), Some(result));
    }
}
