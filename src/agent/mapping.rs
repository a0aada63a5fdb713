use super::{call_with_fallback, AgentSettings, Progress};
use crate::cache::KeyedCache;
use crate::fallback;
use crate::model::{AnalysisRequest, SourceKind, Stage, StageOutcome, StageRecord};
use crate::source::MappingSource;
use serde_json::Value;
use std::sync::Arc;

const NAMESPACE: &str = "mapping";

/// Resolves a request into one mapping record per vulnerability.
///
/// An empty live result is a fallback condition: the request gets a single
/// placeholder identifier instead of an empty pipeline.
pub struct MappingAgent {
    source: Arc<dyn MappingSource>,
    cache: Arc<KeyedCache>,
    settings: AgentSettings,
}

impl MappingAgent {
    pub fn new(
        source: Arc<dyn MappingSource>,
        cache: Arc<KeyedCache>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            source,
            cache,
            settings,
        }
    }

    fn placeholder_records(request: &AnalysisRequest) -> Vec<StageRecord> {
        fallback::placeholder_ids(&request.subject)
            .iter()
            .map(|id| fallback::mapping_record(id, &request.subject, &request.ecosystem))
            .collect()
    }

    pub async fn execute(
        &self,
        request: &AnalysisRequest,
        force: bool,
        progress: &Progress,
    ) -> StageOutcome<Vec<StageRecord>> {
        let key = request.scope_key();

        if !force {
            if let Some(cached) = self
                .cache
                .get::<StageOutcome<Vec<StageRecord>>>(NAMESPACE, &key)
                .await
            {
                progress.emit(
                    Stage::Mapping,
                    format!("cache hit: {} identifiers for {}", cached.value().len(), request),
                );
                return cached;
            }
        }

        progress.emit(
            Stage::Mapping,
            format!("querying {} for {}", self.source.name(), request),
        );
        let provider = self.source.name();
        let outcome = call_with_fallback(
            Stage::Mapping,
            progress,
            self.settings.call_timeout,
            self.source.fetch_ids(request),
            Vec::new,
        )
        .await;

        let outcome = match outcome {
            StageOutcome::Live(ids) if !ids.is_empty() => StageOutcome::Live(
                ids.into_iter()
                    .map(|id| {
                        StageRecord::new(id, Stage::Mapping, None, SourceKind::Live, provider)
                            .with_auxiliary("subject", Value::from(request.subject.as_str()))
                            .with_auxiliary("ecosystem", Value::from(request.ecosystem.as_str()))
                    })
                    .collect(),
            ),
            StageOutcome::Live(_) => {
                progress.emit(
                    Stage::Mapping,
                    format!("no identifiers found for {}, using placeholder", request),
                );
                StageOutcome::Fallback(Self::placeholder_records(request))
            }
            StageOutcome::Fallback(_) => StageOutcome::Fallback(Self::placeholder_records(request)),
        };

        self.cache
            .set(NAMESPACE, &key, &outcome, self.settings.cache_ttl)
            .await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::MockMapping;
    use crate::cache::MemoryCacheBackend;
    use std::time::Duration;

    fn cache() -> Arc<KeyedCache> {
        Arc::new(KeyedCache::new(
            Arc::new(MemoryCacheBackend::new()),
            Duration::from_millis(500),
        ))
    }

    fn request() -> AnalysisRequest {
        AnalysisRequest::new("lodash", "4.17.20", "npm")
    }

    #[tokio::test]
    async fn test_second_call_is_served_from_cache() {
        let source = Arc::new(MockMapping::returning(vec!["CVE-2020-8203", "CVE-2021-23337"]));
        let agent = MappingAgent::new(source.clone(), cache(), AgentSettings::default());

        let first = agent.execute(&request(), false, &Progress::noop()).await;
        let second = agent.execute(&request(), false, &Progress::noop()).await;

        assert_eq!(source.calls(), 1);
        assert!(!first.is_fallback());
        assert_eq!(first, second);
        assert_eq!(second.value().len(), 2);
    }

    #[tokio::test]
    async fn test_force_bypasses_cache() {
        let source = Arc::new(MockMapping::returning(vec!["CVE-2020-8203"]));
        let agent = MappingAgent::new(source.clone(), cache(), AgentSettings::default());

        agent.execute(&request(), false, &Progress::noop()).await;
        agent.execute(&request(), true, &Progress::noop()).await;
        agent.execute(&request(), false, &Progress::noop()).await;

        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_empty_mapping_yields_one_placeholder() {
        let source = Arc::new(MockMapping::returning(Vec::new()));
        let agent = MappingAgent::new(source, cache(), AgentSettings::default());

        let outcome = agent
            .execute(&AnalysisRequest::new("pkg-a", "", "x"), false, &Progress::noop())
            .await;

        assert!(outcome.is_fallback());
        let records = outcome.into_inner();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].vulnerability_id, fallback::placeholder_id("pkg-a"));
        assert!(records[0].is_fallback());
    }

    #[tokio::test]
    async fn test_failed_mapping_is_cached_as_fallback() {
        let source = Arc::new(MockMapping::failing());
        let agent = MappingAgent::new(source.clone(), cache(), AgentSettings::default());

        let first = agent.execute(&request(), false, &Progress::noop()).await;
        let second = agent.execute(&request(), false, &Progress::noop()).await;

        assert!(first.is_fallback());
        assert!(second.is_fallback());
        assert_eq!(source.calls(), 1);
    }
}
