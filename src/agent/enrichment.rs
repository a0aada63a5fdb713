use super::{call_with_fallback, AgentSettings, Progress};
use crate::cache::KeyedCache;
use crate::fallback;
use crate::model::{
    AnalysisRequest, SourceKind, Stage, StageOutcome, StageRecord, VulnerabilityId,
};
use crate::source::EnrichmentSource;
use serde_json::Value;
use std::sync::Arc;

const NAMESPACE: &str = "enrichment";

/// Gathers threat cases for one vulnerability.
pub struct EnrichmentAgent {
    source: Arc<dyn EnrichmentSource>,
    cache: Arc<KeyedCache>,
    settings: AgentSettings,
}

impl EnrichmentAgent {
    pub fn new(
        source: Arc<dyn EnrichmentSource>,
        cache: Arc<KeyedCache>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            source,
            cache,
            settings,
        }
    }

    pub async fn execute(
        &self,
        request: &AnalysisRequest,
        id: &VulnerabilityId,
        placeholder: bool,
        force: bool,
        progress: &Progress,
    ) -> StageOutcome<StageRecord> {
        if placeholder {
            return StageOutcome::Fallback(fallback::enrichment_record(id));
        }

        let key = format!("{}:{}", request.scope_key(), id);
        if !force {
            if let Some(record) = self.cache.get::<StageRecord>(NAMESPACE, &key).await {
                progress.emit(Stage::Enrichment, format!("cache hit for {}", id));
                return record.into();
            }
        }

        progress.emit(
            Stage::Enrichment,
            format!("querying {} for {}", self.source.name(), id),
        );
        let outcome = call_with_fallback(
            Stage::Enrichment,
            progress,
            self.settings.call_timeout,
            self.source.fetch_cases(request, id),
            || fallback::threat_cases(id),
        )
        .await;

        let record = match outcome {
            StageOutcome::Live(cases) => {
                let count = cases.len();
                let cases = serde_json::to_value(cases).unwrap_or(Value::Null);
                StageRecord::new(
                    id.clone(),
                    Stage::Enrichment,
                    None,
                    SourceKind::Live,
                    self.source.name(),
                )
                .with_auxiliary("cases", cases)
                .with_auxiliary("caseCount", Value::from(count))
            }
            StageOutcome::Fallback(_) => fallback::enrichment_record(id),
        };

        self.cache
            .set(NAMESPACE, &key, &record, self.settings.cache_ttl)
            .await;
        record.into()
    }
}
