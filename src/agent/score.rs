use super::{call_with_fallback, AgentSettings, Progress};
use crate::cache::KeyedCache;
use crate::error::SourceError;
use crate::fallback;
use crate::model::{SourceKind, StageOutcome, StageRecord, VulnerabilityId};
use crate::source::ScoreSource;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Batch scoring stage (EPSS or CVSS).
///
/// The cache holds one map per request scope. Each run fetches only the
/// identifiers missing from that map, merges them in and writes the full map
/// back.
pub struct ScoreAgent {
    source: Arc<dyn ScoreSource>,
    cache: Arc<KeyedCache>,
    settings: AgentSettings,
}

impl ScoreAgent {
    pub fn new(source: Arc<dyn ScoreSource>, cache: Arc<KeyedCache>, settings: AgentSettings) -> Self {
        Self {
            source,
            cache,
            settings,
        }
    }

    async fn fetch_one(
        &self,
        id: &VulnerabilityId,
        placeholder: bool,
        progress: &Progress,
    ) -> StageRecord {
        let stage = self.source.stage();
        if placeholder {
            return fallback::score_record(id, stage);
        }

        progress.emit(stage, format!("querying {} for {}", self.source.name(), id));
        let call = async {
            let reading = self.source.fetch_score(id).await?;
            let mut record =
                StageRecord::new(id.clone(), stage, reading.score, SourceKind::Live, self.source.name());
            record.auxiliary = reading.auxiliary;
            Ok::<_, SourceError>(record)
        };
        call_with_fallback(stage, progress, self.settings.call_timeout, call, || {
            fallback::score_record(id, stage)
        })
        .await
        .into_inner()
    }

    /// Scores every id in `ids`. Ids listed in `placeholders` are not real
    /// identifiers and get fallback records without a source call.
    pub async fn execute(
        &self,
        scope: &str,
        ids: &[VulnerabilityId],
        placeholders: &BTreeSet<VulnerabilityId>,
        force: bool,
        progress: &Progress,
    ) -> BTreeMap<VulnerabilityId, StageOutcome<StageRecord>> {
        let stage = self.source.stage();
        let namespace = stage.as_str();

        let mut cached: BTreeMap<VulnerabilityId, StageRecord> = if force {
            BTreeMap::new()
        } else {
            self.cache
                .get(namespace, scope)
                .await
                .unwrap_or_default()
        };

        let missing: Vec<VulnerabilityId> = ids
            .iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|id| !cached.contains_key(*id))
            .cloned()
            .collect();

        let hits = ids.iter().filter(|id| cached.contains_key(*id)).count();
        if hits > 0 {
            progress.emit(stage, format!("cache hit for {} of {} identifiers", hits, ids.len()));
        }

        if !missing.is_empty() {
            let fetched: Vec<StageRecord> = stream::iter(missing)
                .map(|id| async move {
                    let placeholder = placeholders.contains(&id);
                    self.fetch_one(&id, placeholder, progress).await
                })
                .buffer_unordered(self.settings.concurrency.max(1))
                .collect()
                .await;

            // Another worker may have written this scope while we were fetching.
            if !force {
                if let Some(latest) = self
                    .cache
                    .get::<BTreeMap<VulnerabilityId, StageRecord>>(namespace, scope)
                    .await
                {
                    for (id, record) in latest {
                        cached.entry(id).or_insert(record);
                    }
                }
            }

            for record in fetched {
                let keep_existing = !force
                    && record.score.is_none()
                    && cached
                        .get(&record.vulnerability_id)
                        .is_some_and(|existing| existing.score.is_some());
                if !keep_existing {
                    cached.insert(record.vulnerability_id.clone(), record);
                }
            }

            self.cache
                .set(namespace, scope, &cached, self.settings.cache_ttl)
                .await;
        }

        ids.iter()
            .filter_map(|id| {
                cached
                    .get(id)
                    .map(|record| (id.clone(), StageOutcome::from(record.clone())))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{id, MockScore};
    use crate::cache::MemoryCacheBackend;
    use crate::model::Stage;
    use std::time::Duration;

    const SCOPE: &str = "npm:lodash:latest";

    fn cache() -> Arc<KeyedCache> {
        Arc::new(KeyedCache::new(
            Arc::new(MemoryCacheBackend::new()),
            Duration::from_millis(500),
        ))
    }

    #[tokio::test]
    async fn test_only_missing_ids_are_fetched() {
        let cache = cache();
        let warm = Arc::new(MockScore::new(Stage::Epss, 0.3));
        let agent = ScoreAgent::new(warm.clone(), cache.clone(), AgentSettings::default());
        agent
            .execute(SCOPE, &[id("CVE-2024-0001")], &BTreeSet::new(), false, &Progress::noop())
            .await;
        assert_eq!(warm.calls(), 1);

        let source = Arc::new(MockScore::new(Stage::Epss, 0.7));
        let agent = ScoreAgent::new(source.clone(), cache.clone(), AgentSettings::default());
        let ids = [id("CVE-2024-0001"), id("CVE-2024-0002")];
        let scores = agent
            .execute(SCOPE, &ids, &BTreeSet::new(), false, &Progress::noop())
            .await;

        assert_eq!(source.requested(), vec!["CVE-2024-0002"]);
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[&ids[0]].value().score, Some(0.3));
        assert_eq!(scores[&ids[1]].value().score, Some(0.7));

        let stored: BTreeMap<VulnerabilityId, StageRecord> =
            cache.get("epss", SCOPE).await.unwrap();
        assert!(stored.contains_key(&ids[0]));
        assert!(stored.contains_key(&ids[1]));
    }

    #[tokio::test]
    async fn test_repeat_call_issues_no_requests() {
        let source = Arc::new(MockScore::new(Stage::Cvss, 9.8));
        let agent = ScoreAgent::new(source.clone(), cache(), AgentSettings::default());
        let ids = [id("CVE-2024-0001"), id("CVE-2024-0002")];

        agent.execute(SCOPE, &ids, &BTreeSet::new(), false, &Progress::noop()).await;
        agent.execute(SCOPE, &ids, &BTreeSet::new(), false, &Progress::noop()).await;

        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_force_refetches_and_overwrites() {
        let cache = cache();
        let ids = [id("CVE-2024-0001")];
        let old = Arc::new(MockScore::new(Stage::Cvss, 5.0));
        ScoreAgent::new(old, cache.clone(), AgentSettings::default())
            .execute(SCOPE, &ids, &BTreeSet::new(), false, &Progress::noop())
            .await;

        let fresh = Arc::new(MockScore::new(Stage::Cvss, 7.5));
        let scores = ScoreAgent::new(fresh.clone(), cache.clone(), AgentSettings::default())
            .execute(SCOPE, &ids, &BTreeSet::new(), true, &Progress::noop())
            .await;

        assert_eq!(fresh.calls(), 1);
        assert_eq!(scores[&ids[0]].value().score, Some(7.5));
        let stored: BTreeMap<VulnerabilityId, StageRecord> =
            cache.get("cvss", SCOPE).await.unwrap();
        assert_eq!(stored[&ids[0]].score, Some(7.5));
    }

    #[tokio::test]
    async fn test_failed_ids_fall_back_individually() {
        let source = Arc::new(
            MockScore::new(Stage::Epss, 0.4).failing_for(vec!["CVE-2024-0002"]),
        );
        let agent = ScoreAgent::new(source, cache(), AgentSettings::default());
        let ids = [id("CVE-2024-0001"), id("CVE-2024-0002")];

        let scores = agent
            .execute(SCOPE, &ids, &BTreeSet::new(), false, &Progress::noop())
            .await;

        assert!(!scores[&ids[0]].is_fallback());
        assert!(scores[&ids[1]].is_fallback());
        assert_eq!(scores[&ids[1]].value().score, None);
    }

    #[tokio::test]
    async fn test_placeholders_skip_the_source() {
        let source = Arc::new(MockScore::new(Stage::Epss, 0.4));
        let agent = ScoreAgent::new(source.clone(), cache(), AgentSettings::default());
        let placeholder = fallback::placeholder_id("pkg-a");
        let placeholders: BTreeSet<_> = [placeholder.clone()].into_iter().collect();

        let scores = agent
            .execute(SCOPE, &[placeholder.clone()], &placeholders, false, &Progress::noop())
            .await;

        assert_eq!(source.calls(), 0);
        assert!(scores[&placeholder].is_fallback());
    }
}
