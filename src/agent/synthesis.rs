use super::{call_with_fallback, AgentSettings, Progress};
use crate::cache::KeyedCache;
use crate::error::SourceError;
use crate::fallback;
use crate::model::{SourceKind, Stage, StageOutcome, Synthesis};
use crate::source::{SynthesisInput, SynthesisSource};
use chrono::Utc;
use std::sync::Arc;

const NAMESPACE: &str = "synthesis";

/// Combines mapping, scores and threat cases into a final assessment.
pub struct SynthesisAgent {
    source: Arc<dyn SynthesisSource>,
    cache: Arc<KeyedCache>,
    settings: AgentSettings,
}

impl SynthesisAgent {
    pub fn new(
        source: Arc<dyn SynthesisSource>,
        cache: Arc<KeyedCache>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            source,
            cache,
            settings,
        }
    }

    fn cache_key(input: &SynthesisInput) -> String {
        format!(
            "{}:{}:{}:{}",
            input.ecosystem, input.subject, input.version_selector, input.vulnerability_id
        )
    }

    pub async fn execute(
        &self,
        input: &SynthesisInput,
        placeholder: bool,
        force: bool,
        progress: &Progress,
    ) -> StageOutcome<Synthesis> {
        let id = &input.vulnerability_id;
        if placeholder {
            return StageOutcome::Fallback(fallback::synthesis(id));
        }

        let key = Self::cache_key(input);
        if !force {
            if let Some(synthesis) = self.cache.get::<Synthesis>(NAMESPACE, &key).await {
                progress.emit(Stage::Synthesis, format!("cache hit for {}", id));
                return synthesis.into();
            }
        }

        progress.emit(
            Stage::Synthesis,
            format!("querying {} for {}", self.source.name(), id),
        );
        let call = async {
            let draft = self.source.synthesize(input).await?;
            Ok::<_, SourceError>(Synthesis {
                vulnerability_id: id.clone(),
                risk_level: draft.risk_level,
                recommendations: draft.recommendations,
                summary: draft.summary,
                source: SourceKind::Live,
                generated_at: Utc::now(),
            })
        };
        let synthesis = call_with_fallback(
            Stage::Synthesis,
            progress,
            self.settings.call_timeout,
            call,
            || fallback::synthesis(id),
        )
        .await
        .into_inner();

        self.cache
            .set(NAMESPACE, &key, &synthesis, self.settings.cache_ttl)
            .await;
        synthesis.into()
    }
}
