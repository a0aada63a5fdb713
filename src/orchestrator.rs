//! Runs the stage agents for one request and assembles the result.
//!
//! ```text
//! INIT -> MAPPING -> SCORING (EPSS || CVSS) -> PER_ITEM (ENRICH -> SYNTHESIZE) -> PERSIST -> DONE
//! ```
//!
//! Stage failures never abort a run; they surface as fallback records. Each
//! stage's output is written to the store as soon as it exists, and store
//! failures are logged and otherwise ignored. The only error a run can return
//! is an invalid request.

use crate::agent::{
    AgentSettings, EnrichmentAgent, MappingAgent, Progress, ScoreAgent, SynthesisAgent,
};
use crate::cache::KeyedCache;
use crate::error::{PipelineError, StoreError};
use crate::fallback;
use crate::model::{
    AnalysisRequest, PipelineResult, Stage, StageOutcome, StageRecord, Synthesis,
    VulnerabilityId, VulnerabilityReport,
};
use crate::source::{
    EnrichmentSource, MappingSource, ScoreSource, SynthesisInput, SynthesisSource,
};
use crate::store::ResultStore;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    Mapping,
    Scoring,
    PerItem,
    Persist,
    Done,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Init => "INIT",
            PipelineState::Mapping => "MAPPING",
            PipelineState::Scoring => "SCORING",
            PipelineState::PerItem => "PER_ITEM",
            PipelineState::Persist => "PERSIST",
            PipelineState::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// The external sources one orchestrator talks to.
#[derive(Clone)]
pub struct PipelineSources {
    pub mapping: Arc<dyn MappingSource>,
    pub epss: Arc<dyn ScoreSource>,
    pub cvss: Arc<dyn ScoreSource>,
    pub enrichment: Arc<dyn EnrichmentSource>,
    pub synthesis: Arc<dyn SynthesisSource>,
}

pub struct PipelineOrchestrator {
    mapping: MappingAgent,
    epss: ScoreAgent,
    cvss: ScoreAgent,
    enrichment: EnrichmentAgent,
    synthesis: SynthesisAgent,
    store: Option<Arc<dyn ResultStore>>,
    settings: AgentSettings,
}

/// Per-run data shared by the per-item tasks.
struct RunContext<'a> {
    request: &'a AnalysisRequest,
    force: bool,
    progress: &'a Progress,
    placeholders: &'a BTreeSet<VulnerabilityId>,
    epss: &'a BTreeMap<VulnerabilityId, StageOutcome<StageRecord>>,
    cvss: &'a BTreeMap<VulnerabilityId, StageOutcome<StageRecord>>,
}

impl PipelineOrchestrator {
    pub fn new(sources: PipelineSources, cache: Arc<KeyedCache>, settings: AgentSettings) -> Self {
        Self {
            mapping: MappingAgent::new(sources.mapping, cache.clone(), settings),
            epss: ScoreAgent::new(sources.epss, cache.clone(), settings),
            cvss: ScoreAgent::new(sources.cvss, cache.clone(), settings),
            enrichment: EnrichmentAgent::new(sources.enrichment, cache.clone(), settings),
            synthesis: SynthesisAgent::new(sources.synthesis, cache, settings),
            store: None,
            settings,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn advance(&self, state: &mut PipelineState, next: PipelineState, request: &AnalysisRequest) {
        debug!(request = %request, from = %state, to = %next, "pipeline state change");
        *state = next;
    }

    async fn persist<F>(&self, what: &str, write: impl FnOnce(Arc<dyn ResultStore>) -> F)
    where
        F: Future<Output = Result<(), StoreError>>,
    {
        let Some(store) = self.store.clone() else {
            return;
        };
        match tokio::time::timeout(self.settings.call_timeout, write(store)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(what, error = %e, "failed to persist, continuing"),
            Err(_) => warn!(what, "persisting timed out, continuing"),
        }
    }

    async fn persist_stage(&self, record: &StageRecord) {
        self.persist("stage record", |store| async move {
            store.upsert_stage(record).await
        })
        .await;
    }

    async fn persist_synthesis(&self, synthesis: &Synthesis) {
        self.persist("synthesis", |store| async move {
            store.upsert_synthesis(synthesis).await
        })
        .await;
    }

    fn score_record(
        scores: &BTreeMap<VulnerabilityId, StageOutcome<StageRecord>>,
        id: &VulnerabilityId,
        stage: Stage,
    ) -> StageRecord {
        scores
            .get(id)
            .map(|outcome| outcome.value().clone())
            .unwrap_or_else(|| fallback::score_record(id, stage))
    }

    async fn process_item(
        &self,
        ctx: &RunContext<'_>,
        mapping: StageRecord,
    ) -> VulnerabilityReport {
        let id = mapping.vulnerability_id.clone();
        let placeholder = ctx.placeholders.contains(&id);

        let enrichment = self
            .enrichment
            .execute(ctx.request, &id, placeholder, ctx.force, ctx.progress)
            .await
            .into_inner();
        self.persist_stage(&enrichment).await;

        let epss = Self::score_record(ctx.epss, &id, Stage::Epss);
        let cvss = Self::score_record(ctx.cvss, &id, Stage::Cvss);

        let input = SynthesisInput {
            vulnerability_id: id.clone(),
            subject: ctx.request.subject.clone(),
            version_selector: ctx.request.version_selector.clone(),
            ecosystem: ctx.request.ecosystem.clone(),
            epss_score: epss.score,
            cvss_score: cvss.score,
            cases: enrichment.cases(),
        };
        let synthesis = self
            .synthesis
            .execute(&input, placeholder, ctx.force, ctx.progress)
            .await
            .into_inner();
        self.persist_synthesis(&synthesis).await;

        VulnerabilityReport {
            vulnerability_id: id,
            stage_records: vec![mapping, epss, cvss, enrichment],
            synthesis,
        }
    }

    /// Runs the full pipeline for `request`.
    pub async fn run(
        &self,
        request: &AnalysisRequest,
        progress: &Progress,
    ) -> Result<PipelineResult, PipelineError> {
        let mut state = PipelineState::Init;
        request.validate()?;
        let force = request.force_refresh;
        let scope = request.scope_key();
        info!(request = %request, force, "pipeline started");

        self.advance(&mut state, PipelineState::Mapping, request);
        let mapping = self.mapping.execute(request, force, progress).await;
        let mapping_fell_back = mapping.is_fallback();

        // Duplicates collapse onto the first occurrence.
        let mut seen = BTreeSet::new();
        let mapping_records: Vec<StageRecord> = mapping
            .into_inner()
            .into_iter()
            .filter(|record| seen.insert(record.vulnerability_id.clone()))
            .collect();
        for record in &mapping_records {
            self.persist_stage(record).await;
        }

        let ids: Vec<VulnerabilityId> = mapping_records
            .iter()
            .map(|record| record.vulnerability_id.clone())
            .collect();
        let placeholders: BTreeSet<VulnerabilityId> = if mapping_fell_back {
            ids.iter().cloned().collect()
        } else {
            BTreeSet::new()
        };

        self.advance(&mut state, PipelineState::Scoring, request);
        let (epss, cvss) = futures::join!(
            self.epss.execute(&scope, &ids, &placeholders, force, progress),
            self.cvss.execute(&scope, &ids, &placeholders, force, progress),
        );
        for outcome in epss.values().chain(cvss.values()) {
            self.persist_stage(outcome.value()).await;
        }

        self.advance(&mut state, PipelineState::PerItem, request);
        let ctx = RunContext {
            request,
            force,
            progress,
            placeholders: &placeholders,
            epss: &epss,
            cvss: &cvss,
        };
        let reports: Vec<VulnerabilityReport> = stream::iter(mapping_records)
            .map(|mapping| self.process_item(&ctx, mapping))
            .buffered(self.settings.concurrency.max(1))
            .collect()
            .await;

        self.advance(&mut state, PipelineState::Persist, request);
        let result = PipelineResult::new(request.clone(), reports);
        self.persist("pipeline result", |store| {
            let result = &result;
            async move { store.save_result(result).await }
        })
        .await;

        self.advance(&mut state, PipelineState::Done, request);
        let degraded: usize = result.reports.iter().map(|r| r.fallback_count()).sum();
        info!(
            request = %request,
            vulnerabilities = result.reports.len(),
            fallback_records = degraded,
            "pipeline finished"
        );
        Ok(result)
    }
}

impl fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("persistent", &self.store.is_some())
            .field("settings", &self.settings)
            .finish()
    }
}
