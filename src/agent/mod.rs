//! Stage agents: one external call each, wrapped in cache-check,
//! call-with-fallback and cache-store.
//!
//! Agents never fail. A source error or timeout is logged, reported on the
//! progress channel and replaced by the deterministic output of
//! [`crate::fallback`]; fallback results are cached like live ones until the
//! next forced refresh.

mod enrichment;
mod mapping;
mod score;
mod synthesis;

pub use enrichment::EnrichmentAgent;
pub use mapping::MappingAgent;
pub use score::ScoreAgent;
pub use synthesis::SynthesisAgent;

use crate::error::SourceError;
use crate::model::{Stage, StageOutcome};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Tuning shared by every agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentSettings {
    /// TTL for cached stage results.
    pub cache_ttl: Duration,
    /// Upper bound on one stage call, retries included.
    pub call_timeout: Duration,
    /// Concurrent lookups in batch stages.
    pub concurrency: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(3600),
            call_timeout: Duration::from_secs(90),
            concurrency: 8,
        }
    }
}

type ProgressFn = dyn Fn(Stage, &str) + Send + Sync;

/// Fire-and-forget observer for `(stage, message)` events.
///
/// The callback runs inline and must not block. A panicking callback is
/// caught and logged; it never reaches the pipeline.
#[derive(Clone, Default)]
pub struct Progress {
    callback: Option<Arc<ProgressFn>>,
}

impl Progress {
    pub fn new(callback: impl Fn(Stage, &str) + Send + Sync + 'static) -> Self {
        Self {
            callback: Some(Arc::new(callback)),
        }
    }

    pub fn noop() -> Self {
        Self::default()
    }

    pub fn emit(&self, stage: Stage, message: impl AsRef<str>) {
        let message = message.as_ref();
        debug!(stage = %stage, "{}", message);

        if let Some(callback) = &self.callback {
            if catch_unwind(AssertUnwindSafe(|| callback(stage, message))).is_err() {
                warn!(stage = %stage, "progress callback panicked");
            }
        }
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("attached", &self.callback.is_some())
            .finish()
    }
}

/// Runs one external call under a timeout and substitutes `fallback` on any
/// failure.
pub async fn call_with_fallback<T, Fut>(
    stage: Stage,
    progress: &Progress,
    timeout: Duration,
    call: Fut,
    fallback: impl FnOnce() -> T,
) -> StageOutcome<T>
where
    Fut: Future<Output = Result<T, SourceError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => StageOutcome::Live(value),
        Ok(Err(e)) => {
            warn!(stage = %stage, error = %e, "stage call failed, using fallback");
            progress.emit(stage, format!("{} failed ({}), using fallback", stage, e));
            StageOutcome::Fallback(fallback())
        }
        Err(_) => {
            warn!(stage = %stage, ?timeout, "stage call timed out, using fallback");
            progress.emit(
                stage,
                format!("{} timed out after {:?}, using fallback", stage, timeout),
            );
            StageOutcome::Fallback(fallback())
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable sources shared by the agent and orchestrator tests.

    use crate::error::SourceError;
    use crate::model::{AnalysisRequest, Stage, ThreatCase, VulnerabilityId};
    use crate::source::{
        EnrichmentSource, MappingSource, ScoreReading, ScoreSource, SynthesisDraft,
        SynthesisInput, SynthesisSource,
    };
    use crate::model::RiskLevel;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub fn id(value: &str) -> VulnerabilityId {
        VulnerabilityId::parse(value).unwrap()
    }

    pub fn outage(service: &str) -> SourceError {
        SourceError::Transport {
            service: service.to_string(),
            message: "connection refused".to_string(),
        }
    }

    pub struct MockMapping {
        pub ids: Vec<&'static str>,
        pub fail: bool,
        pub calls: AtomicUsize,
    }

    impl MockMapping {
        pub fn returning(ids: Vec<&'static str>) -> Self {
            Self {
                ids,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn failing() -> Self {
            Self {
                ids: Vec::new(),
                fail: true,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MappingSource for MockMapping {
        fn name(&self) -> &'static str {
            "mock-mapping"
        }

        async fn fetch_ids(
            &self,
            _request: &AnalysisRequest,
        ) -> Result<Vec<VulnerabilityId>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(outage("mapping"));
            }
            Ok(self.ids.iter().map(|value| id(value)).collect())
        }
    }

    /// Returns a fixed score for every id not listed in `failing`, and
    /// records which ids were requested.
    pub struct MockScore {
        pub stage: Stage,
        pub score: f64,
        pub failing: Vec<&'static str>,
        pub requested: Mutex<Vec<String>>,
    }

    impl MockScore {
        pub fn new(stage: Stage, score: f64) -> Self {
            Self {
                stage,
                score,
                failing: Vec::new(),
                requested: Mutex::new(Vec::new()),
            }
        }

        pub fn failing_for(mut self, ids: Vec<&'static str>) -> Self {
            self.failing = ids;
            self
        }

        pub fn calls(&self) -> usize {
            self.requested.lock().unwrap().len()
        }

        pub fn requested(&self) -> Vec<String> {
            let mut requested = self.requested.lock().unwrap().clone();
            requested.sort();
            requested
        }
    }

    #[async_trait]
    impl ScoreSource for MockScore {
        fn name(&self) -> &'static str {
            "mock-score"
        }

        fn stage(&self) -> Stage {
            self.stage
        }

        async fn fetch_score(&self, id: &VulnerabilityId) -> Result<ScoreReading, SourceError> {
            self.requested.lock().unwrap().push(id.to_string());
            if self.failing.contains(&id.as_str()) {
                return Err(outage("score"));
            }
            Ok(ScoreReading::new(self.score))
        }
    }

    pub struct MockEnrichment {
        pub fail: bool,
        pub calls: AtomicUsize,
    }

    impl MockEnrichment {
        pub fn new(fail: bool) -> Self {
            Self {
                fail,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EnrichmentSource for MockEnrichment {
        fn name(&self) -> &'static str {
            "mock-enrichment"
        }

        async fn fetch_cases(
            &self,
            request: &AnalysisRequest,
            id: &VulnerabilityId,
        ) -> Result<Vec<ThreatCase>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(outage("enrichment"));
            }
            Ok(vec![ThreatCase {
                source: format!("https://intel.example/{}", id),
                title: format!("{} exploited via {}", id, request.subject),
                date: None,
                summary: "observed in the wild".to_string(),
            }])
        }
    }

    /// Echoes what it was given so tests can check the inputs arrived.
    pub struct MockSynthesis {
        pub fail: bool,
        pub inputs: Mutex<Vec<SynthesisInput>>,
    }

    impl MockSynthesis {
        pub fn new(fail: bool) -> Self {
            Self {
                fail,
                inputs: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> usize {
            self.inputs.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SynthesisSource for MockSynthesis {
        fn name(&self) -> &'static str {
            "mock-synthesis"
        }

        async fn synthesize(&self, input: &SynthesisInput) -> Result<SynthesisDraft, SourceError> {
            self.inputs.lock().unwrap().push(input.clone());
            if self.fail {
                return Err(outage("synthesis"));
            }
            Ok(SynthesisDraft {
                risk_level: RiskLevel::High,
                recommendations: vec![format!("Upgrade {}", input.subject)],
                summary: format!("{} cases considered", input.cases.len()),
            })
        }
    }
}
