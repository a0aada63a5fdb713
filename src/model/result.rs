use super::{AnalysisRequest, Stage, StageRecord, Synthesis, VulnerabilityId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Everything the pipeline produced for one vulnerability, in stage order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VulnerabilityReport {
    pub vulnerability_id: VulnerabilityId,
    pub stage_records: Vec<StageRecord>,
    pub synthesis: Synthesis,
}

impl VulnerabilityReport {
    pub fn record(&self, stage: Stage) -> Option<&StageRecord> {
        self.stage_records.iter().find(|r| r.stage == stage)
    }

    pub fn fallback_count(&self) -> usize {
        self.stage_records.iter().filter(|r| r.is_fallback()).count()
    }
}

/// Durable output of one orchestrator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub request: AnalysisRequest,
    pub reports: Vec<VulnerabilityReport>,
    pub generated_at: DateTime<Utc>,
}

impl PipelineResult {
    pub fn new(request: AnalysisRequest, reports: Vec<VulnerabilityReport>) -> Self {
        Self {
            request,
            reports,
            generated_at: Utc::now(),
        }
    }

    pub fn contains(&self, id: &VulnerabilityId) -> bool {
        self.reports.iter().any(|r| &r.vulnerability_id == id)
    }

    /// True when every record and synthesis came from fallback data.
    pub fn is_fully_degraded(&self) -> bool {
        self.reports.iter().all(|r| {
            r.fallback_count() == r.stage_records.len()
                && r.synthesis.source == super::SourceKind::Fallback
        })
    }
}
