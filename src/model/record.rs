use super::VulnerabilityId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A step of the pipeline, one per external data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Mapping,
    Epss,
    Cvss,
    Enrichment,
    Synthesis,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Mapping => "mapping",
            Stage::Epss => "epss",
            Stage::Cvss => "cvss",
            Stage::Enrichment => "enrichment",
            Stage::Synthesis => "synthesis",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Mapping => "MAPPING",
            Stage::Epss => "EPSS",
            Stage::Cvss => "CVSS",
            Stage::Enrichment => "ENRICH",
            Stage::Synthesis => "SYNTHESIZE",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Where a record's data came from.
///
/// Sources that report "not found" or "no data" are treated the same as
/// failed calls and produce `Fallback` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Live,
    Fallback,
}

/// Result of a stage: either what the source returned, or the substitute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "lowercase")]
pub enum StageOutcome<T> {
    Live(T),
    Fallback(T),
}

impl<T> StageOutcome<T> {
    pub fn is_fallback(&self) -> bool {
        matches!(self, StageOutcome::Fallback(_))
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            StageOutcome::Live(_) => SourceKind::Live,
            StageOutcome::Fallback(_) => SourceKind::Fallback,
        }
    }

    pub fn value(&self) -> &T {
        match self {
            StageOutcome::Live(value) | StageOutcome::Fallback(value) => value,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            StageOutcome::Live(value) | StageOutcome::Fallback(value) => value,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StageOutcome<U> {
        match self {
            StageOutcome::Live(value) => StageOutcome::Live(f(value)),
            StageOutcome::Fallback(value) => StageOutcome::Fallback(f(value)),
        }
    }
}

impl From<StageRecord> for StageOutcome<StageRecord> {
    fn from(record: StageRecord) -> Self {
        match record.source {
            SourceKind::Live => StageOutcome::Live(record),
            SourceKind::Fallback => StageOutcome::Fallback(record),
        }
    }
}

impl From<Synthesis> for StageOutcome<Synthesis> {
    fn from(synthesis: Synthesis) -> Self {
        match synthesis.source {
            SourceKind::Live => StageOutcome::Live(synthesis),
            SourceKind::Fallback => StageOutcome::Fallback(synthesis),
        }
    }
}

/// Output of one data source for one vulnerability.
///
/// Records are never mutated; a refresh produces a new record with the same
/// `(vulnerability_id, stage)` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub vulnerability_id: VulnerabilityId,
    pub stage: Stage,
    pub score: Option<f64>,
    #[serde(default)]
    pub auxiliary: Map<String, Value>,
    pub source: SourceKind,
    pub provider: String,
    pub collected_at: DateTime<Utc>,
}

impl StageRecord {
    pub fn new(
        vulnerability_id: VulnerabilityId,
        stage: Stage,
        score: Option<f64>,
        source: SourceKind,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            vulnerability_id,
            stage,
            score,
            auxiliary: Map::new(),
            source,
            provider: provider.into(),
            collected_at: Utc::now(),
        }
    }

    pub fn with_auxiliary(mut self, key: impl Into<String>, value: Value) -> Self {
        self.auxiliary.insert(key.into(), value);
        self
    }

    pub fn is_fallback(&self) -> bool {
        self.source == SourceKind::Fallback
    }

    /// Threat cases attached by the enrichment stage, if any.
    pub fn cases(&self) -> Vec<ThreatCase> {
        self.auxiliary
            .get("cases")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }
}

/// A publicly reported exploitation or incident for a vulnerability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatCase {
    pub source: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    Critical,
    High,
    Medium,
    Low,
    Unknown,
}

impl RiskLevel {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "critical" => RiskLevel::Critical,
            "high" => RiskLevel::High,
            "medium" | "moderate" => RiskLevel::Medium,
            "low" => RiskLevel::Low,
            _ => RiskLevel::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Critical => "Critical",
            RiskLevel::High => "High",
            RiskLevel::Medium => "Medium",
            RiskLevel::Low => "Low",
            RiskLevel::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final assessment combining mapping, scores and enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Synthesis {
    pub vulnerability_id: VulnerabilityId,
    pub risk_level: RiskLevel,
    pub recommendations: Vec<String>,
    pub summary: String,
    pub source: SourceKind,
    pub generated_at: DateTime<Utc>,
}
