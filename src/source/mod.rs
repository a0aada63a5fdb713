//! Ports to the external data and AI sources the pipeline consumes.
//!
//! Each stage talks to one trait object. Adapters own their retry policy and
//! raise a [`SourceError`] on any non-2xx, timeout or transport failure; the
//! stage agents turn those errors into fallback data.

mod agent;
mod epss;
mod http;
mod nvd;
mod osv;

pub use agent::{AgentEnrichmentSource, AgentSynthesisSource};
pub use epss::{EpssScoreSource, DEFAULT_EPSS_URL};
pub use http::{http_client, RetryPolicy};
pub use nvd::{NvdCvssSource, DEFAULT_NVD_URL};
pub use osv::{OsvMappingSource, DEFAULT_OSV_URL};

use crate::error::SourceError;
use crate::model::{AnalysisRequest, RiskLevel, Stage, ThreatCase, VulnerabilityId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Resolves a package into the vulnerabilities that affect it.
#[async_trait]
pub trait MappingSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_ids(
        &self,
        request: &AnalysisRequest,
    ) -> Result<Vec<VulnerabilityId>, SourceError>;
}

/// A score reported by a [`ScoreSource`], with source-specific extras
/// (percentile, CVSS vector and so on).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReading {
    pub score: Option<f64>,
    #[serde(default)]
    pub auxiliary: Map<String, Value>,
}

impl ScoreReading {
    pub fn new(score: f64) -> Self {
        Self {
            score: Some(score),
            auxiliary: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.auxiliary.insert(key.to_string(), value.into());
        self
    }
}

#[async_trait]
pub trait ScoreSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Which scoring stage this source feeds.
    fn stage(&self) -> Stage;

    async fn fetch_score(&self, id: &VulnerabilityId) -> Result<ScoreReading, SourceError>;
}

#[async_trait]
pub trait EnrichmentSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_cases(
        &self,
        request: &AnalysisRequest,
        id: &VulnerabilityId,
    ) -> Result<Vec<ThreatCase>, SourceError>;
}

/// Everything the synthesis source is given about one vulnerability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisInput {
    pub vulnerability_id: VulnerabilityId,
    pub subject: String,
    pub version_selector: String,
    pub ecosystem: String,
    pub epss_score: Option<f64>,
    pub cvss_score: Option<f64>,
    pub cases: Vec<ThreatCase>,
}

/// The part of a synthesis produced by the external source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisDraft {
    pub risk_level: RiskLevel,
    pub recommendations: Vec<String>,
    pub summary: String,
}

#[async_trait]
pub trait SynthesisSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn synthesize(&self, input: &SynthesisInput) -> Result<SynthesisDraft, SourceError>;
}
