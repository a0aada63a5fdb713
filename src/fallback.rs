//! Deterministic placeholder data for stages whose live call failed.
//!
//! Everything here is pure: the same input always yields the same output
//! (apart from timestamps), so repeated fallbacks are stable and cacheable.

use crate::model::{
    RiskLevel, SourceKind, Stage, StageRecord, Synthesis, ThreatCase, VulnerabilityId,
};
use chrono::Utc;
use serde_json::Value;

/// Provider name recorded on every fallback record.
pub const PROVIDER: &str = "fallback";

const PLACEHOLDER_YEAR: u32 = 2025;

fn fnv1a(input: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    input.bytes().fold(OFFSET, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(PRIME)
    })
}

/// The single synthetic identifier used when mapping yields nothing.
pub fn placeholder_id(subject: &str) -> VulnerabilityId {
    let suffix = fnv1a(subject) % 10_000;
    VulnerabilityId::from_trusted(format!("CVE-{}-{:04}", PLACEHOLDER_YEAR, suffix))
}

pub fn placeholder_ids(subject: &str) -> Vec<VulnerabilityId> {
    vec![placeholder_id(subject)]
}

/// Mapping record for an identifier that did not come from a live lookup.
pub fn mapping_record(id: &VulnerabilityId, subject: &str, ecosystem: &str) -> StageRecord {
    StageRecord::new(id.clone(), Stage::Mapping, None, SourceKind::Fallback, PROVIDER)
        .with_auxiliary("subject", Value::from(subject))
        .with_auxiliary("ecosystem", Value::from(ecosystem))
        .with_auxiliary("placeholder", Value::Bool(true))
}

/// Score records never carry a made-up number; the score is left empty.
pub fn score_record(id: &VulnerabilityId, stage: Stage) -> StageRecord {
    StageRecord::new(id.clone(), stage, None, SourceKind::Fallback, PROVIDER)
}

pub fn threat_cases(id: &VulnerabilityId) -> Vec<ThreatCase> {
    vec![ThreatCase {
        source: "fallback://enrichment".to_string(),
        title: format!("No threat intelligence available for {}", id),
        date: None,
        summary: "The enrichment source could not be reached; review manually.".to_string(),
    }]
}

pub fn enrichment_record(id: &VulnerabilityId) -> StageRecord {
    let cases = serde_json::to_value(threat_cases(id)).unwrap_or(Value::Null);
    StageRecord::new(id.clone(), Stage::Enrichment, None, SourceKind::Fallback, PROVIDER)
        .with_auxiliary("cases", cases)
}

pub fn synthesis(id: &VulnerabilityId) -> Synthesis {
    Synthesis {
        vulnerability_id: id.clone(),
        risk_level: RiskLevel::Medium,
        recommendations: vec![
            "Upgrade the package to the latest release.".to_string(),
            "Enable heightened monitoring until a manual review is done.".to_string(),
        ],
        summary: "Automated analysis unavailable; manual review required.".to_string(),
        source: SourceKind::Fallback,
        generated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_is_deterministic() {
        let a = placeholder_id("pkg-a");
        let b = placeholder_id("pkg-a");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "CVE-2025-7919");
        assert_eq!(a.as_str().len(), "CVE-2025-0000".len());
        assert_ne!(placeholder_id("pkg-a"), placeholder_id("pkg-b"));
        assert!(VulnerabilityId::parse(a.as_str()).is_ok());
    }

    #[test]
    fn test_placeholder_ids_has_one_entry() {
        assert_eq!(placeholder_ids("").len(), 1);
    }

    #[test]
    fn test_fallback_records_are_marked() {
        let id = placeholder_id("pkg-a");
        for record in [
            mapping_record(&id, "pkg-a", "x"),
            score_record(&id, Stage::Epss),
            score_record(&id, Stage::Cvss),
            enrichment_record(&id),
        ] {
            assert_eq!(record.source, SourceKind::Fallback);
            assert_eq!(record.provider, PROVIDER);
            assert!(record.score.is_none());
        }
        assert_eq!(enrichment_record(&id).cases().len(), 1);
    }

    #[test]
    fn test_fallback_synthesis() {
        let id = placeholder_id("pkg-a");
        let synthesis = synthesis(&id);
        assert_eq!(synthesis.risk_level, RiskLevel::Medium);
        assert_eq!(synthesis.source, SourceKind::Fallback);
        assert!(!synthesis.recommendations.is_empty());
    }
}
