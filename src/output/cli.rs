use crate::model::{
    DeadLetterRecord, PipelineResult, RiskLevel, SourceKind, Stage, StageRecord,
    VulnerabilityReport,
};
use anyhow::Result;
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct ReportRow {
    #[tabled(rename = "Risk")]
    risk: String,
    #[tabled(rename = "Vulnerability")]
    id: String,
    #[tabled(rename = "EPSS")]
    epss: String,
    #[tabled(rename = "CVSS")]
    cvss: String,
    #[tabled(rename = "Cases")]
    cases: String,
    #[tabled(rename = "Degraded")]
    degraded: String,
}

#[derive(Tabled)]
struct DeadLetterRow {
    #[tabled(rename = "Job")]
    job_id: String,
    #[tabled(rename = "Subject")]
    subject: String,
    #[tabled(rename = "Failed At")]
    failed_at: String,
    #[tabled(rename = "Error")]
    error: String,
}

pub fn print_cli_table(result: &PipelineResult) -> Result<()> {
    println!();
    println!(
        "Analysis of {} completed at: {}",
        result.request,
        result.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!();

    if result.reports.is_empty() {
        println!("No vulnerabilities reported.");
        return Ok(());
    }

    let mut reports: Vec<&VulnerabilityReport> = result.reports.iter().collect();
    reports.sort_by_key(|r| risk_rank(r.synthesis.risk_level));

    let rows: Vec<ReportRow> = reports.iter().map(|r| report_row(r)).collect();
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);

    for report in &reports {
        print_assessment(report);
    }

    println!();
    print_summary(result);
    Ok(())
}

fn report_row(report: &VulnerabilityReport) -> ReportRow {
    let degraded: Vec<&str> = report
        .stage_records
        .iter()
        .filter(|r| r.is_fallback())
        .map(|r| r.stage.label())
        .chain(
            (report.synthesis.source == SourceKind::Fallback)
                .then(|| Stage::Synthesis.label()),
        )
        .collect();

    ReportRow {
        risk: format_risk(report.synthesis.risk_level),
        id: report.vulnerability_id.to_string(),
        epss: format_score(report.record(Stage::Epss), 3),
        cvss: format_score(report.record(Stage::Cvss), 1),
        cases: report
            .record(Stage::Enrichment)
            .map(|r| r.cases().len().to_string())
            .unwrap_or_else(|| "-".to_string()),
        degraded: if degraded.is_empty() {
            "-".to_string()
        } else {
            degraded.join(", ")
        },
    }
}

fn print_assessment(report: &VulnerabilityReport) {
    let synthesis = &report.synthesis;
    println!();
    println!("{} ({})", report.vulnerability_id, synthesis.risk_level);
    if !synthesis.summary.is_empty() {
        println!("  {}", truncate(&synthesis.summary, 200));
    }
    for recommendation in &synthesis.recommendations {
        println!("  - {}", recommendation);
    }
}

fn print_summary(result: &PipelineResult) {
    let total = result.reports.len();
    let critical = count_risk(result, RiskLevel::Critical);
    let high = count_risk(result, RiskLevel::High);
    let fallbacks: usize = result.reports.iter().map(|r| r.fallback_count()).sum();

    println!(
        "Summary: {} vulnerabilities ({} critical, {} high), {} degraded stage results",
        total, critical, high, fallbacks
    );
    if result.is_fully_degraded() {
        println!("Every stage fell back to placeholder data; live sources were unavailable.");
    }
}

pub fn print_dead_letters(records: &[DeadLetterRecord]) -> Result<()> {
    if records.is_empty() {
        println!("Dead-letter list is empty.");
        return Ok(());
    }

    let rows: Vec<DeadLetterRow> = records
        .iter()
        .map(|r| DeadLetterRow {
            job_id: r.job_id().unwrap_or("-").to_string(),
            subject: r.subject().unwrap_or("-").to_string(),
            failed_at: r.error_timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            error: truncate(&r.error_message, 60),
        })
        .collect();

    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
    Ok(())
}

fn count_risk(result: &PipelineResult, level: RiskLevel) -> usize {
    result
        .reports
        .iter()
        .filter(|r| r.synthesis.risk_level == level)
        .count()
}

fn risk_rank(level: RiskLevel) -> u8 {
    match level {
        RiskLevel::Critical => 0,
        RiskLevel::High => 1,
        RiskLevel::Medium => 2,
        RiskLevel::Low => 3,
        RiskLevel::Unknown => 4,
    }
}

fn format_risk(level: RiskLevel) -> String {
    match level {
        RiskLevel::Critical => "\x1b[31mCRITICAL\x1b[0m".to_string(),
        RiskLevel::High => "\x1b[91mHIGH\x1b[0m".to_string(),
        RiskLevel::Medium => "\x1b[33mMEDIUM\x1b[0m".to_string(),
        RiskLevel::Low => "\x1b[32mLOW\x1b[0m".to_string(),
        RiskLevel::Unknown => "UNKNOWN".to_string(),
    }
}

fn format_score(record: Option<&StageRecord>, precision: usize) -> String {
    match record.and_then(|r| r.score) {
        Some(score) => format!("{:.*}", precision, score),
        None => "-".to_string(),
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback;
    use crate::model::{AnalysisRequest, VulnerabilityId};

    fn report(score: Option<f64>) -> VulnerabilityReport {
        let id = VulnerabilityId::parse("CVE-2021-23337").unwrap();
        let mut epss = fallback::score_record(&id, Stage::Epss);
        if let Some(score) = score {
            epss = StageRecord::new(id.clone(), Stage::Epss, Some(score), SourceKind::Live, "epss");
        }
        VulnerabilityReport {
            vulnerability_id: id.clone(),
            stage_records: vec![epss],
            synthesis: fallback::synthesis(&id),
        }
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 6), "abc...");
        assert_eq!(truncate("ééééééé", 5), "éé...");
    }

    #[test]
    fn test_row_marks_degraded_stages() {
        let row = report_row(&report(None));
        assert_eq!(row.epss, "-");
        assert!(row.degraded.contains("EPSS"));
        assert!(row.degraded.contains("SYNTHESIZE"));

        let row = report_row(&report(Some(0.97314)));
        assert_eq!(row.epss, "0.973");
        assert!(!row.degraded.contains("EPSS"));
    }

    #[test]
    fn test_print_handles_empty_result() {
        let result = PipelineResult::new(AnalysisRequest::new("lodash", "latest", "npm"), Vec::new());
        assert!(print_cli_table(&result).is_ok());
    }
}
