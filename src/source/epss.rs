use super::http::send_json;
use super::{RetryPolicy, ScoreReading, ScoreSource};
use crate::error::SourceError;
use crate::model::{Stage, VulnerabilityId};
use async_trait::async_trait;
use serde::Deserialize;

const SERVICE: &str = "epss";

pub const DEFAULT_EPSS_URL: &str = "https://api.first.org/data/v1";

/// Exploit Prediction Scoring System scores from FIRST.
pub struct EpssScoreSource {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl EpssScoreSource {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry,
        }
    }
}

#[derive(Deserialize)]
struct EpssResponse {
    #[serde(default)]
    data: Vec<EpssEntry>,
}

/// FIRST returns numbers as strings.
#[derive(Deserialize)]
struct EpssEntry {
    epss: String,
    #[serde(default)]
    percentile: Option<String>,
    #[serde(default)]
    date: Option<String>,
}

fn parse_reading(id: &VulnerabilityId, response: EpssResponse) -> Result<ScoreReading, SourceError> {
    let entry = response
        .data
        .into_iter()
        .next()
        .ok_or_else(|| SourceError::NoData {
            service: SERVICE.to_string(),
            query: id.to_string(),
        })?;

    let score: f64 = entry.epss.trim().parse().map_err(|_| SourceError::Malformed {
        service: SERVICE.to_string(),
        message: format!("epss value {:?} is not a number", entry.epss),
    })?;
    if !(0.0..=1.0).contains(&score) {
        return Err(SourceError::Malformed {
            service: SERVICE.to_string(),
            message: format!("epss value {} outside [0, 1]", score),
        });
    }

    let mut reading = ScoreReading::new(score);
    if let Some(percentile) = entry.percentile.and_then(|p| p.trim().parse::<f64>().ok()) {
        reading = reading.with("percentile", percentile);
    }
    if let Some(date) = entry.date {
        reading = reading.with("date", date);
    }
    Ok(reading)
}

#[async_trait]
impl ScoreSource for EpssScoreSource {
    fn name(&self) -> &'static str {
        "FIRST EPSS"
    }

    fn stage(&self) -> Stage {
        Stage::Epss
    }

    async fn fetch_score(&self, id: &VulnerabilityId) -> Result<ScoreReading, SourceError> {
        if !id.is_cve() {
            return Err(SourceError::NoData {
                service: SERVICE.to_string(),
                query: id.to_string(),
            });
        }

        let url = format!("{}/epss", self.base_url);
        let response: EpssResponse = self
            .retry
            .run(SERVICE, || {
                send_json(
                    SERVICE,
                    self.client.get(&url).query(&[("cve", id.as_str())]),
                )
            })
            .await?;

        parse_reading(id, response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> VulnerabilityId {
        VulnerabilityId::parse("CVE-2021-44228").unwrap()
    }

    #[test]
    fn test_parse_reading() {
        let response: EpssResponse = serde_json::from_str(
            r#"{"status":"OK","data":[{"cve":"CVE-2021-44228","epss":"0.97565","percentile":"0.99996","date":"2024-03-01"}]}"#,
        )
        .unwrap();

        let reading = parse_reading(&id(), response).unwrap();
        assert_eq!(reading.score, Some(0.97565));
        assert_eq!(reading.auxiliary["percentile"], 0.99996);
        assert_eq!(reading.auxiliary["date"], "2024-03-01");
    }

    #[test]
    fn test_parse_reading_without_data() {
        let response: EpssResponse = serde_json::from_str(r#"{"data":[]}"#).unwrap();
        let err = parse_reading(&id(), response).unwrap_err();
        assert!(matches!(err, SourceError::NoData { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_parse_reading_rejects_out_of_range() {
        let response: EpssResponse =
            serde_json::from_str(r#"{"data":[{"epss":"1.5"}]}"#).unwrap();
        assert!(matches!(
            parse_reading(&id(), response),
            Err(SourceError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_non_cve_ids_have_no_data() {
        let source = EpssScoreSource::new(
            reqwest::Client::new(),
            DEFAULT_EPSS_URL,
            RetryPolicy::none(),
        );
        let ghsa = VulnerabilityId::parse("GHSA-jfh8-c2jp-5v3q").unwrap();
        let err = source.fetch_score(&ghsa).await.unwrap_err();
        assert!(matches!(err, SourceError::NoData { .. }));
    }
}
