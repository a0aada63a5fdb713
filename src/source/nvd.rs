use super::http::send_json;
use super::{RetryPolicy, ScoreReading, ScoreSource};
use crate::error::SourceError;
use crate::model::{Stage, VulnerabilityId};
use async_trait::async_trait;
use serde::Deserialize;

const SERVICE: &str = "nvd";

pub const DEFAULT_NVD_URL: &str = "https://services.nvd.nist.gov/rest/json/cves/2.0";

/// CVSS v3 base scores from the NVD CVE API.
pub struct NvdCvssSource {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl NvdCvssSource {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry,
        }
    }
}

#[derive(Deserialize)]
struct NvdResponse {
    #[serde(default)]
    vulnerabilities: Vec<NvdItem>,
}

#[derive(Deserialize)]
struct NvdItem {
    cve: NvdCve,
}

#[derive(Deserialize)]
struct NvdCve {
    #[serde(default)]
    metrics: NvdMetrics,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct NvdMetrics {
    #[serde(default)]
    cvss_metric_v31: Vec<NvdMetric>,
    #[serde(default)]
    cvss_metric_v30: Vec<NvdMetric>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NvdMetric {
    cvss_data: CvssData,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CvssData {
    base_score: f64,
    #[serde(default)]
    vector_string: Option<String>,
    #[serde(default)]
    base_severity: Option<String>,
}

fn parse_reading(id: &VulnerabilityId, response: NvdResponse) -> Result<ScoreReading, SourceError> {
    let no_data = || SourceError::NoData {
        service: SERVICE.to_string(),
        query: id.to_string(),
    };

    let item = response.vulnerabilities.into_iter().next().ok_or_else(no_data)?;
    let metrics = item.cve.metrics;
    let data = metrics
        .cvss_metric_v31
        .into_iter()
        .chain(metrics.cvss_metric_v30)
        .map(|metric| metric.cvss_data)
        .next()
        .ok_or_else(no_data)?;

    if !(0.0..=10.0).contains(&data.base_score) {
        return Err(SourceError::Malformed {
            service: SERVICE.to_string(),
            message: format!("cvss base score {} outside [0, 10]", data.base_score),
        });
    }

    let mut reading = ScoreReading::new(data.base_score);
    if let Some(vector) = data.vector_string {
        reading = reading.with("vector", vector);
    }
    if let Some(severity) = data.base_severity {
        reading = reading.with("severity", severity);
    }
    Ok(reading)
}

#[async_trait]
impl ScoreSource for NvdCvssSource {
    fn name(&self) -> &'static str {
        "NVD"
    }

    fn stage(&self) -> Stage {
        Stage::Cvss
    }

    async fn fetch_score(&self, id: &VulnerabilityId) -> Result<ScoreReading, SourceError> {
        if !id.is_cve() {
            return Err(SourceError::NoData {
                service: SERVICE.to_string(),
                query: id.to_string(),
            });
        }

        let response: NvdResponse = self
            .retry
            .run(SERVICE, || {
                send_json(
                    SERVICE,
                    self.client
                        .get(&self.base_url)
                        .query(&[("cveId", id.as_str())]),
                )
            })
            .await?;

        parse_reading(id, response)
    }
}
