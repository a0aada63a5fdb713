//! JSON-over-HTTP adapters for the enrichment and synthesis agents.
//!
//! Prompting and response parsing live behind the agent endpoints; these
//! adapters only carry the data contract.

use super::http::send_json;
use super::{EnrichmentSource, RetryPolicy, SynthesisDraft, SynthesisInput, SynthesisSource};
use crate::error::SourceError;
use crate::model::{AnalysisRequest, RiskLevel, ThreatCase, VulnerabilityId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Connection details shared by both agent adapters.
#[derive(Clone)]
struct AgentEndpoint {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl AgentEndpoint {
    fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        api_key: Option<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            api_key: api_key.filter(|key| !key.is_empty()),
            retry,
        }
    }

    async fn post<B, T>(&self, service: &str, query: &str, body: &B) -> Result<T, SourceError>
    where
        B: Serialize + Sync,
        T: serde::de::DeserializeOwned,
    {
        if self.url.is_empty() {
            return Err(SourceError::NoData {
                service: service.to_string(),
                query: format!("{} (no endpoint configured)", query),
            });
        }

        self.retry
            .run(service, || {
                let mut request = self.client.post(&self.url).json(body);
                if let Some(key) = &self.api_key {
                    request = request.bearer_auth(key);
                }
                send_json(service, request)
            })
            .await
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnrichmentRequest<'a> {
    vulnerability_id: &'a str,
    subject: &'a str,
    version_selector: &'a str,
    ecosystem: &'a str,
}

#[derive(Deserialize)]
struct EnrichmentResponse {
    #[serde(default)]
    cases: Vec<ThreatCase>,
}

pub struct AgentEnrichmentSource {
    endpoint: AgentEndpoint,
}

impl AgentEnrichmentSource {
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        api_key: Option<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            endpoint: AgentEndpoint::new(client, url, api_key, retry),
        }
    }
}

#[async_trait]
impl EnrichmentSource for AgentEnrichmentSource {
    fn name(&self) -> &'static str {
        "enrichment-agent"
    }

    async fn fetch_cases(
        &self,
        request: &AnalysisRequest,
        id: &VulnerabilityId,
    ) -> Result<Vec<ThreatCase>, SourceError> {
        let body = EnrichmentRequest {
            vulnerability_id: id.as_str(),
            subject: &request.subject,
            version_selector: &request.version_selector,
            ecosystem: &request.ecosystem,
        };

        let response: EnrichmentResponse =
            self.endpoint.post("enrichment", id.as_str(), &body).await?;
        Ok(response.cases)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesisResponse {
    risk_level: String,
    #[serde(default)]
    recommendations: Vec<String>,
    #[serde(default)]
    summary: String,
}

impl From<SynthesisResponse> for SynthesisDraft {
    fn from(response: SynthesisResponse) -> Self {
        Self {
            risk_level: RiskLevel::parse(&response.risk_level),
            recommendations: response.recommendations,
            summary: response.summary,
        }
    }
}

pub struct AgentSynthesisSource {
    endpoint: AgentEndpoint,
}

impl AgentSynthesisSource {
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        api_key: Option<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            endpoint: AgentEndpoint::new(client, url, api_key, retry),
        }
    }
}

#[async_trait]
impl SynthesisSource for AgentSynthesisSource {
    fn name(&self) -> &'static str {
        "synthesis-agent"
    }

    async fn synthesize(&self, input: &SynthesisInput) -> Result<SynthesisDraft, SourceError> {
        let response: SynthesisResponse = self
            .endpoint
            .post("synthesis", input.vulnerability_id.as_str(), input)
            .await?;
        Ok(response.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesis_response_normalises_risk_level() {
        let response: SynthesisResponse = serde_json::from_str(
            r#"{"riskLevel":"HIGH","recommendations":["Upgrade to 4.17.21"],"summary":"Prototype pollution"}"#,
        )
        .unwrap();
        let draft = SynthesisDraft::from(response);
        assert_eq!(draft.risk_level, RiskLevel::High);
        assert_eq!(draft.recommendations.len(), 1);
    }

    #[test]
    fn test_enrichment_response_defaults_to_no_cases() {
        let response: EnrichmentResponse = serde_json::from_str("{}").unwrap();
        assert!(response.cases.is_empty());
    }

    #[test]
    fn test_enrichment_request_is_camel_case() {
        let body = EnrichmentRequest {
            vulnerability_id: "CVE-2024-1",
            subject: "lodash",
            version_selector: "latest",
            ecosystem: "npm",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["vulnerabilityId"], "CVE-2024-1");
        assert_eq!(json["versionSelector"], "latest");
    }

    #[tokio::test]
    async fn test_unconfigured_endpoint_has_no_data() {
        let source = AgentEnrichmentSource::new(
            reqwest::Client::new(),
            "",
            Some(String::new()),
            RetryPolicy::none(),
        );
        let request = AnalysisRequest::new("lodash", "latest", "npm");
        let id = VulnerabilityId::parse("CVE-2024-0001").unwrap();

        let err = source.fetch_cases(&request, &id).await.unwrap_err();
        assert!(matches!(err, SourceError::NoData { .. }));
        assert!(source.endpoint.api_key.is_none());
    }
}
