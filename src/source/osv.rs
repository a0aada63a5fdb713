use super::http::send_json;
use super::{MappingSource, RetryPolicy};
use crate::error::SourceError;
use crate::model::{AnalysisRequest, VulnerabilityId, DEFAULT_VERSION_SELECTOR};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

const SERVICE: &str = "osv";

pub const DEFAULT_OSV_URL: &str = "https://api.osv.dev";

/// Maps a package to vulnerability identifiers through OSV.dev.
pub struct OsvMappingSource {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl OsvMappingSource {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry,
        }
    }

    fn build_query(request: &AnalysisRequest) -> OsvQuery {
        let version = if request.version_selector == DEFAULT_VERSION_SELECTOR {
            None
        } else {
            Some(request.version_selector.clone())
        };

        OsvQuery {
            package: OsvPackage {
                name: request.subject.clone(),
                ecosystem: request.ecosystem.clone(),
            },
            version,
        }
    }
}

#[derive(Serialize)]
struct OsvPackage {
    name: String,
    ecosystem: String,
}

#[derive(Serialize)]
struct OsvQuery {
    package: OsvPackage,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

#[derive(Deserialize, Default)]
struct OsvQueryResponse {
    #[serde(default)]
    vulns: Vec<OsvVuln>,
}

#[derive(Deserialize)]
struct OsvVuln {
    id: String,
    #[serde(default)]
    aliases: Vec<String>,
}

/// Picks one identifier per advisory, preferring its CVE alias, in response
/// order and without duplicates.
fn collect_ids(response: OsvQueryResponse) -> Vec<VulnerabilityId> {
    let mut ids: Vec<VulnerabilityId> = Vec::new();

    for vuln in response.vulns {
        let preferred = vuln
            .aliases
            .iter()
            .find(|alias| alias.starts_with("CVE-"))
            .unwrap_or(&vuln.id);

        match VulnerabilityId::parse(preferred) {
            Ok(id) if !ids.contains(&id) => ids.push(id),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "skipping advisory with unusable id"),
        }
    }

    ids
}

#[async_trait]
impl MappingSource for OsvMappingSource {
    fn name(&self) -> &'static str {
        "OSV.dev"
    }

    async fn fetch_ids(
        &self,
        request: &AnalysisRequest,
    ) -> Result<Vec<VulnerabilityId>, SourceError> {
        request.validate()?;
        let url = format!("{}/v1/query", self.base_url);
        let query = Self::build_query(request);

        let response: OsvQueryResponse = self
            .retry
            .run(SERVICE, || {
                send_json(SERVICE, self.client.post(&url).json(&query))
            })
            .await?;

        Ok(collect_ids(response))
    }
}
