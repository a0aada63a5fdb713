//! Durable storage for pipeline output.
//!
//! "Not found" is an ordinary outcome ([`Lookup::NotFound`]), never an error,
//! so callers can branch on it while polling.

mod file;
mod memory;

pub use file::FileResultStore;
pub use memory::MemoryResultStore;

use crate::error::StoreError;
use crate::model::{AnalysisRequest, PipelineResult, StageRecord, Synthesis, VulnerabilityId};
use async_trait::async_trait;

/// Result of a store read.
#[derive(Debug)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
    Error(StoreError),
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound | Lookup::Error(_) => None,
        }
    }
}

impl<T> From<Result<Option<T>, StoreError>> for Lookup<T> {
    fn from(result: Result<Option<T>, StoreError>) -> Self {
        match result {
            Ok(Some(value)) => Lookup::Found(value),
            Ok(None) => Lookup::NotFound,
            Err(e) => Lookup::Error(e),
        }
    }
}

/// What to look a stored result up by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultQuery {
    /// A package; without a version selector the newest result for any
    /// version matches.
    Subject {
        subject: String,
        ecosystem: String,
        version_selector: Option<String>,
    },
    /// The newest result that reports this vulnerability.
    Vulnerability(VulnerabilityId),
}

impl ResultQuery {
    pub fn for_request(request: &AnalysisRequest) -> Self {
        ResultQuery::Subject {
            subject: request.subject.clone(),
            ecosystem: request.ecosystem.clone(),
            version_selector: Some(request.version_selector.clone()),
        }
    }

    pub fn matches(&self, result: &PipelineResult) -> bool {
        match self {
            ResultQuery::Subject {
                subject,
                ecosystem,
                version_selector,
            } => {
                result.request.subject == *subject
                    && result.request.ecosystem == *ecosystem
                    && version_selector
                        .as_ref()
                        .map_or(true, |v| result.request.version_selector == *v)
            }
            ResultQuery::Vulnerability(id) => result.contains(id),
        }
    }
}

/// Picks the newest of several matching results.
pub(crate) fn newest<I>(results: I) -> Option<PipelineResult>
where
    I: IntoIterator<Item = PipelineResult>,
{
    results.into_iter().max_by_key(|r| r.generated_at)
}

/// Persistence contract consumed by the orchestrator and the gateway.
///
/// Every operation is safe to call when nothing is stored yet.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn find_result(&self, query: &ResultQuery) -> Lookup<PipelineResult>;

    /// Removes matching results and returns how many were removed.
    async fn delete_result(
        &self,
        subject: &str,
        ecosystem: &str,
        version_selector: Option<&str>,
    ) -> Result<usize, StoreError>;

    async fn upsert_stage(&self, record: &StageRecord) -> Result<(), StoreError>;

    async fn upsert_synthesis(&self, synthesis: &Synthesis) -> Result<(), StoreError>;

    async fn save_result(&self, result: &PipelineResult) -> Result<(), StoreError>;
}
