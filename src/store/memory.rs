use super::{newest, Lookup, ResultQuery, ResultStore};
use crate::error::StoreError;
use crate::model::{PipelineResult, Stage, StageRecord, Synthesis, VulnerabilityId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// In-process store for tests and single-process runs.
#[derive(Debug)]
pub struct MemoryResultStore {
    results: RwLock<HashMap<String, PipelineResult>>,
    stages: RwLock<HashMap<(VulnerabilityId, Stage), StageRecord>>,
    syntheses: RwLock<HashMap<VulnerabilityId, Synthesis>>,
    available: AtomicBool,
}

impl Default for MemoryResultStore {
    fn default() -> Self {
        Self {
            results: RwLock::default(),
            stages: RwLock::default(),
            syntheses: RwLock::default(),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail with [`StoreError::Unavailable`] until
    /// switched back, to exercise outage handling.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store switched off".into()))
        }
    }

    pub async fn stage_record(&self, id: &VulnerabilityId, stage: Stage) -> Option<StageRecord> {
        self.stages.read().await.get(&(id.clone(), stage)).cloned()
    }

    pub async fn synthesis(&self, id: &VulnerabilityId) -> Option<Synthesis> {
        self.syntheses.read().await.get(id).cloned()
    }

    pub async fn result_count(&self) -> usize {
        self.results.read().await.len()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn find_result(&self, query: &ResultQuery) -> Lookup<PipelineResult> {
        if let Err(e) = self.check() {
            return Lookup::Error(e);
        }
        let results = self.results.read().await;
        let matching = results.values().filter(|r| query.matches(r)).cloned();
        match newest(matching) {
            Some(result) => Lookup::Found(result),
            None => Lookup::NotFound,
        }
    }

    async fn delete_result(
        &self,
        subject: &str,
        ecosystem: &str,
        version_selector: Option<&str>,
    ) -> Result<usize, StoreError> {
        self.check()?;
        let query = ResultQuery::Subject {
            subject: subject.to_string(),
            ecosystem: ecosystem.to_string(),
            version_selector: version_selector.map(str::to_string),
        };
        let mut results = self.results.write().await;
        let before = results.len();
        results.retain(|_, r| !query.matches(r));
        Ok(before - results.len())
    }

    async fn upsert_stage(&self, record: &StageRecord) -> Result<(), StoreError> {
        self.check()?;
        self.stages.write().await.insert(
            (record.vulnerability_id.clone(), record.stage),
            record.clone(),
        );
        Ok(())
    }

    async fn upsert_synthesis(&self, synthesis: &Synthesis) -> Result<(), StoreError> {
        self.check()?;
        self.syntheses
            .write()
            .await
            .insert(synthesis.vulnerability_id.clone(), synthesis.clone());
        Ok(())
    }

    async fn save_result(&self, result: &PipelineResult) -> Result<(), StoreError> {
        self.check()?;
        self.results
            .write()
            .await
            .insert(result.request.scope_key(), result.clone());
        Ok(())
    }
}
