//! JSON-file store.
//!
//! Layout under the data directory:
//!
//! - `results/<scope>.json` - one [`PipelineResult`] per request scope
//! - `stages/<stage>/<id>.json` - latest [`StageRecord`] per vulnerability and stage
//! - `syntheses/<id>.json` - latest [`Synthesis`] per vulnerability

use super::{newest, Lookup, ResultQuery, ResultStore};
use crate::error::StoreError;
use crate::model::{PipelineResult, StageRecord, Synthesis};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

const RESULTS_DIR: &str = "results";
const STAGES_DIR: &str = "stages";
const SYNTHESES_DIR: &str = "syntheses";

#[derive(Debug, Clone)]
pub struct FileResultStore {
    root: PathBuf,
}

impl FileResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Converts a key to a safe filename. Distinct keys always get distinct
    /// names: anything other than alphanumerics, `-` and a non-leading `.` is
    /// written as `_XX` per UTF-8 byte.
    fn file_name(key: &str) -> String {
        let mut name = String::with_capacity(key.len() + 5);
        for (i, c) in key.chars().enumerate() {
            if c.is_alphanumeric() || c == '-' || (c == '.' && i > 0) {
                name.push(c);
            } else {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    name.push_str(&format!("_{:02X}", byte));
                }
            }
        }
        name.push_str(".json");
        name
    }

    fn path(&self, dir: impl AsRef<Path>, key: &str) -> PathBuf {
        self.root.join(dir).join(Self::file_name(key))
    }

    async fn write_json<T: Serialize>(
        &self,
        dir: impl AsRef<Path>,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let dir_path = self.root.join(dir.as_ref());
        fs::create_dir_all(&dir_path).await?;

        let path = dir_path.join(Self::file_name(key));
        // Each writer gets its own temp file; the rename is the commit point.
        let tmp = dir_path.join(format!(".{}.tmp", Uuid::new_v4()));
        let content = serde_json::to_vec_pretty(value)?;
        if let Err(e) = fs::write(&tmp, content).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every stored result, skipping files that fail to decode.
    async fn all_results(&self) -> Result<Vec<(PathBuf, PipelineResult)>, StoreError> {
        let dir = self.root.join(RESULTS_DIR);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut results = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            match Self::read_json::<PipelineResult>(&path).await {
                Ok(Some(result)) => results.push((path, result)),
                Ok(None) => {}
                Err(e) => debug!(path = %path.display(), error = %e, "skipping unreadable result"),
            }
        }
        Ok(results)
    }

    async fn find(&self, query: &ResultQuery) -> Result<Option<PipelineResult>, StoreError> {
        if let ResultQuery::Subject {
            subject,
            ecosystem,
            version_selector: Some(version),
        } = query
        {
            let key = format!("{}:{}:{}", ecosystem, subject, version);
            let found = Self::read_json::<PipelineResult>(&self.path(RESULTS_DIR, &key)).await?;
            return Ok(found.filter(|r| query.matches(r)));
        }

        let matching = self
            .all_results()
            .await?
            .into_iter()
            .map(|(_, result)| result)
            .filter(|r| query.matches(r));
        Ok(newest(matching))
    }
}

#[async_trait]
impl ResultStore for FileResultStore {
    async fn find_result(&self, query: &ResultQuery) -> Lookup<PipelineResult> {
        self.find(query).await.into()
    }

    async fn delete_result(
        &self,
        subject: &str,
        ecosystem: &str,
        version_selector: Option<&str>,
    ) -> Result<usize, StoreError> {
        let query = ResultQuery::Subject {
            subject: subject.to_string(),
            ecosystem: ecosystem.to_string(),
            version_selector: version_selector.map(str::to_string),
        };

        let mut removed = 0;
        for (path, result) in self.all_results().await? {
            if !query.matches(&result) {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    async fn upsert_stage(&self, record: &StageRecord) -> Result<(), StoreError> {
        let dir = Path::new(STAGES_DIR).join(record.stage.as_str());
        self.write_json(dir, record.vulnerability_id.as_str(), record)
            .await
    }

    async fn upsert_synthesis(&self, synthesis: &Synthesis) -> Result<(), StoreError> {
        self.write_json(SYNTHESES_DIR, synthesis.vulnerability_id.as_str(), synthesis)
            .await
    }

    async fn save_result(&self, result: &PipelineResult) -> Result<(), StoreError> {
        self.write_json(RESULTS_DIR, &result.request.scope_key(), result)
            .await
    }
}
