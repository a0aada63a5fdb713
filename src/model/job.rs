use super::AnalysisRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const DEFAULT_JOB_SOURCE: &str = "api";

fn default_source() -> String {
    DEFAULT_JOB_SOURCE.to_string()
}

/// Queue wire format for one analysis job.
///
/// Producers that predate `jobId`/`enqueuedAt` are still accepted; missing
/// values are filled in on decode and unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(default = "Uuid::new_v4")]
    pub job_id: Uuid,
    pub subject: String,
    #[serde(default)]
    pub version_selector: String,
    pub ecosystem: String,
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default = "Utc::now")]
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
}

impl Job {
    pub fn new(request: &AnalysisRequest, source: impl Into<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            subject: request.subject.clone(),
            version_selector: request.version_selector.clone(),
            ecosystem: request.ecosystem.clone(),
            force_refresh: request.force_refresh,
            source: source.into(),
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }

    /// Rebuilds the request this job was created from.
    pub fn request(&self) -> AnalysisRequest {
        AnalysisRequest::new(
            self.subject.clone(),
            self.version_selector.clone(),
            self.ecosystem.clone(),
        )
        .force_refresh(self.force_refresh)
    }

    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

const RESERVED_KEYS: &[&str] = &["originalPayload", "errorMessage", "errorTimestamp", "stackTrace"];

/// A job that failed processing, kept for inspection and manual replay.
///
/// `fields` holds every top-level field of the original payload when it was a
/// JSON object, and `original_payload` the exact text that was popped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    pub original_payload: String,
    pub error_message: String,
    pub error_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub stack_trace: String,
}

impl DeadLetterRecord {
    pub fn new(
        original_payload: impl Into<String>,
        error_message: impl Into<String>,
        stack_trace: impl Into<String>,
    ) -> Self {
        let original_payload = original_payload.into();
        let mut fields = match serde_json::from_str::<Value>(&original_payload) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        // These would collide with our own keys; the verbatim text survives in
        // `original_payload`.
        for key in RESERVED_KEYS {
            fields.remove(*key);
        }

        Self {
            fields,
            original_payload,
            error_message: error_message.into(),
            error_timestamp: Utc::now(),
            stack_trace: stack_trace.into(),
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        self.fields.get("jobId").and_then(Value::as_str)
    }

    pub fn subject(&self) -> Option<&str> {
        self.fields.get("subject").and_then(Value::as_str)
    }
}
