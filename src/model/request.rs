use crate::error::ValidationError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Version selector used when the caller does not specify one.
pub const DEFAULT_VERSION_SELECTOR: &str = "latest";

const MAX_SUBJECT_LEN: usize = 214;

/// One unit of analysis work: a package in an ecosystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub subject: String,
    pub version_selector: String,
    pub ecosystem: String,
    #[serde(default)]
    pub force_refresh: bool,
}

impl AnalysisRequest {
    pub fn new(
        subject: impl Into<String>,
        version_selector: impl Into<String>,
        ecosystem: impl Into<String>,
    ) -> Self {
        let version_selector = version_selector.into();
        let version_selector = if version_selector.trim().is_empty() {
            DEFAULT_VERSION_SELECTOR.to_string()
        } else {
            version_selector.trim().to_string()
        };

        Self {
            subject: subject.into().trim().to_string(),
            version_selector,
            ecosystem: ecosystem.into().trim().to_string(),
            force_refresh: false,
        }
    }

    pub fn force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }

    /// Checks the request before it reaches the queue or any external source.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.subject.is_empty() {
            return Err(ValidationError::new(
                "subject",
                &self.subject,
                "must not be empty",
            ));
        }
        if self.subject.len() > MAX_SUBJECT_LEN {
            return Err(ValidationError::new(
                "subject",
                &self.subject,
                format!("must be at most {} characters", MAX_SUBJECT_LEN),
            ));
        }
        if self
            .subject
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(ValidationError::new(
                "subject",
                &self.subject,
                "must not contain whitespace or control characters",
            ));
        }
        if self.ecosystem.is_empty() {
            return Err(ValidationError::new(
                "ecosystem",
                &self.ecosystem,
                "must not be empty",
            ));
        }
        Ok(())
    }

    /// Key shared by every cache entry and stored result for this request.
    ///
    /// `force_refresh` is deliberately not part of it.
    pub fn scope_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.ecosystem, self.subject, self.version_selector
        )
    }
}

impl fmt::Display for AnalysisRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} ({})",
            self.subject, self.version_selector, self.ecosystem
        )
    }
}

fn id_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Z][A-Z0-9]*-[A-Za-z0-9][A-Za-z0-9._:-]*$").ok())
        .as_ref()
}

/// A vulnerability identifier such as `CVE-2024-1234` or `GHSA-xxxx-xxxx-xxxx`.
///
/// Only constructed through [`VulnerabilityId::parse`], so every value that
/// reaches a source adapter has already passed the format check.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VulnerabilityId(String);

impl VulnerabilityId {
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        let value = value.trim();
        if value.len() > 128 || !id_pattern().is_some_and(|re| re.is_match(value)) {
            return Err(ValidationError::new(
                "vulnerability_id",
                value,
                "not a recognised vulnerability identifier",
            ));
        }
        Ok(Self(value.to_string()))
    }

    /// For identifiers built from a fixed format known to match the pattern.
    pub(crate) fn from_trusted(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_cve(&self) -> bool {
        self.0.starts_with("CVE-")
    }
}

impl TryFrom<String> for VulnerabilityId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<VulnerabilityId> for String {
    fn from(id: VulnerabilityId) -> Self {
        id.0
    }
}

impl fmt::Display for VulnerabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
