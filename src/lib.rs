//! Queue-backed vulnerability risk pipeline.
//!
//! A request names a package; the [`PipelineOrchestrator`] maps it to
//! vulnerability identifiers, scores them (EPSS and CVSS concurrently),
//! enriches each one with threat cases and asks a synthesis agent for a final
//! assessment. Every stage is cached on its own and falls back to
//! deterministic placeholder data when its source fails, so a run always
//! completes.
//!
//! Requests normally arrive through the [`PollingGateway`], which enqueues a
//! [`Job`] on the [`JobQueue`] and waits a bounded time for a [`Worker`] to
//! store the result.

pub mod agent;
pub mod cache;
pub mod config;
pub mod error;
pub mod fallback;
pub mod gateway;
pub mod model;
pub mod orchestrator;
pub mod output;
pub mod queue;
pub mod source;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use agent::{AgentSettings, Progress};
pub use cache::KeyedCache;
pub use config::Config;
pub use error::{GatewayError, PipelineError, QueueError, SourceError, StoreError, ValidationError};
pub use gateway::{GatewayConfig, PollingGateway, Resolution};
pub use model::{
    AnalysisRequest, DeadLetterRecord, Job, PipelineResult, RiskLevel, SourceKind, Stage,
    StageOutcome, StageRecord, Synthesis, VulnerabilityId, VulnerabilityReport,
};
pub use orchestrator::{PipelineOrchestrator, PipelineSources, PipelineState};
pub use queue::JobQueue;
pub use store::{Lookup, ResultQuery, ResultStore};
pub use worker::{JobHandler, Worker, WorkerConfig, WorkerStats};
