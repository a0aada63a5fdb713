//! Core data types for requests, stage records, pipeline results and jobs.
//!
//! - [`AnalysisRequest`] - one unit of work (a package in an ecosystem)
//! - [`VulnerabilityId`] - a validated vulnerability identifier
//! - [`StageRecord`] - output of one data source for one vulnerability
//! - [`PipelineResult`] - the durable output of an orchestrator run
//! - [`Job`] / [`DeadLetterRecord`] - queue wire formats
//!
//! # Example
//!
//! ```
//! use vulnflow::{AnalysisRequest, Job};
//!
//! let request = AnalysisRequest::new("lodash", "4.17.21", "npm");
//! assert!(request.validate().is_ok());
//!
//! let job = Job::new(&request, "cli");
//! assert_eq!(job.request(), request);
//! ```

mod job;
mod record;
mod request;
mod result;

pub use job::*;
pub use record::*;
pub use request::*;
pub use result::*;
