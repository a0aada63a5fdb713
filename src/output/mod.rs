mod cli;
mod json;

pub use cli::{print_cli_table, print_dead_letters};
pub use json::{print_dead_letters_json, print_json};

use crate::model::{DeadLetterRecord, PipelineResult};
use anyhow::Result;

/// Output format for pipeline results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format
    Table,
    /// JSON format for programmatic use
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown format: {}. Use 'table' or 'json'", s)),
        }
    }
}

pub fn print_result(result: &PipelineResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => print_cli_table(result),
        OutputFormat::Json => print_json(result),
    }
}

pub fn print_dead_letter_list(records: &[DeadLetterRecord], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => print_dead_letters(records),
        OutputFormat::Json => print_dead_letters_json(records),
    }
}

/// Format result to string for file output. Files are always JSON.
pub fn format_result_to_string(result: &PipelineResult) -> Result<String> {
    Ok(serde_json::to_string_pretty(result)?)
}
