use crate::model::{DeadLetterRecord, PipelineResult};
use anyhow::Result;

pub fn print_json(result: &PipelineResult) -> Result<()> {
    let json = serde_json::to_string_pretty(result)?;
    println!("{}", json);
    Ok(())
}

pub fn print_dead_letters_json(records: &[DeadLetterRecord]) -> Result<()> {
    let json = serde_json::to_string_pretty(records)?;
    println!("{}", json);
    Ok(())
}
