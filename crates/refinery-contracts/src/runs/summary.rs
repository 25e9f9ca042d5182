use std::path::Path;

use serde::{Deserialize, Serialize};

use super::iteration::{IterationRecord, Verdict};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub model: String,
    pub started_at: String,
    pub finished_at: String,
    pub verdict: Verdict,
    pub attempts_used: u32,
    pub max_attempts: u32,
    pub target_score: u8,
    pub final_score: u8,
    pub final_text: String,
    pub base_report: String,
    pub iterations: Vec<IterationRecord>,
}

pub fn write_summary(path: &Path, summary: &RunSummary) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(summary)?)?;
    Ok(())
}
