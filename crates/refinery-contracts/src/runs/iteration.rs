use std::fmt;

use serde::{Deserialize, Serialize};

/// One synthesis/audit pair inside a refinement run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub synthesis: String,
    pub audit: String,
    pub score: u8,
    pub accepted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Accepted,
    Exhausted,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "ACCEPTED",
            Self::Exhausted => "EXHAUSTED",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered log of iterations for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationLog {
    records: Vec<IterationRecord>,
}

impl IterationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: IterationRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[IterationRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<IterationRecord> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::{IterationLog, IterationRecord, Verdict};

    fn record(iteration: u32, score: u8) -> IterationRecord {
        IterationRecord {
            iteration,
            synthesis: format!("candidate {iteration}"),
            audit: format!("SCORE: {score}"),
            score,
            accepted: false,
        }
    }

    #[test]
    fn log_keeps_insertion_order() {
        let mut log = IterationLog::new();
        log.push(record(1, 40));
        log.push(record(2, 70));
        log.push(record(3, 60));

        let order: Vec<u32> = log.records().iter().map(|row| row.iteration).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(log.len(), 3);
        assert_eq!(log.into_records()[1].score, 70);
    }

    #[test]
    fn verdict_serializes_as_upper_case() -> anyhow::Result<()> {
        assert_eq!(serde_json::to_string(&Verdict::Exhausted)?, "\"EXHAUSTED\"");
        assert_eq!(Verdict::Accepted.to_string(), "ACCEPTED");
        Ok(())
    }
}
