use std::fs;
use std::path::Path;

use anyhow::Context;

const DEFAULT_ANALYSIS_PROMPT: &str = include_str!("../resources/prompts/analysis.md");
const DEFAULT_SYNTHESIS_PROMPT: &str = include_str!("../resources/prompts/synthesis.md");
const DEFAULT_AUDIT_PROMPT: &str = include_str!("../resources/prompts/audit.md");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSet {
    pub analysis: String,
    pub synthesis: String,
    pub audit: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            analysis: DEFAULT_ANALYSIS_PROMPT.to_string(),
            synthesis: DEFAULT_SYNTHESIS_PROMPT.to_string(),
            audit: DEFAULT_AUDIT_PROMPT.to_string(),
        }
    }
}

impl PromptSet {
    /// Defaults, with `analysis.md`, `synthesis.md` and `audit.md` from `dir` taking precedence when present.
    pub fn with_overrides(dir: &Path) -> anyhow::Result<Self> {
        let mut prompts = Self::default();
        for (file, slot) in [
            ("analysis.md", &mut prompts.analysis),
            ("synthesis.md", &mut prompts.synthesis),
            ("audit.md", &mut prompts.audit),
        ] {
            let path = dir.join(file);
            if !path.is_file() {
                continue;
            }
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed reading {}", path.display()))?;
            if raw.trim().is_empty() {
                anyhow::bail!("prompt override {} is empty", path.display());
            }
            *slot = raw;
        }
        Ok(prompts)
    }

    pub fn analysis_prompt(&self, image_count: usize) -> String {
        render(
            &self.analysis,
            &[("image_count", image_count.to_string().as_str())],
        )
    }

    pub fn synthesis_prompt(&self, image_count: usize, base_report: &str, feedback: &str) -> String {
        render(
            &self.synthesis,
            &[
                ("image_count", image_count.to_string().as_str()),
                ("base_report", base_report),
                ("feedback", feedback),
            ],
        )
    }

    pub fn audit_prompt(&self, base_report: &str, candidate: &str, target_score: u8) -> String {
        render(
            &self.audit,
            &[
                ("base_report", base_report),
                ("candidate", candidate),
                ("target_score", target_score.to_string().as_str()),
            ],
        )
    }
}

/// Single-pass `{name}` substitution; substituted text is never re-scanned and
/// unknown placeholders are kept verbatim.
fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let replacement = after.find('}').and_then(|close| {
            let name = &after[..close];
            values
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (*value, close))
        });
        match replacement {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
