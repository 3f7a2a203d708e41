use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compaction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Order in which archive candidates are walked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompactionStrategy {
    /// Chronological: turn order, then in-turn sequence.
    #[default]
    OldestFirst,
    /// User/assistant text before tool messages.
    TextFirst,
    /// Tool messages before user/assistant text.
    ToolFirst,
}

impl CompactionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OldestFirst => "oldest-first",
            Self::TextFirst => "text-first",
            Self::ToolFirst => "tool-first",
        }
    }
}

impl fmt::Display for CompactionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompactionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "oldest-first" => Ok(Self::OldestFirst),
            "text-first" => Ok(Self::TextFirst),
            "tool-first" => Ok(Self::ToolFirst),
            other => Err(Error::InvalidInput(format!(
                "unknown compaction strategy {other:?}"
            ))),
        }
    }
}

/// Token-budget compaction archives old messages and leaves short
/// summaries in their place so the active context fits a budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default)]
    pub default_strategy: CompactionStrategy,
    /// Characters of the original body kept in each summary preview.
    #[serde(default = "d_100")]
    pub preview_chars: usize,
    /// Also ask the summarizer for one summary of everything archived.
    #[serde(default)]
    pub llm_summary: bool,
    /// Budget handed to the summarizer, in estimated tokens.
    #[serde(default = "d_512")]
    pub summary_max_tokens: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            default_strategy: CompactionStrategy::OldestFirst,
            preview_chars: 100,
            llm_summary: false,
            summary_max_tokens: 512,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_100() -> usize {
    100
}
fn d_512() -> usize {
    512
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parses_kebab_case() {
        assert_eq!(
            "text-first".parse::<CompactionStrategy>().unwrap(),
            CompactionStrategy::TextFirst
        );
        assert_eq!(
            "".parse::<CompactionStrategy>().unwrap(),
            CompactionStrategy::OldestFirst
        );
        assert!("newest-first".parse::<CompactionStrategy>().is_err());
    }

    #[test]
    fn deserialize_strategy_from_toml() {
        let cfg: CompactionConfig = toml::from_str("default_strategy = \"tool-first\"").unwrap();
        assert_eq!(cfg.default_strategy, CompactionStrategy::ToolFirst);
        assert_eq!(cfg.preview_chars, 100);
    }
}
