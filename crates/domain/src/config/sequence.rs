use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sequence allocation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Retry policy for `(turn_id, sequence)` conflicts on message insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// Insert attempts before a conflict is surfaced to the caller.
    #[serde(default = "d_10")]
    pub max_attempts: u32,
    /// Linear backoff step: attempt `n` (0-indexed) waits `(n + 1) * step`.
    #[serde(default = "d_5")]
    pub backoff_step_ms: u64,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_step_ms: 5,
        }
    }
}

impl SequenceConfig {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(u64::from(attempt + 1).saturating_mul(self.backoff_step_ms))
    }
}

fn d_10() -> u32 {
    10
}
fn d_5() -> u64 {
    5
}
