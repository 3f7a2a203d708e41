use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Logging configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Controls how [`crate::logging::init_tracing`] installs the subscriber.
///
/// `RUST_LOG` always wins over `default_filter` when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Structured JSON lines (services) vs. human-readable output (tools).
    #[serde(default = "d_true")]
    pub json_logs: bool,

    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "d_filter")]
    pub default_filter: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            json_logs: true,
            default_filter: d_filter(),
        }
    }
}

fn d_true() -> bool {
    true
}

fn d_filter() -> String {
    "info,cs_conversations=debug".into()
}
