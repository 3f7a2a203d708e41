//! Subscriber setup for embedders and tests.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::ObservabilityConfig;

/// Install the global `tracing` subscriber.
///
/// JSON lines when `json_logs` is set, compact human output otherwise.
/// Returns `false` if a subscriber was already installed.
pub fn init_tracing(obs: &ObservabilityConfig) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&obs.default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if obs.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false).compact())
            .try_init()
    };
    result.is_ok()
}
