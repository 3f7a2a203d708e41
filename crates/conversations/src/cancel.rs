//! Cancellation plumbing around storage calls and backoff sleeps.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use cs_domain::error::{Error, Result};

/// Run `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(Error::Cancelled(what.to_owned()));
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled(what.to_owned())),
        result = fut => result,
    }
}

/// Sleep for `delay`, returning early with `Cancelled` if the token fires.
pub(crate) async fn backoff(cancel: &CancellationToken, what: &str, delay: Duration) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled(what.to_owned())),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
