//! Bounded, timed provider calls.

use std::future::Future;
use std::time::Duration;

use hoster_reconcile::RetryPolicy;
use tracing::warn;

use crate::providers::{CallKind, ProviderError};

/// Runs `op` until it succeeds, fails non-transiently, or the retry budget
/// runs out.
///
/// Each attempt is capped by `timeout`. A create that times out has an
/// unknown outcome and is never retried; a delete that times out is.
pub(crate) async fn call_provider<T, F, Fut>(
    retry: &RetryPolicy,
    timeout: Duration,
    kind: CallKind,
    what: &'static str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 1;
    loop {
        let result = match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(timed_out(kind, what, timeout)),
        };

        match result {
            Err(ProviderError::Transient(message)) if retry.should_retry(attempt) => {
                let delay = retry.backoff_for(attempt);
                warn!(
                    call = what,
                    %kind,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "Transient provider failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

fn timed_out(kind: CallKind, what: &str, timeout: Duration) -> ProviderError {
    let message = format!("{what} timed out after {}ms", timeout.as_millis());
    match kind {
        CallKind::Create => ProviderError::Ambiguous(message),
        CallKind::Delete => ProviderError::Transient(message),
    }
}
