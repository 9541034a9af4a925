//! Bootstrap utilities for flowforward binaries.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::retry::connection_backoff;
use crate::config::LOG_ENV_VAR;

/// Initialize tracing from `FLOWFORWARD_LOG`, defaulting to "info".
pub fn init_tracing() {
    init_tracing_with(false);
}

/// Like [`init_tracing`], but falls back to "debug" when `debug` is set.
///
/// An explicit `FLOWFORWARD_LOG` always wins.
pub fn init_tracing_with(debug: bool) {
    let fallback = if debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(fallback)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Run a startup step with exponential backoff.
///
/// Used while the broker may still be coming up. Retries follow
/// [`connection_backoff`]; once it is exhausted the last error is returned.
pub async fn retry_startup<T, E, F, Fut>(step: &str, target: &str, attempt: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_with(step, target, attempt, connection_backoff()).await
}

async fn retry_with<T, E, F, Fut>(
    step: &str,
    target: &str,
    attempt: F,
    backoff: ExponentialBuilder,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let result = attempt
        .retry(backoff)
        .notify(|err: &E, delay: Duration| {
            warn!(
                step = %step,
                target = %target,
                error = %err,
                retry_in = ?delay,
                "Startup step failed, retrying"
            );
        })
        .await;

    match &result {
        Ok(_) => info!(step = %step, target = %target, "Startup step succeeded"),
        Err(e) => error!(
            step = %step,
            target = %target,
            error = %e,
            "Startup step failed, giving up"
        ),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_backoff(max_retries: usize) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
            .with_max_times(max_retries)
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);

        let result: Result<u32, String> = retry_with(
            "connect",
            "broker",
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("attempt {} refused", n))
                } else {
                    Ok(n)
                }
            },
            fast_backoff(4),
        )
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_returns_last_error() {
        let calls = AtomicU32::new(0);

        let result: Result<(), String> = retry_with(
            "connect",
            "broker",
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err(format!("attempt {} refused", n))
            },
            fast_backoff(2),
        )
        .await;

        // One initial attempt plus two retries.
        assert_eq!(result, Err("attempt 3 refused".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
