//! Retry policy for management-plane calls.
//!
//! Azure rate-limits aggressively and returns transient 409/429/500
//! responses during scale operations. Callers wrap each request in
//! [`with_retry`]; the classifier decides what is worth retrying and
//! the backoff doubles per attempt up to 256 seconds, with sub-second
//! jitter so a fleet of masters does not re-synchronize.

use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::{AzureError, AzureResult};

/// Backoff ceiling in seconds.
const MAX_BACKOFF_SECS: f64 = 256.0;

/// True when the error is transient and the call should be retried:
/// HTTP 409/429/500, connect/timeout/body transport failures (covers
/// DNS resolution), and short-read style IO errors.
pub fn retryable(err: &AzureError) -> bool {
    match err {
        AzureError::Status { status, .. } => matches!(status, 409 | 429 | 500),
        AzureError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_body(),
        AzureError::Io(e) => matches!(
            e.kind(),
            ErrorKind::UnexpectedEof
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::TimedOut
        ),
        _ => false,
    }
}

/// Sleep duration before retry `attempt` (0-indexed).
///
/// Base is `min(2^(attempt-1), 256)` seconds — half a second on the
/// first retry — plus uniform jitter in [0, 1). A 429 carrying a
/// `retry-after` header overrides the base with the server's value.
fn backoff(attempt: u32, err: &AzureError) -> Duration {
    let base = match err {
        AzureError::Status {
            status: 429,
            retry_after: Some(secs),
            ..
        } => *secs as f64,
        _ => 2f64.powi(attempt as i32 - 1).min(MAX_BACKOFF_SECS),
    };
    let jitter: f64 = rand::rng().random_range(0.0..1.0);
    Duration::from_secs_f64(base + jitter)
}

/// Run `op` up to `nretry + 1` times, sleeping per [`backoff`] between
/// attempts. Non-retryable errors propagate immediately; exhaustion
/// propagates the last observed error.
pub async fn with_retry<T, F, Fut>(nretry: u32, mut op: F) -> AzureResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AzureResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= nretry || !retryable(&err) {
                    return Err(err);
                }
                let delay = backoff(attempt, &err);
                debug!(attempt, delay_secs = delay.as_secs_f64(), error = %err, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn status(code: u16) -> AzureError {
        AzureError::Status {
            status: code,
            retry_after: None,
            body: String::new(),
        }
    }

    #[test]
    fn classifies_status_codes() {
        assert!(retryable(&status(409)));
        assert!(retryable(&status(429)));
        assert!(retryable(&status(500)));
        assert!(!retryable(&status(400)));
        assert!(!retryable(&status(404)));
        assert!(!retryable(&AzureError::Interrupted));
    }

    #[test]
    fn classifies_io_errors() {
        let eof = AzureError::Io(std::io::Error::new(ErrorKind::UnexpectedEof, "eof"));
        assert!(retryable(&eof));
        let denied = AzureError::Io(std::io::Error::new(ErrorKind::PermissionDenied, "no"));
        assert!(!retryable(&denied));
    }

    #[test]
    fn backoff_grows_and_caps() {
        // attempt 0 → 0.5s base, attempt 9 → 256s cap; jitter adds < 1s.
        let b0 = backoff(0, &status(500));
        assert!(b0 >= Duration::from_secs_f64(0.5) && b0 < Duration::from_secs_f64(1.5));
        let b3 = backoff(3, &status(500));
        assert!(b3 >= Duration::from_secs(4) && b3 < Duration::from_secs(5));
        let b20 = backoff(20, &status(500));
        assert!(b20 >= Duration::from_secs(256) && b20 < Duration::from_secs(257));
    }

    #[test]
    fn retry_after_overrides_base() {
        let err = AzureError::Status {
            status: 429,
            retry_after: Some(7),
            body: String::new(),
        };
        let b = backoff(0, &err);
        assert!(b >= Duration::from_secs(7) && b < Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_budget_exhausted() {
        let calls = AtomicU32::new(0);
        let result: AzureResult<()> = with_retry(2, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(status(500)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: AzureResult<()> = with_retry(5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(status(403)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(5, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(status(429))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
