//! Polling a freshly started instance until it serves requests.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, trace};

use crate::config::ProbeConfig;
use crate::error::{HarnessError, Result};

/// Error type returned by a single probe attempt.
pub type ProbeError = Box<dyn std::error::Error + Send + Sync>;

/// One cheap, idempotent request that only succeeds against a live server.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self) -> std::result::Result<(), ProbeError>;
}

/// Call `probe` until it succeeds or `config.max_attempts` attempts have
/// failed.
///
/// Every attempt is cut off after `per_attempt_timeout`. A failed attempt is
/// followed by a sleep for whatever is left of that window, so each attempt
/// occupies at most one window and the whole loop finishes within
/// `max_attempts * per_attempt_timeout`. Returns the time it took to become
/// ready.
pub async fn wait_until_ready<P>(probe: &P, config: &ProbeConfig) -> Result<Duration>
where
    P: ReadinessProbe + ?Sized,
{
    let started = Instant::now();
    let attempts = config.attempts();
    let window = config.per_attempt_timeout;
    let mut last_error = String::from("no probe completed");

    for attempt in 1..=attempts {
        let attempt_started = Instant::now();
        match timeout(window, probe.probe()).await {
            Ok(Ok(())) => {
                let elapsed = started.elapsed();
                debug!(attempt, ?elapsed, "instance ready");
                return Ok(elapsed);
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("probe timed out after {window:?}"),
        }
        trace!(attempt, error = %last_error, "readiness probe failed");

        if attempt < attempts {
            let residual = window.saturating_sub(attempt_started.elapsed());
            if !residual.is_zero() {
                sleep(residual).await;
            }
        }
    }

    Err(HarnessError::ReadinessTimeout {
        attempts,
        elapsed: started.elapsed(),
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails until it has been called `ready_after` times.
    struct Countdown {
        calls: AtomicU32,
        ready_after: u32,
    }

    impl Countdown {
        fn new(ready_after: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                ready_after,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReadinessProbe for Countdown {
        async fn probe(&self) -> std::result::Result<(), ProbeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n > self.ready_after {
                Ok(())
            } else {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused").into())
            }
        }
    }

    /// Never answers.
    struct BlackHole;

    #[async_trait]
    impl ReadinessProbe for BlackHole {
        async fn probe(&self) -> std::result::Result<(), ProbeError> {
            std::future::pending().await
        }
    }

    fn fast(attempts: u32) -> ProbeConfig {
        ProbeConfig::new(attempts, Duration::from_millis(40))
    }

    #[tokio::test]
    async fn ready_on_first_attempt_returns_immediately() {
        let probe = Countdown::new(0);
        let elapsed = wait_until_ready(&probe, &fast(5)).await.expect("ready");
        assert_eq!(probe.calls(), 1);
        assert!(elapsed < Duration::from_millis(40), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn retries_until_ready() {
        let probe = Countdown::new(3);
        wait_until_ready(&probe, &fast(10)).await.expect("ready on 4th");
        assert_eq!(probe.calls(), 4);
    }

    #[tokio::test]
    async fn failing_attempts_sleep_out_their_window() {
        let probe = Countdown::new(2);
        let elapsed = wait_until_ready(&probe, &fast(10)).await.unwrap();
        // Two failed windows precede the successful third attempt.
        assert!(elapsed >= Duration::from_millis(80), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let probe = Countdown::new(u32::MAX);
        let config = fast(5);
        let err = wait_until_ready(&probe, &config).await.unwrap_err();

        assert_eq!(probe.calls(), 5);
        match err {
            HarnessError::ReadinessTimeout {
                attempts,
                elapsed,
                last_error,
            } => {
                assert_eq!(attempts, 5);
                assert!(last_error.contains("connection refused"), "{last_error}");
                // No sleep after the final attempt: four full windows.
                assert!(elapsed >= Duration::from_millis(160), "took {elapsed:?}");
                assert!(
                    elapsed < config.budget() + Duration::from_millis(150),
                    "took {elapsed:?}"
                );
            }
            other => panic!("expected ReadinessTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hung_probe_is_cut_off_per_attempt() {
        let config = fast(3);
        let err = wait_until_ready(&BlackHole, &config).await.unwrap_err();
        match err {
            HarnessError::ReadinessTimeout {
                elapsed,
                last_error,
                ..
            } => {
                assert!(last_error.contains("timed out"), "{last_error}");
                assert!(elapsed >= config.budget(), "took {elapsed:?}");
                assert!(
                    elapsed < config.budget() + Duration::from_millis(150),
                    "took {elapsed:?}"
                );
            }
            other => panic!("expected ReadinessTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_attempts_still_probes_once() {
        let probe = Countdown::new(u32::MAX);
        let err = wait_until_ready(&probe, &fast(0)).await.unwrap_err();
        assert_eq!(probe.calls(), 1);
        assert!(matches!(
            err,
            HarnessError::ReadinessTimeout { attempts: 1, .. }
        ));
    }

    #[tokio::test]
    async fn works_through_trait_objects() {
        let probe: Box<dyn ReadinessProbe> = Box::new(Countdown::new(0));
        wait_until_ready(probe.as_ref(), &fast(1)).await.unwrap();
    }
}
