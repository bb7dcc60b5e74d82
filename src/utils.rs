use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::warn;

const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Runs `operation` until it succeeds, the attempt budget is spent, or the
/// deadline would be exceeded by waiting again. Waits grow exponentially
/// from `base_delay` up to a cap, with up to 50% random jitter added so
/// that retries against a struggling peer do not arrive in lockstep.
pub async fn retry_with_backoff<T, E, F, Fut>(
    max_attempts: u32,
    base_delay: Duration,
    deadline: Duration,
    mut operation: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let mut delay = base_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_attempts {
                    return Err(err);
                }
                let jitter = delay.mul_f64(rand::thread_rng().gen_range(0.0..0.5));
                let wait = delay + jitter;
                if started.elapsed() + wait > deadline {
                    return Err(err);
                }
                warn!(attempt, error = %err, "retrying after failure");
                tokio::time::sleep(wait).await;
                delay = (delay * 2).min(MAX_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(
            10,
            Duration::from_millis(100),
            Duration::from_secs(5),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(7) }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_from_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(
            10,
            Duration::from_millis(100),
            Duration::from_secs(60),
            || {
                let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if attempt < 4 {
                        Err("connection refused".to_string())
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_attempt_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(
            3,
            Duration::from_millis(10),
            Duration::from_secs(60),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("down".to_string()) }
            },
        )
        .await;

        assert_eq!(result.unwrap_err(), "down");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_retrying_at_the_deadline() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(
            u32::MAX,
            Duration::from_millis(500),
            Duration::from_secs(2),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("down".to_string()) }
            },
        )
        .await;

        assert!(result.is_err());
        // 500ms, 1s, 2s (+ jitter) of waiting crosses the 2s deadline well
        // before the attempt budget does.
        assert!(calls.load(Ordering::SeqCst) < 10);
    }
}
