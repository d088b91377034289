use std::future::Future;
use std::time::Duration;

use tokio::time;
use tracing::debug;

/// Delay schedule for retrying a fallible call a bounded number of times.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub attempts: u32,
    pub initial: Duration,
    pub max: Duration,
    pub factor: u32,
}

impl Backoff {
    /// The same delay between every attempt.
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Backoff {
            attempts,
            initial: delay,
            max: delay,
            factor: 1,
        }
    }

    /// Doubling delays starting at `initial`, capped at `max`.
    pub fn exponential(attempts: u32, initial: Duration, max: Duration) -> Self {
        Backoff {
            attempts,
            initial,
            max,
            factor: 2,
        }
    }

    /// Delay to wait after the failed attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut delay = self.initial;
        for _ in 0..attempt {
            delay = delay.saturating_mul(self.factor);
            if delay >= self.max {
                return self.max;
            }
        }
        delay.min(self.max)
    }
}

/// Runs `op` until it succeeds, `retryable` rejects its error, or the budget
/// is spent. The last error is returned. At least one attempt is always made.
pub async fn retry<T, E, F, Fut, P>(backoff: Backoff, what: &str, retryable: P, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = backoff.attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                if attempt >= attempts || !retryable(&e) {
                    return Err(e);
                }
                let delay = backoff.delay(attempt - 1);
                debug!("{} failed (attempt {}/{}): {}, retrying in {:?}", what, attempt, attempts, e, delay);
                time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_delay_is_capped() {
        let b = Backoff::exponential(5, Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(b.delay(0), Duration::from_millis(100));
        assert_eq!(b.delay(1), Duration::from_millis(200));
        assert_eq!(b.delay(2), Duration::from_millis(350));
        assert_eq!(b.delay(10), Duration::from_millis(350));
    }

    #[test]
    fn test_fixed_delay() {
        let b = Backoff::fixed(3, Duration::from_millis(20));
        assert_eq!(b.delay(0), b.delay(7));
    }

    #[tokio::test]
    async fn test_retry_stops_after_budget() {
        let calls = AtomicU32::new(0);
        let res: Result<(), String> = retry(
            Backoff::fixed(3, Duration::from_millis(1)),
            "op",
            |_| true,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("boom".to_string()) }
            },
        )
        .await;
        assert_eq!(res, Err("boom".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let res: Result<u32, String> = retry(
            Backoff::exponential(5, Duration::from_millis(1), Duration::from_millis(4)),
            "op",
            |_| true,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(format!("attempt {}", n))
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await;
        assert_eq!(res, Ok(2));
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let res: Result<(), String> = retry(
            Backoff::fixed(5, Duration::from_millis(1)),
            "op",
            |e: &String| e != "fatal",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal".to_string()) }
            },
        )
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
