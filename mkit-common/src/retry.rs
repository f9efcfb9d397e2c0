//! Exponential backoff bounded by a wall-clock budget.
//!
//! Operations classify their own failures: only [`RetryError::Retriable`]
//! is retried, anything [`RetryError::Terminal`] ends the loop at once.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::deadline::Deadline;

/// Delay growth factor between attempts.
const FACTOR: u32 = 2;

/// Jitter applied to every delay after the first, as a fraction of the delay.
pub const JITTER: f64 = 0.1;

/// A failure tagged with whether trying again may help.
#[derive(Debug)]
pub enum RetryError<E> {
    Retriable(E),
    Terminal(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Retriable(e) | RetryError::Terminal(e) => e,
        }
    }

    pub fn inner(&self) -> &E {
        match self {
            RetryError::Retriable(e) | RetryError::Terminal(e) => e,
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, RetryError::Retriable(_))
    }
}

/// Tag the error side of a `Result` for the retry loop.
pub trait RetryExt<T, E> {
    fn retriable(self) -> Result<T, RetryError<E>>;
    fn terminal(self) -> Result<T, RetryError<E>>;
}

impl<T, E> RetryExt<T, E> for Result<T, E> {
    fn retriable(self) -> Result<T, RetryError<E>> {
        self.map_err(RetryError::Retriable)
    }

    fn terminal(self) -> Result<T, RetryError<E>> {
        self.map_err(RetryError::Terminal)
    }
}

/// Backoff schedule for [`retry_expo`].
#[derive(Debug, Clone)]
pub struct ExpoBackoff {
    /// Delay after the first failure, used exactly.
    pub initial: Duration,
    /// Cap applied before jitter.
    pub max: Duration,
    /// Total wall-clock time the loop may spend.
    pub budget: Duration,
    /// Checked at every iteration boundary.
    pub deadline: Option<Deadline>,
}

impl ExpoBackoff {
    pub fn new(initial: Duration, max: Duration, budget: Duration) -> Self {
        Self {
            initial,
            max,
            budget,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: &Deadline) -> Self {
        self.deadline = Some(deadline.clone());
        self
    }

    /// Delay after the `failures`th consecutive failure (1-based), capped but
    /// without jitter.
    pub fn capped_delay(&self, failures: u32) -> Duration {
        let failures = failures.max(1);
        let multiplier = FACTOR.saturating_pow(failures - 1);
        self.initial.saturating_mul(multiplier).min(self.max)
    }

    /// Delay to sleep after the `failures`th failure. The first delay is
    /// exactly `initial`; later ones carry up to ±10% jitter.
    pub fn delay(&self, failures: u32) -> Duration {
        let capped = self.capped_delay(failures);
        if failures <= 1 {
            return capped;
        }
        apply_jitter(capped, fastrand::f64())
    }
}

/// Scale `delay` by a factor in `[1 - JITTER, 1 + JITTER]`, where `unit` in
/// `[0, 1)` picks the point in that range.
pub fn apply_jitter(delay: Duration, unit: f64) -> Duration {
    let factor = 1.0 + (unit * 2.0 - 1.0) * JITTER;
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay)
}

/// Invoke `op` until it succeeds, fails terminally, or the budget runs out.
///
/// `op` always runs at least once. An iteration whose delay would cross the
/// budget is not started and the most recent error is returned. A running
/// invocation is never interrupted; the caller's deadline covers that.
pub async fn retry_expo<F, Fut, T, E>(backoff: &ExpoBackoff, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RetryError<E>>>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let mut attempt: u32 = 1;

    loop {
        debug!(attempt, "retry attempt");

        let err = match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(attempt, elapsed_ms = started.elapsed().as_millis() as u64, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(RetryError::Terminal(err)) => {
                warn!(attempt, error = %err, "terminal error, not retrying");
                return Err(err);
            }
            Err(RetryError::Retriable(err)) => err,
        };

        if let Some(deadline) = &backoff.deadline
            && deadline.is_expired()
        {
            warn!(attempt, error = %err, "deadline reached, giving up");
            return Err(err);
        }

        let delay = backoff.delay(attempt);
        if started.elapsed() + delay > backoff.budget {
            warn!(
                attempt,
                budget_ms = backoff.budget.as_millis() as u64,
                error = %err,
                "retry budget exhausted"
            );
            return Err(err);
        }

        info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "will retry after backoff"
        );

        match &backoff.deadline {
            Some(deadline) => {
                if deadline.sleep(delay, "retry backoff").await.is_err() {
                    warn!(attempt, error = %err, "deadline reached during backoff");
                    return Err(err);
                }
            }
            None => tokio::time::sleep(delay).await,
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    struct Attempt(u32);

    impl std::fmt::Display for Attempt {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "attempt {}", self.0)
        }
    }

    fn fast() -> ExpoBackoff {
        ExpoBackoff::new(
            Duration::from_millis(1),
            Duration::from_millis(5),
            Duration::from_secs(5),
        )
    }

    // ----- retry_expo() tests -----

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = retry_expo(&fast(), move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(RetryError::Retriable(Attempt(n)))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), Attempt> = retry_expo(&fast(), move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Err(Attempt(n)).terminal()
            }
        })
        .await;

        assert_eq!(result.unwrap_err(), Attempt(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_budget_still_invokes_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let backoff = ExpoBackoff::new(Duration::from_millis(10), Duration::from_secs(1), Duration::ZERO);

        let result: Result<(), Attempt> = retry_expo(&backoff, move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Err(Attempt(n)).retriable()
            }
        })
        .await;

        assert_eq!(result.unwrap_err(), Attempt(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_bounds_attempts_and_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let backoff = ExpoBackoff::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
            Duration::from_secs(3),
        );

        let started = Instant::now();
        let result: Result<(), Attempt> = retry_expo(&backoff, move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Err(Attempt(n)).retriable()
            }
        })
        .await;

        let n = calls.load(Ordering::SeqCst);
        assert!((3..=8).contains(&n), "invocations: {n}");
        assert_eq!(result.unwrap_err(), Attempt(n));
        assert!(started.elapsed() <= Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_cancelled_deadline_ends_loop_at_boundary() {
        let deadline = Deadline::after(Duration::from_secs(60));
        deadline.cancel();
        let backoff = fast().with_deadline(&deadline);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), Attempt> = retry_expo(&backoff, move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Err(Attempt(n)).retriable()
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // ----- delay schedule tests -----

    #[test]
    fn test_first_delay_is_exact() {
        let backoff = ExpoBackoff::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
            Duration::from_secs(3),
        );
        for _ in 0..20 {
            assert_eq!(backoff.delay(1), Duration::from_millis(100));
        }
    }

    #[test]
    fn test_capped_delay_doubles_until_cap() {
        let backoff = ExpoBackoff::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
            Duration::from_secs(3),
        );
        let delays: Vec<_> = (1..=6).map(|k| backoff.capped_delay(k).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_apply_jitter_bounds() {
        let base = Duration::from_secs(1);
        assert_eq!(apply_jitter(base, 0.5), base);
        assert!(apply_jitter(base, 0.0) >= Duration::from_millis(900));
        assert!(apply_jitter(base, 0.999_999) <= Duration::from_millis(1100));
    }

    proptest! {
        #[test]
        fn prop_delays_within_jitter_of_schedule(
            initial_ms in 1u64..2_000,
            max_ms in 1u64..60_000,
            failures in 1u32..40,
        ) {
            let backoff = ExpoBackoff::new(
                Duration::from_millis(initial_ms),
                Duration::from_millis(max_ms),
                Duration::from_secs(600),
            );
            let capped = backoff.capped_delay(failures);
            prop_assert!(capped <= Duration::from_millis(max_ms));

            let delay = backoff.delay(failures).as_secs_f64();
            let nominal = capped.as_secs_f64();
            prop_assert!(delay >= nominal * (1.0 - JITTER) - 1e-9);
            prop_assert!(delay <= nominal * (1.0 + JITTER) + 1e-9);
        }

        #[test]
        fn prop_capped_delays_non_decreasing(
            initial_ms in 1u64..2_000,
            max_ms in 1u64..60_000,
            failures in 1u32..40,
        ) {
            let backoff = ExpoBackoff::new(
                Duration::from_millis(initial_ms),
                Duration::from_millis(max_ms),
                Duration::from_secs(600),
            );
            prop_assert!(backoff.capped_delay(failures) <= backoff.capped_delay(failures + 1));
        }
    }
}
