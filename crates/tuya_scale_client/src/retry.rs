use crate::ScaleError;
use crate::observability;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::{RngExt, rng};
use std::fmt::Display;
use std::time::Duration;

/// Source of "now" and of sleeping, so backoff and token expiry can be tested
/// without waiting on the wall clock.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// How a failed attempt may be retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryClass {
    /// Exponential backoff up to `max_retries`.
    Backoff,
    /// Retried at most `unknown_max_retries` times.
    Bounded,
    Fatal,
}

pub trait Retryable {
    fn retry_class(&self) -> RetryClass;
}

impl Retryable for ScaleError {
    fn retry_class(&self) -> RetryClass {
        match self {
            ScaleError::RateLimited(_) | ScaleError::Transport(_) => RetryClass::Backoff,
            ScaleError::Unknown { .. } => RetryClass::Bounded,
            _ => RetryClass::Fatal,
        }
    }
}

/// Exponential backoff with full jitter.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub unknown_max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            unknown_max_retries: 1,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the sleep before retry number `attempt` (1-based).
    pub fn delay_ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let ceiling = self.delay_ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        let mut rng = rng();
        Duration::from_millis(rng.random_range(0..=ceiling))
    }

    pub async fn retry_async<F, Fut, T, E>(&self, clock: &dyn Clock, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempt = 0u32;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let limit = match e.retry_class() {
                        RetryClass::Backoff => self.max_retries,
                        RetryClass::Bounded => self.unknown_max_retries.min(self.max_retries),
                        RetryClass::Fatal => return Err(e),
                    };
                    attempt += 1;
                    if attempt > limit {
                        return Err(e);
                    }
                    let delay = self.jittered_delay(attempt);
                    tracing::debug!(attempt, ?delay, error = %e, "retrying request");
                    metrics::counter!(observability::RETRIES_TOTAL).increment(1);
                    clock.sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// Records requested sleeps instead of sleeping; time only moves when told.
    #[derive(Default)]
    pub(crate) struct FakeClock {
        pub now: Mutex<DateTime<Utc>>,
        pub sleeps: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }

        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            unknown_max_retries: 1,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        }
    }

    async fn run_failing(
        clock: &FakeClock,
        err: ScaleError,
        succeed_on: u32,
    ) -> (Result<u32, ScaleError>, u32) {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = policy()
            .retry_async(clock, move || {
                let c = c.clone();
                let err = err.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < succeed_on { Err(err) } else { Ok(n) }
                }
            })
            .await;
        (result, calls.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn retry_succeeds_after_retries() {
        let clock = FakeClock::default();
        let (result, calls) = run_failing(&clock, ScaleError::Transport("reset".into()), 3).await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 3);
        assert_eq!(clock.sleeps.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn backoff_gives_up_after_max_retries() {
        let clock = FakeClock::default();
        let (result, calls) =
            run_failing(&clock, ScaleError::RateLimited("slow down".into()), u32::MAX).await;
        assert!(matches!(result, Err(ScaleError::RateLimited(_))));
        assert_eq!(calls, 4);
        let sleeps = clock.sleeps.lock().unwrap();
        for (i, d) in sleeps.iter().enumerate() {
            assert!(*d <= policy().delay_ceiling(i as u32 + 1));
        }
    }

    #[tokio::test]
    async fn unknown_errors_use_the_small_bound() {
        let clock = FakeClock::default();
        let err = ScaleError::Unknown { code: 7, msg: "?".into() };
        let (result, calls) = run_failing(&clock, err, u32::MAX).await;
        assert!(result.is_err());
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let clock = FakeClock::default();
        let (result, calls) =
            run_failing(&clock, ScaleError::DeviceNotFound("gone".into()), u32::MAX).await;
        assert!(matches!(result, Err(ScaleError::DeviceNotFound(_))));
        assert_eq!(calls, 1);
        assert!(clock.sleeps.lock().unwrap().is_empty());
    }

    #[test]
    fn delay_ceiling_doubles_then_caps() {
        let p = policy();
        assert_eq!(p.delay_ceiling(1), Duration::from_millis(20));
        assert_eq!(p.delay_ceiling(2), Duration::from_millis(40));
        assert_eq!(p.delay_ceiling(3), Duration::from_millis(40));
        assert_eq!(p.delay_ceiling(64), Duration::from_millis(40));
    }
}
