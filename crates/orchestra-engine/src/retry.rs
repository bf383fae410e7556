//! Retry classification and exponential backoff with jitter for agent calls.
//!
//! Retry progress lives in an explicit [`RetryState`] (attempt count and the
//! earliest instant the next attempt may run), so a caller can either sleep
//! until it is eligible ([`RetryPolicy::execute_with_retry`]) or poll it from a
//! cooperative timer without changing how delays are decided.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use orchestra_types::{OrchestraError, Result, RetryConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            backoff_factor: config.backoff_factor,
            jitter: config.jitter,
        }
    }

    /// Retries without waiting. Used by dry runs and tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
            jitter: false,
        }
    }

    /// `true` when `error` is retryable and `attempt` (0-indexed count of
    /// retries already spent) is below the limit.
    pub fn should_retry(&self, error: &OrchestraError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_retries
    }

    /// `min(base_delay * backoff_factor^attempt, max_delay)`, without jitter.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.base_delay.as_millis() as f64 * self.backoff_factor.powi(exponent);
        let cap = self.max_delay.as_millis() as f64;
        if !millis.is_finite() || millis >= cap {
            return self.max_delay;
        }
        Duration::from_millis(millis as u64)
    }

    /// Delay before retry number `attempt`, jittered when enabled.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.next_delay_with(attempt, &mut rand::thread_rng())
    }

    /// [`next_delay`](Self::next_delay) with a caller-supplied random source.
    /// The jittered value lies in `[0.5, 1.5] * capped_delay(attempt)`.
    pub fn next_delay_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let capped = self.capped_delay(attempt);
        if !self.jitter || capped.is_zero() {
            return capped;
        }
        capped.mul_f64(rng.gen_range(0.5..=1.5))
    }

    /// Run `f` until it succeeds, fails terminally, or retries run out. The
    /// error from the last attempt is returned unchanged.
    pub async fn execute_with_retry<T, F, Fut>(&self, f: F, label: &str) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_retry_notify(f, label, |_, _| {}).await
    }

    /// Like [`execute_with_retry`](Self::execute_with_retry), calling
    /// `on_retry(attempt, delay)` before each backoff sleep.
    pub async fn execute_with_retry_notify<T, F, Fut, N>(
        &self,
        mut f: F,
        label: &str,
        mut on_retry: N,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        N: FnMut(u32, Duration),
    {
        let mut state = RetryState::new();
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) => match state.record_failure(self, &e) {
                    Some(delay) => {
                        tracing::warn!(
                            task = %label,
                            attempt = state.attempt,
                            delay_ms = %delay.as_millis(),
                            error = %e,
                            "Retryable error, retrying"
                        );
                        on_retry(state.attempt, delay);
                        state.wait().await;
                    }
                    None => {
                        if e.is_retryable() {
                            tracing::warn!(task = %label, attempts = state.attempt + 1, error = %e, "Retries exhausted");
                        }
                        return Err(e);
                    }
                },
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RetryState
// ---------------------------------------------------------------------------

/// Progress of one retry loop.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Retries scheduled so far.
    pub attempt: u32,
    /// Earliest instant the next attempt may start. `None` before any failure.
    pub next_eligible_at: Option<Instant>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed attempt. Returns the backoff before the next attempt, or
    /// `None` when the error is terminal or retries are exhausted.
    ///
    /// A rate-limit hint longer than the computed delay wins.
    pub fn record_failure(&mut self, policy: &RetryPolicy, error: &OrchestraError) -> Option<Duration> {
        if !policy.should_retry(error, self.attempt) {
            return None;
        }
        let mut delay = policy.next_delay(self.attempt);
        if let OrchestraError::RateLimited { retry_after_ms } = error {
            delay = delay.max(Duration::from_millis(*retry_after_ms).min(policy.max_delay));
        }
        self.attempt += 1;
        self.next_eligible_at = Some(Instant::now() + delay);
        Some(delay)
    }

    pub fn is_eligible(&self, now: Instant) -> bool {
        self.next_eligible_at.map_or(true, |at| now >= at)
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.next_eligible_at
            .map_or(Duration::ZERO, |at| at.saturating_duration_since(now))
    }

    /// Sleep until the next attempt is eligible.
    pub async fn wait(&self) {
        if let Some(at) = self.next_eligible_at {
            tokio::time::sleep_until(at).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(jitter: bool) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            backoff_factor: 2.0,
            jitter,
        }
    }

    fn transient() -> OrchestraError {
        OrchestraError::TransientAgent {
            message: "connection reset".into(),
        }
    }

    #[test]
    fn capped_delay_grows_then_caps() {
        let p = policy(false);
        assert_eq!(p.capped_delay(0), Duration::from_millis(100));
        assert_eq!(p.capped_delay(1), Duration::from_millis(200));
        assert_eq!(p.capped_delay(3), Duration::from_millis(800));
        assert_eq!(p.capped_delay(4), Duration::from_millis(1_000));
        assert_eq!(p.capped_delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn capped_delay_is_non_decreasing() {
        let p = policy(false);
        let delays: Vec<_> = (0..20).map(|a| p.capped_delay(a)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let p = policy(true);
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..8 {
            let capped = p.capped_delay(attempt);
            for _ in 0..200 {
                let d = p.next_delay_with(attempt, &mut rng);
                assert!(d >= capped.mul_f64(0.5), "{d:?} below range at {attempt}");
                assert!(d <= capped.mul_f64(1.5), "{d:?} above range at {attempt}");
            }
        }
    }

    #[test]
    fn classification_drives_should_retry() {
        let p = policy(false);
        assert!(p.should_retry(&transient(), 0));
        assert!(p.should_retry(&OrchestraError::AgentTimeout { timeout_ms: 10 }, 2));
        assert!(p.should_retry(&OrchestraError::RateLimited { retry_after_ms: 5 }, 1));
        assert!(!p.should_retry(&transient(), 3));
        assert!(!p.should_retry(&OrchestraError::AuthError { message: "bad key".into() }, 0));
        assert!(!p.should_retry(&OrchestraError::Validation("schema".into()), 0));
        assert!(!p.should_retry(&OrchestraError::Config("missing".into()), 0));
        assert!(!p.should_retry(&OrchestraError::FatalAgent { message: "crash".into() }, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_state_tracks_eligibility() {
        let p = policy(false);
        let mut state = RetryState::new();
        assert!(state.is_eligible(Instant::now()));

        let delay = state.record_failure(&p, &transient()).unwrap();
        assert_eq!(delay, Duration::from_millis(100));
        assert_eq!(state.attempt, 1);
        assert!(!state.is_eligible(Instant::now()));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(state.is_eligible(Instant::now()));
        assert_eq!(state.remaining(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn rate_limit_hint_extends_delay() {
        let p = policy(false);
        let mut state = RetryState::new();
        let delay = state
            .record_failure(&p, &OrchestraError::RateLimited { retry_after_ms: 700 })
            .unwrap();
        assert_eq!(delay, Duration::from_millis(700));
    }

    #[tokio::test]
    async fn success_on_first_try() {
        let result = RetryPolicy::immediate(3)
            .execute_with_retry(|| async { Ok::<_, OrchestraError>("done") }, "t1")
            .await;
        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut retried = Vec::new();

        let result = policy(false)
            .execute_with_retry_notify(
                move || {
                    let c = c.clone();
                    async move {
                        if c.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(transient())
                        } else {
                            Ok(42)
                        }
                    }
                },
                "t1",
                |attempt, delay| retried.push((attempt, delay)),
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            retried,
            vec![(1, Duration::from_millis(100)), (2, Duration::from_millis(200))]
        );
    }

    #[tokio::test]
    async fn exhausted_retries_return_original_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<()> = RetryPolicy::immediate(2)
            .execute_with_retry(
                move || {
                    let c = c.clone();
                    async move {
                        let n = c.fetch_add(1, Ordering::SeqCst);
                        Err(OrchestraError::TransientAgent {
                            message: format!("attempt {n}"),
                        })
                    }
                },
                "t1",
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            OrchestraError::TransientAgent { message } => assert_eq!(message, "attempt 2"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn terminal_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<()> = RetryPolicy::immediate(5)
            .execute_with_retry(
                move || {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err(OrchestraError::FatalAgent {
                            message: "segfault".into(),
                        })
                    }
                },
                "t1",
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(OrchestraError::FatalAgent { .. })));
    }
}
