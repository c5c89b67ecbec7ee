//! Backoff - 指数バックオフ付きの再試行
//!
//! `BackoffPolicy::delay(n)` は `first × factor^n` を `max` で頭打ちにし、jitter をかける。
//! jitter の結果は次の計算に戻さない（n だけから base を求める）。
//!
//! Queue の retry 遅延と `BackoffPolicy::exec` は同じ式を使うが、互いに独立している。

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Jitter {
    #[default]
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// `delay/2 + uniform[0, delay/2]`.
    Equal,
}

impl Jitter {
    pub fn apply(self, delay: Duration) -> Duration {
        let ms = delay.as_millis() as u64;
        if ms == 0 {
            return delay;
        }
        let mut rng = rand::thread_rng();
        match self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_millis(rng.gen_range(0..=ms)),
            Jitter::Equal => {
                let half = ms / 2;
                Duration::from_millis(half + rng.gen_range(0..=half))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: Jitter,
}

impl Default for BackoffPolicy {
    /// 2s, 4s, 8s, ... capped at 10 minutes.
    fn default() -> Self {
        Self {
            first: Duration::from_secs(2),
            max: Duration::from_secs(600),
            factor: 2.0,
            jitter: Jitter::None,
        }
    }
}

impl BackoffPolicy {
    pub fn exponential(first: Duration, max: Duration) -> Self {
        Self {
            first,
            max,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after `failures` previous failures (0-indexed).
    ///
    /// Example with first=2s, factor=2.0:
    /// - 0: 2s
    /// - 1: 4s
    /// - 2: 8s
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        let base = if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        };
        self.jitter.apply(base)
    }

    /// Call `op` until it succeeds or `max_attempts` calls have failed.
    ///
    /// `op` receives the 1-based attempt number. Returns the last error on exhaustion.
    /// `max_attempts = 0` is treated as 1.
    pub async fn exec<T, F, Fut>(&self, max_attempts: u32, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= max_attempts => return Err(err),
                Err(err) => {
                    let delay = self.delay(attempt - 1);
                    warn!(attempt, max_attempts, ?delay, error = %err, "attempt failed, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SpindleError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> BackoffPolicy {
        BackoffPolicy::exponential(Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn exponential_backoff_increases() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(2));
        assert_eq!(policy.delay(1), Duration::from_secs(4));
        assert_eq!(policy.delay(2), Duration::from_secs(8));
    }

    #[test]
    fn delay_is_capped() {
        let policy = BackoffPolicy::exponential(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.delay(10), Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            assert!(Jitter::Full.apply(base) <= base);
            let eq = Jitter::Equal.apply(base);
            assert!(eq >= Duration::from_millis(500) && eq <= base);
        }
    }

    #[tokio::test]
    async fn exec_returns_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out = fast()
            .exec(5, move |attempt| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(SpindleError::handler("flaky"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exec_returns_last_error_on_exhaustion() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let err = fast()
            .exec(3, move |attempt| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(SpindleError::handler(format!("fail {attempt}")))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.to_string(), "handler error: fail 3");
    }

    #[tokio::test]
    async fn zero_attempts_still_calls_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let _ = fast()
            .exec(0, move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(SpindleError::handler("nope"))
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
