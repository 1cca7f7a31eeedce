//! Cancellable retry-with-backoff.
//!
//! [`retry_until`] is the single waiting primitive of the crate: process
//! startup and every convergence wait are expressed as a probe that is
//! retried until it reports [`Probe::Done`], the deadline passes, or the
//! harness is torn down.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::{HarnessError, Result};

/// How often and for how long to retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub interval: Duration,
    /// Ceiling for the delay once backoff applies.
    pub max_interval: Duration,
    /// Factor applied to the delay after each attempt.
    pub multiplier: f64,
    /// Overall budget, measured from the first attempt.
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Constant `interval` between attempts.
    pub fn fixed(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            max_interval: interval,
            multiplier: 1.0,
            timeout,
        }
    }

    pub fn with_backoff(mut self, multiplier: f64, max_interval: Duration) -> Self {
        self.multiplier = multiplier.max(1.0);
        self.max_interval = max_interval.max(self.interval);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Delay to use after `current`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }
}

/// Outcome of one probe attempt.
#[derive(Debug)]
pub enum Probe<T, L> {
    /// Stop retrying and return `T`.
    Done(T),
    /// Try again; `L` is kept as the last observation for error reporting.
    Retry(L),
}

/// Why [`retry_until`] gave up.
#[derive(Debug)]
pub enum RetryError<L> {
    TimedOut { attempts: u32, last: Option<L> },
    Cancelled,
}

/// Run `probe` until it returns [`Probe::Done`].
///
/// The probe receives the 1-based attempt number.  An attempt still in
/// flight when the deadline passes is abandoned, and sleeps never extend
/// past the deadline, so an always-failing probe returns no later than
/// `policy.timeout` plus scheduling slack.
pub async fn retry_until<T, L, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut probe: F,
) -> std::result::Result<T, RetryError<L>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Probe<T, L>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut delay = policy.interval;
    let mut attempts = 0u32;
    let mut last = None;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        attempts += 1;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            outcome = tokio::time::timeout_at(deadline, probe(attempts)) => outcome,
        };
        match outcome {
            Ok(Probe::Done(value)) => return Ok(value),
            Ok(Probe::Retry(observed)) => last = Some(observed),
            Err(_) => return Err(RetryError::TimedOut { attempts, last }),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(RetryError::TimedOut { attempts, last });
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay.min(deadline - now)) => {}
        }
        delay = policy.next_delay(delay);
    }
}

/// Bound `fut` by an overall deadline.
///
/// Used to wrap a whole scenario so that a single stuck node cannot hang
/// a test run.  On expiry the future is dropped and
/// [`HarnessError::Cancelled`] is returned.
pub async fn with_deadline<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Operation exceeded overall deadline of {:?}", limit);
            Err(HarnessError::Cancelled)
        }
    }
}

/// One overall deadline shared by several sequential phases.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    limit: Duration,
}

impl Deadline {
    pub fn after(limit: Duration) -> Self {
        Self {
            at: Instant::now() + limit,
            limit,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Run `fut` within whatever is left of the deadline.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout_at(self.at, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Operation exceeded overall deadline of {:?}", self.limit);
                Err(HarnessError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(interval_ms: u64, timeout_ms: u64) -> RetryPolicy {
        RetryPolicy::fixed(
            Duration::from_millis(interval_ms),
            Duration::from_millis(timeout_ms),
        )
    }

    #[tokio::test]
    async fn test_done_on_first_attempt() {
        let cancel = CancellationToken::new();
        let out: std::result::Result<u32, RetryError<()>> =
            retry_until(&policy(10, 1000), &cancel, |n| async move { Probe::Done(n) }).await;
        assert_eq!(out.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retries_until_done() {
        let cancel = CancellationToken::new();
        let out = retry_until(&policy(5, 2000), &cancel, |n| async move {
            if n < 4 {
                Probe::Retry(n)
            } else {
                Probe::Done("ready")
            }
        })
        .await;
        assert_eq!(out.unwrap(), "ready");
    }

    #[tokio::test]
    async fn test_times_out_with_last_observation() {
        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        let out: std::result::Result<(), _> =
            retry_until(&policy(20, 200), &cancel, |n| async move { Probe::Retry(n) }).await;
        let elapsed = started.elapsed();
        match out {
            Err(RetryError::TimedOut { attempts, last }) => {
                assert!(attempts >= 2);
                assert_eq!(last, Some(attempts));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(600), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_slow_probe_is_cut_at_deadline() {
        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        let out: std::result::Result<(), RetryError<()>> =
            retry_until(&policy(10, 100), &cancel, |_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Probe::Done(())
            })
            .await;
        assert!(matches!(out, Err(RetryError::TimedOut { attempts: 1, last: None })));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let out: std::result::Result<(), RetryError<()>> =
            retry_until(&policy(10, 60_000), &cancel, move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Probe::Retry(()) }
            })
            .await;
        assert!(matches!(out, Err(RetryError::Cancelled)));
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_never_probes() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let out: std::result::Result<(), RetryError<()>> =
            retry_until(&policy(10, 1000), &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Probe::Retry(()) }
            })
            .await;
        assert!(matches!(out, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_backoff_is_capped() {
        let p = policy(100, 1000).with_backoff(3.0, Duration::from_millis(500));
        assert_eq!(p.next_delay(Duration::from_millis(100)), Duration::from_millis(300));
        assert_eq!(p.next_delay(Duration::from_millis(300)), Duration::from_millis(500));
        let fixed = policy(100, 1000);
        assert_eq!(fixed.next_delay(Duration::from_millis(100)), Duration::from_millis(100));
    }

    #[test]
    fn test_huge_backoff_saturates_at_max_interval() {
        let cap = Duration::from_secs(1);
        let p = policy(200, 1000).with_backoff(1.0e30, cap);
        assert_eq!(p.next_delay(Duration::from_millis(200)), cap);
        let p = policy(200, 1000).with_backoff(f64::INFINITY, cap);
        assert_eq!(p.next_delay(Duration::from_millis(200)), cap);
    }

    #[tokio::test]
    async fn test_with_deadline() {
        let ok = with_deadline(Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let late: Result<()> = with_deadline(Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(late.unwrap_err().code(), "Cancelled");
    }

    #[tokio::test]
    async fn test_deadline_is_shared_across_phases() {
        let deadline = Deadline::after(Duration::from_millis(300));
        let first = deadline
            .run(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, HarnessError>(1)
            })
            .await;
        assert_eq!(first.unwrap(), 1);
        assert!(deadline.remaining() <= Duration::from_millis(100));

        let second = deadline
            .run(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, HarnessError>(2)
            })
            .await;
        assert!(matches!(second, Err(HarnessError::Cancelled)));
    }
}
