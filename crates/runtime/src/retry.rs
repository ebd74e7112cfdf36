//! Shared retry/backoff combinator
//!
//! Both the planner and the executor retry through this one place instead of
//! open-coding attempt loops at each call site. Backoff schedules are fixed
//! per caller; the combinator sleeps between attempts and stops early when a
//! shutdown signal flips.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;

/// Bounded retry schedule. `delays[n]` is slept after failed attempt `n + 1`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delays: Vec<Duration>,
}

impl RetryPolicy {
    /// Planner schedule: 3 attempts, 1 s / 4 s / 16 s.
    pub fn planner() -> Self {
        Self {
            max_attempts: 3,
            delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(4),
                Duration::from_secs(16),
            ],
        }
    }

    /// Executor schedule: 10 s / 20 s / 30 s between attempts.
    pub fn executor(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delays: vec![
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(30),
            ],
        }
    }

    /// Delay to sleep after the given 1-based attempt fails.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let idx = (attempt as usize).saturating_sub(1);
        self.delays
            .get(idx)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    #[cfg(test)]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delays: vec![Duration::ZERO],
        }
    }
}

/// Outcome of a retried operation, carrying how many attempts ran.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Run `op` up to `policy.max_attempts` times.
///
/// `op` receives the 1-based attempt number. A failure is re-run only when
/// `is_retryable` says so; otherwise it is returned immediately. When a
/// shutdown receiver is supplied, a flip to `true` during backoff cancels
/// the remaining attempts and the last error is returned — the in-flight
/// attempt itself is never interrupted here, callers bound it with their own
/// deadline.
pub async fn run_with_retry<T, E, Op, Fut>(
    policy: &RetryPolicy,
    mut shutdown: Option<watch::Receiver<bool>>,
    mut op: Op,
    is_retryable: impl Fn(&E) -> bool,
) -> RetryOutcome<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) => {
                if attempt >= policy.max_attempts || !is_retryable(&err) {
                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt,
                    };
                }

                let delay = policy.delay_after(attempt);
                let cancelled = match shutdown.as_mut() {
                    Some(rx) => backoff_or_cancel(rx, delay).await,
                    None => {
                        tokio::time::sleep(delay).await;
                        false
                    }
                };
                if cancelled {
                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt,
                    };
                }
            }
        }
    }
}

/// Sleep for `delay`, returning `true` if shutdown fired first.
async fn backoff_or_cancel(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_ok() && *shutdown.borrow(),
    }
}
