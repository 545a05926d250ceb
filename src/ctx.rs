//! Cancellation, deadlines and polling shared by every blocking call.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CujError, Result};

/// Default cadence for `wait-*` primitives.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Default upper bound for `wait-*` primitives.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

impl PollOptions {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub fn with_interval(self, interval: Duration) -> Self {
        Self { interval, ..self }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }
}

/// Execution context threaded through actions and waits.
///
/// Cloning is cheap; clones share the cancellation token. Child contexts made
/// with [`Ctx::shorten`] or [`Ctx::with_timeout`] are cancelled with their
/// parent, while [`Ctx::cleanup`] hands out an independent token so teardown
/// keeps its own budget.
#[derive(Debug, Clone)]
pub struct Ctx {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    poll: PollOptions,
}

impl Default for Ctx {
    fn default() -> Self {
        Self::new()
    }
}

impl Ctx {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            poll: PollOptions::default(),
        }
    }

    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
            poll: PollOptions::default(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn poll(&self) -> PollOptions {
        self.poll
    }

    /// Time left before the deadline; `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Child context whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Ctx {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(current) if current < candidate => current,
            _ => candidate,
        };
        Ctx {
            cancel: self.cancel.child_token(),
            deadline: Some(deadline),
            poll: self.poll,
        }
    }

    /// Child context with `reserve` carved off the end of the deadline.
    pub fn shorten(&self, reserve: Duration) -> Ctx {
        let deadline = self.deadline.map(|deadline| {
            deadline
                .checked_sub(reserve)
                .filter(|shortened| *shortened > Instant::now())
                .unwrap_or_else(Instant::now)
        });
        Ctx {
            cancel: self.cancel.child_token(),
            deadline,
            poll: self.poll,
        }
    }

    /// Context with different default polling options.
    pub fn with_poll(&self, poll: PollOptions) -> Ctx {
        Ctx {
            poll,
            ..self.clone()
        }
    }

    /// Independent context for deferred teardown, bounded by `budget`.
    pub fn cleanup(&self, budget: Duration) -> Ctx {
        Ctx {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + budget),
            poll: self.poll,
        }
    }

    fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CujError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(CujError::timeout(Duration::ZERO, "context deadline exceeded"));
            }
        }
        Ok(())
    }

    /// Pause for `duration`, abandoning early on cancellation or deadline.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.check()?;
        let wake = Instant::now() + duration;
        let (until, hits_deadline) = match self.deadline {
            Some(deadline) if deadline < wake => (deadline, true),
            _ => (wake, false),
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CujError::Cancelled),
            _ = tokio::time::sleep_until(until) => {
                if hits_deadline {
                    Err(CujError::timeout(duration, "context deadline exceeded during sleep"))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Drive `fut` to completion unless cancellation or the deadline wins.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        let started = Instant::now();
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => Err(CujError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => Err(CujError::timeout(
                    started.elapsed(),
                    "context deadline exceeded",
                )),
                result = fut => result,
            },
            None => tokio::select! {
                _ = self.cancel.cancelled() => Err(CujError::Cancelled),
                result = fut => result,
            },
        }
    }
}

/// Outcome of one polling attempt.
#[derive(Debug)]
pub enum PollError {
    /// Keep polling; the error is reported if the wait times out.
    Retry(CujError),
    /// Stop immediately with this error.
    Break(CujError),
}

impl From<CujError> for PollError {
    fn from(err: CujError) -> Self {
        PollError::Retry(err)
    }
}

/// Repeatedly run `attempt` until it succeeds, breaks, or `opts.timeout`
/// elapses.
///
/// Each attempt races the bounded deadline, so an attempt that never
/// resolves still ends in [`CujError::Timeout`]. The loop yields
/// `opts.interval` between attempts, so cancellation is observed within one
/// interval.
pub async fn poll<T, F, Fut>(ctx: &Ctx, opts: PollOptions, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, PollError>>,
{
    let started = Instant::now();
    let bounded = ctx.with_timeout(opts.timeout);
    let deadline = bounded.deadline().unwrap_or_else(|| started + opts.timeout);
    let mut attempts = 0u32;
    let mut last: Option<CujError> = None;
    loop {
        if ctx.is_cancelled() {
            return Err(CujError::Cancelled);
        }
        attempts += 1;
        let outcome = tokio::select! {
            biased;
            outcome = attempt() => outcome,
            _ = ctx.token().cancelled() => return Err(CujError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                debug!(attempts, "poll attempt outlived its deadline");
                return Err(poll_timeout(started, last.as_ref()));
            }
        };
        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(PollError::Break(err)) => return Err(err),
            Err(PollError::Retry(err)) => err,
        };
        if !err.is_timeout() && err.is_fatal() {
            return Err(err);
        }
        let err = last.insert(err);

        let elapsed = started.elapsed();
        let out_of_time = bounded
            .remaining()
            .is_some_and(|left| left <= opts.interval);
        if elapsed >= opts.timeout || out_of_time {
            debug!(attempts, elapsed_ms = elapsed.as_millis() as u64, "poll timed out");
            return Err(CujError::timeout(elapsed, format!("last error: {err}")));
        }
        match bounded.sleep(opts.interval).await {
            Ok(()) => {}
            Err(CujError::Cancelled) => return Err(CujError::Cancelled),
            Err(_) => return Err(poll_timeout(started, last.as_ref())),
        }
    }
}

fn poll_timeout(started: Instant, last: Option<&CujError>) -> CujError {
    let message = match last {
        Some(err) => format!("last error: {err}"),
        None => "first attempt did not finish".to_string(),
    };
    CujError::timeout(started.elapsed(), message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn sleep_observes_cancellation() {
        let ctx = Ctx::new();
        let handle = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            handle.cancel();
        });
        let err = ctx.sleep(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, CujError::Cancelled));
    }

    #[tokio::test]
    async fn sleep_stops_at_deadline() {
        let ctx = Ctx::new().with_timeout(Duration::from_millis(10));
        let started = Instant::now();
        let err = ctx.sleep(Duration::from_secs(5)).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn shorten_reserves_time_and_follows_parent_cancel() {
        let parent = Ctx::new().with_timeout(Duration::from_secs(60));
        let child = parent.shorten(Duration::from_secs(10));
        let left = child.remaining().expect("bounded");
        assert!(left <= Duration::from_secs(50));
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn cleanup_context_survives_parent_cancel() {
        let parent = Ctx::new();
        let cleanup = parent.cleanup(Duration::from_secs(10));
        parent.cancel();
        assert!(!cleanup.is_cancelled());
        assert!(cleanup.sleep(Duration::from_millis(1)).await.is_ok());
    }

    #[tokio::test]
    async fn poll_retries_until_success() {
        let ctx = Ctx::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let value = poll(
            &ctx,
            PollOptions::new(Duration::from_millis(1), Duration::from_secs(1)),
            move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(PollError::Retry(CujError::failed("not yet")))
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn poll_reports_last_error_on_timeout() {
        let ctx = Ctx::new();
        let err = poll(
            &ctx,
            PollOptions::new(Duration::from_millis(2), Duration::from_millis(20)),
            || async { Err::<(), _>(PollError::Retry(CujError::failed("still missing"))) },
        )
        .await
        .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("still missing"));
    }

    #[tokio::test]
    async fn poll_break_stops_immediately() {
        let ctx = Ctx::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let err = poll(&ctx, PollOptions::default(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(PollError::Break(CujError::failed("give up"))) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "give up");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn poll_times_out_an_attempt_that_never_resolves() {
        let ctx = Ctx::new();
        let started = Instant::now();
        let waited = tokio::time::timeout(
            Duration::from_secs(2),
            poll(
                &ctx,
                PollOptions::new(Duration::from_millis(2), Duration::from_millis(30)),
                || futures_util::future::pending::<std::result::Result<(), PollError>>(),
            ),
        )
        .await
        .expect("poll returned before the outer guard");
        let err = waited.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("first attempt did not finish"));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn poll_timeout_after_hang_keeps_the_previous_error() {
        let ctx = Ctx::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let err = poll(
            &ctx,
            PollOptions::new(Duration::from_millis(1), Duration::from_millis(40)),
            move || {
                let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
                async move {
                    if first {
                        Err::<(), _>(PollError::Retry(CujError::failed("window not shown")))
                    } else {
                        futures_util::future::pending().await
                    }
                }
            },
        )
        .await
        .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("window not shown"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
