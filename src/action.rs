//! First-class scenario steps and the combinators that compose them.
//!
//! An [`Action`] is a cheaply cloneable function of a [`Ctx`] that either
//! succeeds or fails with a [`CujError`]. Composition is left to right and
//! short-circuits on the first failure; named steps prepend their name to the
//! failure so the failing leaf can be identified from the message alone.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::ctx::{Ctx, PollError, PollOptions, poll};
use crate::error::{CujError, Result};

type ActionFn = dyn Fn(Ctx) -> BoxFuture<'static, Result<()>> + Send + Sync;

#[derive(Clone)]
pub struct Action {
    name: Option<Arc<str>>,
    body: Arc<ActionFn>,
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name.as_deref().unwrap_or("<anonymous>"))
            .finish()
    }
}

impl Action {
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: Fn(Ctx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: None,
            body: Arc::new(move |ctx| Box::pin(body(ctx))),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Run the action; a cancelled context fails before the body starts.
    pub async fn run(&self, ctx: &Ctx) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(CujError::Cancelled);
        }
        (self.body)(ctx.clone()).await
    }

    /// Same body, failures wrapped with `name`.
    pub fn named(self, name: impl Into<String>) -> Action {
        named(name, self)
    }
}

/// Wrap failures of `action` with `name`.
pub fn named(name: impl Into<String>, action: Action) -> Action {
    let name: Arc<str> = Arc::from(name.into());
    let label = name.clone();
    let inner = action;
    Action {
        name: Some(name),
        body: Arc::new(move |ctx| {
            let inner = inner.clone();
            let label = label.clone();
            Box::pin(async move { inner.run(&ctx).await.map_err(|err| err.wrap(label.as_ref())) })
        }),
    }
}

/// Always succeeds.
pub fn noop() -> Action {
    Action::new(|_ctx| async { Ok(()) })
}

/// Always fails with `message`.
pub fn fail(message: impl Into<String>) -> Action {
    let message: Arc<str> = Arc::from(message.into());
    Action::new(move |_ctx| {
        let message = message.clone();
        async move { Err(CujError::failed(message.as_ref())) }
    })
}

/// Run `actions` in order; the first failure stops the sequence and is
/// wrapped with `name`.
pub fn combine(name: impl Into<String>, actions: impl IntoIterator<Item = Action>) -> Action {
    let steps: Arc<[Action]> = actions.into_iter().collect();
    named(
        name,
        Action::new(move |ctx| {
            let steps = steps.clone();
            async move {
                for step in steps.iter() {
                    step.run(&ctx).await?;
                }
                Ok(())
            }
        }),
    )
}

/// Run `probe`; when it succeeds run `then`, otherwise succeed silently.
pub fn if_success_then(probe: Action, then: Action) -> Action {
    Action::new(move |ctx| {
        let probe = probe.clone();
        let then = then.clone();
        async move {
            match probe.run(&ctx).await {
                Ok(()) => then.run(&ctx).await,
                Err(err) if err.is_fatal() => Err(err),
                Err(err) => {
                    debug!(error = %err, "probe failed, skipping follow-up");
                    Ok(())
                }
            }
        }
    })
}

/// Run `probe`; when it fails run `then`, otherwise succeed.
pub fn if_fail_then(probe: Action, then: Action) -> Action {
    Action::new(move |ctx| {
        let probe = probe.clone();
        let then = then.clone();
        async move {
            match probe.run(&ctx).await {
                Ok(()) => Ok(()),
                Err(err) if err.is_fatal() => Err(err),
                Err(err) => {
                    debug!(error = %err, "probe failed, running fallback");
                    then.run(&ctx).await
                }
            }
        }
    })
}

/// Re-invoke `action` until it succeeds or `opts.timeout` elapses.
pub fn retry(action: Action, opts: PollOptions) -> Action {
    Action::new(move |ctx| {
        let action = action.clone();
        async move {
            let attempt_ctx = ctx.clone();
            poll(&ctx, opts, move || {
                let action = action.clone();
                let ctx = attempt_ctx.clone();
                async move { action.run(&ctx).await.map_err(PollError::Retry) }
            })
            .await
        }
    })
}

/// Try `action` up to `times` times, pausing `interval` between attempts.
pub fn retry_times(times: usize, action: Action, interval: Duration) -> Action {
    retry_times_inner(times, action, interval, true)
}

/// Like [`retry_times`] without logging intermediate failures.
pub fn retry_silently(times: usize, action: Action, interval: Duration) -> Action {
    retry_times_inner(times, action, interval, false)
}

fn retry_times_inner(times: usize, action: Action, interval: Duration, log: bool) -> Action {
    Action::new(move |ctx| {
        let action = action.clone();
        async move {
            let mut last = None;
            for attempt in 0..times.max(1) {
                if attempt > 0 {
                    ctx.sleep(interval).await?;
                }
                match action.run(&ctx).await {
                    Ok(()) => return Ok(()),
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        if log {
                            warn!(attempt = attempt + 1, error = %err, "attempt failed");
                        }
                        last = Some(err);
                    }
                }
            }
            Err(last
                .unwrap_or_else(|| CujError::failed("retry ran no attempts"))
                .wrap(format!("failed after {} attempts", times.max(1))))
        }
    })
}

/// Repeat `action` until `condition` succeeds, checking after every run.
pub fn retry_until(action: Action, condition: Action, opts: PollOptions) -> Action {
    Action::new(move |ctx| {
        let action = action.clone();
        let condition = condition.clone();
        async move {
            let attempt_ctx = ctx.clone();
            poll(&ctx, opts, move || {
                let action = action.clone();
                let condition = condition.clone();
                let ctx = attempt_ctx.clone();
                async move {
                    action.run(&ctx).await.map_err(PollError::Break)?;
                    condition.run(&ctx).await.map_err(PollError::Retry)
                }
            })
            .await
        }
    })
}

/// Run `action` exactly `times` times.
pub fn repeat(times: usize, action: Action) -> Action {
    Action::new(move |ctx| {
        let action = action.clone();
        async move {
            for index in 0..times {
                action
                    .run(&ctx)
                    .await
                    .map_err(|err| err.wrap(format!("iteration {}", index + 1)))?;
            }
            Ok(())
        }
    })
}

/// Bound the total duration of `action`.
pub fn with_timeout(timeout: Duration, action: Action) -> Action {
    Action::new(move |ctx| {
        let action = action.clone();
        async move {
            let bounded = ctx.with_timeout(timeout);
            let started = Instant::now();
            match tokio::time::timeout(timeout, action.run(&bounded)).await {
                Ok(result) => result,
                Err(_) => Err(CujError::timeout(
                    started.elapsed(),
                    format!("action did not finish within {timeout:?}"),
                )),
            }
        }
    })
}

/// Run `action` with `interval` as the polling cadence of its waits.
pub fn with_interval(interval: Duration, action: Action) -> Action {
    Action::new(move |ctx| {
        let action = action.clone();
        async move {
            let poll = ctx.poll().with_interval(interval);
            action.run(&ctx.with_poll(poll)).await
        }
    })
}

/// Run `action` with `opts` as the default polling options of its waits.
pub fn with_poll_options(opts: PollOptions, action: Action) -> Action {
    Action::new(move |ctx| {
        let action = action.clone();
        async move { action.run(&ctx.with_poll(opts)).await }
    })
}

/// Unconditional pause.
pub fn sleep(duration: Duration) -> Action {
    Action::new(move |ctx| async move { ctx.sleep(duration).await })
}

/// Pause for an effect with no observable completion event.
///
/// Kept distinct from [`sleep`] so every fixed wait carries the reason it
/// exists and can be replaced by a real wait later.
pub fn settle(reason: impl Into<String>, duration: Duration) -> Action {
    let reason: Arc<str> = Arc::from(reason.into());
    Action::new(move |ctx| {
        let reason = reason.clone();
        async move {
            debug!(reason = %reason, duration_ms = duration.as_millis() as u64, "settling");
            ctx.sleep(duration).await
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counter() -> (Arc<AtomicU32>, Action) {
        let hits = Arc::new(AtomicU32::new(0));
        let tally = hits.clone();
        let action = Action::new(move |_ctx| {
            let tally = tally.clone();
            async move {
                tally.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        (hits, action)
    }

    fn fails_until(successes_after: u32) -> (Arc<AtomicU32>, Action) {
        let calls = Arc::new(AtomicU32::new(0));
        let tally = calls.clone();
        let action = Action::new(move |_ctx| {
            let tally = tally.clone();
            async move {
                let n = tally.fetch_add(1, Ordering::SeqCst) + 1;
                if n > successes_after {
                    Ok(())
                } else {
                    Err(CujError::failed(format!("attempt {n}")))
                }
            }
        });
        (calls, action)
    }

    #[tokio::test]
    async fn combine_short_circuits_with_breadcrumb() {
        let (hits, tail) = counter();
        let action = combine(
            "outer",
            [
                sleep(Duration::from_millis(10)),
                fail("boom"),
                sleep(Duration::from_millis(10)),
                tail,
            ],
        );
        let started = Instant::now();
        let err = action.run(&Ctx::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "outer: boom");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(started.elapsed() < Duration::from_millis(25));
    }

    #[tokio::test]
    async fn nested_combine_runs_in_the_same_order_as_flat() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let step = |label: &'static str| {
            let order = order.clone();
            Action::new(move |_ctx| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(label);
                    Ok(())
                }
            })
        };
        combine("flat", [step("a"), step("b"), step("c")])
            .run(&Ctx::new())
            .await
            .unwrap();
        combine("nested", [step("a"), combine("inner", [step("b"), step("c")])])
            .run(&Ctx::new())
            .await
            .unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn nested_failure_keeps_full_chain() {
        let err = combine("outer", [combine("inner", [fail("boom")])])
            .run(&Ctx::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "outer: inner: boom");
        assert_eq!(err.chain(), vec!["outer", "inner"]);
    }

    #[tokio::test]
    async fn if_success_then_skips_follow_up_on_probe_failure() {
        let (hits, then) = counter();
        if_success_then(fail("absent"), then.clone())
            .run(&Ctx::new())
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        if_success_then(noop(), then).run(&Ctx::new()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn if_fail_then_runs_fallback_only_on_failure() {
        let (hits, then) = counter();
        if_fail_then(noop(), then.clone()).run(&Ctx::new()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        if_fail_then(fail("absent"), then).run(&Ctx::new()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_until_deadline() {
        let (calls, flaky) = fails_until(2);
        retry(
            flaky,
            PollOptions::new(Duration::from_millis(1), Duration::from_secs(1)),
        )
        .run(&Ctx::new())
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let err = retry(
            fail("never"),
            PollOptions::new(Duration::from_millis(2), Duration::from_millis(15)),
        )
        .run(&Ctx::new())
        .await
        .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("never"));
    }

    #[tokio::test]
    async fn retry_times_gives_up_after_n() {
        let (calls, flaky) = fails_until(10);
        let err = retry_times(3, flaky, Duration::from_millis(1))
            .run(&Ctx::new())
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.to_string(), "failed after 3 attempts: attempt 3");
    }

    #[tokio::test]
    async fn retry_until_reruns_action_until_condition_holds() {
        let (runs, action) = counter();
        let (_, condition) = fails_until(1);
        retry_until(
            action,
            condition,
            PollOptions::new(Duration::from_millis(1), Duration::from_secs(1)),
        )
        .run(&Ctx::new())
        .await
        .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn repeat_runs_n_times_and_labels_iteration() {
        let (hits, action) = counter();
        repeat(4, action).run(&Ctx::new()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 4);

        let err = repeat(2, fail("nope")).run(&Ctx::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "iteration 1: nope");
    }

    #[tokio::test]
    async fn with_timeout_bounds_duration() {
        let started = Instant::now();
        let err = with_timeout(Duration::from_millis(10), sleep(Duration::from_secs(10)))
            .run(&Ctx::new())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn with_interval_sets_poll_cadence() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let probe = {
            let seen = seen.clone();
            Action::new(move |ctx| {
                let seen = seen.clone();
                async move {
                    *seen.lock().unwrap() = Some(ctx.poll().interval);
                    Ok(())
                }
            })
        };
        with_interval(Duration::from_millis(7), probe)
            .run(&Ctx::new())
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(Duration::from_millis(7)));
    }

    #[tokio::test]
    async fn cancelled_context_fails_before_running() {
        let (hits, action) = counter();
        let ctx = Ctx::new();
        ctx.cancel();
        let err = action.run(&ctx).await.unwrap_err();
        assert!(matches!(err, CujError::Cancelled));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn settle_is_a_plain_pause() {
        let started = Instant::now();
        settle("alt-tab animation", Duration::from_millis(5))
            .run(&Ctx::new())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(5));
    }
}
