use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::automation::{Automation, NodeAction, WatchId};
use super::finder::Finder;
use super::node::{EventKind, NodeInfo, NodeRef, Rect};
use crate::action::Action;
use crate::ctx::{Ctx, PollError, PollOptions, poll};
use crate::error::{CujError, Result};

/// Finder-driven waits and node actions against one [`Automation`] tree.
///
/// Cloning is cheap. Polling options default to the ones carried by the
/// [`Ctx`] each action runs under; `with_*` builders pin them.
#[derive(Clone)]
pub struct UiContext {
    automation: Arc<dyn Automation>,
    poll: Option<PollOptions>,
}

impl UiContext {
    pub fn new(automation: Arc<dyn Automation>) -> Self {
        Self {
            automation,
            poll: None,
        }
    }

    pub fn automation(&self) -> &Arc<dyn Automation> {
        &self.automation
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let base = self.poll.unwrap_or_default();
        self.with_poll_opts(base.with_timeout(timeout))
    }

    pub fn with_interval(&self, interval: Duration) -> Self {
        let base = self.poll.unwrap_or_default();
        self.with_poll_opts(base.with_interval(interval))
    }

    pub fn with_poll_opts(&self, opts: PollOptions) -> Self {
        Self {
            automation: self.automation.clone(),
            poll: Some(opts),
        }
    }

    fn opts(&self, ctx: &Ctx) -> PollOptions {
        self.poll.unwrap_or_else(|| ctx.poll())
    }

    /// Single attempt against a fresh snapshot.
    pub async fn find(&self, ctx: &Ctx, finder: &Finder) -> Result<NodeRef> {
        let tree = ctx.run(self.automation.tree()).await?;
        finder.select(&tree)
    }

    /// Poll until `finder` resolves to exactly one node.
    ///
    /// Missing and stale results are retried; an ambiguous finder fails at
    /// once.
    pub async fn locate(&self, ctx: &Ctx, finder: &Finder) -> Result<NodeRef> {
        let opts = self.opts(ctx);
        poll(ctx, opts, move || async move {
            match self.find(ctx, finder).await {
                Ok(node) => Ok(node),
                Err(err @ CujError::TooGeneric(_)) => Err(PollError::Break(err)),
                Err(err) => Err(PollError::Retry(err)),
            }
        })
        .await
    }

    pub async fn info(&self, ctx: &Ctx, finder: &Finder) -> Result<NodeInfo> {
        Ok(self.locate(ctx, finder).await?.info)
    }

    /// Whether at least one node currently matches, without waiting.
    pub async fn is_node_found(&self, ctx: &Ctx, finder: &Finder) -> Result<bool> {
        match self.find(ctx, finder).await {
            Ok(_) | Err(CujError::TooGeneric(_)) => Ok(true),
            Err(CujError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Current location of the node, without waiting for it to settle.
    pub async fn immediate_location(&self, ctx: &Ctx, finder: &Finder) -> Result<Rect> {
        Ok(self.find(ctx, finder).await?.location())
    }

    /// Location once two consecutive polls agree on a non-empty rectangle.
    pub async fn location(&self, ctx: &Ctx, finder: &Finder) -> Result<Rect> {
        let opts = self.opts(ctx);
        let previous = std::sync::Mutex::new(None::<Rect>);
        let previous = &previous;
        poll(ctx, opts, move || async move {
            let current = self.find(ctx, finder).await?.location();
            let mut last = previous
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let stable = *last == Some(current) && !current.is_empty();
            *last = Some(current);
            if stable {
                Ok(current)
            } else {
                Err(PollError::Retry(CujError::failed(format!(
                    "location of {finder} still changing: {current:?}"
                ))))
            }
        })
        .await
    }

    /// Succeeds when `finder` matches right now.
    pub fn exists(&self, finder: Finder) -> Action {
        let ui = self.clone();
        Action::new(move |ctx| {
            let ui = ui.clone();
            let finder = finder.clone();
            async move { ui.exists_now(&ctx, &finder).await }
        })
    }

    pub fn wait_until_exists(&self, finder: Finder) -> Action {
        let ui = self.clone();
        Action::new(move |ctx| {
            let ui = ui.clone();
            let finder = finder.clone();
            async move {
                let opts = ui.opts(&ctx);
                let (ui, finder, ctx) = (&ui, &finder, &ctx);
                poll(ctx, opts, move || async move {
                    ui.exists_now(ctx, finder).await?;
                    Ok(())
                })
                .await
            }
        })
    }

    pub fn wait_until_gone(&self, finder: Finder) -> Action {
        let ui = self.clone();
        Action::new(move |ctx| {
            let ui = ui.clone();
            let finder = finder.clone();
            async move {
                let opts = ui.opts(&ctx);
                let (ui, finder, ctx) = (&ui, &finder, &ctx);
                poll(ctx, opts, move || async move {
                    if ui.is_node_found(ctx, finder).await? {
                        Err(PollError::Retry(CujError::failed(format!(
                            "node still present: {finder}"
                        ))))
                    } else {
                        Ok(())
                    }
                })
                .await
            }
        })
    }

    /// Fails if `finder` matches at any poll during `window`.
    pub fn ensure_gone_for(&self, finder: Finder, window: Duration) -> Action {
        let ui = self.clone();
        Action::new(move |ctx| {
            let ui = ui.clone();
            let finder = finder.clone();
            async move {
                let interval = ui.opts(&ctx).interval;
                let started = Instant::now();
                loop {
                    if ui.is_node_found(&ctx, &finder).await? {
                        return Err(CujError::failed(format!(
                            "node appeared within {window:?}: {finder}"
                        )));
                    }
                    if started.elapsed() >= window {
                        return Ok(());
                    }
                    ctx.sleep(interval.min(window.saturating_sub(started.elapsed())))
                        .await?;
                }
            }
        })
    }

    /// Waits until the node's location stops changing.
    pub fn wait_for_location(&self, finder: Finder) -> Action {
        let ui = self.clone();
        Action::new(move |ctx| {
            let ui = ui.clone();
            let finder = finder.clone();
            async move {
                ui.location(&ctx, &finder).await?;
                Ok(())
            }
        })
    }

    /// Run `action` and wait for an event of `kind` on a node matching
    /// `finder`.
    ///
    /// Event targets are shallow, so only the finder's role, name, class and
    /// attribute constraints are checked against them.
    pub fn wait_for_event(&self, finder: Finder, kind: EventKind, action: Action) -> Action {
        let ui = self.clone();
        Action::new(move |ctx| {
            let ui = ui.clone();
            let finder = finder.clone();
            let action = action.clone();
            async move {
                let automation = ui.automation.clone();
                let id = ctx.run(automation.watch(kind)).await?;
                let outcome = ui.await_event(&ctx, id, &finder, kind, &action).await;
                let unwatched = automation.unwatch(id).await;
                outcome.and(unwatched)
            }
        })
    }

    async fn await_event(
        &self,
        ctx: &Ctx,
        id: WatchId,
        finder: &Finder,
        kind: EventKind,
        action: &Action,
    ) -> Result<()> {
        action.run(ctx).await?;
        let opts = self.opts(ctx);
        let automation = &self.automation;
        poll(ctx, opts, move || async move {
            let events = automation.drain(id).await?;
            if events
                .iter()
                .any(|event| event.kind == kind && finder.matches_node(&event.target))
            {
                Ok(())
            } else {
                Err(PollError::Retry(CujError::failed(format!(
                    "no {} event on {finder}",
                    kind.as_str()
                ))))
            }
        })
        .await
    }

    /// Waits for a `quiet` window with no event of `kind` on a matching node.
    pub fn wait_until_no_event(&self, finder: Finder, kind: EventKind, quiet: Duration) -> Action {
        let ui = self.clone();
        Action::new(move |ctx| {
            let ui = ui.clone();
            let finder = finder.clone();
            async move {
                let automation = ui.automation.clone();
                let id = ctx.run(automation.watch(kind)).await?;
                let outcome = ui.await_quiet(&ctx, id, &finder, kind, quiet).await;
                let unwatched = automation.unwatch(id).await;
                outcome.and(unwatched)
            }
        })
    }

    async fn await_quiet(
        &self,
        ctx: &Ctx,
        id: WatchId,
        finder: &Finder,
        kind: EventKind,
        quiet: Duration,
    ) -> Result<()> {
        let timeout = self.opts(ctx).timeout;
        let started = Instant::now();
        loop {
            ctx.sleep(quiet).await?;
            let events = self.automation.drain(id).await?;
            let seen = events
                .iter()
                .filter(|event| event.kind == kind && finder.matches_node(&event.target))
                .count();
            if seen == 0 {
                return Ok(());
            }
            debug!(kind = kind.as_str(), seen, "events still arriving");
            if started.elapsed() >= timeout {
                return Err(CujError::timeout(
                    started.elapsed(),
                    format!("{} events kept arriving on {finder}", kind.as_str()),
                ));
            }
        }
    }

    pub fn do_default(&self, finder: Finder) -> Action {
        self.node_action(finder, NodeAction::DoDefault)
    }

    pub fn focus(&self, finder: Finder) -> Action {
        self.node_action(finder, NodeAction::Focus)
    }

    pub fn make_visible(&self, finder: Finder) -> Action {
        self.node_action(finder, NodeAction::MakeVisible)
    }

    fn node_action(&self, finder: Finder, node_action: NodeAction) -> Action {
        let ui = self.clone();
        Action::new(move |ctx| {
            let ui = ui.clone();
            let finder = finder.clone();
            async move {
                let opts = ui.opts(&ctx);
                let (ui, finder, ctx) = (&ui, &finder, &ctx);
                poll(ctx, opts, move || async move {
                    let node = ui.locate(ctx, finder).await.map_err(PollError::Break)?;
                    match ui.automation.perform(&node, node_action).await {
                        Ok(()) => Ok(()),
                        Err(err @ CujError::Stale(_)) => Err(PollError::Retry(err)),
                        Err(err) => Err(PollError::Break(err)),
                    }
                })
                .await
            }
        })
    }

    async fn exists_now(&self, ctx: &Ctx, finder: &Finder) -> Result<()> {
        match self.find(ctx, finder).await {
            Ok(_) | Err(CujError::TooGeneric(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
