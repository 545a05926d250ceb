use tracing::{debug, warn};

use crate::ctx::Ctx;
use crate::error::{CujError, Result};
use crate::histogram::{self, Histogram, HistogramSource};

/// Renderer failure counters ("sad tab" pages).
pub const SAD_TAB_HISTOGRAMS: [&str; 3] = [
    "Tabs.SadTab.CrashCreated",
    "Tabs.SadTab.KillCreated",
    "Tabs.SadTab.OomCreated",
];

/// Detects tab crashes between [`TabCrashChecker::start`] and
/// [`TabCrashChecker::check`].
#[derive(Debug, Clone)]
pub struct TabCrashChecker {
    baselines: Vec<Histogram>,
}

impl TabCrashChecker {
    pub async fn start(ctx: &Ctx, source: &dyn HistogramSource) -> Result<Self> {
        let mut baselines = Vec::with_capacity(SAD_TAB_HISTOGRAMS.len());
        for name in SAD_TAB_HISTOGRAMS {
            baselines.push(histogram::get(ctx, source, name).await?);
        }
        debug!(source = source.label(), "tab crash surveillance started");
        Ok(Self { baselines })
    }

    /// Fails with [`CujError::TabCrash`] when any counter advanced.
    pub async fn check(&self, ctx: &Ctx, source: &dyn HistogramSource) -> Result<()> {
        let mut advanced = Vec::new();
        for baseline in &self.baselines {
            let current = histogram::get(ctx, source, &baseline.name).await?;
            let delta = current.diff(baseline);
            if !delta.is_empty() {
                advanced.push(format!("{} (+{})", baseline.name, delta.total()));
            }
        }
        if advanced.is_empty() {
            return Ok(());
        }
        let detail = advanced.join(", ");
        warn!(counters = %detail, "tab crash detected");
        Err(CujError::TabCrash(detail))
    }
}
