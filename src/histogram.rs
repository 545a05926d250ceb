//! Delta-style histogram sampling against a remote process.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::info;

use crate::action::Action;
use crate::channel::{Channel, ChannelExt, promisify};
use crate::ctx::{Ctx, PollError, poll};
use crate::error::{CujError, Result};
use crate::recorder::metric::Direction;

/// One histogram bucket covering `[low, high)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    #[serde(alias = "min")]
    pub low: i64,
    #[serde(alias = "max")]
    pub high: i64,
    pub count: i64,
}

impl Bucket {
    pub fn new(low: i64, high: i64, count: i64) -> Self {
        Self { low, high, count }
    }

    fn same_range(&self, other: &Bucket) -> bool {
        self.low == other.low && self.high == other.high
    }

    fn width(&self) -> f64 {
        (self.high - self.low).max(1) as f64
    }
}

/// Immutable record of a named histogram at an instant, or a delta between
/// two such records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub name: String,
    pub sum: i64,
    pub buckets: Vec<Bucket>,
}

impl Histogram {
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sum: 0,
            buckets: Vec::new(),
        }
    }

    pub fn new(name: impl Into<String>, sum: i64, buckets: Vec<Bucket>) -> Self {
        Self {
            name: name.into(),
            sum,
            buckets,
        }
    }

    /// Total sample count; always the sum of bucket counts.
    pub fn total(&self) -> i64 {
        self.buckets.iter().map(|bucket| bucket.count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// `self - baseline`, bucket by bucket.
    ///
    /// Buckets missing from the baseline count from zero; a bucket that shrank
    /// (counter reset) clamps to zero. Empty buckets are dropped.
    pub fn diff(&self, baseline: &Histogram) -> Histogram {
        let buckets: Vec<Bucket> = self
            .buckets
            .iter()
            .filter_map(|bucket| {
                let before = baseline
                    .buckets
                    .iter()
                    .find(|candidate| candidate.same_range(bucket))
                    .map(|candidate| candidate.count)
                    .unwrap_or(0);
                let count = (bucket.count - before).max(0);
                (count > 0).then(|| Bucket::new(bucket.low, bucket.high, count))
            })
            .collect();
        let sum = if buckets.is_empty() {
            0
        } else {
            self.sum - baseline.sum
        };
        Histogram {
            name: self.name.clone(),
            sum,
            buckets,
        }
    }

    /// Pool another delta into this one.
    pub fn merge(&mut self, other: &Histogram) {
        self.sum += other.sum;
        for bucket in &other.buckets {
            match self
                .buckets
                .iter_mut()
                .find(|existing| existing.same_range(bucket))
            {
                Some(existing) => existing.count += bucket.count,
                None => self.buckets.push(*bucket),
            }
        }
        self.buckets.sort_by_key(|bucket| (bucket.low, bucket.high));
    }

    /// `sum / total`; fails with [`CujError::EmptyHistogram`] without samples.
    pub fn mean(&self) -> Result<f64> {
        let total = self.total();
        if total == 0 {
            return Err(CujError::EmptyHistogram(self.name.clone()));
        }
        Ok(self.sum as f64 / total as f64)
    }

    /// Estimate the `p`-th percentile (`0.0..=100.0`) assuming samples spread
    /// uniformly inside each bucket.
    pub fn percentile(&self, p: f64) -> Result<f64> {
        let total = self.total();
        if total == 0 {
            return Err(CujError::EmptyHistogram(self.name.clone()));
        }
        let mut sorted = self.buckets.clone();
        sorted.sort_by_key(|bucket| (bucket.low, bucket.high));
        let target = (p.clamp(0.0, 100.0) / 100.0) * total as f64;
        let mut seen = 0.0;
        for bucket in &sorted {
            let count = bucket.count as f64;
            if seen + count >= target {
                let fraction = if count > 0.0 {
                    (target - seen) / count
                } else {
                    0.0
                };
                return Ok(bucket.low as f64 + fraction * bucket.width());
            }
            seen += count;
        }
        Ok(sorted.last().map(|bucket| bucket.high as f64).unwrap_or(0.0))
    }

    /// Samples on the bad side of `criterion` for a metric with `direction`.
    ///
    /// A bucket straddling the criterion contributes the proportional share of
    /// its count.
    pub fn jank_count(&self, direction: Direction, criterion: i64) -> f64 {
        let mut count = 0.0;
        for bucket in &self.buckets {
            let samples = bucket.count as f64;
            match direction {
                Direction::BiggerIsBetter => {
                    if bucket.high < criterion {
                        count += samples;
                    } else if bucket.low <= criterion {
                        count += samples * (criterion - bucket.low) as f64 / bucket.width();
                    }
                }
                Direction::SmallerIsBetter => {
                    if bucket.low > criterion {
                        count += samples;
                    } else if bucket.high > criterion {
                        count += samples * (bucket.high - criterion) as f64 / bucket.width();
                    }
                }
            }
        }
        count
    }
}

/// Anything that can report the current state of a named histogram.
#[async_trait]
pub trait HistogramSource: Send + Sync {
    fn label(&self) -> &str;

    /// Current snapshot of `name`; a histogram never recorded is empty.
    async fn fetch(&self, name: &str) -> Result<Histogram>;
}

/// Where a channel-backed source reads histograms from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistogramQuery {
    /// `chrome.metricsPrivate.getHistogram` on a test-extension connection.
    MetricsPrivate,
    /// `globalThis.__cujHistograms[name]` maintained by an in-page recorder.
    PageRecorder,
}

#[derive(Debug, Default, Deserialize)]
struct RemoteHistogram {
    #[serde(default)]
    sum: i64,
    #[serde(default)]
    buckets: Vec<Bucket>,
}

/// [`HistogramSource`] that evaluates queries over a [`Channel`].
pub struct ChannelHistograms {
    channel: Arc<dyn Channel>,
    query: HistogramQuery,
    label: String,
}

impl ChannelHistograms {
    pub fn new(channel: Arc<dyn Channel>, query: HistogramQuery) -> Self {
        let label = channel.label().to_string();
        Self {
            channel,
            query,
            label,
        }
    }
}

#[async_trait]
impl HistogramSource for ChannelHistograms {
    fn label(&self) -> &str {
        &self.label
    }

    async fn fetch(&self, name: &str) -> Result<Histogram> {
        let remote = match self.query {
            HistogramQuery::MetricsPrivate => {
                let expression = promisify("chrome.metricsPrivate.getHistogram", &[json!(name)])?;
                match self
                    .channel
                    .evaluate_promise::<Option<RemoteHistogram>>(&expression)
                    .await
                {
                    Ok(remote) => remote,
                    Err(CujError::RemoteException { message }) if message.contains("not found") => {
                        None
                    }
                    Err(err) => return Err(err),
                }
            }
            HistogramQuery::PageRecorder => {
                let key = serde_json::to_string(name)?;
                self.channel
                    .evaluate::<Option<RemoteHistogram>>(&format!(
                        "(globalThis.__cujHistograms && globalThis.__cujHistograms[{key}]) || null"
                    ))
                    .await?
            }
        };
        let remote = remote.unwrap_or_default();
        Ok(Histogram::new(name, remote.sum, remote.buckets))
    }
}

/// Current snapshot of `name`, bounded by `ctx`.
pub async fn get(ctx: &Ctx, source: &dyn HistogramSource, name: &str) -> Result<Histogram> {
    ctx.run(source.fetch(name)).await
}

/// Poll `name` until it holds strictly more samples than `baseline`.
pub async fn wait_update(
    ctx: &Ctx,
    source: &dyn HistogramSource,
    name: &str,
    baseline: &Histogram,
    timeout: Duration,
) -> Result<Histogram> {
    let want = baseline.total();
    let opts = ctx.poll().with_timeout(timeout);
    poll(ctx, opts, move || async move {
        let current = source.fetch(name).await?;
        if current.total() > want {
            Ok(current)
        } else {
            Err(PollError::Retry(CujError::failed(format!(
                "histogram {name} still has {} samples",
                current.total()
            ))))
        }
    })
    .await
}

pub fn mean(histogram: &Histogram) -> Result<f64> {
    histogram.mean()
}

/// Baselines for a set of histograms, taken before some work runs.
#[derive(Debug, Clone)]
pub struct Recorder {
    baselines: Vec<Histogram>,
}

impl Recorder {
    pub async fn start(ctx: &Ctx, source: &dyn HistogramSource, names: &[String]) -> Result<Self> {
        let mut baselines = Vec::with_capacity(names.len());
        for name in names {
            baselines.push(get(ctx, source, name).await?);
        }
        Ok(Self { baselines })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.baselines.iter().map(|baseline| baseline.name.as_str())
    }

    pub fn baseline(&self, name: &str) -> Option<&Histogram> {
        self.baselines.iter().find(|baseline| baseline.name == name)
    }

    /// Deltas since [`Recorder::start`].
    pub async fn histograms(&self, ctx: &Ctx, source: &dyn HistogramSource) -> Result<Vec<Histogram>> {
        let mut deltas = Vec::with_capacity(self.baselines.len());
        for baseline in &self.baselines {
            let current = get(ctx, source, &baseline.name).await?;
            deltas.push(current.diff(baseline));
        }
        Ok(deltas)
    }

    /// Deltas once every histogram gained at least one sample.
    pub async fn wait_all(
        &self,
        ctx: &Ctx,
        source: &dyn HistogramSource,
        timeout: Duration,
    ) -> Result<Vec<Histogram>> {
        let mut deltas = Vec::with_capacity(self.baselines.len());
        for baseline in &self.baselines {
            let current = wait_update(ctx, source, &baseline.name, baseline, timeout).await?;
            deltas.push(current.diff(baseline));
        }
        Ok(deltas)
    }

    /// Deltas after giving in-flight samples up to `settle` to arrive.
    pub async fn settle(
        &self,
        ctx: &Ctx,
        source: &dyn HistogramSource,
        settle: Duration,
    ) -> Result<Vec<Histogram>> {
        let started = Instant::now();
        let interval = ctx.poll().interval;
        loop {
            let deltas = self.histograms(ctx, source).await?;
            let all_updated = deltas.iter().all(|delta| !delta.is_empty());
            if all_updated || started.elapsed() + interval > settle {
                return Ok(deltas);
            }
            ctx.sleep(interval).await?;
        }
    }
}

/// Snapshot `names`, run `action`, and return per-name deltas.
pub async fn run(
    ctx: &Ctx,
    source: &dyn HistogramSource,
    action: &Action,
    names: &[String],
    settle: Duration,
) -> Result<BTreeMap<String, Histogram>> {
    let recorder = Recorder::start(ctx, source, names).await?;
    action.run(ctx).await?;
    let deltas = recorder.settle(ctx, source, settle).await?;
    let collected: Vec<&str> = deltas
        .iter()
        .filter(|delta| !delta.is_empty())
        .map(|delta| delta.name.as_str())
        .collect();
    info!(source = source.label(), ?collected, "histograms collected");
    Ok(deltas
        .into_iter()
        .map(|delta| (delta.name.clone(), delta))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action;
    use crate::ctx::PollOptions;
    use crate::fake::{FakeDevice, ScriptedChannel};

    fn hist(buckets: &[(i64, i64, i64)], sum: i64) -> Histogram {
        Histogram::new(
            "A.X",
            sum,
            buckets
                .iter()
                .map(|&(low, high, count)| Bucket::new(low, high, count))
                .collect(),
        )
    }

    #[test]
    fn delta_keeps_only_new_samples() {
        let pre = hist(&[(0, 10, 3)], 15);
        let post = hist(&[(0, 10, 3), (10, 20, 2)], 45);
        let delta = post.diff(&pre);
        assert_eq!(delta.buckets, vec![Bucket::new(10, 20, 2)]);
        assert_eq!(delta.total(), 2);
        assert_eq!(delta.sum, 30);
        assert_eq!(delta.mean().unwrap(), 15.0);
    }

    #[test]
    fn delta_clamps_shrunken_buckets() {
        let pre = hist(&[(0, 10, 5), (10, 20, 1)], 40);
        let post = hist(&[(0, 10, 2), (10, 20, 4)], 70);
        let delta = post.diff(&pre);
        assert!(delta.buckets.iter().all(|bucket| bucket.count >= 0));
        assert_eq!(delta.total(), delta.buckets.iter().map(|b| b.count).sum::<i64>());
        assert_eq!(delta.total(), 3);
    }

    #[test]
    fn unchanged_histogram_yields_empty_delta() {
        let snapshot = hist(&[(0, 10, 3)], 15);
        let delta = snapshot.diff(&snapshot);
        assert!(delta.is_empty());
        assert_eq!(delta.sum, 0);
        assert!(matches!(delta.mean(), Err(CujError::EmptyHistogram(ref name)) if name == "A.X"));
    }

    #[test]
    fn merge_pools_matching_buckets() {
        let mut pooled = hist(&[(0, 10, 1)], 5);
        pooled.merge(&hist(&[(0, 10, 2), (20, 30, 1)], 35));
        assert_eq!(pooled.total(), 4);
        assert_eq!(pooled.sum, 40);
        assert_eq!(pooled.buckets[0], Bucket::new(0, 10, 3));
    }

    #[test]
    fn percentile_interpolates_within_bucket() {
        let histogram = hist(&[(0, 10, 5), (10, 20, 5)], 100);
        assert_eq!(histogram.percentile(50.0).unwrap(), 10.0);
        assert_eq!(histogram.percentile(75.0).unwrap(), 15.0);
        assert_eq!(histogram.percentile(100.0).unwrap(), 20.0);
    }

    #[test]
    fn jank_count_uses_uniform_split() {
        let histogram = hist(&[(0, 40, 2), (40, 60, 4), (60, 100, 4)], 0);
        // bigger is better: everything below 50 is janky
        assert_eq!(histogram.jank_count(Direction::BiggerIsBetter, 50), 2.0 + 4.0 * 0.5);
        // smaller is better: everything above 50 is janky
        assert_eq!(histogram.jank_count(Direction::SmallerIsBetter, 50), 4.0 + 4.0 * 0.5);
    }

    #[test]
    fn bucket_accepts_min_max_aliases() {
        let bucket: Bucket = serde_json::from_str(r#"{"min": 1, "max": 2, "count": 3}"#).unwrap();
        assert_eq!(bucket, Bucket::new(1, 2, 3));
    }

    #[tokio::test]
    async fn metrics_private_not_found_is_empty() {
        let channel = ScriptedChannel::new(|_, _| {
            Err(CujError::RemoteException {
                message: "Histogram A.X not found".into(),
            })
        });
        let source = ChannelHistograms::new(Arc::new(channel), HistogramQuery::MetricsPrivate);
        let snapshot = source.fetch("A.X").await.unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.name, "A.X");
    }

    #[tokio::test]
    async fn metrics_private_propagates_other_failures() {
        let channel = ScriptedChannel::new(|_, _| Err(CujError::Transport("socket closed".into())));
        let source = ChannelHistograms::new(Arc::new(channel), HistogramQuery::MetricsPrivate);
        let err = source.fetch("A.X").await.unwrap_err();
        assert!(matches!(err, CujError::Transport(_)));
    }

    #[tokio::test]
    async fn page_recorder_decodes_min_max_buckets() {
        let channel = ScriptedChannel::new(|expr, _| {
            assert!(expr.contains("__cujHistograms[\"Page.LongTask\"]"));
            Ok(serde_json::json!({"sum": 120, "buckets": [{"min": 50, "max": 100, "count": 2}]}))
        });
        let source = ChannelHistograms::new(Arc::new(channel), HistogramQuery::PageRecorder);
        let snapshot = source.fetch("Page.LongTask").await.unwrap();
        assert_eq!(snapshot.total(), 2);
        assert_eq!(snapshot.mean().unwrap(), 60.0);
    }

    #[tokio::test]
    async fn wait_update_returns_after_new_sample() {
        let device = FakeDevice::new();
        let ctx = Ctx::new().with_poll(PollOptions::new(
            Duration::from_millis(2),
            Duration::from_secs(1),
        ));
        let baseline = get(&ctx, device.as_ref(), "A.X").await.unwrap();
        let pusher = device.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            pusher.push_sample("A.X", 42);
        });
        let updated = wait_update(&ctx, device.as_ref(), "A.X", &baseline, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(updated.total() > baseline.total());
    }

    #[tokio::test]
    async fn wait_update_times_out_without_samples() {
        let device = FakeDevice::new();
        let ctx = Ctx::new().with_poll(PollOptions::new(
            Duration::from_millis(2),
            Duration::from_secs(1),
        ));
        let baseline = Histogram::empty("A.X");
        let err = wait_update(&ctx, device.as_ref(), "A.X", &baseline, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    struct StalledSource;

    #[async_trait]
    impl HistogramSource for StalledSource {
        fn label(&self) -> &str {
            "stalled"
        }

        async fn fetch(&self, _name: &str) -> Result<Histogram> {
            futures_util::future::pending().await
        }
    }

    #[tokio::test]
    async fn wait_update_times_out_when_fetch_hangs() {
        let ctx = Ctx::new().with_poll(PollOptions::new(
            Duration::from_millis(2),
            Duration::from_secs(10),
        ));
        let baseline = Histogram::empty("A.X");
        let waited = tokio::time::timeout(
            Duration::from_secs(2),
            wait_update(&ctx, &StalledSource, "A.X", &baseline, Duration::from_millis(50)),
        )
        .await
        .expect("wait_update kept its own deadline");
        assert!(waited.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn run_returns_per_name_deltas() {
        let device = FakeDevice::new();
        device.push_sample("A.X", 5);
        let pusher = device.clone();
        let action = Action::new(move |_ctx| {
            let pusher = pusher.clone();
            async move {
                pusher.push_sample("A.X", 15);
                pusher.push_sample("A.X", 15);
                Ok(())
            }
        });
        let ctx = Ctx::new().with_poll(PollOptions::new(
            Duration::from_millis(1),
            Duration::from_secs(1),
        ));
        let names = vec!["A.X".to_string(), "B.Y".to_string()];
        let deltas = run(&ctx, device.as_ref(), &action, &names, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(deltas["A.X"].total(), 2);
        assert_eq!(deltas["A.X"].mean().unwrap(), 15.0);
        assert!(deltas["B.Y"].is_empty());
    }

    #[tokio::test]
    async fn run_propagates_action_failure() {
        let device = FakeDevice::new();
        let ctx = Ctx::new();
        let err = run(
            &ctx,
            device.as_ref(),
            &action::fail("boom"),
            &["A.X".to_string()],
            Duration::ZERO,
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
