//! CUJ runner: drives a scenario action inside a recording window and turns
//! the histogram deltas it produced into reported values.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use super::aggregate::{self, Aggregate};
use super::expectation::{Expectations, Verification};
use super::journal::{RunEvent, RunJournal};
use super::metric::{Direction, MetricSource, MetricSpec};
use super::results::{self, ArchivedDelta, ResultRecord};
use super::store::SampleStore;
use super::tracker::Tracker;
use crate::action::Action;
use crate::crash::TabCrashChecker;
use crate::ctx::Ctx;
use crate::device::Device;
use crate::error::{CujError, ErrorKind, Result, StepExt};
use crate::histogram::{self, Histogram, Recorder};
use crate::login::{self, DEFAULT_LOGIN_TIME_FILE, LOGIN_TIME_METRIC, LoginTime};
use crate::power::{BatteryDischarge, DischargeOptions};
use crate::screen::RECORDING_FILE;
use crate::trace::TRACE_FILE;

/// Histogram reported only through its per-minute derivative.
pub const CRAS_UNDERRUNS: &str = "Cras.UnderrunsPerDevice";
const CRAS_UNDERRUNS_PER_MINUTE: &str = "Media.Cras.UnderrunsPerDevicePerMinute";

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Runs performed by [`Runner::run_multiple`].
    pub runs: usize,
    pub trace: bool,
    pub screen_recording: bool,
    pub battery_discharge: bool,
    pub discharge: DischargeOptions,
    /// Report test cycle, run time, discharge and audio underrun metrics.
    pub report_run_metrics: bool,
    pub login_time_file: Option<PathBuf>,
    /// Where system traces are written before [`Runner::save`] copies them.
    pub scratch_dir: PathBuf,
    /// Grace period for optional metrics to receive their samples.
    pub settle: Duration,
    /// How long a required metric may take to receive a sample.
    pub required_timeout: Duration,
    /// Time carved off the caller's deadline for teardown.
    pub cleanup_budget: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            runs: 1,
            trace: false,
            screen_recording: false,
            battery_discharge: false,
            discharge: DischargeOptions::default(),
            report_run_metrics: false,
            login_time_file: Some(PathBuf::from(DEFAULT_LOGIN_TIME_FILE)),
            scratch_dir: PathBuf::from("/tmp/cujkit"),
            settle: Duration::from_secs(1),
            required_timeout: Duration::from_secs(10),
            cleanup_budget: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Open,
    Sampling,
    Closed,
}

#[derive(Debug)]
pub struct RunFailure {
    pub run: usize,
    pub error: CujError,
}

/// Outcome of a batch of runs.
#[derive(Debug, Default)]
pub struct RunReport {
    pub attempted: usize,
    pub failures: Vec<RunFailure>,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    /// The first failure, tagged with its run index.
    pub fn into_result(self) -> Result<()> {
        match self.failures.into_iter().next() {
            None => Ok(()),
            Some(failure) => Err(failure.error.wrap(format!("run {}", failure.run))),
        }
    }
}

enum Body<'a> {
    Once(&'a Action),
    /// Repeat the action until the duration elapsed, at least once.
    Cycles(&'a Action, Duration),
}

/// What a recording window started and must stop.
#[derive(Default)]
struct Window {
    crash: Option<TabCrashChecker>,
    discharging: bool,
    screen: bool,
    trace: bool,
    trackers: Vec<Arc<dyn Tracker>>,
}

pub struct Runner {
    id: Uuid,
    device: Device,
    metrics: Vec<MetricSpec>,
    options: RunnerOptions,
    state: RunnerState,
    store: SampleStore,
    discharge: Option<BatteryDischarge>,
    discharged_every_run: bool,
    cycles: usize,
    duration: Duration,
    login: Option<LoginTime>,
    login_checked: bool,
    recording: Option<Vec<u8>>,
    trace: Option<PathBuf>,
    events: Vec<RunEvent>,
}

impl Runner {
    pub fn new(device: Device, metrics: Vec<MetricSpec>, options: RunnerOptions) -> Result<Self> {
        let discharge = options
            .battery_discharge
            .then(|| BatteryDischarge::new(device.power.clone(), options.discharge));
        let mut runner = Self {
            id: Uuid::new_v4(),
            device,
            metrics: Vec::new(),
            options,
            state: RunnerState::Open,
            store: SampleStore::new(),
            discharge,
            discharged_every_run: true,
            cycles: 0,
            duration: Duration::ZERO,
            login: None,
            login_checked: false,
            recording: None,
            trace: None,
            events: Vec::new(),
        };
        runner.add_metrics(metrics)?;
        Ok(runner)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn metrics(&self) -> &[MetricSpec] {
        &self.metrics
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// Completed test cycles across every successful run.
    pub fn cycles(&self) -> usize {
        self.cycles
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            RunnerState::Closed => Err(CujError::AfterClose),
            _ => Ok(()),
        }
    }

    /// Register more metrics; only allowed before the first run.
    pub fn add_metrics(&mut self, specs: impl IntoIterator<Item = MetricSpec>) -> Result<()> {
        self.ensure_open()?;
        if self.store.runs() > 0 || self.state == RunnerState::Sampling {
            return Err(CujError::Config(
                "metrics cannot be added after recording started".into(),
            ));
        }
        let mut seen: HashSet<String> = self.metrics.iter().map(|spec| spec.name.clone()).collect();
        let mut accepted = Vec::new();
        for spec in specs {
            spec.validate()?;
            if !seen.insert(spec.name.clone()) {
                return Err(CujError::Config(format!("metric {} registered twice", spec.name)));
            }
            self.device.source(spec.source)?;
            accepted.push(spec);
        }
        debug!(count = accepted.len(), "metrics registered");
        self.metrics.extend(accepted);
        Ok(())
    }

    /// One recording window around `action`.
    pub async fn run(&mut self, ctx: &Ctx, action: &Action) -> Result<()> {
        self.ensure_open()?;
        let (_, outcome) = self.record(ctx, Body::Once(action)).await;
        outcome
    }

    /// [`RunnerOptions::runs`] independent runs of `action`.
    pub async fn run_multiple(&mut self, ctx: &Ctx, action: &Action) -> Result<RunReport> {
        let runs = self.options.runs;
        self.repeat_runs(ctx, action, move |attempted, _| attempted < runs)
            .await
    }

    /// Independent runs of `action` until `budget` of wall-clock time is used.
    pub async fn run_for(&mut self, ctx: &Ctx, action: &Action, budget: Duration) -> Result<RunReport> {
        self.repeat_runs(ctx, action, move |attempted, elapsed| {
            attempted == 0 || elapsed < budget
        })
        .await
    }

    /// A single recording window that repeats `action` for at least
    /// `minimum`, counting each completed repetition as a test cycle.
    pub async fn run_cycles_for(&mut self, ctx: &Ctx, action: &Action, minimum: Duration) -> Result<()> {
        self.ensure_open()?;
        let (_, outcome) = self.record(ctx, Body::Cycles(action, minimum)).await;
        outcome
    }

    async fn repeat_runs<F>(&mut self, ctx: &Ctx, action: &Action, mut more: F) -> Result<RunReport>
    where
        F: FnMut(usize, Duration) -> bool,
    {
        self.ensure_open()?;
        let started = Instant::now();
        let mut report = RunReport::default();
        while more(report.attempted, started.elapsed()) {
            let (run, outcome) = self.record(ctx, Body::Once(action)).await;
            report.attempted += 1;
            let Err(error) = outcome else {
                continue;
            };
            let halt = ctx.is_cancelled()
                || matches!(
                    error.kind(),
                    ErrorKind::Transport | ErrorKind::Cancelled | ErrorKind::AfterClose
                );
            if halt {
                return Err(error.wrap(format!("run {run}")));
            }
            warn!(run, error = %error, "run failed, continuing with the next one");
            report.failures.push(RunFailure { run, error });
        }
        info!(
            attempted = report.attempted,
            failed = report.failures.len(),
            "runs finished"
        );
        Ok(report)
    }

    async fn record(&mut self, ctx: &Ctx, body: Body<'_>) -> (usize, Result<()>) {
        let run = self.store.next_run();
        self.state = RunnerState::Sampling;
        self.events.push(RunEvent::start(self.id, run));
        info!(run, metrics = self.metrics.len(), "recording started");

        let started = Instant::now();
        let outcome = self
            .record_window(ctx, run, body)
            .instrument(info_span!("cuj_run", run))
            .await;
        let elapsed = started.elapsed();
        self.duration += elapsed;
        self.state = RunnerState::Open;

        let (collected, error) = match &outcome {
            Ok(collected) => (collected.clone(), None),
            Err(err) => (Vec::new(), Some(err.to_string())),
        };
        info!(
            run,
            elapsed_ms = elapsed.as_millis() as u64,
            ?collected,
            ok = error.is_none(),
            "recording finished"
        );
        self.events.push(RunEvent::finish(
            self.id,
            run,
            collected,
            elapsed.as_millis() as u64,
            error,
        ));
        (run, outcome.map(|_| ()))
    }

    /// Pre-flight, action and collection, then teardown on a separate
    /// budget. A detected tab crash takes precedence over every other
    /// failure.
    async fn record_window(&mut self, ctx: &Ctx, run: usize, body: Body<'_>) -> Result<Vec<String>> {
        let mut window = Window::default();
        let sampled = self.open_window(ctx, run, body, &mut window).await;

        let cleanup = ctx.cleanup(self.options.cleanup_budget);
        let crashed = match &window.crash {
            Some(checker) => checker.check(&cleanup, self.device.histograms.as_ref()).await,
            None => Ok(()),
        };
        let closed = self.close_window(&cleanup, &window).await;

        crashed?;
        let (deltas, cycles) = sampled?;
        closed?;

        self.cycles += cycles;
        let collected: Vec<String> = deltas
            .iter()
            .filter(|delta| !delta.is_empty())
            .map(|delta| delta.name.clone())
            .collect();
        for delta in deltas {
            self.store.record(run, delta);
        }
        Ok(collected)
    }

    async fn open_window(
        &mut self,
        ctx: &Ctx,
        run: usize,
        body: Body<'_>,
        window: &mut Window,
    ) -> Result<(Vec<Histogram>, usize)> {
        ctx.run(self.device.power.turn_on_display())
            .await
            .step("turn on display")?;

        if let Some(discharge) = &self.discharge {
            window.discharging = ctx
                .run(discharge.acquire())
                .await
                .step("start battery discharge")?;
            if !window.discharging {
                self.discharged_every_run = false;
            }
        }

        let checker = TabCrashChecker::start(ctx, self.device.histograms.as_ref())
            .await
            .step("start tab crash surveillance")?;
        window.crash = Some(checker);

        if self.options.screen_recording {
            let screen = self.device.screen.clone().ok_or_else(|| {
                CujError::Unsupported("screen recording requested without a capture device".into())
            })?;
            ctx.run(screen.start()).await.step("start screen recording")?;
            window.screen = true;
        }

        if self.options.trace {
            let tracer = self.device.tracer.clone().ok_or_else(|| {
                CujError::Unsupported("tracing requested without a system tracer".into())
            })?;
            let dir = self.options.scratch_dir.join(format!("run_{run}"));
            tokio::fs::create_dir_all(&dir).await?;
            ctx.run(tracer.start(&dir)).await.step("start system trace")?;
            window.trace = true;
        }

        self.snapshot_login().await;

        let recorders = self.start_recorders(ctx).await.step("snapshot baselines")?;

        for tracker in &self.device.trackers {
            ctx.run(tracker.start())
                .await
                .with_step(|| format!("start {} tracker", tracker.name()))?;
            window.trackers.push(tracker.clone());
        }

        let action_ctx = ctx.shorten(self.options.cleanup_budget);
        let cycles = match body {
            Body::Once(action) => {
                action.run(&action_ctx).await?;
                1
            }
            Body::Cycles(action, minimum) => {
                let end = Instant::now() + minimum;
                let mut cycles = 0;
                loop {
                    action.run(&action_ctx).await?;
                    cycles += 1;
                    if Instant::now() >= end {
                        break cycles;
                    }
                }
            }
        };

        let deltas = self.collect(ctx, &recorders).await.step("collect metrics")?;
        Ok((deltas, cycles))
    }

    /// Stop everything `window` started. Every step runs; the first failure
    /// is returned.
    async fn close_window(&mut self, ctx: &Ctx, window: &Window) -> Result<()> {
        let mut first: Option<CujError> = None;
        let mut note = |err: CujError, step: &str| {
            warn!(error = %err, step, "teardown step failed");
            first.get_or_insert(err.wrap(step));
        };

        for tracker in &window.trackers {
            if let Err(err) = ctx.run(tracker.stop()).await {
                note(err, &format!("stop {} tracker", tracker.name()));
            }
        }
        if window.screen {
            if let Some(screen) = self.device.screen.clone() {
                match ctx.run(screen.stop()).await {
                    Ok(video) => self.recording = Some(video),
                    Err(err) => note(err, "stop screen recording"),
                }
            }
        }
        if window.trace {
            if let Some(tracer) = self.device.tracer.clone() {
                match ctx.run(tracer.stop()).await {
                    Ok(path) => self.trace = Some(path),
                    Err(err) => note(err, "stop system trace"),
                }
            }
        }
        if window.discharging {
            if let Some(discharge) = &self.discharge {
                if let Err(err) = ctx.run(discharge.release()).await {
                    note(err, "restore battery charging");
                }
            }
        }

        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn snapshot_login(&mut self) {
        if self.login_checked {
            return;
        }
        self.login_checked = true;
        let Some(path) = &self.options.login_time_file else {
            return;
        };
        match login::snapshot(path).await {
            Ok(login) => self.login = login,
            Err(err) => warn!(path = %path.display(), error = %err, "ignoring login time file"),
        }
    }

    async fn start_recorders(&self, ctx: &Ctx) -> Result<Vec<(MetricSource, Recorder)>> {
        let mut recorders = Vec::new();
        for source in [MetricSource::Primary, MetricSource::Secondary] {
            let names: Vec<String> = self
                .metrics
                .iter()
                .filter(|spec| spec.source == source)
                .map(|spec| spec.name.clone())
                .collect();
            if names.is_empty() {
                continue;
            }
            let histograms = self.device.source(source)?;
            recorders.push((source, Recorder::start(ctx, histograms, &names).await?));
        }
        Ok(recorders)
    }

    /// Deltas for every metric. Required metrics without samples are waited
    /// for; optional ones only get the settle period.
    async fn collect(&self, ctx: &Ctx, recorders: &[(MetricSource, Recorder)]) -> Result<Vec<Histogram>> {
        let mut collected = Vec::new();
        for (source, recorder) in recorders {
            let histograms = self.device.source(*source)?;
            let deltas = recorder.settle(ctx, histograms, self.options.settle).await?;
            for delta in deltas {
                let required = self
                    .metrics
                    .iter()
                    .any(|spec| spec.name == delta.name && spec.is_required());
                if !delta.is_empty() || !required {
                    collected.push(delta);
                    continue;
                }
                let baseline = recorder
                    .baseline(&delta.name)
                    .ok_or_else(|| CujError::failed(format!("no baseline for {}", delta.name)))?;
                let current = histogram::wait_update(
                    ctx,
                    histograms,
                    &delta.name,
                    baseline,
                    self.options.required_timeout,
                )
                .await
                .with_step(|| format!("required metric {}", delta.name))?;
                collected.push(current.diff(baseline));
            }
        }
        Ok(collected)
    }

    /// Summary value per metric and metric group.
    pub fn aggregates(&self) -> Result<BTreeMap<String, Aggregate>> {
        self.ensure_open()?;
        Ok(aggregate::summarize(&self.metrics, &self.store))
    }

    pub fn verify(&self, expectations: &Expectations) -> Result<Verification> {
        let verification = expectations.check(&self.aggregates()?);
        for miss in verification.misses() {
            warn!(miss, "expectation missed");
        }
        Ok(verification)
    }

    /// Every reported value, in the order it is written to disk.
    pub fn results(&self) -> Result<Vec<ResultRecord>> {
        self.ensure_open()?;
        let mut records: Vec<ResultRecord> = aggregate::records(&self.metrics, &self.store)
            .into_iter()
            .filter(|record| record.name != CRAS_UNDERRUNS)
            .collect();
        records.extend(self.derived_records());
        for tracker in &self.device.trackers {
            records.extend(tracker.records());
        }
        if let Some(login) = self.login {
            let record = ResultRecord::summary(
                LOGIN_TIME_METRIC,
                "s",
                Direction::SmallerIsBetter,
                login.seconds,
            );
            records.push(record.clone());
            records.push(record.with_variant(login.kind.as_str()));
        }
        Ok(records)
    }

    fn derived_records(&self) -> Vec<ResultRecord> {
        let mut records = Vec::new();
        let minutes = self.duration.as_secs_f64() / 60.0;
        if self.metrics.iter().any(|spec| spec.name == CRAS_UNDERRUNS) && minutes > 0.0 {
            let underruns = self.store.pooled(CRAS_UNDERRUNS).sum as f64;
            records.push(ResultRecord::summary(
                CRAS_UNDERRUNS_PER_MINUTE,
                "count",
                Direction::SmallerIsBetter,
                underruns / minutes,
            ));
        }
        if !self.options.report_run_metrics {
            return records;
        }
        let discharged =
            self.options.battery_discharge && self.discharged_every_run && self.store.runs() > 0;
        records.push(ResultRecord::summary(
            "Power.MetricsCollectedWithBatteryDischarge",
            "unitless",
            Direction::BiggerIsBetter,
            if discharged { 1.0 } else { 0.0 },
        ));
        records.push(ResultRecord::summary(
            "TestMetrics.TestCyclesCount",
            "count",
            Direction::SmallerIsBetter,
            self.cycles as f64,
        ));
        records.push(ResultRecord::summary(
            "TestMetrics.TotalTestRunTime",
            "s",
            Direction::BiggerIsBetter,
            self.duration.as_secs_f64(),
        ));
        records
    }

    fn archive(&self) -> Vec<ArchivedDelta> {
        self.metrics
            .iter()
            .flat_map(|spec| {
                self.store
                    .samples(&spec.name)
                    .iter()
                    .map(|sample| ArchivedDelta {
                        metric: spec.name.clone(),
                        source: spec.source,
                        sample: sample.clone(),
                    })
            })
            .collect()
    }

    /// Write results, chart, histogram archives, journal and any captured
    /// recording or trace into `dir`.
    pub async fn save(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let records = self.results()?;
        let mut written = results::save_results(dir, &records)?;
        written.extend(results::save_archive(dir, &self.archive())?);

        if let Some(video) = &self.recording {
            let path = dir.join(RECORDING_FILE);
            tokio::fs::write(&path, video).await?;
            written.push(path);
        }
        if let Some(trace) = &self.trace {
            let path = dir.join(TRACE_FILE);
            tokio::fs::copy(trace, &path).await?;
            written.push(path);
        }

        let journal = RunJournal::in_dir(dir);
        journal.rewrite(&self.events)?;
        written.push(journal.log_path().clone());
        info!(dir = %dir.display(), files = written.len(), "recorder output saved");
        Ok(written)
    }

    /// Release anything still held; every later call fails with
    /// [`CujError::AfterClose`].
    pub async fn close(&mut self, ctx: &Ctx) -> Result<()> {
        self.ensure_open()?;
        self.state = RunnerState::Closed;
        self.events.push(RunEvent::close(self.id));
        if let Some(discharge) = &self.discharge {
            ctx.run(discharge.release()).await.step("restore battery charging")?;
        }
        info!(runs = self.store.runs(), "recorder closed");
        Ok(())
    }
}
