mod cdp;
mod scenarios;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand, value_parser};
use cujkit::channel::Channel;
use cujkit::config::{CujSettings, default_config_path};
use cujkit::ctx::Ctx;
use cujkit::device::Device;
use cujkit::histogram::{ChannelHistograms, HistogramQuery};
use cujkit::recorder::expectation::aggregates_from_records;
use cujkit::recorder::results::{RESULTS_FILE, load_results};
use cujkit::recorder::tracker::DEFAULT_MEMINFO_FILE;
use cujkit::recorder::{
    Expectations, MemInfoTracker, Outcome, RunEvent, RunJournal, RunPhase, Runner, RunnerOptions,
    Verification,
};
use cujkit::telemetry::{current_trace_file, init_tracing, trace_report};
use tracing::{info, warn};
use url::Url;

use crate::cdp::CdpBrowser;
use crate::scenarios::{Scenario, default_scenario, find_scenario, scenarios};

#[derive(Parser, Debug)]
#[command(name = "cujkit-bench", author, version, about = "CUJ performance recorder", long_about = None)]
struct BenchCli {
    /// Increase logging verbosity.
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Settings file (defaults to the platform config directory).
    #[arg(long, value_parser = value_parser!(PathBuf))]
    config: Option<PathBuf>,

    /// Location to write results (overrides the settings file).
    #[arg(long, value_parser = value_parser!(PathBuf))]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: BenchCommand,
}

#[derive(Subcommand, Debug)]
enum BenchCommand {
    /// Record a built-in scenario in Chromium and verify its thresholds.
    Run(RunCommand),
    /// Re-check a saved results document against an expectations file.
    Verify(VerifyCommand),
    /// List the built-in scenarios.
    Scenarios,
    /// Show the lifecycle journal of a results directory.
    Journal(JournalCommand),
    /// Show where JSON traces are written and the most recent files.
    Traces,
}

#[derive(Args, Debug)]
struct RunCommand {
    /// Scenario identifier (see `scenarios`).
    #[arg(long)]
    scenario: Option<String>,

    /// Page to load instead of the scenario default.
    #[arg(long)]
    url: Option<String>,

    /// Number of runs; defaults to the scenario's own count.
    #[arg(long)]
    runs: Option<usize>,

    /// Show the browser window.
    #[arg(long, action = ArgAction::SetTrue)]
    headed: bool,

    /// Thresholds file replacing the scenario's built-in expectations.
    #[arg(long, value_parser = value_parser!(PathBuf))]
    expectations: Option<PathBuf>,

    /// Save results without failing on missed expectations.
    #[arg(long, action = ArgAction::SetTrue)]
    no_verify: bool,
}

#[derive(Args, Debug)]
struct VerifyCommand {
    /// A `results.json` file, or the directory holding one.
    #[arg(long, value_parser = value_parser!(PathBuf))]
    results: PathBuf,

    /// JSON map of metric name to threshold.
    #[arg(long, value_parser = value_parser!(PathBuf))]
    expectations: PathBuf,
}

#[derive(Args, Debug)]
struct JournalCommand {
    /// Results directory holding `run_journal.jsonl`.
    #[arg(long, value_parser = value_parser!(PathBuf))]
    dir: PathBuf,

    /// Most recent events to show.
    #[arg(long, default_value_t = 50)]
    limit: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = BenchCli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let mut settings = CujSettings::load_or_default(&config_path)?;
    if let Some(output) = &cli.output {
        settings.output_dir = Some(output.clone());
    }

    init_tracing("cujkit-bench", cli.verbose, &settings.telemetry)?;
    if let Some(path) = current_trace_file() {
        info!(path = %path.display(), "Writing JSON trace");
    }

    match &cli.command {
        BenchCommand::Run(cmd) => handle_run(cmd, &settings).await,
        BenchCommand::Verify(cmd) => handle_verify(cmd),
        BenchCommand::Scenarios => {
            for scenario in scenarios() {
                println!(
                    "{:<12} {} (runs: {}, url: {})",
                    scenario.name, scenario.description, scenario.default_runs, scenario.default_url
                );
            }
            Ok(())
        }
        BenchCommand::Journal(cmd) => {
            for line in journal_lines(&RunJournal::in_dir(&cmd.dir).read_events(cmd.limit)?) {
                println!("{line}");
            }
            Ok(())
        }
        BenchCommand::Traces => handle_traces(&settings),
    }
}

async fn handle_run(cmd: &RunCommand, settings: &CujSettings) -> Result<()> {
    let scenario = match &cmd.scenario {
        Some(name) => find_scenario(name).with_context(|| format!("Unknown scenario '{name}'"))?,
        None => default_scenario(),
    };
    let raw_url = cmd.url.as_deref().unwrap_or(scenario.default_url);
    let url = Url::parse(raw_url).with_context(|| format!("Invalid URL '{raw_url}'"))?;
    let expectations = match &cmd.expectations {
        Some(path) => Expectations::load(path)?,
        None => scenario.expectations(),
    };

    let mut options = settings.runner.to_options();
    options.runs = cmd.runs.unwrap_or(scenario.default_runs).max(1);
    if options.screen_recording || options.trace {
        warn!("Screen recording and system tracing need a device connection; disabling both");
        options.screen_recording = false;
        options.trace = false;
    }

    let output_root = settings.resolve_output_root()?;
    let run_dir = output_root
        .join(scenario.name)
        .join(Utc::now().format("%Y%m%dT%H%M%SZ").to_string());
    fs::create_dir_all(&run_dir)
        .with_context(|| format!("Failed to create results directory {}", run_dir.display()))?;

    info!(
        scenario = scenario.name,
        url = %url,
        runs = options.runs,
        headless = !cmd.headed,
        "Launching Chromium"
    );
    let browser = CdpBrowser::launch(!cmd.headed).await?;
    let channel: Arc<dyn Channel> = browser.open("primary").await?;

    let ctx = Ctx::new().with_poll(settings.poll.to_options());
    scenarios::prepare(&ctx, channel.as_ref(), &url).await?;

    let histograms = ChannelHistograms::new(channel.clone(), HistogramQuery::PageRecorder);
    let mut device = Device::new(Arc::new(histograms));
    if Path::new(DEFAULT_MEMINFO_FILE).exists() {
        device = device.with_tracker(Arc::new(MemInfoTracker::new()));
    }
    let verification = record(&ctx, scenario, &channel, device, options, &expectations, &run_dir).await?;

    print_verification(&verification);
    println!("Results written to {}", run_dir.display());
    if !cmd.no_verify {
        verification.into_result()?;
    }
    Ok(())
}

async fn record(
    ctx: &Ctx,
    scenario: &Scenario,
    channel: &Arc<dyn Channel>,
    device: Device,
    options: RunnerOptions,
    expectations: &Expectations,
    run_dir: &Path,
) -> Result<Verification> {
    let mut runner = Runner::new(device, scenario.metrics(), options)?;
    let action = scenario.action(channel);

    let outcome = runner.run_multiple(ctx, &action).await;
    let verification = runner.verify(expectations);
    let saved = runner.save(run_dir).await;
    let closed = runner.close(ctx).await;

    let report = outcome?;
    for path in saved? {
        info!(path = %path.display(), "Saved artifact");
    }
    closed?;
    info!(
        attempted = report.attempted,
        failed = report.failures.len(),
        "Runs finished"
    );
    report.into_result()?;
    Ok(verification?)
}

fn handle_verify(cmd: &VerifyCommand) -> Result<()> {
    let path = if cmd.results.is_dir() {
        cmd.results.join(RESULTS_FILE)
    } else {
        cmd.results.clone()
    };
    let records = load_results(&path)?;
    let expectations = Expectations::load(&cmd.expectations)?;
    if expectations.is_empty() {
        bail!("Expectations file {} lists no metrics", cmd.expectations.display());
    }

    let verification = expectations.check(&aggregates_from_records(&records));
    print_verification(&verification);
    verification.into_result()?;
    Ok(())
}

fn journal_lines(events: &[RunEvent]) -> Vec<String> {
    events
        .iter()
        .map(|event| {
            let when = event.timestamp.format("%Y-%m-%dT%H:%M:%SZ");
            let run = event.run.map(|run| format!(" run {run}")).unwrap_or_default();
            match event.phase {
                RunPhase::Start => format!("{when} start{run}"),
                RunPhase::Close => format!("{when} close"),
                RunPhase::Finish => {
                    let took = event.duration_ms.unwrap_or_default();
                    match &event.error {
                        Some(error) => format!("{when} failed{run} after {took}ms: {error}"),
                        None => format!(
                            "{when} finished{run} in {took}ms, collected [{}]",
                            event.metrics.join(", ")
                        ),
                    }
                }
            }
        })
        .collect()
}

fn handle_traces(settings: &CujSettings) -> Result<()> {
    let report = trace_report(&settings.telemetry)?;
    println!("enabled: {}", report.enabled);
    match &report.directory {
        Some(dir) => println!("directory: {}", dir.display()),
        None => println!("directory: unavailable"),
    }
    if let Some(active) = &report.active_file {
        println!("active: {}", active.display());
    }
    for file in &report.recent_files {
        println!("  {}", file.display());
    }
    Ok(())
}

fn print_verification(verification: &Verification) {
    for verdict in &verification.verdicts {
        match &verdict.outcome {
            Outcome::Pass(value) => println!("PASS {} = {value:.3}", verdict.metric),
            Outcome::Miss(message) => println!("MISS {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cujkit::recorder::results::save_results;
    use cujkit::recorder::{Direction, ResultRecord};
    use uuid::Uuid;
    use tempfile::tempdir;

    #[test]
    fn parses_run_defaults() {
        let cli = BenchCli::parse_from(["cujkit-bench", "run"]);
        match cli.command {
            BenchCommand::Run(cmd) => {
                assert!(cmd.scenario.is_none());
                assert!(cmd.runs.is_none());
                assert!(!cmd.headed);
                assert!(!cmd.no_verify);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn parses_run_options() {
        let cli = BenchCli::parse_from([
            "cujkit-bench",
            "--verbose",
            "run",
            "--scenario",
            "dom-latency",
            "--runs",
            "7",
            "--headed",
            "--url",
            "https://example.com/",
        ]);
        assert!(cli.verbose);
        match cli.command {
            BenchCommand::Run(cmd) => {
                assert_eq!(cmd.scenario.as_deref(), Some("dom-latency"));
                assert_eq!(cmd.runs, Some(7));
                assert!(cmd.headed);
                assert_eq!(cmd.url.as_deref(), Some("https://example.com/"));
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn parses_journal_command() {
        let cli = BenchCli::parse_from(["cujkit-bench", "journal", "--dir", "/tmp/run"]);
        match cli.command {
            BenchCommand::Journal(cmd) => {
                assert_eq!(cmd.dir, PathBuf::from("/tmp/run"));
                assert_eq!(cmd.limit, 50);
            }
            _ => panic!("expected journal command"),
        }
    }

    #[test]
    fn journal_lines_describe_each_run() {
        let dir = tempdir().expect("temp directory");
        let journal = RunJournal::in_dir(dir.path());
        journal
            .rewrite(&[
                RunEvent::start(Uuid::nil(), 0),
                RunEvent::finish(Uuid::nil(), 0, vec!["Cuj.Scroll.Smoothness".into()], 850, None),
                RunEvent::finish(Uuid::nil(), 1, vec![], 12, Some("tab crashed".into())),
                RunEvent::close(Uuid::nil()),
            ])
            .expect("write journal");

        let lines = journal_lines(&journal.read_events(10).expect("read journal"));
        assert_eq!(lines.len(), 4);
        assert!(lines[0].ends_with("start run 0"));
        assert!(lines[1].ends_with("finished run 0 in 850ms, collected [Cuj.Scroll.Smoothness]"));
        assert!(lines[2].ends_with("failed run 1 after 12ms: tab crashed"));
        assert!(lines[3].ends_with("close"));
    }

    #[test]
    fn traces_lists_files_in_the_configured_directory() {
        let dir = tempdir().expect("temp directory");
        fs::write(dir.path().join("cujkit-bench-20260101T000000Z.trace.jsonl"), "{}\n").unwrap();
        let mut settings = CujSettings::default();
        settings.telemetry.traces.directory = Some(dir.path().to_path_buf());

        let report = trace_report(&settings.telemetry).expect("report");
        assert!(!report.enabled);
        assert_eq!(report.directory.as_deref(), Some(dir.path()));
        assert_eq!(report.recent_files.len(), 1);
        handle_traces(&settings).expect("print report");
    }

    #[test]
    fn verify_reads_a_results_directory() {
        let dir = tempdir().expect("temp directory");
        save_results(
            dir.path(),
            &[ResultRecord::summary("Cuj.Scroll.Smoothness", "percent", Direction::BiggerIsBetter, 92.0)],
        )
        .expect("save results");
        let expectations = dir.path().join("expect.json");
        fs::write(&expectations, r#"{"Cuj.Scroll.Smoothness": 80}"#).unwrap();

        let cmd = VerifyCommand {
            results: dir.path().to_path_buf(),
            expectations: expectations.clone(),
        };
        handle_verify(&cmd).expect("passes");

        fs::write(&expectations, r#"{"Cuj.Scroll.Smoothness": 95}"#).unwrap();
        let err = handle_verify(&cmd).unwrap_err();
        assert!(err.to_string().contains("expected ≥ 95, got 92"));
    }
}
