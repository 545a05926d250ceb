use std::cmp::Reverse;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::Utc;
use directories::ProjectDirs;
use once_cell::sync::OnceCell;
use tracing::{Subscriber, subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

use crate::config::{TelemetrySettings, TraceSettings};

const TRACE_SUFFIX: &str = ".trace.jsonl";

static TRACE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static ACTIVE_TRACE_FILE: OnceCell<PathBuf> = OnceCell::new();
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Snapshot of trace export state for diagnostics.
#[derive(Debug, Clone)]
pub struct TraceReport {
    pub enabled: bool,
    pub directory: Option<PathBuf>,
    pub active_file: Option<PathBuf>,
    pub recent_files: Vec<PathBuf>,
}

fn install_subscriber<S>(subscriber: S) -> Result<()>
where
    S: Subscriber + Send + Sync + 'static,
{
    if TRACING_INITIALIZED.get().is_some() {
        return Ok(());
    }

    subscriber::set_global_default(subscriber)?;
    let _ = TRACING_INITIALIZED.set(());
    Ok(())
}

/// Install the console subscriber, plus a JSON trace file when enabled.
///
/// `RUST_LOG` overrides the default `cujkit=info` (`cujkit=debug` when
/// `verbose`). Only binaries call this; the library never installs one.
pub fn init_tracing(service: &str, verbose: bool, telemetry: &TelemetrySettings) -> Result<()> {
    let default_level = if verbose {
        "cujkit=debug"
    } else {
        "cujkit=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let console = fmt::layer().with_target(false);

    match build_trace_file_layer(service, &telemetry.traces)? {
        Some((writer, guard, path)) => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(console)
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_span_list(true)
                        .with_file(true)
                        .with_line_number(true)
                        .with_target(true)
                        .with_writer(writer)
                        .with_filter(LevelFilter::TRACE),
                );
            let _ = TRACE_GUARD.set(guard);
            let _ = ACTIVE_TRACE_FILE.set(path);
            install_subscriber(subscriber)
        }
        None => install_subscriber(tracing_subscriber::registry().with(env_filter).with(console)),
    }
}

/// Trace file written by the current process, if any.
pub fn current_trace_file() -> Option<&'static PathBuf> {
    ACTIVE_TRACE_FILE.get()
}

pub fn trace_report(settings: &TelemetrySettings) -> Result<TraceReport> {
    let directory = if settings.traces.enabled {
        Some(resolve_trace_directory(&settings.traces)?)
    } else {
        resolve_trace_directory(&settings.traces).ok()
    };

    let recent_files = match directory.as_deref() {
        Some(dir) => scan_trace_files(dir)?
            .into_iter()
            .take(settings.traces.max_files.saturating_add(2))
            .collect(),
        None => Vec::new(),
    };

    Ok(TraceReport {
        enabled: settings.traces.enabled,
        directory,
        active_file: ACTIVE_TRACE_FILE.get().cloned(),
        recent_files,
    })
}

fn build_trace_file_layer(
    service: &str,
    settings: &TraceSettings,
) -> Result<Option<(NonBlocking, WorkerGuard, PathBuf)>> {
    if !settings.enabled {
        return Ok(None);
    }

    let directory = resolve_trace_directory(settings)?;
    fs::create_dir_all(&directory)
        .with_context(|| format!("Failed to create trace directory {}", directory.display()))?;

    let (file, path) = create_trace_file(service, &directory)?;
    prune_old_traces(&directory, settings.max_files, &path)?;

    let (writer, guard) = tracing_appender::non_blocking(file);
    Ok(Some((writer, guard, path)))
}

fn resolve_trace_directory(settings: &TraceSettings) -> Result<PathBuf> {
    if let Some(dir) = &settings.directory {
        return Ok(dir.clone());
    }
    let dirs = ProjectDirs::from("dev", "cujkit", "cujkit")
        .context("Unable to resolve platform trace directory")?;
    Ok(dirs.cache_dir().join("traces"))
}

fn create_trace_file(service: &str, directory: &Path) -> Result<(fs::File, PathBuf)> {
    let service = sanitize_service(service);
    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let mut candidate = directory.join(format!("{service}-{timestamp}{TRACE_SUFFIX}"));
    let mut counter = 0;
    while candidate.exists() {
        counter += 1;
        candidate = directory.join(format!("{service}-{timestamp}-{counter}{TRACE_SUFFIX}"));
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&candidate)
        .with_context(|| format!("Failed to open trace file {}", candidate.display()))?;
    Ok((file, candidate))
}

/// Keep `keep` plus the newest `max_files - 1` other traces. Zero disables pruning.
fn prune_old_traces(directory: &Path, max_files: usize, keep: &Path) -> Result<()> {
    if max_files == 0 {
        return Ok(());
    }

    let retain = max_files.saturating_sub(1);
    for path in scan_trace_files(directory)?
        .into_iter()
        .filter(|path| path != keep)
        .skip(retain)
    {
        let _ = fs::remove_file(&path);
    }
    Ok(())
}

/// Trace files in `directory`, newest first.
fn scan_trace_files(directory: &Path) -> Result<Vec<PathBuf>> {
    if !directory.exists() {
        return Ok(Vec::new());
    }

    let mut entries: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(directory)
        .with_context(|| format!("Failed to read trace directory {}", directory.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|value| value.to_str()) else {
            continue;
        };
        if !name.ends_with(TRACE_SUFFIX) {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|metadata| metadata.modified()) else {
            continue;
        };
        entries.push((modified, path));
    }

    entries.sort_by_key(|(modified, _)| Reverse(*modified));
    Ok(entries.into_iter().map(|(_, path)| path).collect())
}

fn sanitize_service(service: &str) -> String {
    service
        .chars()
        .map(|ch| match ch {
            'a'..='z' | '0'..='9' | '-' | '_' => ch,
            'A'..='Z' => ch.to_ascii_lowercase(),
            _ => '-',
        })
        .collect()
}
