use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::ctx::{DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT, PollOptions};
use crate::login::DEFAULT_LOGIN_TIME_FILE;
use crate::power::{DEFAULT_DISCHARGE_THRESHOLD, DischargeOptions};
use crate::recorder::RunnerOptions;

/// User configuration for the benchmark CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CujSettings {
    /// Optional override for where results are written.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub runner: RunnerSettings,
    #[serde(default)]
    pub poll: PollSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

impl CujSettings {
    /// Load settings from disk, writing defaults if missing.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Unable to read config at {}", path.display()))?;
            let parsed: Self = serde_json::from_str(&raw)
                .with_context(|| format!("Malformed config at {}", path.display()))?;
            Ok(parsed)
        } else {
            let settings = Self::default();
            settings.save(path)?;
            Ok(settings)
        }
    }

    /// Resolve the directory that receives per-scenario result folders.
    pub fn resolve_output_root(&self) -> Result<PathBuf> {
        if let Some(path) = &self.output_dir {
            return Ok(path.clone());
        }
        let dirs = ProjectDirs::from("dev", "cujkit", "cujkit")
            .context("Unable to resolve platform data directory")?;
        Ok(dirs.data_dir().join("results"))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        let serialised = serde_json::to_string_pretty(self)?;
        fs::write(path, serialised)
            .with_context(|| format!("Failed to persist config to {}", path.display()))
    }
}

/// Serialisable mirror of [`RunnerOptions`]; durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerSettings {
    #[serde(default = "RunnerSettings::default_runs")]
    pub runs: usize,
    #[serde(default)]
    pub trace: bool,
    #[serde(default)]
    pub screen_recording: bool,
    #[serde(default)]
    pub battery_discharge: bool,
    #[serde(default = "RunnerSettings::default_discharge_threshold")]
    pub discharge_threshold: f64,
    #[serde(default)]
    pub fail_on_discharge_error: bool,
    #[serde(default)]
    pub report_run_metrics: bool,
    #[serde(default = "RunnerSettings::default_login_time_file")]
    pub login_time_file: Option<PathBuf>,
    #[serde(default = "RunnerSettings::default_scratch_dir")]
    pub scratch_dir: PathBuf,
    #[serde(default = "RunnerSettings::default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "RunnerSettings::default_required_timeout_ms")]
    pub required_timeout_ms: u64,
    #[serde(default = "RunnerSettings::default_cleanup_budget_ms")]
    pub cleanup_budget_ms: u64,
}

impl RunnerSettings {
    const fn default_runs() -> usize {
        1
    }

    const fn default_discharge_threshold() -> f64 {
        DEFAULT_DISCHARGE_THRESHOLD
    }

    fn default_login_time_file() -> Option<PathBuf> {
        Some(PathBuf::from(DEFAULT_LOGIN_TIME_FILE))
    }

    fn default_scratch_dir() -> PathBuf {
        PathBuf::from("/tmp/cujkit")
    }

    const fn default_settle_ms() -> u64 {
        1_000
    }

    const fn default_required_timeout_ms() -> u64 {
        10_000
    }

    const fn default_cleanup_budget_ms() -> u64 {
        10_000
    }

    pub fn to_options(&self) -> RunnerOptions {
        RunnerOptions {
            runs: self.runs.max(1),
            trace: self.trace,
            screen_recording: self.screen_recording,
            battery_discharge: self.battery_discharge,
            discharge: DischargeOptions {
                threshold: self.discharge_threshold,
                fail_on_error: self.fail_on_discharge_error,
            },
            report_run_metrics: self.report_run_metrics,
            login_time_file: self.login_time_file.clone(),
            scratch_dir: self.scratch_dir.clone(),
            settle: Duration::from_millis(self.settle_ms),
            required_timeout: Duration::from_millis(self.required_timeout_ms),
            cleanup_budget: Duration::from_millis(self.cleanup_budget_ms),
        }
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            runs: Self::default_runs(),
            trace: false,
            screen_recording: false,
            battery_discharge: false,
            discharge_threshold: Self::default_discharge_threshold(),
            fail_on_discharge_error: false,
            report_run_metrics: false,
            login_time_file: Self::default_login_time_file(),
            scratch_dir: Self::default_scratch_dir(),
            settle_ms: Self::default_settle_ms(),
            required_timeout_ms: Self::default_required_timeout_ms(),
            cleanup_budget_ms: Self::default_cleanup_budget_ms(),
        }
    }
}

/// Default cadence for `wait-until-*` primitives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSettings {
    #[serde(default = "PollSettings::default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "PollSettings::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl PollSettings {
    fn default_interval_ms() -> u64 {
        DEFAULT_POLL_INTERVAL.as_millis() as u64
    }

    fn default_timeout_ms() -> u64 {
        DEFAULT_POLL_TIMEOUT.as_millis() as u64
    }

    pub fn to_options(&self) -> PollOptions {
        PollOptions::new(
            Duration::from_millis(self.interval_ms),
            Duration::from_millis(self.timeout_ms),
        )
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_ms: Self::default_interval_ms(),
            timeout_ms: Self::default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetrySettings {
    #[serde(default)]
    pub traces: TraceSettings,
}

/// JSON trace files written alongside console logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "TraceSettings::default_max_files")]
    pub max_files: usize,
}

impl TraceSettings {
    const fn default_max_files() -> usize {
        10
    }
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: None,
            max_files: Self::default_max_files(),
        }
    }
}

/// Compute the default path to the CLI configuration file.
pub fn default_config_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("dev", "cujkit", "cujkit")
        .context("Unable to resolve platform config directory")?;
    Ok(dirs.config_dir().join("config.json"))
}
