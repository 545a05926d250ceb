//! System-wide telemetry collected alongside the histograms of a recording
//! window.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use super::metric::Direction;
use super::results::ResultRecord;
use crate::error::{CujError, Result};
use crate::power::PowerControl;

/// Prefix shared by every system-wide value.
pub const TRACKER_PREFIX: &str = "TPS.";
pub const DEFAULT_MEMINFO_FILE: &str = "/proc/meminfo";

/// A source of device telemetry that runs for the duration of each
/// recording window.
///
/// The runner starts every tracker after the histogram baselines are taken
/// and stops it during teardown, including when the action failed.
/// [`Tracker::records`] is read once when results are assembled and covers
/// every window so far.
#[async_trait]
pub trait Tracker: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    fn records(&self) -> Vec<ResultRecord>;
}

/// Lowest available memory and largest swap use seen at window edges.
#[derive(Debug)]
pub struct MemInfoTracker {
    path: PathBuf,
    seen: Mutex<MemSeen>,
}

#[derive(Debug, Default)]
struct MemSeen {
    available_min_kb: Option<u64>,
    swap_used_max_kb: Option<u64>,
}

impl MemInfoTracker {
    pub fn new() -> Self {
        Self::from_file(DEFAULT_MEMINFO_FILE)
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            seen: Mutex::new(MemSeen::default()),
        }
    }

    async fn sample(&self) -> Result<()> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let fields = parse_meminfo(&raw);
        let available = fields.get("MemAvailable").copied().ok_or_else(|| {
            CujError::failed(format!("{} has no MemAvailable line", self.path.display()))
        })?;
        let swap_used = match (fields.get("SwapTotal"), fields.get("SwapFree")) {
            (Some(total), Some(free)) => Some(total.saturating_sub(*free)),
            _ => None,
        };
        debug!(available_kb = available, ?swap_used, "meminfo sampled");

        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        seen.available_min_kb = Some(seen.available_min_kb.map_or(available, |min| min.min(available)));
        if let Some(used) = swap_used {
            seen.swap_used_max_kb = Some(seen.swap_used_max_kb.map_or(used, |max| max.max(used)));
        }
        Ok(())
    }
}

impl Default for MemInfoTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tracker for MemInfoTracker {
    fn name(&self) -> &str {
        "meminfo"
    }

    async fn start(&self) -> Result<()> {
        self.sample().await
    }

    async fn stop(&self) -> Result<()> {
        self.sample().await
    }

    fn records(&self) -> Vec<ResultRecord> {
        let seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records = Vec::new();
        if let Some(kb) = seen.available_min_kb {
            records.push(ResultRecord::summary(
                format!("{TRACKER_PREFIX}Memory.AvailableMin"),
                "MB",
                Direction::BiggerIsBetter,
                kb as f64 / 1024.0,
            ));
        }
        if let Some(kb) = seen.swap_used_max_kb {
            records.push(ResultRecord::summary(
                format!("{TRACKER_PREFIX}Memory.SwapUsedMax"),
                "MB",
                Direction::SmallerIsBetter,
                kb as f64 / 1024.0,
            ));
        }
        records
    }
}

/// `Key: value kB` lines of a meminfo report, in kilobytes.
pub fn parse_meminfo(raw: &str) -> BTreeMap<String, u64> {
    raw.lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let value = rest.split_whitespace().next()?.parse().ok()?;
            Some((key.trim().to_string(), value))
        })
        .collect()
}

/// Battery charge consumed inside recording windows.
///
/// Hosts without a battery leave the tracker inert.
pub struct BatteryInfoTracker {
    power: Arc<dyn PowerControl>,
    state: Mutex<BatteryWindow>,
}

#[derive(Debug, Default)]
struct BatteryWindow {
    started_at: Option<f64>,
    used_percent: f64,
    windows: usize,
}

impl BatteryInfoTracker {
    pub fn new(power: Arc<dyn PowerControl>) -> Self {
        Self {
            power,
            state: Mutex::new(BatteryWindow::default()),
        }
    }

    fn window(&self) -> std::sync::MutexGuard<'_, BatteryWindow> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Tracker for BatteryInfoTracker {
    fn name(&self) -> &str {
        "battery"
    }

    async fn start(&self) -> Result<()> {
        if self.power.battery_count().await? == 0 {
            debug!("no battery, skipping battery telemetry");
            return Ok(());
        }
        let percent = self.power.charge_percent().await?;
        self.window().started_at = Some(percent);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let started = self.window().started_at.take();
        let Some(started) = started else {
            return Ok(());
        };
        let percent = self.power.charge_percent().await?;
        let mut window = self.window();
        window.used_percent += (started - percent).max(0.0);
        window.windows += 1;
        Ok(())
    }

    fn records(&self) -> Vec<ResultRecord> {
        let window = self.window();
        if window.windows == 0 {
            return Vec::new();
        }
        vec![ResultRecord::summary(
            format!("{TRACKER_PREFIX}Battery.ChargeUsed"),
            "percent",
            Direction::SmallerIsBetter,
            window.used_percent,
        )]
    }
}
