//! Display and battery control on the device-under-test.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{CujError, Result};

pub const DEFAULT_DISCHARGE_THRESHOLD: f64 = 55.0;

#[async_trait]
pub trait PowerControl: Send + Sync {
    async fn turn_on_display(&self) -> Result<()>;

    async fn battery_count(&self) -> Result<usize>;

    /// Charge of the first battery, in percent.
    async fn charge_percent(&self) -> Result<f64>;

    /// `true` forces discharge even on AC; `false` restores normal charging.
    async fn set_discharge(&self, discharge: bool) -> Result<()>;
}

/// Host without battery or display control; everything is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unmanaged;

#[async_trait]
impl PowerControl for Unmanaged {
    async fn turn_on_display(&self) -> Result<()> {
        Ok(())
    }

    async fn battery_count(&self) -> Result<usize> {
        Ok(0)
    }

    async fn charge_percent(&self) -> Result<f64> {
        Err(CujError::Unsupported("no battery".into()))
    }

    async fn set_discharge(&self, _discharge: bool) -> Result<()> {
        Err(CujError::Unsupported("no battery".into()))
    }
}

/// Chromebook power control through `power_supply_info`, `ectool` and the
/// power manager's D-Bus interface.
#[derive(Debug, Clone)]
pub struct Ectool {
    power_supply_info: PathBuf,
    ectool: PathBuf,
    dbus_send: PathBuf,
}

impl Ectool {
    /// Locate the tools on `PATH`.
    pub fn locate() -> Result<Self> {
        let find = |name: &str| {
            which::which(name)
                .map_err(|err| CujError::Unsupported(format!("{name} not available: {err}")))
        };
        Ok(Self {
            power_supply_info: find("power_supply_info")?,
            ectool: find("ectool")?,
            dbus_send: find("dbus-send")?,
        })
    }

    async fn output(program: &PathBuf, args: &[&str]) -> Result<String> {
        debug!(program = %program.display(), ?args, "running power tool");
        let output = Command::new(program).args(args).output().await?;
        if !output.status.success() {
            return Err(CujError::failed(format!(
                "{} {} exited with {}: {}",
                program.display(),
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl PowerControl for Ectool {
    async fn turn_on_display(&self) -> Result<()> {
        Self::output(
            &self.dbus_send,
            &[
                "--system",
                "--type=method_call",
                "--dest=org.chromium.PowerManager",
                "/org/chromium/PowerManager",
                "org.chromium.PowerManager.HandleUserActivity",
                "int32:0",
            ],
        )
        .await?;
        Ok(())
    }

    async fn battery_count(&self) -> Result<usize> {
        let report = Self::output(&self.power_supply_info, &[]).await?;
        Ok(parse_power_supply(&report).len())
    }

    async fn charge_percent(&self) -> Result<f64> {
        let report = Self::output(&self.power_supply_info, &[]).await?;
        parse_power_supply(&report)
            .into_iter()
            .next()
            .flatten()
            .ok_or_else(|| CujError::failed("power_supply_info reported no battery percentage"))
    }

    async fn set_discharge(&self, discharge: bool) -> Result<()> {
        let mode = if discharge { "discharge" } else { "normal" };
        Self::output(&self.ectool, &["chargecontrol", mode]).await?;
        Ok(())
    }
}

/// Battery sections of a `power_supply_info` report, each with its
/// percentage when reported.
pub fn parse_power_supply(report: &str) -> Vec<Option<f64>> {
    let mut batteries = Vec::new();
    let mut in_battery = false;
    for line in report.lines() {
        let trimmed = line.trim();
        if let Some(kind) = trimmed.strip_prefix("Device:") {
            in_battery = kind.trim() == "Battery";
            if in_battery {
                batteries.push(None);
            }
            continue;
        }
        if !in_battery {
            continue;
        }
        if let Some(value) = trimmed.strip_prefix("percentage:") {
            if let (Some(slot), Ok(percent)) = (batteries.last_mut(), value.trim().parse::<f64>()) {
                *slot = Some(percent);
            }
        }
    }
    batteries
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DischargeOptions {
    /// Minimum charge, in percent, needed to start discharging.
    pub threshold: f64,
    /// Turn an impossible discharge on a battery device into a failure.
    pub fail_on_error: bool,
}

impl Default for DischargeOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_DISCHARGE_THRESHOLD,
            fail_on_error: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DischargeState {
    Idle,
    Discharging,
    NoBattery,
}

/// Scoped forced-discharge. `acquire` is idempotent; each successful
/// acquisition is matched by exactly one restore in `release`.
pub struct BatteryDischarge {
    power: Arc<dyn PowerControl>,
    options: DischargeOptions,
    state: Mutex<DischargeState>,
}

impl BatteryDischarge {
    pub fn new(power: Arc<dyn PowerControl>, options: DischargeOptions) -> Self {
        Self {
            power,
            options,
            state: Mutex::new(DischargeState::Idle),
        }
    }

    fn state(&self) -> DischargeState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: DischargeState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn is_discharging(&self) -> bool {
        self.state() == DischargeState::Discharging
    }

    /// Start discharging. Returns whether the battery is now discharging.
    pub async fn acquire(&self) -> Result<bool> {
        match self.state() {
            DischargeState::Discharging => return Ok(true),
            DischargeState::NoBattery => return Ok(false),
            DischargeState::Idle => {}
        }
        if self.power.battery_count().await? == 0 {
            info!("no battery present, skipping forced discharge");
            self.set_state(DischargeState::NoBattery);
            return Ok(false);
        }
        match self.start().await {
            Ok(()) => {
                info!(threshold = self.options.threshold, "battery discharge started");
                self.set_state(DischargeState::Discharging);
                Ok(true)
            }
            Err(err) if self.options.fail_on_error => Err(err),
            Err(err) => {
                warn!(error = %err, "battery discharge unavailable, continuing on AC");
                Ok(false)
            }
        }
    }

    async fn start(&self) -> Result<()> {
        let percent = self.power.charge_percent().await?;
        if percent < self.options.threshold {
            return Err(CujError::failed(format!(
                "battery percent {percent:.2} is too low to start discharging (need {:.2})",
                self.options.threshold
            )));
        }
        self.power.set_discharge(true).await
    }

    /// Restore normal charging if this guard started a discharge.
    pub async fn release(&self) -> Result<()> {
        if self.state() != DischargeState::Discharging {
            return Ok(());
        }
        self.set_state(DischargeState::Idle);
        info!("restoring normal battery charging");
        self.power.set_discharge(false).await
    }
}
