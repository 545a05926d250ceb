//! System-wide tracing with a detached perfetto session.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{CujError, Result};

pub const TRACE_FILE: &str = "trace.perfetto";
const CONFIG_FILE: &str = "perfetto.cfg";

pub const DEFAULT_CONFIG: &str = r#"buffers { size_kb: 65536 fill_policy: RING_BUFFER }
data_sources { config { name: "linux.ftrace" ftrace_config {
  ftrace_events: "sched/sched_switch"
  ftrace_events: "sched/sched_wakeup"
  ftrace_events: "power/cpu_frequency"
  ftrace_events: "power/cpu_idle"
} } }
data_sources { config { name: "linux.process_stats" } }
data_sources { config { name: "org.chromium.trace_event" } }
"#;

#[async_trait]
pub trait SystemTracer: Send + Sync {
    /// Begin tracing into `dir`; the trace lands in [`TRACE_FILE`].
    async fn start(&self, dir: &Path) -> Result<()>;

    async fn stop(&self) -> Result<PathBuf>;
}

pub struct Perfetto {
    binary: PathBuf,
    config: String,
    key: String,
    active: Mutex<Option<PathBuf>>,
}

impl Perfetto {
    pub fn locate(config: impl Into<String>) -> Result<Self> {
        let binary = which::which("perfetto")
            .map_err(|err| CujError::Unsupported(format!("perfetto not available: {err}")))?;
        Ok(Self::with_binary(binary, config))
    }

    pub fn with_binary(binary: PathBuf, config: impl Into<String>) -> Self {
        Self {
            binary,
            config: config.into(),
            key: format!("cujkit-{}", std::process::id()),
            active: Mutex::new(None),
        }
    }

    pub fn start_args(&self, config: &Path, output: &Path) -> Vec<String> {
        vec![
            format!("--detach={}", self.key),
            "--txt".to_string(),
            "-c".to_string(),
            config.display().to_string(),
            "-o".to_string(),
            output.display().to_string(),
        ]
    }

    pub fn stop_args(&self) -> Vec<String> {
        vec![format!("--attach={}", self.key), "--stop".to_string()]
    }

    async fn invoke(&self, args: &[String]) -> Result<()> {
        debug!(binary = %self.binary.display(), ?args, "running perfetto");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(CujError::failed(format!(
                "perfetto {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl SystemTracer for Perfetto {
    async fn start(&self, dir: &Path) -> Result<()> {
        let config = dir.join(CONFIG_FILE);
        let output = dir.join(TRACE_FILE);
        tokio::fs::write(&config, &self.config).await?;
        self.invoke(&self.start_args(&config, &output)).await?;
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(output.clone());
        info!(output = %output.display(), "system trace started");
        Ok(())
    }

    async fn stop(&self) -> Result<PathBuf> {
        let output = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| CujError::failed("no system trace in progress"))?;
        self.invoke(&self.stop_args()).await?;
        info!(output = %output.display(), "system trace saved");
        Ok(output)
    }
}
