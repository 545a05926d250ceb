//! DevTools-protocol transport for the library's channel seam.

use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use cujkit::channel::{Browser, Channel};
use cujkit::error::{CujError, Result};
use headless_chrome::{LaunchOptions, Tab};
use serde_json::Value;
use tracing::debug;
use url::Url;

/// A launched Chromium process.
#[derive(Clone)]
pub struct CdpBrowser {
    browser: headless_chrome::Browser,
}

impl CdpBrowser {
    pub async fn launch(headless: bool) -> anyhow::Result<Self> {
        tokio::task::spawn_blocking(move || {
            let options = LaunchOptions::default_builder()
                .headless(headless)
                .build()
                .map_err(|err| anyhow!("invalid Chromium launch options: {err}"))?;
            let browser =
                headless_chrome::Browser::new(options).context("Failed to launch Chromium")?;
            Ok(Self { browser })
        })
        .await
        .context("Chromium launch task panicked")?
    }

    pub async fn open(&self, label: &str) -> anyhow::Result<Arc<CdpChannel>> {
        let browser = self.browser.clone();
        let tab = tokio::task::spawn_blocking(move || browser.new_tab())
            .await
            .context("tab task panicked")?
            .context("Failed to open a tab")?;
        Ok(Arc::new(CdpChannel::new(tab, label)))
    }
}

#[async_trait]
impl Browser for CdpBrowser {
    /// Chromium exposes tabs only; `new_window` is not distinguished.
    async fn new_conn(&self, url: &Url, new_window: bool) -> Result<Arc<dyn Channel>> {
        debug!(url = %url, new_window, "opening DevTools connection");
        let browser = self.browser.clone();
        let target = url.to_string();
        let tab = tokio::task::spawn_blocking(move || -> anyhow::Result<Arc<Tab>> {
            let tab = browser.new_tab()?;
            tab.navigate_to(&target)?.wait_until_navigated()?;
            Ok(tab)
        })
        .await
        .map_err(|err| CujError::Transport(format!("tab task failed: {err}")))?
        .map_err(|err| CujError::Transport(format!("{err:#}")))?;
        Ok(Arc::new(CdpChannel::new(tab, "primary")))
    }
}

/// [`Channel`] evaluating scripts in one tab.
pub struct CdpChannel {
    tab: Arc<Tab>,
    label: String,
}

impl CdpChannel {
    pub fn new(tab: Arc<Tab>, label: impl Into<String>) -> Self {
        Self {
            tab,
            label: label.into(),
        }
    }
}

#[async_trait]
impl Channel for CdpChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn exec(&self, script: &str) -> Result<String> {
        let tab = self.tab.clone();
        let script = script.to_string();
        let object = tokio::task::spawn_blocking(move || tab.evaluate(&script, true))
            .await
            .map_err(|err| CujError::Transport(format!("evaluation task failed: {err}")))?
            .map_err(|err| CujError::Transport(format!("{err:#}")))?;
        match object.value {
            Some(Value::String(raw)) => Ok(raw),
            other => Err(CujError::Transport(format!(
                "evaluation resolved to {other:?} instead of a JSON string"
            ))),
        }
    }
}
