use std::sync::Arc;

use crate::channel::Channel;
use crate::error::{CujError, Result};
use crate::histogram::{ChannelHistograms, HistogramQuery, HistogramSource};
use crate::power::{PowerControl, Unmanaged};
use crate::recorder::metric::MetricSource;
use crate::recorder::tracker::Tracker;
use crate::screen::{ChannelScreenRecorder, ScreenCapture};
use crate::trace::SystemTracer;

/// Capabilities of the device-under-test that a recording needs.
#[derive(Clone)]
pub struct Device {
    pub histograms: Arc<dyn HistogramSource>,
    pub secondary: Option<Arc<dyn HistogramSource>>,
    pub power: Arc<dyn PowerControl>,
    pub screen: Option<Arc<dyn ScreenCapture>>,
    pub tracer: Option<Arc<dyn SystemTracer>>,
    /// System-wide telemetry running inside every recording window.
    pub trackers: Vec<Arc<dyn Tracker>>,
}

impl Device {
    pub fn new(histograms: Arc<dyn HistogramSource>) -> Self {
        Self {
            histograms,
            secondary: None,
            power: Arc::new(Unmanaged),
            screen: None,
            tracer: None,
            trackers: Vec::new(),
        }
    }

    /// Histograms and screen capture over a test-extension connection.
    pub fn from_test_api(test_conn: Arc<dyn Channel>) -> Self {
        let histograms = ChannelHistograms::new(test_conn.clone(), HistogramQuery::MetricsPrivate);
        Self::new(Arc::new(histograms)).with_screen(Arc::new(ChannelScreenRecorder::new(test_conn)))
    }

    pub fn with_secondary(mut self, secondary: Arc<dyn HistogramSource>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    pub fn with_power(mut self, power: Arc<dyn PowerControl>) -> Self {
        self.power = power;
        self
    }

    pub fn with_screen(mut self, screen: Arc<dyn ScreenCapture>) -> Self {
        self.screen = Some(screen);
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn SystemTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn Tracker>) -> Self {
        self.trackers.push(tracker);
        self
    }

    pub fn source(&self, source: MetricSource) -> Result<&dyn HistogramSource> {
        match source {
            MetricSource::Primary => Ok(self.histograms.as_ref()),
            MetricSource::Secondary => self
                .secondary
                .as_deref()
                .ok_or_else(|| CujError::Config("no secondary browser attached".into())),
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("histograms", &self.histograms.label())
            .field("secondary", &self.secondary.as_ref().map(|s| s.label().to_string()))
            .field("screen", &self.screen.is_some())
            .field("tracer", &self.tracer.is_some())
            .field(
                "trackers",
                &self.trackers.iter().map(|t| t.name().to_string()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
