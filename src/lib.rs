//! Performance recording for scripted critical user journeys on Chromium OS
//! devices, plus the composable UI action model scenarios are written in.

pub mod action;
pub mod channel;
pub mod config;
pub mod crash;
pub mod ctx;
pub mod device;
pub mod error;
#[cfg(any(test, feature = "test-support"))]
pub mod fake;
pub mod histogram;
pub mod input;
pub mod login;
pub mod power;
pub mod recorder;
pub mod screen;
pub mod telemetry;
pub mod trace;
pub mod uiauto;

pub use action::Action;
pub use channel::{Browser, Channel, ChannelExt};
pub use config::{CujSettings, default_config_path};
pub use ctx::{Ctx, PollOptions};
pub use device::Device;
pub use error::{CujError, ErrorKind, Result, StepExt};
pub use histogram::{Bucket, Histogram, HistogramSource};
pub use recorder::{
    Aggregator, Direction, Expectations, MetricSource, MetricSpec, ResultRecord, Runner,
    RunnerOptions, Tracker,
};
pub use uiauto::{Finder, UiContext};
