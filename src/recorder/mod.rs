//! Performance recording around scenario actions.

pub mod aggregate;
pub mod expectation;
pub mod journal;
pub mod metric;
pub mod results;
pub mod runner;
pub mod store;
pub mod tracker;

pub use aggregate::Aggregate;
pub use expectation::{Expectations, Outcome, Verdict, Verification};
pub use journal::{RunEvent, RunJournal, RunPhase};
pub use metric::{Aggregator, Direction, Group, JankCriteria, MetricSource, MetricSpec, Requirement};
pub use results::{ArchivedDelta, ResultRecord};
pub use runner::{RunFailure, RunReport, Runner, RunnerOptions, RunnerState};
pub use store::{RunSample, SampleStore};
pub use tracker::{BatteryInfoTracker, MemInfoTracker, Tracker};
