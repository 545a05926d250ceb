//! Declarative metric specs.

use std::fmt;

use clap::ValueEnum;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CujError, Result};

static NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._-]{1,256}$").expect("metric name pattern is valid")
});
static UNIT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._-]{1,32}$").expect("metric unit pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    BiggerIsBetter,
    SmallerIsBetter,
}

impl Direction {
    /// `up` / `down`, as used in chart documents.
    pub fn improvement(&self) -> &'static str {
        match self {
            Direction::BiggerIsBetter => "up",
            Direction::SmallerIsBetter => "down",
        }
    }

    pub fn short(&self) -> &'static str {
        match self {
            Direction::BiggerIsBetter => "bigger",
            Direction::SmallerIsBetter => "smaller",
        }
    }

    /// Whether `value` meets `threshold`.
    pub fn satisfies(&self, value: f64, threshold: f64) -> bool {
        match self {
            Direction::BiggerIsBetter => value >= threshold,
            Direction::SmallerIsBetter => value <= threshold,
        }
    }

    pub fn comparator(&self) -> &'static str {
        match self {
            Direction::BiggerIsBetter => "≥",
            Direction::SmallerIsBetter => "≤",
        }
    }
}

/// How per-run deltas reduce to reported values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Aggregator {
    /// Pooled mean plus every per-run mean.
    AllSamples,
    /// As all-samples, plus p50/p90 of the pooled samples.
    Latency,
    /// As all-samples; values are percentages.
    Smoothness,
    /// Chosen from the unit.
    #[default]
    Heuristic,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum MetricSource {
    #[default]
    Primary,
    Secondary,
}

impl MetricSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricSource::Primary => "primary",
            MetricSource::Secondary => "secondary",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Requirement {
    /// A run without samples records nothing for the metric.
    #[default]
    Optional,
    /// A run without samples fails.
    Required,
}

/// Sample values on the bad side of which a frame or input counts as janky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JankCriteria {
    pub jank: i64,
    pub very_jank: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Group {
    AnimationSmoothness,
    InputLatency,
    #[default]
    Other,
}

impl Group {
    pub const AGGREGATED: [Group; 2] = [Group::AnimationSmoothness, Group::InputLatency];

    pub fn as_str(&self) -> &'static str {
        match self {
            Group::AnimationSmoothness => "AnimationSmoothness",
            Group::InputLatency => "InputLatency",
            Group::Other => "Other",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Group::AnimationSmoothness => "percent",
            Group::InputLatency => "ms",
            Group::Other => "count",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Group::AnimationSmoothness => Direction::BiggerIsBetter,
            Group::InputLatency | Group::Other => Direction::SmallerIsBetter,
        }
    }

    pub fn is_reserved(name: &str) -> bool {
        [Group::AnimationSmoothness, Group::InputLatency, Group::Other]
            .iter()
            .any(|group| group.as_str() == name)
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MetricSpec {
    pub name: String,
    pub unit: String,
    pub direction: Direction,
    #[serde(default)]
    pub aggregator: Aggregator,
    #[serde(default)]
    pub source: MetricSource,
    #[serde(default)]
    pub requirement: Requirement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jank: Option<JankCriteria>,
    #[serde(default)]
    pub group: Group,
}

impl MetricSpec {
    /// Animation smoothness in percent; frames below 50 % are janky, below
    /// 20 % very janky.
    pub fn smoothness(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: "percent".into(),
            direction: Direction::BiggerIsBetter,
            aggregator: Aggregator::Smoothness,
            source: MetricSource::Primary,
            requirement: Requirement::Optional,
            jank: Some(JankCriteria {
                jank: 50,
                very_jank: 20,
            }),
            group: Group::AnimationSmoothness,
        }
    }

    /// Input latency in milliseconds; above 100 ms is janky, above 250 ms
    /// very janky.
    pub fn latency(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: "ms".into(),
            direction: Direction::SmallerIsBetter,
            aggregator: Aggregator::Latency,
            source: MetricSource::Primary,
            requirement: Requirement::Optional,
            jank: Some(JankCriteria {
                jank: 100,
                very_jank: 250,
            }),
            group: Group::InputLatency,
        }
    }

    pub fn custom(name: impl Into<String>, unit: impl Into<String>, direction: Direction) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            direction,
            aggregator: Aggregator::Heuristic,
            source: MetricSource::Primary,
            requirement: Requirement::Optional,
            jank: None,
            group: Group::Other,
        }
    }

    pub fn from_secondary(mut self) -> Self {
        self.source = MetricSource::Secondary;
        self
    }

    pub fn required(mut self) -> Self {
        self.requirement = Requirement::Required;
        self
    }

    pub fn with_aggregator(mut self, aggregator: Aggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn with_jank(mut self, jank: i64, very_jank: i64) -> Self {
        self.jank = Some(JankCriteria { jank, very_jank });
        self
    }

    pub fn is_required(&self) -> bool {
        self.requirement == Requirement::Required
    }

    /// Concrete aggregator, resolving [`Aggregator::Heuristic`] from the
    /// unit.
    pub fn resolved_aggregator(&self) -> Aggregator {
        match self.aggregator {
            Aggregator::Heuristic => match self.unit.as_str() {
                "percent" => Aggregator::Smoothness,
                "ms" | "microsecond" => Aggregator::Latency,
                _ => Aggregator::AllSamples,
            },
            other => other,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !NAME_PATTERN.is_match(&self.name) {
            return Err(CujError::Config(format!(
                "invalid metric name {:?}: expected {}",
                self.name,
                NAME_PATTERN.as_str()
            )));
        }
        if Group::is_reserved(&self.name) {
            return Err(CujError::Config(format!(
                "metric name {:?} is reserved for group aggregates",
                self.name
            )));
        }
        if !UNIT_PATTERN.is_match(&self.unit) {
            return Err(CujError::Config(format!(
                "invalid unit {:?} for metric {}: expected {}",
                self.unit,
                self.name,
                UNIT_PATTERN.as_str()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_carry_defaults() {
        let smooth = MetricSpec::smoothness("Ash.Overview.AnimationSmoothness.Enter");
        assert_eq!(smooth.unit, "percent");
        assert_eq!(smooth.direction, Direction::BiggerIsBetter);
        assert_eq!(smooth.group, Group::AnimationSmoothness);
        assert_eq!(smooth.jank, Some(JankCriteria { jank: 50, very_jank: 20 }));

        let latency = MetricSpec::latency("Ash.TabletMode.Latency").required();
        assert_eq!(latency.direction, Direction::SmallerIsBetter);
        assert_eq!(latency.group, Group::InputLatency);
        assert!(latency.is_required());

        let custom = MetricSpec::custom("Cras.UnderrunsPerDevice", "count", Direction::SmallerIsBetter);
        assert_eq!(custom.group, Group::Other);
        assert_eq!(custom.resolved_aggregator(), Aggregator::AllSamples);
    }

    #[test]
    fn heuristic_follows_unit() {
        let spec = |unit: &str| MetricSpec::custom("A.X", unit, Direction::SmallerIsBetter);
        assert_eq!(spec("percent").resolved_aggregator(), Aggregator::Smoothness);
        assert_eq!(spec("ms").resolved_aggregator(), Aggregator::Latency);
        assert_eq!(spec("microsecond").resolved_aggregator(), Aggregator::Latency);
        assert_eq!(spec("janks").resolved_aggregator(), Aggregator::AllSamples);
    }

    #[test]
    fn validation_rejects_bad_names_units_and_groups() {
        assert!(MetricSpec::smoothness("A.X").validate().is_ok());
        assert!(MetricSpec::smoothness("has space").validate().is_err());
        assert!(MetricSpec::smoothness("").validate().is_err());
        assert!(MetricSpec::smoothness("x".repeat(257)).validate().is_err());
        assert!(MetricSpec::smoothness("InputLatency").validate().is_err());
        assert!(
            MetricSpec::custom("A.X", "per/second", Direction::BiggerIsBetter)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn direction_comparisons() {
        assert!(Direction::BiggerIsBetter.satisfies(42.0, 30.0));
        assert!(!Direction::BiggerIsBetter.satisfies(42.0, 50.0));
        assert!(Direction::SmallerIsBetter.satisfies(42.0, 42.0));
        assert!(!Direction::SmallerIsBetter.satisfies(42.5, 42.0));
    }

    #[test]
    fn spec_deserializes_with_defaults() {
        let spec: MetricSpec = serde_json::from_str(
            r#"{"name": "Page.LongTask", "unit": "ms", "direction": "smaller-is-better"}"#,
        )
        .unwrap();
        assert_eq!(spec.aggregator, Aggregator::Heuristic);
        assert_eq!(spec.source, MetricSource::Primary);
        assert_eq!(spec.group, Group::Other);
    }
}
