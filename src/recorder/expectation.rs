//! Threshold checks over aggregated metrics.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::aggregate::Aggregate;
use super::results::ResultRecord;
use crate::error::{CujError, Result};

/// Threshold per metric name; the direction comes from the metric itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Expectations(BTreeMap<String, f64>);

impl Expectations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect(mut self, name: impl Into<String>, threshold: f64) -> Self {
        self.0.insert(name.into(), threshold);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(name, threshold)| (name.as_str(), *threshold))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read expectations from {}", path.display()))?;
        let parsed: Self = serde_json::from_str(&text)
            .with_context(|| format!("Invalid expectations file {}", path.display()))?;
        Ok(parsed)
    }

    /// One verdict per expectation, in name order.
    pub fn check(&self, aggregates: &BTreeMap<String, Aggregate>) -> Verification {
        let verdicts = self
            .iter()
            .map(|(name, threshold)| {
                let outcome = match aggregates.get(name) {
                    None => Outcome::Miss(format!("{name}: metric is not recorded")),
                    Some(aggregate) => {
                        let expected = format!(
                            "expected {} {}",
                            aggregate.direction.comparator(),
                            render(threshold)
                        );
                        match aggregate.value {
                            None => Outcome::Miss(format!("{name}: {expected}, got no samples")),
                            Some(value) if aggregate.direction.satisfies(value, threshold) => {
                                Outcome::Pass(value)
                            }
                            Some(value) => {
                                Outcome::Miss(format!("{name}: {expected}, got {}", render(value)))
                            }
                        }
                    }
                };
                Verdict {
                    metric: name.to_string(),
                    outcome,
                }
            })
            .collect();
        Verification { verdicts }
    }
}

/// Summary aggregates reconstructed from a saved results document.
pub fn aggregates_from_records(records: &[ResultRecord]) -> BTreeMap<String, Aggregate> {
    records
        .iter()
        .filter(|record| record.variant.is_none())
        .map(|record| {
            (
                record.name.clone(),
                Aggregate {
                    unit: record.unit.clone(),
                    direction: record.direction,
                    value: Some(record.value),
                },
            )
        })
        .collect()
}

fn render(value: f64) -> String {
    let rounded = (value * 1000.0).round() / 1000.0;
    format!("{rounded}")
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Pass(f64),
    Miss(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub metric: String,
    pub outcome: Outcome,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        matches!(self.outcome, Outcome::Pass(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Verification {
    pub verdicts: Vec<Verdict>,
}

impl Verification {
    pub fn passed(&self) -> bool {
        self.verdicts.iter().all(Verdict::passed)
    }

    pub fn misses(&self) -> Vec<&str> {
        self.verdicts
            .iter()
            .filter_map(|verdict| match &verdict.outcome {
                Outcome::Miss(message) => Some(message.as_str()),
                Outcome::Pass(_) => None,
            })
            .collect()
    }

    /// `Err(ExpectationMiss)` listing every miss.
    pub fn into_result(self) -> Result<()> {
        let misses = self.misses();
        if misses.is_empty() {
            Ok(())
        } else {
            Err(CujError::ExpectationMiss(misses.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::recorder::metric::Direction;

    fn aggregates(direction: Direction, value: Option<f64>) -> BTreeMap<String, Aggregate> {
        BTreeMap::from([(
            "A.X".to_string(),
            Aggregate {
                unit: "percent".into(),
                direction,
                value,
            },
        )])
    }

    #[test]
    fn bigger_is_better_threshold() {
        let aggs = aggregates(Direction::BiggerIsBetter, Some(42.0));
        assert!(Expectations::new().expect("A.X", 30.0).check(&aggs).passed());
        assert!(Expectations::new().expect("A.X", 42.0).check(&aggs).passed());
        let miss = Expectations::new().expect("A.X", 50.0).check(&aggs);
        assert_eq!(miss.misses(), vec!["A.X: expected ≥ 50, got 42"]);
    }

    #[test]
    fn smaller_is_better_threshold() {
        let aggs = aggregates(Direction::SmallerIsBetter, Some(120.25));
        assert!(Expectations::new().expect("A.X", 200.0).check(&aggs).passed());
        let miss = Expectations::new().expect("A.X", 100.0).check(&aggs);
        assert_eq!(miss.misses(), vec!["A.X: expected ≤ 100, got 120.25"]);
    }

    #[test]
    fn no_samples_is_a_miss() {
        let aggs = aggregates(Direction::BiggerIsBetter, None);
        let err = Expectations::new()
            .expect("A.X", 30.0)
            .check(&aggs)
            .into_result()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExpectationMiss);
        assert_eq!(err.to_string(), "A.X: expected ≥ 30, got no samples");
    }

    #[test]
    fn unknown_metric_is_a_miss() {
        let verification = Expectations::new().expect("Nope", 1.0).check(&BTreeMap::new());
        assert!(!verification.passed());
        assert!(verification.misses()[0].contains("not recorded"));
    }

    #[test]
    fn expectations_parse_from_json_map() {
        let parsed: Expectations = serde_json::from_str(r#"{"A.X": 30, "B.Y": 250.5}"#).unwrap();
        assert_eq!(parsed, Expectations::new().expect("A.X", 30.0).expect("B.Y", 250.5));
    }

    #[test]
    fn saved_summaries_become_aggregates() {
        let records = vec![
            ResultRecord::summary("A.X", "percent", Direction::BiggerIsBetter, 42.0),
            ResultRecord::summary("A.X", "percent", Direction::BiggerIsBetter, 10.0).with_variant("run_0"),
        ];
        let aggs = aggregates_from_records(&records);
        assert_eq!(aggs.len(), 1);
        assert_eq!(aggs["A.X"].value, Some(42.0));
    }
}
