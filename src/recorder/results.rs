//! On-disk result documents.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use super::metric::{Direction, MetricSource};
use super::store::RunSample;

pub const RESULTS_FILE: &str = "results.json";
pub const CHART_FILE: &str = "results-chart.json";
pub const ARCHIVE_FILE: &str = "recorder_histograms.json";
const SUMMARY_VARIANT: &str = "summary";

/// One reported value. A record without a variant is the metric's summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    pub unit: String,
    #[serde(with = "short_direction")]
    pub direction: Direction,
    pub value: f64,
}

impl ResultRecord {
    pub fn summary(name: impl Into<String>, unit: impl Into<String>, direction: Direction, value: f64) -> Self {
        Self {
            name: name.into(),
            variant: None,
            unit: unit.into(),
            direction,
            value,
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    pub fn variant_or_summary(&self) -> &str {
        self.variant.as_deref().unwrap_or(SUMMARY_VARIANT)
    }
}

mod short_direction {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    use super::Direction;

    pub fn serialize<S: Serializer>(direction: &Direction, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(direction.short())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Direction, D::Error> {
        match String::deserialize(deserializer)?.as_str() {
            "bigger" => Ok(Direction::BiggerIsBetter),
            "smaller" => Ok(Direction::SmallerIsBetter),
            other => Err(D::Error::custom(format!("unknown direction {other:?}"))),
        }
    }
}

/// Delta of one metric in one run, as archived for offline analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedDelta {
    pub metric: String,
    pub source: MetricSource,
    #[serde(flatten)]
    pub sample: RunSample,
}

/// Chart layout: name → variant → {units, improvement_direction, type, value}.
pub fn chart(records: &[ResultRecord]) -> Value {
    let mut chart: BTreeMap<&str, BTreeMap<&str, Value>> = BTreeMap::new();
    for record in records {
        chart.entry(&record.name).or_default().insert(
            record.variant_or_summary(),
            json!({
                "units": record.unit,
                "improvement_direction": record.direction.improvement(),
                "type": "scalar",
                "value": record.value,
            }),
        );
    }
    json!(chart)
}

fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))
}

/// Write the results and chart documents into `dir`.
pub fn save_results(dir: &Path, records: &[ResultRecord]) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Unable to create output directory {}", dir.display()))?;
    let results = dir.join(RESULTS_FILE);
    let chart_path = dir.join(CHART_FILE);
    write_json(&results, &records)?;
    write_json(&chart_path, &chart(records))?;
    info!(records = records.len(), dir = %dir.display(), "results saved");
    Ok(vec![results, chart_path])
}

/// Write every archived delta, plus one file per source that produced any.
pub fn save_archive(dir: &Path, deltas: &[ArchivedDelta]) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Unable to create output directory {}", dir.display()))?;
    let mut written = Vec::new();
    let all = dir.join(ARCHIVE_FILE);
    write_json(&all, &deltas)?;
    written.push(all);
    for source in [MetricSource::Primary, MetricSource::Secondary] {
        let subset: Vec<&ArchivedDelta> = deltas.iter().filter(|delta| delta.source == source).collect();
        if subset.is_empty() {
            continue;
        }
        let path = dir.join(format!("recorder_histograms_{}.json", source.as_str()));
        write_json(&path, &subset)?;
        written.push(path);
    }
    Ok(written)
}

pub fn load_results(path: &Path) -> Result<Vec<ResultRecord>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read results from {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid results document {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::{Bucket, Histogram};
    use tempfile::tempdir;

    fn records() -> Vec<ResultRecord> {
        vec![
            ResultRecord::summary("A.X", "percent", Direction::BiggerIsBetter, 42.0),
            ResultRecord::summary("A.X", "percent", Direction::BiggerIsBetter, 40.0).with_variant("run_0"),
            ResultRecord::summary("B.Y", "ms", Direction::SmallerIsBetter, 120.5),
        ]
    }

    #[test]
    fn record_uses_short_direction() {
        let value = serde_json::to_value(&records()[0]).unwrap();
        assert_eq!(value["direction"], "bigger");
        assert!(value.get("variant").is_none());
        let back: ResultRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, records()[0]);
    }

    #[test]
    fn chart_groups_variants_under_name() {
        let chart = chart(&records());
        assert_eq!(chart["A.X"]["summary"]["value"], 42.0);
        assert_eq!(chart["A.X"]["run_0"]["improvement_direction"], "up");
        assert_eq!(chart["B.Y"]["summary"]["improvement_direction"], "down");
        assert_eq!(chart["B.Y"]["summary"]["type"], "scalar");
    }

    #[test]
    fn saved_results_load_back() {
        let dir = tempdir().unwrap();
        let written = save_results(dir.path(), &records()).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(load_results(&dir.path().join(RESULTS_FILE)).unwrap(), records());
    }

    #[test]
    fn archive_splits_by_source() {
        let dir = tempdir().unwrap();
        let delta = ArchivedDelta {
            metric: "A.X".into(),
            source: MetricSource::Secondary,
            sample: RunSample {
                run: 0,
                histogram: Histogram::new("A.X", 42, vec![Bucket::new(42, 43, 1)]),
            },
        };
        let written = save_archive(dir.path(), &[delta]).unwrap();
        assert_eq!(written.len(), 2);
        assert!(dir.path().join("recorder_histograms_secondary.json").exists());
        assert!(!dir.path().join("recorder_histograms_primary.json").exists());
    }
}
