use std::collections::BTreeMap;

use super::metric::{Aggregator, Direction, Group, MetricSpec};
use super::results::ResultRecord;
use super::store::SampleStore;
use crate::histogram::Histogram;

/// Reduced value of one metric, or of one metric group.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub unit: String,
    pub direction: Direction,
    /// Pooled mean; `None` when no run produced samples.
    pub value: Option<f64>,
}

/// Summary value per metric name, plus one entry per populated group.
pub fn summarize(specs: &[MetricSpec], store: &SampleStore) -> BTreeMap<String, Aggregate> {
    let mut summary: BTreeMap<String, Aggregate> = specs
        .iter()
        .map(|spec| {
            let value = store.pooled(&spec.name).mean().ok();
            (
                spec.name.clone(),
                Aggregate {
                    unit: spec.unit.clone(),
                    direction: spec.direction,
                    value,
                },
            )
        })
        .collect();
    for (group, pooled) in group_pools(specs, store) {
        summary.insert(
            group.as_str().to_string(),
            Aggregate {
                unit: group.unit().to_string(),
                direction: group.direction(),
                value: pooled.mean().ok(),
            },
        );
    }
    summary
}

/// Every reported record: metric variants first, then group aggregates.
/// Metrics without samples report nothing.
pub fn records(specs: &[MetricSpec], store: &SampleStore) -> Vec<ResultRecord> {
    let mut records: Vec<ResultRecord> = specs
        .iter()
        .flat_map(|spec| metric_records(spec, store))
        .collect();
    for (group, pooled) in group_pools(specs, store) {
        if let Ok(mean) = pooled.mean() {
            records.push(ResultRecord::summary(
                group.as_str(),
                group.unit(),
                group.direction(),
                mean,
            ));
        }
    }
    records
}

fn metric_records(spec: &MetricSpec, store: &SampleStore) -> Vec<ResultRecord> {
    let pooled = store.pooled(&spec.name);
    let Ok(mean) = pooled.mean() else {
        return Vec::new();
    };
    let record = |value: f64| ResultRecord::summary(&spec.name, &spec.unit, spec.direction, value);

    let mut records = vec![record(mean)];
    for sample in store.samples(&spec.name) {
        if let Ok(run_mean) = sample.histogram.mean() {
            records.push(record(run_mean).with_variant(format!("run_{}", sample.run)));
        }
    }
    if spec.resolved_aggregator() == Aggregator::Latency {
        for (variant, p) in [("p50", 50.0), ("p90", 90.0)] {
            if let Ok(value) = pooled.percentile(p) {
                records.push(record(value).with_variant(variant));
            }
        }
    }
    if let Some(jank) = spec.jank {
        let total = pooled.total() as f64;
        for (variant, criterion) in [("jank_rate", jank.jank), ("very_jank_rate", jank.very_jank)] {
            let rate = pooled.jank_count(spec.direction, criterion) / total * 100.0;
            records.push(
                ResultRecord::summary(&spec.name, "percent", Direction::SmallerIsBetter, rate)
                    .with_variant(variant),
            );
        }
    }
    records
}

fn group_pools(specs: &[MetricSpec], store: &SampleStore) -> Vec<(Group, Histogram)> {
    Group::AGGREGATED
        .into_iter()
        .filter_map(|group| {
            let mut pooled = Histogram::empty(group.as_str());
            let mut members = 0;
            for spec in specs.iter().filter(|spec| spec.group == group) {
                pooled.merge(&store.pooled(&spec.name));
                members += 1;
            }
            (members > 0).then_some((group, pooled))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::Bucket;

    fn one_sample(name: &str, value: i64) -> Histogram {
        Histogram::new(name, value, vec![Bucket::new(value, value + 1, 1)])
    }

    #[test]
    fn empty_metric_reports_nothing() {
        let specs = vec![MetricSpec::smoothness("A.X")];
        let store = SampleStore::new();
        assert!(records(&specs, &store).is_empty());
        let summary = summarize(&specs, &store);
        assert_eq!(summary["A.X"].value, None);
        assert_eq!(summary["AnimationSmoothness"].value, None);
    }

    #[test]
    fn smoothness_reports_summary_runs_and_jank() {
        let specs = vec![MetricSpec::smoothness("A.X")];
        let mut store = SampleStore::new();
        for value in [40, 80] {
            let run = store.next_run();
            store.record(run, one_sample("A.X", value));
        }
        let records = records(&specs, &store);
        let value = |variant: Option<&str>, name: &str| {
            records
                .iter()
                .find(|r| r.name == name && r.variant.as_deref() == variant)
                .map(|r| r.value)
        };
        assert_eq!(value(None, "A.X"), Some(60.0));
        assert_eq!(value(Some("run_0"), "A.X"), Some(40.0));
        assert_eq!(value(Some("run_1"), "A.X"), Some(80.0));
        assert_eq!(value(Some("jank_rate"), "A.X"), Some(50.0));
        assert_eq!(value(Some("very_jank_rate"), "A.X"), Some(0.0));
        assert_eq!(value(None, "AnimationSmoothness"), Some(60.0));
        assert!(value(Some("p50"), "A.X").is_none());
    }

    #[test]
    fn latency_adds_percentiles() {
        let specs = vec![MetricSpec::latency("B.Y")];
        let mut store = SampleStore::new();
        let run = store.next_run();
        store.record(
            run,
            Histogram::new("B.Y", 150, vec![Bucket::new(0, 10, 5), Bucket::new(10, 20, 5)]),
        );
        let records = records(&specs, &store);
        let p50 = records.iter().find(|r| r.variant.as_deref() == Some("p50")).unwrap();
        assert_eq!(p50.value, 10.0);
        assert!(records.iter().any(|r| r.variant.as_deref() == Some("p90")));
        assert!(records.iter().any(|r| r.name == "InputLatency"));
    }

    #[test]
    fn groups_pool_members() {
        let specs = vec![MetricSpec::latency("B.Y"), MetricSpec::latency("B.Z")];
        let mut store = SampleStore::new();
        let run = store.next_run();
        store.record(run, one_sample("B.Y", 100));
        store.record(run, one_sample("B.Z", 300));
        store.record(run, one_sample("B.Z", 200));
        let summary = summarize(&specs, &store);
        assert_eq!(summary["InputLatency"].value, Some(200.0));
        assert_eq!(summary["InputLatency"].unit, "ms");
    }
}
