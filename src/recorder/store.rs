use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::histogram::Histogram;

/// Delta collected for one metric during one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSample {
    pub run: usize,
    pub histogram: Histogram,
}

/// Per-metric accumulation of run deltas.
///
/// Runs that produced no samples for a metric leave no entry, so pooling is
/// unaffected by empty runs.
#[derive(Debug, Clone, Default)]
pub struct SampleStore {
    runs: usize,
    samples: BTreeMap<String, Vec<RunSample>>,
}

impl SampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs started, including those that failed before
    /// post-flight.
    pub fn runs(&self) -> usize {
        self.runs
    }

    /// Reserve the index of the next run.
    pub fn next_run(&mut self) -> usize {
        let run = self.runs;
        self.runs += 1;
        run
    }

    pub fn record(&mut self, run: usize, delta: Histogram) {
        if delta.is_empty() {
            return;
        }
        self.samples
            .entry(delta.name.clone())
            .or_default()
            .push(RunSample {
                run,
                histogram: delta,
            });
    }

    pub fn samples(&self, name: &str) -> &[RunSample] {
        self.samples.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All deltas for `name` merged into one histogram.
    pub fn pooled(&self, name: &str) -> Histogram {
        let mut pooled = Histogram::empty(name);
        for sample in self.samples(name) {
            pooled.merge(&sample.histogram);
        }
        pooled
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.samples.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::Bucket;

    #[test]
    fn empty_deltas_are_not_stored() {
        let mut store = SampleStore::new();
        let run = store.next_run();
        store.record(run, Histogram::empty("A.X"));
        assert!(store.is_empty());
        assert_eq!(store.runs(), 1);
        assert!(store.pooled("A.X").is_empty());
    }

    #[test]
    fn pooled_merges_every_run() {
        let mut store = SampleStore::new();
        for value in [10, 30] {
            let run = store.next_run();
            store.record(
                run,
                Histogram::new("A.X", value, vec![Bucket::new(value, value + 1, 1)]),
            );
        }
        let pooled = store.pooled("A.X");
        assert_eq!(pooled.total(), 2);
        assert_eq!(pooled.mean().unwrap(), 20.0);
        assert_eq!(
            store.samples("A.X").iter().map(|s| s.run).collect::<Vec<_>>(),
            vec![0, 1]
        );
    }
}
