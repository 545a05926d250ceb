//! In-memory device-under-test for unit tests and offline demos.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::channel::Channel;
use crate::error::{CujError, Result};
use crate::histogram::{Bucket, Histogram, HistogramSource};
use crate::input::{InputSink, KeyCode, MouseButton, Surface};
use crate::power::PowerControl;
use crate::recorder::metric::Direction;
use crate::recorder::results::ResultRecord;
use crate::recorder::tracker::{TRACKER_PREFIX, Tracker};
use crate::screen::ScreenCapture;
use crate::uiauto::automation::{Automation, NodeAction, WatchId};
use crate::uiauto::node::{EventKind, NodeInfo, NodeRef, Point, TreeEvent};

/// One primitive received by the fake input sink.
#[derive(Debug, Clone, PartialEq)]
pub enum InputRecord {
    MouseMove(Point),
    MouseButton(MouseButton, bool),
    /// Contacts on `surface`; an empty list lifts every finger.
    Touch(Surface, Vec<Point>),
    /// `held` lists the keys that were down before this event.
    Key {
        key: KeyCode,
        pressed: bool,
        held: Vec<KeyCode>,
    },
}

#[derive(Default)]
struct Battery {
    count: usize,
    percent: f64,
    starts: usize,
    stops: usize,
}

#[derive(Default)]
struct State {
    histograms: BTreeMap<String, Histogram>,
    tree: NodeInfo,
    watches: BTreeMap<WatchId, (EventKind, Vec<TreeEvent>)>,
    performed: Vec<(Vec<usize>, NodeAction)>,
    inputs: Vec<InputRecord>,
    buttons: BTreeSet<MouseButton>,
    keys: BTreeSet<KeyCode>,
    battery: Battery,
    recording: bool,
    tracking: usize,
    tracked_windows: usize,
}

/// Implements every device seam against shared in-memory state.
#[derive(Default)]
pub struct FakeDevice {
    state: Mutex<State>,
    next_watch: AtomicU64,
    tree_reads: AtomicUsize,
}

impl FakeDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one sample of `value` into `name`, in a unit-wide bucket.
    pub fn push_sample(&self, name: &str, value: i64) {
        let mut state = self.state();
        let histogram = state
            .histograms
            .entry(name.to_string())
            .or_insert_with(|| Histogram::empty(name));
        histogram.merge(&Histogram::new(name, value, vec![Bucket::new(value, value + 1, 1)]));
    }

    pub fn set_tree(&self, tree: NodeInfo) {
        self.state().tree = tree;
    }

    pub fn tree_reads(&self) -> usize {
        self.tree_reads.load(Ordering::SeqCst)
    }

    /// Deliver an event to every subscription of `kind`.
    pub fn emit_event(&self, kind: EventKind, target: NodeInfo) {
        let mut state = self.state();
        for (watched, events) in state.watches.values_mut() {
            if *watched == kind {
                events.push(TreeEvent {
                    kind,
                    target: target.clone(),
                });
            }
        }
    }

    pub fn active_watches(&self) -> usize {
        self.state().watches.len()
    }

    pub fn performed(&self) -> Vec<(Vec<usize>, NodeAction)> {
        self.state().performed.clone()
    }

    pub fn input_log(&self) -> Vec<InputRecord> {
        self.state().inputs.clone()
    }

    pub fn held_buttons(&self) -> Vec<MouseButton> {
        self.state().buttons.iter().copied().collect()
    }

    pub fn held_keys(&self) -> Vec<KeyCode> {
        self.state().keys.iter().copied().collect()
    }

    pub fn set_battery(&self, count: usize, percent: f64) {
        let mut state = self.state();
        state.battery.count = count;
        state.battery.percent = percent;
    }

    pub fn discharge_starts(&self) -> usize {
        self.state().battery.starts
    }

    pub fn discharge_stops(&self) -> usize {
        self.state().battery.stops
    }

    /// Tracker windows started but not yet stopped.
    pub fn tracking(&self) -> usize {
        self.state().tracking
    }

    pub fn tracked_windows(&self) -> usize {
        self.state().tracked_windows
    }
}

#[async_trait]
impl HistogramSource for FakeDevice {
    fn label(&self) -> &str {
        "fake"
    }

    async fn fetch(&self, name: &str) -> Result<Histogram> {
        Ok(self
            .state()
            .histograms
            .get(name)
            .cloned()
            .unwrap_or_else(|| Histogram::empty(name)))
    }
}

#[async_trait]
impl Automation for FakeDevice {
    async fn tree(&self) -> Result<NodeInfo> {
        self.tree_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.state().tree.clone())
    }

    async fn watch(&self, kind: EventKind) -> Result<WatchId> {
        let id = WatchId(self.next_watch.fetch_add(1, Ordering::SeqCst));
        self.state().watches.insert(id, (kind, Vec::new()));
        Ok(id)
    }

    async fn drain(&self, id: WatchId) -> Result<Vec<TreeEvent>> {
        let mut state = self.state();
        let (_, events) = state
            .watches
            .get_mut(&id)
            .ok_or_else(|| CujError::failed(format!("unknown watch {}", id.0)))?;
        Ok(std::mem::take(events))
    }

    async fn unwatch(&self, id: WatchId) -> Result<()> {
        self.state().watches.remove(&id);
        Ok(())
    }

    async fn perform(&self, node: &NodeRef, action: NodeAction) -> Result<()> {
        let mut state = self.state();
        let current = state
            .tree
            .at_path(&node.path)
            .map(|found| (found.role, found.name.clone()));
        if current != Some((node.info.role, node.info.name.clone())) {
            return Err(CujError::Stale(format!("{} at {:?}", node.info.name, node.path)));
        }
        state.performed.push((node.path.clone(), action));
        Ok(())
    }
}

#[async_trait]
impl InputSink for FakeDevice {
    async fn mouse_move(&self, to: Point) -> Result<()> {
        self.state().inputs.push(InputRecord::MouseMove(to));
        Ok(())
    }

    async fn mouse_button(&self, button: MouseButton, pressed: bool) -> Result<()> {
        let mut state = self.state();
        state.inputs.push(InputRecord::MouseButton(button, pressed));
        if pressed {
            state.buttons.insert(button);
        } else {
            state.buttons.remove(&button);
        }
        Ok(())
    }

    async fn touch(&self, surface: Surface, contacts: &[Point]) -> Result<()> {
        self.state()
            .inputs
            .push(InputRecord::Touch(surface, contacts.to_vec()));
        Ok(())
    }

    async fn key(&self, key: KeyCode, pressed: bool) -> Result<()> {
        let mut state = self.state();
        let held = state.keys.iter().copied().collect();
        state.inputs.push(InputRecord::Key { key, pressed, held });
        if pressed {
            state.keys.insert(key);
        } else {
            state.keys.remove(&key);
        }
        Ok(())
    }
}

#[async_trait]
impl PowerControl for FakeDevice {
    async fn turn_on_display(&self) -> Result<()> {
        Ok(())
    }

    async fn battery_count(&self) -> Result<usize> {
        Ok(self.state().battery.count)
    }

    async fn charge_percent(&self) -> Result<f64> {
        let state = self.state();
        if state.battery.count == 0 {
            return Err(CujError::Unsupported("no battery".into()));
        }
        Ok(state.battery.percent)
    }

    async fn set_discharge(&self, discharge: bool) -> Result<()> {
        let mut state = self.state();
        if discharge {
            state.battery.starts += 1;
        } else {
            state.battery.stops += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl ScreenCapture for FakeDevice {
    async fn start(&self) -> Result<()> {
        let mut state = self.state();
        if state.recording {
            return Err(CujError::failed("recording already in progress"));
        }
        state.recording = true;
        Ok(())
    }

    async fn stop(&self) -> Result<Vec<u8>> {
        let mut state = self.state();
        if !std::mem::replace(&mut state.recording, false) {
            return Err(CujError::failed("no recording in progress"));
        }
        Ok(b"\x1aE\xdf\xa3fake-webm".to_vec())
    }
}

#[async_trait]
impl Tracker for FakeDevice {
    fn name(&self) -> &str {
        "fake"
    }

    async fn start(&self) -> Result<()> {
        self.state().tracking += 1;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.state();
        if state.tracking == 0 {
            return Err(CujError::failed("tracker stopped without a start"));
        }
        state.tracking -= 1;
        state.tracked_windows += 1;
        Ok(())
    }

    fn records(&self) -> Vec<ResultRecord> {
        vec![ResultRecord::summary(
            format!("{TRACKER_PREFIX}Fake.Windows"),
            "count",
            Direction::BiggerIsBetter,
            self.tracked_windows() as f64,
        )]
    }
}

type Script = dyn Fn(&str, bool) -> Result<Value> + Send + Sync;

/// [`Channel`] whose evaluations are answered by a closure of
/// `(expression, await_promise)`.
pub struct ScriptedChannel {
    script: Box<Script>,
}

impl ScriptedChannel {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&str, bool) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
        }
    }
}

#[async_trait]
impl Channel for ScriptedChannel {
    fn label(&self) -> &str {
        "scripted"
    }

    async fn exec(&self, _script: &str) -> Result<String> {
        Ok(json!({ "ok": null }).to_string())
    }

    async fn evaluate_value(&self, expression: &str, await_promise: bool) -> Result<Value> {
        (self.script)(expression, await_promise)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn samples_accumulate_into_unit_buckets() {
        let device = FakeDevice::new();
        device.push_sample("A.X", 42);
        device.push_sample("A.X", 42);
        device.push_sample("A.X", 10);
        let snapshot = device.fetch("A.X").await.unwrap();
        assert_eq!(snapshot.total(), 3);
        assert_eq!(snapshot.sum, 94);
        assert_eq!(snapshot.buckets[1], Bucket::new(42, 43, 2));
    }

    #[tokio::test]
    async fn events_only_reach_matching_watches() {
        let device = FakeDevice::new();
        let alerts = device.watch(EventKind::Alert).await.unwrap();
        let moves = device.watch(EventKind::LocationChanged).await.unwrap();
        device.emit_event(EventKind::Alert, NodeInfo::default());
        assert_eq!(device.drain(alerts).await.unwrap().len(), 1);
        assert!(device.drain(alerts).await.unwrap().is_empty());
        assert!(device.drain(moves).await.unwrap().is_empty());
        device.unwatch(alerts).await.unwrap();
        assert_eq!(device.active_watches(), 1);
    }
}
