//! Pointer variants behind one gesture grammar.
//!
//! [`PointerContext`] is built once per scenario from a [`PointerKind`];
//! every action it hands out works the same on mouse, touchscreen and
//! trackpad. A press made by a composite gesture is released on every exit
//! path, including failure and cancellation.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::{InputSink, MouseButton, Surface};
use crate::action::{self, Action};
use crate::ctx::Ctx;
use crate::error::Result;
use crate::uiauto::{Finder, Point, UiContext};

/// Interpolation step for timed moves.
pub const FRAME: Duration = Duration::from_millis(16);
pub const DOUBLE_CLICK_GAP: Duration = Duration::from_millis(100);
pub const LONG_PRESS: Duration = Duration::from_secs(1);
/// Resting position of the finger used for trackpad clicks.
const TRACKPAD_TAP: Point = Point::new(500, 500);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PointerKind {
    #[default]
    Mouse,
    Touch,
    Trackpad,
}

/// Where a gesture goes: a fixed point or the centre of a located node.
#[derive(Debug, Clone)]
pub enum Target {
    Point(Point),
    Node(Finder),
}

impl From<Point> for Target {
    fn from(point: Point) -> Self {
        Target::Point(point)
    }
}

impl From<Finder> for Target {
    fn from(finder: Finder) -> Self {
        Target::Node(finder)
    }
}

#[derive(Debug, Clone)]
pub struct DragStep {
    pub target: Target,
    pub duration: Duration,
}

impl DragStep {
    pub fn new(target: impl Into<Target>, duration: Duration) -> Self {
        Self {
            target: target.into(),
            duration,
        }
    }
}

/// Primitive capability each variant implements.
#[async_trait]
trait PointerDevice: Send + Sync {
    fn kind(&self) -> PointerKind;

    fn position(&self) -> Point;

    /// Instant move.
    async fn warp(&self, to: Point) -> Result<()>;

    async fn press(&self, button: MouseButton) -> Result<()>;

    async fn release(&self, button: MouseButton) -> Result<()>;

    async fn secondary_click(&self, _ctx: &Ctx) -> Result<()> {
        self.press(MouseButton::Right).await?;
        self.release(MouseButton::Right).await
    }
}

struct MousePointer {
    sink: Arc<dyn InputSink>,
    position: Mutex<Point>,
}

#[async_trait]
impl PointerDevice for MousePointer {
    fn kind(&self) -> PointerKind {
        PointerKind::Mouse
    }

    fn position(&self) -> Point {
        *self.position.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn warp(&self, to: Point) -> Result<()> {
        self.sink.mouse_move(to).await?;
        *self.position.lock().unwrap_or_else(PoisonError::into_inner) = to;
        Ok(())
    }

    async fn press(&self, button: MouseButton) -> Result<()> {
        self.sink.mouse_button(button, true).await
    }

    async fn release(&self, button: MouseButton) -> Result<()> {
        self.sink.mouse_button(button, false).await
    }
}

/// Single finger on the touchscreen; the button is ignored.
struct TouchPointer {
    sink: Arc<dyn InputSink>,
    state: Mutex<(Point, bool)>,
}

impl TouchPointer {
    fn set(&self, position: Point, down: bool) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = (position, down);
    }

    fn down(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).1
    }
}

#[async_trait]
impl PointerDevice for TouchPointer {
    fn kind(&self) -> PointerKind {
        PointerKind::Touch
    }

    fn position(&self) -> Point {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).0
    }

    async fn warp(&self, to: Point) -> Result<()> {
        let down = self.down();
        if down {
            self.sink.touch(Surface::Screen, &[to]).await?;
        }
        self.set(to, down);
        Ok(())
    }

    async fn press(&self, _button: MouseButton) -> Result<()> {
        let at = self.position();
        self.sink.touch(Surface::Screen, &[at]).await?;
        self.set(at, true);
        Ok(())
    }

    async fn release(&self, _button: MouseButton) -> Result<()> {
        let at = self.position();
        self.set(at, false);
        self.sink.touch(Surface::Screen, &[]).await
    }

    async fn secondary_click(&self, ctx: &Ctx) -> Result<()> {
        self.press(MouseButton::Left).await?;
        let held = ctx.sleep(LONG_PRESS).await;
        let released = self.release(MouseButton::Left).await;
        held.and(released)
    }
}

/// Cursor positioned through the mouse path, clicks made by resting a
/// finger on the trackpad.
struct TrackpadPointer {
    sink: Arc<dyn InputSink>,
    position: Mutex<Point>,
}

#[async_trait]
impl PointerDevice for TrackpadPointer {
    fn kind(&self) -> PointerKind {
        PointerKind::Trackpad
    }

    fn position(&self) -> Point {
        *self.position.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn warp(&self, to: Point) -> Result<()> {
        self.sink.mouse_move(to).await?;
        *self.position.lock().unwrap_or_else(PoisonError::into_inner) = to;
        Ok(())
    }

    async fn press(&self, _button: MouseButton) -> Result<()> {
        self.sink.touch(Surface::Trackpad, &[TRACKPAD_TAP]).await
    }

    async fn release(&self, _button: MouseButton) -> Result<()> {
        self.sink.touch(Surface::Trackpad, &[]).await
    }

    async fn secondary_click(&self, _ctx: &Ctx) -> Result<()> {
        self.sink
            .touch(Surface::Trackpad, &[TRACKPAD_TAP, TRACKPAD_TAP.offset(120, 0)])
            .await?;
        self.sink.touch(Surface::Trackpad, &[]).await
    }
}

fn device(kind: PointerKind, sink: Arc<dyn InputSink>) -> Arc<dyn PointerDevice> {
    match kind {
        PointerKind::Mouse => Arc::new(MousePointer {
            sink,
            position: Mutex::new(Point::default()),
        }),
        PointerKind::Touch => Arc::new(TouchPointer {
            sink,
            state: Mutex::new((Point::default(), false)),
        }),
        PointerKind::Trackpad => Arc::new(TrackpadPointer {
            sink,
            position: Mutex::new(Point::default()),
        }),
    }
}

async fn glide(device: &dyn PointerDevice, ctx: &Ctx, to: Point, duration: Duration) -> Result<()> {
    if duration.is_zero() {
        return device.warp(to).await;
    }
    let from = device.position();
    let steps = (duration.as_millis() / FRAME.as_millis()).max(1) as u32;
    let pause = duration / steps;
    for step in 1..=steps {
        ctx.sleep(pause).await?;
        device
            .warp(from.lerp(to, f64::from(step) / f64::from(steps)))
            .await?;
    }
    Ok(())
}

#[derive(Clone)]
pub struct PointerContext {
    device: Arc<dyn PointerDevice>,
    ui: UiContext,
}

impl PointerContext {
    pub fn new(kind: PointerKind, sink: Arc<dyn InputSink>, ui: UiContext) -> Self {
        Self {
            device: device(kind, sink),
            ui,
        }
    }

    pub fn kind(&self) -> PointerKind {
        self.device.kind()
    }

    async fn resolve(&self, ctx: &Ctx, target: &Target) -> Result<Point> {
        match target {
            Target::Point(point) => Ok(*point),
            Target::Node(finder) => Ok(self.ui.location(ctx, finder).await?.center()),
        }
    }

    fn gesture<F>(&self, body: F) -> Action
    where
        F: for<'a> Fn(&'a PointerContext, &'a Ctx) -> futures_util::future::BoxFuture<'a, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        let pointer = self.clone();
        let body = Arc::new(body);
        Action::new(move |ctx| {
            let pointer = pointer.clone();
            let body = body.clone();
            async move { body(&pointer, &ctx).await }
        })
    }

    async fn tap(&self, ctx: &Ctx, at: Point, button: MouseButton) -> Result<()> {
        glide(self.device.as_ref(), ctx, at, Duration::ZERO).await?;
        self.device.press(button).await?;
        self.device.release(button).await
    }

    pub fn click_at(&self, point: Point) -> Action {
        self.click(point)
    }

    /// Tap or left-click the centre of `target`.
    pub fn click(&self, target: impl Into<Target>) -> Action {
        let target = target.into();
        self.gesture(move |pointer, ctx| {
            let target = target.clone();
            Box::pin(async move {
                let at = pointer.resolve(ctx, &target).await?;
                pointer.tap(ctx, at, MouseButton::Left).await
            })
        })
    }

    pub fn double_click(&self, target: impl Into<Target>) -> Action {
        let target = target.into();
        self.gesture(move |pointer, ctx| {
            let target = target.clone();
            Box::pin(async move {
                let at = pointer.resolve(ctx, &target).await?;
                pointer.tap(ctx, at, MouseButton::Left).await?;
                ctx.sleep(DOUBLE_CLICK_GAP).await?;
                pointer.tap(ctx, at, MouseButton::Left).await
            })
        })
    }

    /// Right-click, long-press or two-finger tap depending on the variant.
    pub fn right_click(&self, target: impl Into<Target>) -> Action {
        let target = target.into();
        self.gesture(move |pointer, ctx| {
            let target = target.clone();
            Box::pin(async move {
                let at = pointer.resolve(ctx, &target).await?;
                glide(pointer.device.as_ref(), ctx, at, Duration::ZERO).await?;
                pointer.device.secondary_click(ctx).await
            })
        })
    }

    /// Press at the current position. The caller owns the release.
    pub fn press(&self, button: MouseButton) -> Action {
        self.gesture(move |pointer, _ctx| Box::pin(pointer.device.press(button)))
    }

    pub fn release(&self, button: MouseButton) -> Action {
        self.gesture(move |pointer, _ctx| Box::pin(pointer.device.release(button)))
    }

    /// Move to `target` over `duration`; a zero duration is a single jump.
    pub fn move_to(&self, target: impl Into<Target>, duration: Duration) -> Action {
        let target = target.into();
        self.gesture(move |pointer, ctx| {
            let target = target.clone();
            Box::pin(async move {
                let to = pointer.resolve(ctx, &target).await?;
                glide(pointer.device.as_ref(), ctx, to, duration).await
            })
        })
    }

    /// Press at `start`, move through `steps`, release.
    pub fn drag(&self, start: impl Into<Target>, steps: Vec<DragStep>) -> Action {
        let start = start.into();
        let steps: Arc<[DragStep]> = steps.into();
        self.gesture(move |pointer, ctx| {
            let start = start.clone();
            let steps = steps.clone();
            Box::pin(async move {
                let from = pointer.resolve(ctx, &start).await?;
                glide(pointer.device.as_ref(), ctx, from, Duration::ZERO).await?;
                pointer.device.press(MouseButton::Left).await?;
                let moved = async {
                    for step in steps.iter() {
                        let to = pointer.resolve(ctx, &step.target).await?;
                        glide(pointer.device.as_ref(), ctx, to, step.duration).await?;
                    }
                    Ok(())
                }
                .await;
                let released = pointer.device.release(MouseButton::Left).await;
                moved.and(released)
            })
        })
    }

    pub fn long_press(&self, target: impl Into<Target>, duration: Duration) -> Action {
        let target = target.into();
        self.gesture(move |pointer, ctx| {
            let target = target.clone();
            Box::pin(async move {
                let at = pointer.resolve(ctx, &target).await?;
                glide(pointer.device.as_ref(), ctx, at, Duration::ZERO).await?;
                pointer.device.press(MouseButton::Left).await?;
                let held = ctx.sleep(duration).await;
                let released = pointer.device.release(MouseButton::Left).await;
                held.and(released)
            })
        })
    }

    /// Click `target` until `condition` holds.
    pub fn click_until(&self, target: impl Into<Target>, condition: Action) -> Action {
        let click = self.click(target);
        Action::new(move |ctx| {
            let attempt = action::retry_until(click.clone(), condition.clone(), ctx.poll());
            async move { attempt.run(&ctx).await }
        })
    }
}

/// Multi-finger gestures on a touch surface.
#[derive(Clone)]
pub struct Gestures {
    sink: Arc<dyn InputSink>,
    surface: Surface,
}

impl Gestures {
    pub fn new(sink: Arc<dyn InputSink>, surface: Surface) -> Self {
        Self { sink, surface }
    }

    /// Slide `fingers` contacts, `spacing` pixels apart horizontally, from
    /// `start` to `end` over `duration`.
    pub fn swipe(
        &self,
        start: Point,
        end: Point,
        spacing: i32,
        fingers: usize,
        duration: Duration,
    ) -> Action {
        let gestures = self.clone();
        Action::new(move |ctx| {
            let gestures = gestures.clone();
            async move { gestures.swipe_once(&ctx, start, end, spacing, fingers, duration).await }
        })
    }

    async fn swipe_once(
        &self,
        ctx: &Ctx,
        start: Point,
        end: Point,
        spacing: i32,
        fingers: usize,
        duration: Duration,
    ) -> Result<()> {
        let contacts = |at: Point| -> Vec<Point> {
            (0..fingers.max(1))
                .map(|finger| at.offset(spacing * finger as i32, 0))
                .collect()
        };
        self.sink.touch(self.surface, &contacts(start)).await?;
        let moved = async {
            let steps = (duration.as_millis() / FRAME.as_millis()).max(1) as u32;
            let pause = duration / steps;
            for step in 1..=steps {
                ctx.sleep(pause).await?;
                let at = start.lerp(end, f64::from(step) / f64::from(steps));
                self.sink.touch(self.surface, &contacts(at)).await?;
            }
            Ok(())
        }
        .await;
        let lifted = self.sink.touch(self.surface, &[]).await;
        moved.and(lifted)
    }

    /// Two-finger scrolls from `start` to `end`, each taking `interval`,
    /// until `total` has elapsed. At least one scroll is made.
    pub fn repeat_scroll(&self, start: Point, end: Point, interval: Duration, total: Duration) -> Action {
        let gestures = self.clone();
        Action::new(move |ctx| {
            let gestures = gestures.clone();
            async move {
                let started = Instant::now();
                loop {
                    gestures.swipe_once(&ctx, start, end, 60, 2, interval).await?;
                    if started.elapsed() >= total {
                        return Ok(());
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeDevice, InputRecord};
    use crate::uiauto::{NodeInfo, Rect, Role, finder};

    fn pointer(kind: PointerKind) -> (Arc<FakeDevice>, PointerContext) {
        let device = FakeDevice::new();
        let pointer = PointerContext::new(kind, device.clone(), UiContext::new(device.clone()));
        (device, pointer)
    }

    #[tokio::test]
    async fn mouse_click_is_move_press_release() {
        let (device, pointer) = pointer(PointerKind::Mouse);
        pointer.click_at(Point::new(5, 6)).run(&Ctx::new()).await.unwrap();
        assert_eq!(
            device.input_log(),
            vec![
                InputRecord::MouseMove(Point::new(5, 6)),
                InputRecord::MouseButton(MouseButton::Left, true),
                InputRecord::MouseButton(MouseButton::Left, false),
            ]
        );
    }

    #[tokio::test]
    async fn zero_duration_move_is_a_single_jump() {
        let (device, pointer) = pointer(PointerKind::Mouse);
        pointer
            .move_to(Point::new(100, 100), Duration::ZERO)
            .run(&Ctx::new())
            .await
            .unwrap();
        assert_eq!(device.input_log(), vec![InputRecord::MouseMove(Point::new(100, 100))]);
    }

    #[tokio::test]
    async fn timed_move_interpolates_to_target() {
        let (device, pointer) = pointer(PointerKind::Mouse);
        pointer
            .move_to(Point::new(64, 0), FRAME * 4)
            .run(&Ctx::new())
            .await
            .unwrap();
        let log = device.input_log();
        assert_eq!(log.len(), 4);
        assert_eq!(log[0], InputRecord::MouseMove(Point::new(16, 0)));
        assert_eq!(log[3], InputRecord::MouseMove(Point::new(64, 0)));
    }

    #[tokio::test]
    async fn drag_releases_when_a_waypoint_is_missing() {
        let (device, pointer) = pointer(PointerKind::Mouse);
        let ctx = Ctx::new().with_poll(crate::ctx::PollOptions::new(
            Duration::from_millis(1),
            Duration::from_millis(10),
        ));
        let err = pointer
            .drag(
                Point::new(0, 0),
                vec![
                    DragStep::new(Point::new(10, 0), Duration::ZERO),
                    DragStep::new(finder::name("nowhere"), Duration::ZERO),
                ],
            )
            .run(&ctx)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(device.held_buttons().is_empty());
        assert_eq!(
            device.input_log().last(),
            Some(&InputRecord::MouseButton(MouseButton::Left, false))
        );
    }

    #[tokio::test]
    async fn long_press_releases_on_cancellation() {
        let (device, pointer) = pointer(PointerKind::Touch);
        let ctx = Ctx::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            canceller.cancel();
        });
        let err = pointer
            .long_press(Point::new(1, 1), Duration::from_secs(10))
            .run(&ctx)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(
            device.input_log().last(),
            Some(&InputRecord::Touch(Surface::Screen, vec![]))
        );
    }

    #[tokio::test]
    async fn touch_click_targets_node_centre() {
        let (device, pointer) = pointer(PointerKind::Touch);
        device.set_tree(NodeInfo::new(Role::Window, "root").with_children(vec![
            NodeInfo::new(Role::Button, "OK").at(Rect::new(10, 20, 30, 40)),
        ]));
        pointer.click(finder::name("OK")).run(&Ctx::new()).await.unwrap();
        assert_eq!(
            device.input_log(),
            vec![
                InputRecord::Touch(Surface::Screen, vec![Point::new(25, 40)]),
                InputRecord::Touch(Surface::Screen, vec![]),
            ]
        );
    }

    #[tokio::test]
    async fn trackpad_click_taps_the_pad() {
        let (device, pointer) = pointer(PointerKind::Trackpad);
        pointer.click_at(Point::new(3, 3)).run(&Ctx::new()).await.unwrap();
        let log = device.input_log();
        assert_eq!(log[0], InputRecord::MouseMove(Point::new(3, 3)));
        assert_eq!(log[2], InputRecord::Touch(Surface::Trackpad, vec![]));
    }

    #[tokio::test]
    async fn swipe_moves_all_fingers_then_lifts() {
        let device = FakeDevice::new();
        let gestures = Gestures::new(device.clone(), Surface::Trackpad);
        gestures
            .swipe(Point::new(0, 0), Point::new(0, 100), 50, 3, Duration::ZERO)
            .run(&Ctx::new())
            .await
            .unwrap();
        let log = device.input_log();
        assert_eq!(
            log[0],
            InputRecord::Touch(
                Surface::Trackpad,
                vec![Point::new(0, 0), Point::new(50, 0), Point::new(100, 0)]
            )
        );
        assert_eq!(
            log[1],
            InputRecord::Touch(
                Surface::Trackpad,
                vec![Point::new(0, 100), Point::new(50, 100), Point::new(100, 100)]
            )
        );
        assert_eq!(log[2], InputRecord::Touch(Surface::Trackpad, vec![]));
    }

    #[tokio::test]
    async fn click_until_retries_click() {
        let (device, pointer) = pointer(PointerKind::Mouse);
        let probe = device.clone();
        let condition = Action::new(move |_ctx| {
            let probe = probe.clone();
            async move {
                if probe.input_log().len() >= 6 {
                    Ok(())
                } else {
                    Err(crate::error::CujError::failed("menu not open"))
                }
            }
        });
        let ctx = Ctx::new().with_poll(crate::ctx::PollOptions::new(
            Duration::from_millis(1),
            Duration::from_secs(1),
        ));
        pointer
            .click_until(Point::new(1, 1), condition)
            .run(&ctx)
            .await
            .unwrap();
        assert_eq!(device.input_log().len(), 6);
    }
}
