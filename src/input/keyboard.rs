use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use super::InputSink;
use super::keys::{Accel, KeyCode, Modifier, char_key};
use crate::action::Action;
use crate::ctx::Ctx;
use crate::error::{CujError, Result};

/// Keyboard on top of an [`InputSink`], tracking which keys it holds.
#[derive(Clone)]
pub struct Keyboard {
    sink: Arc<dyn InputSink>,
    held: Arc<Mutex<BTreeSet<KeyCode>>>,
}

impl Keyboard {
    pub fn new(sink: Arc<dyn InputSink>) -> Self {
        Self {
            sink,
            held: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Keys currently held down by this keyboard.
    pub fn held(&self) -> Vec<KeyCode> {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    async fn set(&self, key: KeyCode, pressed: bool) -> Result<()> {
        self.sink.key(key, pressed).await?;
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if pressed {
            held.insert(key);
        } else {
            held.remove(&key);
        }
        Ok(())
    }

    pub async fn press(&self, ctx: &Ctx, modifier: Modifier) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(CujError::Cancelled);
        }
        self.set(modifier.key(), true).await
    }

    /// Release never consults the context, so it also runs during teardown.
    pub async fn release(&self, _ctx: &Ctx, modifier: Modifier) -> Result<()> {
        self.set(modifier.key(), false).await
    }

    /// Press the keys of `combo` in order without releasing them.
    pub async fn accel_press(&self, ctx: &Ctx, combo: &str) -> Result<()> {
        let accel: Accel = combo.parse()?;
        for key in accel.keys() {
            if ctx.is_cancelled() {
                return Err(CujError::Cancelled);
            }
            self.set(key, true).await?;
        }
        Ok(())
    }

    /// Release the keys of `combo` in reverse order.
    pub async fn accel_release(&self, _ctx: &Ctx, combo: &str) -> Result<()> {
        let accel: Accel = combo.parse()?;
        let mut first_error = None;
        for key in accel.keys().into_iter().rev() {
            if let Err(err) = self.set(key, false).await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Press and release `combo`; e.g. `Ctrl+Shift+Enter`, `Alt+Tab`.
    pub async fn accel(&self, ctx: &Ctx, combo: &str) -> Result<()> {
        debug!(combo, "accelerator");
        let pressed = self.accel_press(ctx, combo).await;
        let released = self.accel_release(ctx, combo).await;
        pressed.and(released)
    }

    /// Type `text` key by key, holding shift where needed.
    pub async fn type_text(&self, ctx: &Ctx, text: &str) -> Result<()> {
        let strokes = text
            .chars()
            .map(|c| {
                char_key(c).ok_or_else(|| CujError::Unsupported(format!("cannot type {c:?}")))
            })
            .collect::<Result<Vec<_>>>()?;
        for (key, shift) in strokes {
            if ctx.is_cancelled() {
                return Err(CujError::Cancelled);
            }
            if shift {
                self.set(KeyCode::LEFT_SHIFT, true).await?;
            }
            let typed = async {
                self.set(key, true).await?;
                self.set(key, false).await
            }
            .await;
            if shift {
                self.set(KeyCode::LEFT_SHIFT, false).await?;
            }
            typed?;
        }
        Ok(())
    }

    /// Release everything still held.
    pub async fn release_all(&self) -> Result<()> {
        let mut first_error = None;
        for key in self.held().into_iter().rev() {
            if let Err(err) = self.set(key, false).await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn accel_action(&self, combo: impl Into<String>) -> Action {
        let keyboard = self.clone();
        let combo: Arc<str> = Arc::from(combo.into());
        let name = format!("press {combo}");
        Action::new(move |ctx| {
            let keyboard = keyboard.clone();
            let combo = combo.clone();
            async move { keyboard.accel(&ctx, &combo).await }
        })
        .named(name)
    }

    pub fn type_action(&self, text: impl Into<String>) -> Action {
        let keyboard = self.clone();
        let text: Arc<str> = Arc::from(text.into());
        Action::new(move |ctx| {
            let keyboard = keyboard.clone();
            let text = text.clone();
            async move { keyboard.type_text(&ctx, &text).await }
        })
    }

    /// Press `combo` `times` times.
    pub fn repeat_accel(&self, combo: impl Into<String>, times: usize) -> Action {
        let keyboard = self.clone();
        let combo: Arc<str> = Arc::from(combo.into());
        Action::new(move |ctx| {
            let keyboard = keyboard.clone();
            let combo = combo.clone();
            async move {
                for _ in 0..times {
                    keyboard.accel(&ctx, &combo).await?;
                }
                Ok(())
            }
        })
    }

    /// Hold `modifier` while `action` runs. The modifier is released on
    /// every exit path; an action failure wins over a release failure.
    pub fn with_modifier(&self, modifier: Modifier, action: Action) -> Action {
        let keyboard = self.clone();
        Action::new(move |ctx| {
            let keyboard = keyboard.clone();
            let action = action.clone();
            async move {
                keyboard.press(&ctx, modifier).await?;
                let outcome = action.run(&ctx).await;
                let released = keyboard.release(&ctx, modifier).await;
                if let (Err(_), Err(release_err)) = (&outcome, &released) {
                    warn!(?modifier, error = %release_err, "modifier release failed after action failure");
                }
                outcome.and(released)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action;
    use crate::fake::{FakeDevice, InputRecord};

    #[tokio::test]
    async fn modifier_is_released_when_action_fails() {
        let device = FakeDevice::new();
        let keyboard = Keyboard::new(device.clone());
        let ctx = Ctx::new();
        let err = keyboard
            .with_modifier(Modifier::Alt, action::fail("boom"))
            .run(&ctx)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(keyboard.held().is_empty());

        keyboard.accel(&ctx, "a").await.unwrap();
        let log = device.input_log();
        let Some(InputRecord::Key { key, held, .. }) = log.last() else {
            panic!("expected a key record, got {log:?}");
        };
        assert_eq!(*key, KeyCode::letter('a').unwrap());
        assert!(!held.contains(&KeyCode::LEFT_ALT));
    }

    #[tokio::test]
    async fn keyboard_keeps_working_after_a_panicking_holder() {
        let device = FakeDevice::new();
        let keyboard = Keyboard::new(device.clone());
        let held = keyboard.held.clone();
        let _ = std::thread::spawn(move || {
            let _guard = held.lock().unwrap();
            panic!("input helper crashed");
        })
        .join();
        assert!(keyboard.held.is_poisoned());

        keyboard.accel(&Ctx::new(), "a").await.unwrap();
        assert!(keyboard.held().is_empty());
        assert_eq!(device.input_log().len(), 2);
    }

    #[tokio::test]
    async fn modifier_wraps_successful_action() {
        let device = FakeDevice::new();
        let keyboard = Keyboard::new(device.clone());
        let ctx = Ctx::new();
        let inner = keyboard.accel_action("Tab");
        keyboard
            .with_modifier(Modifier::Alt, inner)
            .run(&ctx)
            .await
            .unwrap();
        let keys: Vec<(KeyCode, bool)> = device
            .input_log()
            .into_iter()
            .filter_map(|record| match record {
                InputRecord::Key { key, pressed, .. } => Some((key, pressed)),
                _ => None,
            })
            .collect();
        assert_eq!(
            keys,
            vec![
                (KeyCode::LEFT_ALT, true),
                (KeyCode::TAB, true),
                (KeyCode::TAB, false),
                (KeyCode::LEFT_ALT, false),
            ]
        );
    }

    #[tokio::test]
    async fn accel_releases_in_reverse_order() {
        let device = FakeDevice::new();
        let keyboard = Keyboard::new(device.clone());
        keyboard.accel(&Ctx::new(), "Ctrl+Shift+t").await.unwrap();
        let releases: Vec<KeyCode> = device
            .input_log()
            .into_iter()
            .filter_map(|record| match record {
                InputRecord::Key { key, pressed: false, .. } => Some(key),
                _ => None,
            })
            .collect();
        assert_eq!(
            releases,
            vec![KeyCode::letter('t').unwrap(), KeyCode::LEFT_SHIFT, KeyCode::LEFT_CTRL]
        );
        assert!(device.held_keys().is_empty());
    }

    #[tokio::test]
    async fn type_text_holds_shift_for_capitals() {
        let device = FakeDevice::new();
        let keyboard = Keyboard::new(device.clone());
        keyboard.type_text(&Ctx::new(), "Hi!").await.unwrap();
        let presses: Vec<(KeyCode, Vec<KeyCode>)> = device
            .input_log()
            .into_iter()
            .filter_map(|record| match record {
                InputRecord::Key { key, pressed: true, held } if key != KeyCode::LEFT_SHIFT => {
                    Some((key, held))
                }
                _ => None,
            })
            .collect();
        assert_eq!(presses.len(), 3);
        assert!(presses[0].1.contains(&KeyCode::LEFT_SHIFT));
        assert!(!presses[1].1.contains(&KeyCode::LEFT_SHIFT));
        assert!(presses[2].1.contains(&KeyCode::LEFT_SHIFT));
        assert!(keyboard.held().is_empty());
    }

    #[tokio::test]
    async fn untypeable_text_fails_before_any_key() {
        let device = FakeDevice::new();
        let keyboard = Keyboard::new(device.clone());
        let err = keyboard.type_text(&Ctx::new(), "ok→").await.unwrap_err();
        assert!(matches!(err, CujError::Unsupported(_)));
        assert!(device.input_log().is_empty());
    }

    #[tokio::test]
    async fn repeat_accel_presses_n_times() {
        let device = FakeDevice::new();
        let keyboard = Keyboard::new(device.clone());
        keyboard
            .repeat_accel("Down", 3)
            .run(&Ctx::new())
            .await
            .unwrap();
        assert_eq!(device.input_log().len(), 6);
    }
}
