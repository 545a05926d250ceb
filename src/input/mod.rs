//! Input injection: raw sinks, pointer variants and the keyboard.

pub mod evdev;
pub mod keyboard;
pub mod keys;
pub mod mouse;
pub mod pointer;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CujError, Result};
use crate::uiauto::Point;

pub use evdev::{EvdevKeyboard, EvdevTouch, EvdevWriter};
pub use keyboard::Keyboard;
pub use keys::{Accel, KeyCode, Modifier};
pub use mouse::ChannelMouse;
pub use pointer::{DragStep, Gestures, PointerContext, PointerKind, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Middle,
    Right,
}

impl MouseButton {
    pub fn as_str(&self) -> &'static str {
        match self {
            MouseButton::Left => "Left",
            MouseButton::Middle => "Middle",
            MouseButton::Right => "Right",
        }
    }
}

/// Touch-capable surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Surface {
    Screen,
    Trackpad,
}

/// Lowest-level input primitives. Coordinates are screen pixels.
#[async_trait]
pub trait InputSink: Send + Sync {
    async fn mouse_move(&self, to: Point) -> Result<()>;

    async fn mouse_button(&self, button: MouseButton, pressed: bool) -> Result<()>;

    /// Report the full set of fingers on `surface`; an empty slice lifts all.
    async fn touch(&self, surface: Surface, contacts: &[Point]) -> Result<()>;

    async fn key(&self, key: KeyCode, pressed: bool) -> Result<()>;
}

/// Routes each primitive to whichever backend owns that device.
#[derive(Default)]
pub struct DeviceInput {
    mouse: Option<ChannelMouse>,
    keyboard: Option<EvdevKeyboard>,
    touchscreen: Option<EvdevTouch>,
    trackpad: Option<EvdevTouch>,
}

impl DeviceInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mouse(mut self, mouse: ChannelMouse) -> Self {
        self.mouse = Some(mouse);
        self
    }

    pub fn with_keyboard(mut self, keyboard: EvdevKeyboard) -> Self {
        self.keyboard = Some(keyboard);
        self
    }

    pub fn with_touchscreen(mut self, touchscreen: EvdevTouch) -> Self {
        self.touchscreen = Some(touchscreen);
        self
    }

    pub fn with_trackpad(mut self, trackpad: EvdevTouch) -> Self {
        self.trackpad = Some(trackpad);
        self
    }

    fn missing(device: &str) -> CujError {
        CujError::Unsupported(format!("no {device} attached"))
    }
}

#[async_trait]
impl InputSink for DeviceInput {
    async fn mouse_move(&self, to: Point) -> Result<()> {
        match &self.mouse {
            Some(mouse) => mouse.move_to(to).await,
            None => Err(Self::missing("mouse")),
        }
    }

    async fn mouse_button(&self, button: MouseButton, pressed: bool) -> Result<()> {
        match &self.mouse {
            Some(mouse) => mouse.button(button, pressed).await,
            None => Err(Self::missing("mouse")),
        }
    }

    async fn touch(&self, surface: Surface, contacts: &[Point]) -> Result<()> {
        let device = match surface {
            Surface::Screen => self.touchscreen.as_ref().ok_or_else(|| Self::missing("touchscreen"))?,
            Surface::Trackpad => self.trackpad.as_ref().ok_or_else(|| Self::missing("trackpad"))?,
        };
        device.contacts(contacts).await
    }

    async fn key(&self, key: KeyCode, pressed: bool) -> Result<()> {
        match &self.keyboard {
            Some(keyboard) => keyboard.key(key, pressed).await,
            None => Err(Self::missing("keyboard")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn missing_devices_are_unsupported() {
        let input = DeviceInput::new();
        let err = input.key(KeyCode::ENTER, true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert!(err.to_string().contains("keyboard"));
        let err = input.touch(Surface::Trackpad, &[]).await.unwrap_err();
        assert!(err.to_string().contains("trackpad"));
    }
}
