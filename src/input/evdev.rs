//! Writers for Linux evdev nodes (`/dev/input/eventN`).
//!
//! Each writer exclusively owns its file handle. Multi-touch surfaces use
//! protocol B: one slot per finger, tracking id `-1` lifts the finger.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::keys::KeyCode;
use crate::error::{CujError, Result};
use crate::uiauto::Point;

pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_ABS: u16 = 0x03;
pub const SYN_REPORT: u16 = 0x00;

pub const ABS_X: u16 = 0x00;
pub const ABS_Y: u16 = 0x01;
pub const ABS_MT_SLOT: u16 = 0x2f;
pub const ABS_MT_POSITION_X: u16 = 0x35;
pub const ABS_MT_POSITION_Y: u16 = 0x36;
pub const ABS_MT_TRACKING_ID: u16 = 0x39;

pub const BTN_TOOL_FINGER: u16 = 0x145;
pub const BTN_TOUCH: u16 = 0x14a;
pub const BTN_TOOL_DOUBLETAP: u16 = 0x14d;
pub const BTN_TOOL_TRIPLETAP: u16 = 0x14e;
pub const BTN_TOOL_QUADTAP: u16 = 0x14f;

/// Size of `struct input_event` on 64-bit Linux.
pub const EVENT_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

impl InputEvent {
    pub const fn new(kind: u16, code: u16, value: i32) -> Self {
        Self { kind, code, value }
    }

    pub const fn syn() -> Self {
        Self::new(EV_SYN, SYN_REPORT, 0)
    }

    /// Append the wire form; the timestamp is left zero for the kernel to
    /// fill in.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&[0u8; 16]);
        buf.extend_from_slice(&self.kind.to_le_bytes());
        buf.extend_from_slice(&self.code.to_le_bytes());
        buf.extend_from_slice(&self.value.to_le_bytes());
    }
}

pub fn encode(events: &[InputEvent]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(events.len() * EVENT_SIZE);
    for event in events {
        event.encode_into(&mut buf);
    }
    buf
}

pub struct EvdevWriter {
    path: PathBuf,
    file: Mutex<File>,
}

impl EvdevWriter {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|err| {
                CujError::Unsupported(format!("cannot open input device {}: {err}", path.display()))
            })?;
        debug!(path = %path.display(), "opened input device");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `events` followed by a `SYN_REPORT` as one frame.
    pub async fn frame(&self, events: &[InputEvent]) -> Result<()> {
        let mut buf = encode(events);
        InputEvent::syn().encode_into(&mut buf);
        let mut file = self.file.lock().await;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }
}

pub struct EvdevKeyboard {
    writer: EvdevWriter,
}

impl EvdevKeyboard {
    pub fn new(writer: EvdevWriter) -> Self {
        Self { writer }
    }

    pub async fn key(&self, key: KeyCode, pressed: bool) -> Result<()> {
        self.writer
            .frame(&[InputEvent::new(EV_KEY, key.0, i32::from(pressed))])
            .await
    }
}

/// Axis ranges of a touch device and the screen area it maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchGeometry {
    pub max_x: i32,
    pub max_y: i32,
    pub screen_width: i32,
    pub screen_height: i32,
}

impl TouchGeometry {
    pub fn scale(&self, point: Point) -> (i32, i32) {
        let axis = |value: i32, max: i32, extent: i32| -> i32 {
            if extent <= 0 {
                return 0;
            }
            let scaled = i64::from(value) * i64::from(max) / i64::from(extent);
            scaled.clamp(0, i64::from(max)) as i32
        };
        (
            axis(point.x, self.max_x, self.screen_width),
            axis(point.y, self.max_y, self.screen_height),
        )
    }
}

/// Slot bookkeeping for protocol B.
#[derive(Debug, Default)]
pub struct TouchState {
    tracking: Vec<Option<i32>>,
    next_id: i32,
}

impl TouchState {
    pub fn active(&self) -> usize {
        self.tracking.iter().filter(|slot| slot.is_some()).count()
    }

    /// Events moving the device from its current contacts to `contacts`.
    pub fn frame(
        &mut self,
        geometry: &TouchGeometry,
        contacts: &[Point],
        tool_buttons: bool,
    ) -> Vec<InputEvent> {
        let mut events = Vec::new();
        let was_touching = self.active() > 0;
        if self.tracking.len() < contacts.len() {
            self.tracking.resize(contacts.len(), None);
        }
        for (slot, point) in contacts.iter().enumerate() {
            let (x, y) = geometry.scale(*point);
            events.push(InputEvent::new(EV_ABS, ABS_MT_SLOT, slot as i32));
            if self.tracking[slot].is_none() {
                let id = self.next_id;
                self.next_id = self.next_id.wrapping_add(1) & 0xffff;
                self.tracking[slot] = Some(id);
                events.push(InputEvent::new(EV_ABS, ABS_MT_TRACKING_ID, id));
            }
            events.push(InputEvent::new(EV_ABS, ABS_MT_POSITION_X, x));
            events.push(InputEvent::new(EV_ABS, ABS_MT_POSITION_Y, y));
        }
        for slot in contacts.len()..self.tracking.len() {
            if self.tracking[slot].take().is_some() {
                events.push(InputEvent::new(EV_ABS, ABS_MT_SLOT, slot as i32));
                events.push(InputEvent::new(EV_ABS, ABS_MT_TRACKING_ID, -1));
            }
        }
        let touching = !contacts.is_empty();
        if touching != was_touching {
            events.push(InputEvent::new(EV_KEY, BTN_TOUCH, i32::from(touching)));
        }
        if let Some(first) = contacts.first() {
            let (x, y) = geometry.scale(*first);
            events.push(InputEvent::new(EV_ABS, ABS_X, x));
            events.push(InputEvent::new(EV_ABS, ABS_Y, y));
        }
        if tool_buttons {
            for (count, code) in [
                (1, BTN_TOOL_FINGER),
                (2, BTN_TOOL_DOUBLETAP),
                (3, BTN_TOOL_TRIPLETAP),
                (4, BTN_TOOL_QUADTAP),
            ] {
                events.push(InputEvent::new(EV_KEY, code, i32::from(contacts.len() == count)));
            }
        }
        events
    }
}

/// Touchscreen or trackpad behind one evdev node.
pub struct EvdevTouch {
    writer: EvdevWriter,
    geometry: TouchGeometry,
    tool_buttons: bool,
    state: Mutex<TouchState>,
}

impl EvdevTouch {
    pub fn touchscreen(writer: EvdevWriter, geometry: TouchGeometry) -> Self {
        Self {
            writer,
            geometry,
            tool_buttons: false,
            state: Mutex::new(TouchState::default()),
        }
    }

    /// Trackpads also report finger-count tool buttons.
    pub fn trackpad(writer: EvdevWriter, geometry: TouchGeometry) -> Self {
        Self {
            tool_buttons: true,
            ..Self::touchscreen(writer, geometry)
        }
    }

    pub async fn contacts(&self, contacts: &[Point]) -> Result<()> {
        let mut state = self.state.lock().await;
        let events = state.frame(&self.geometry, contacts, self.tool_buttons);
        self.writer.frame(&events).await
    }
}
