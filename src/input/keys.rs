//! Key codes and accelerator parsing.
//!
//! Codes are Linux evdev `KEY_*` values so the same numbers can be written to
//! a uinput/evdev node or forwarded to a remote keyboard API.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CujError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyCode(pub u16);

impl KeyCode {
    pub const ESC: KeyCode = KeyCode(1);
    pub const DIGIT_1: KeyCode = KeyCode(2);
    pub const MINUS: KeyCode = KeyCode(12);
    pub const EQUAL: KeyCode = KeyCode(13);
    pub const BACKSPACE: KeyCode = KeyCode(14);
    pub const TAB: KeyCode = KeyCode(15);
    pub const LEFT_BRACE: KeyCode = KeyCode(26);
    pub const RIGHT_BRACE: KeyCode = KeyCode(27);
    pub const ENTER: KeyCode = KeyCode(28);
    pub const LEFT_CTRL: KeyCode = KeyCode(29);
    pub const SEMICOLON: KeyCode = KeyCode(39);
    pub const APOSTROPHE: KeyCode = KeyCode(40);
    pub const GRAVE: KeyCode = KeyCode(41);
    pub const LEFT_SHIFT: KeyCode = KeyCode(42);
    pub const BACKSLASH: KeyCode = KeyCode(43);
    pub const COMMA: KeyCode = KeyCode(51);
    pub const DOT: KeyCode = KeyCode(52);
    pub const SLASH: KeyCode = KeyCode(53);
    pub const LEFT_ALT: KeyCode = KeyCode(56);
    pub const SPACE: KeyCode = KeyCode(57);
    pub const F1: KeyCode = KeyCode(59);
    pub const HOME: KeyCode = KeyCode(102);
    pub const UP: KeyCode = KeyCode(103);
    pub const PAGE_UP: KeyCode = KeyCode(104);
    pub const LEFT: KeyCode = KeyCode(105);
    pub const RIGHT: KeyCode = KeyCode(106);
    pub const END: KeyCode = KeyCode(107);
    pub const DOWN: KeyCode = KeyCode(108);
    pub const PAGE_DOWN: KeyCode = KeyCode(109);
    pub const DELETE: KeyCode = KeyCode(111);
    pub const LEFT_META: KeyCode = KeyCode(125);

    /// Letter key for `c` (`a`..=`z`, case-insensitive).
    pub fn letter(c: char) -> Option<KeyCode> {
        const ROWS: [(&str, u16); 3] = [("qwertyuiop", 16), ("asdfghjkl", 30), ("zxcvbnm", 44)];
        let lower = c.to_ascii_lowercase();
        ROWS.iter().find_map(|(row, first)| {
            row.find(lower)
                .map(|offset| KeyCode(first + offset as u16))
        })
    }

    /// Number-row key for `d` (`0`..=`9`).
    pub fn digit(d: char) -> Option<KeyCode> {
        match d {
            '1'..='9' => Some(KeyCode(Self::DIGIT_1.0 + (d as u16 - '1' as u16))),
            '0' => Some(KeyCode(11)),
            _ => None,
        }
    }

    pub fn function(n: u8) -> Option<KeyCode> {
        match n {
            1..=10 => Some(KeyCode(Self::F1.0 + u16::from(n) - 1)),
            11 => Some(KeyCode(87)),
            12 => Some(KeyCode(88)),
            _ => None,
        }
    }
}

impl fmt::Display for KeyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key {}", self.0)
    }
}

/// Keys that change the meaning of others while held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modifier {
    Ctrl,
    Shift,
    Alt,
    Search,
}

impl Modifier {
    pub fn key(&self) -> KeyCode {
        match self {
            Modifier::Ctrl => KeyCode::LEFT_CTRL,
            Modifier::Shift => KeyCode::LEFT_SHIFT,
            Modifier::Alt => KeyCode::LEFT_ALT,
            Modifier::Search => KeyCode::LEFT_META,
        }
    }

    pub fn from_key(key: KeyCode) -> Option<Modifier> {
        [Modifier::Ctrl, Modifier::Shift, Modifier::Alt, Modifier::Search]
            .into_iter()
            .find(|modifier| modifier.key() == key)
    }
}

impl FromStr for Modifier {
    type Err = CujError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "ctrl" | "control" => Ok(Modifier::Ctrl),
            "shift" => Ok(Modifier::Shift),
            "alt" => Ok(Modifier::Alt),
            "search" | "launcher" | "meta" => Ok(Modifier::Search),
            other => Err(CujError::Config(format!("unknown modifier {other:?}"))),
        }
    }
}

/// Parsed accelerator such as `Ctrl+Shift+Enter`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accel {
    pub modifiers: Vec<Modifier>,
    pub key: Option<KeyCode>,
}

impl Accel {
    /// Keys in press order: modifiers first, then the main key.
    pub fn keys(&self) -> Vec<KeyCode> {
        self.modifiers
            .iter()
            .map(Modifier::key)
            .chain(self.key)
            .collect()
    }
}

impl FromStr for Accel {
    type Err = CujError;

    fn from_str(raw: &str) -> Result<Self> {
        let mut modifiers = Vec::new();
        let mut key = None;
        for part in raw.split('+').map(str::trim) {
            if part.is_empty() {
                return Err(CujError::Config(format!("empty key in accelerator {raw:?}")));
            }
            if let Ok(modifier) = part.parse::<Modifier>() {
                if !modifiers.contains(&modifier) {
                    modifiers.push(modifier);
                }
                continue;
            }
            if key.is_some() {
                return Err(CujError::Config(format!(
                    "accelerator {raw:?} names more than one non-modifier key"
                )));
            }
            key = Some(named_key(part).ok_or_else(|| {
                CujError::Config(format!("unknown key {part:?} in accelerator {raw:?}"))
            })?);
        }
        Ok(Accel { modifiers, key })
    }
}

fn named_key(name: &str) -> Option<KeyCode> {
    let lower = name.to_ascii_lowercase();
    let key = match lower.as_str() {
        "enter" | "return" => KeyCode::ENTER,
        "tab" => KeyCode::TAB,
        "esc" | "escape" => KeyCode::ESC,
        "space" => KeyCode::SPACE,
        "backspace" => KeyCode::BACKSPACE,
        "delete" => KeyCode::DELETE,
        "up" => KeyCode::UP,
        "down" => KeyCode::DOWN,
        "left" => KeyCode::LEFT,
        "right" => KeyCode::RIGHT,
        "home" => KeyCode::HOME,
        "end" => KeyCode::END,
        "pageup" => KeyCode::PAGE_UP,
        "pagedown" => KeyCode::PAGE_DOWN,
        "-" | "minus" => KeyCode::MINUS,
        "=" | "equal" => KeyCode::EQUAL,
        "[" => KeyCode::LEFT_BRACE,
        "]" => KeyCode::RIGHT_BRACE,
        ";" => KeyCode::SEMICOLON,
        "'" => KeyCode::APOSTROPHE,
        "`" => KeyCode::GRAVE,
        "\\" => KeyCode::BACKSLASH,
        "," | "comma" => KeyCode::COMMA,
        "." | "period" => KeyCode::DOT,
        "/" | "slash" => KeyCode::SLASH,
        _ => {
            let mut chars = lower.chars();
            return match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii_alphabetic() => KeyCode::letter(c),
                (Some(c), None) if c.is_ascii_digit() => KeyCode::digit(c),
                (Some('f'), Some(_)) => lower[1..].parse().ok().and_then(KeyCode::function),
                _ => None,
            };
        }
    };
    Some(key)
}

/// Key plus whether shift must be held to type `c` on a US layout.
pub fn char_key(c: char) -> Option<(KeyCode, bool)> {
    if c.is_ascii_alphabetic() {
        return KeyCode::letter(c).map(|key| (key, c.is_ascii_uppercase()));
    }
    if c.is_ascii_digit() {
        return KeyCode::digit(c).map(|key| (key, false));
    }
    let unshifted = match c {
        ' ' => Some(KeyCode::SPACE),
        '\n' => Some(KeyCode::ENTER),
        '\t' => Some(KeyCode::TAB),
        '-' => Some(KeyCode::MINUS),
        '=' => Some(KeyCode::EQUAL),
        '[' => Some(KeyCode::LEFT_BRACE),
        ']' => Some(KeyCode::RIGHT_BRACE),
        ';' => Some(KeyCode::SEMICOLON),
        '\'' => Some(KeyCode::APOSTROPHE),
        '`' => Some(KeyCode::GRAVE),
        '\\' => Some(KeyCode::BACKSLASH),
        ',' => Some(KeyCode::COMMA),
        '.' => Some(KeyCode::DOT),
        '/' => Some(KeyCode::SLASH),
        _ => None,
    };
    if let Some(key) = unshifted {
        return Some((key, false));
    }
    let base = match c {
        '!' => '1',
        '@' => '2',
        '#' => '3',
        '$' => '4',
        '%' => '5',
        '^' => '6',
        '&' => '7',
        '*' => '8',
        '(' => '9',
        ')' => '0',
        '_' => '-',
        '+' => '=',
        '{' => '[',
        '}' => ']',
        ':' => ';',
        '"' => '\'',
        '~' => '`',
        '|' => '\\',
        '<' => ',',
        '>' => '.',
        '?' => '/',
        _ => return None,
    };
    char_key(base).map(|(key, _)| (key, true))
}
