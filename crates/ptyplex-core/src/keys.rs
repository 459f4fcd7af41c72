//! Logical key names to terminal byte sequences.
//!
//! Names are matched case-insensitively. A single character is sent as
//! itself, and any other unrecognised token is sent literally so callers
//! can answer numbered menus with `"2"` or `"12"`. The empty token is
//! not a key.

use std::borrow::Cow;

/// A logical key understood by [`translate_key`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    Enter,
    Escape,
    Tab,
    BackTab,
    Backspace,
    Delete,
    Space,
    Up,
    Down,
    Left,
    Right,
    Home,
    End,
    PageUp,
    PageDown,
    /// Control chord with a lowercase ASCII letter.
    Ctrl(u8),
    /// Anything else, written verbatim.
    Literal(String),
}

impl Key {
    /// Parse a key token. Returns `None` for an empty token.
    pub fn parse(token: &str) -> Option<Self> {
        let mut chars = token.chars();
        match (chars.next(), chars.next()) {
            (None, _) => return None,
            (Some(c), None) => return Some(Key::Literal(c.to_string())),
            _ => {}
        }

        let lower = token.to_ascii_lowercase();
        let key = match lower.as_str() {
            "enter" | "return" => Key::Enter,
            "escape" | "esc" => Key::Escape,
            "tab" => Key::Tab,
            "shift+tab" | "backtab" => Key::BackTab,
            "backspace" => Key::Backspace,
            "delete" | "del" => Key::Delete,
            "space" => Key::Space,
            "up" | "arrow-up" | "arrowup" => Key::Up,
            "down" | "arrow-down" | "arrowdown" => Key::Down,
            "left" | "arrow-left" | "arrowleft" => Key::Left,
            "right" | "arrow-right" | "arrowright" => Key::Right,
            "home" => Key::Home,
            "end" => Key::End,
            "page-up" | "pageup" => Key::PageUp,
            "page-down" | "pagedown" => Key::PageDown,
            _ => match ctrl_letter(&lower) {
                Some(letter) => Key::Ctrl(letter),
                None => Key::Literal(token.to_string()),
            },
        };
        Some(key)
    }

    /// Bytes written to the PTY for this key.
    pub fn bytes(&self) -> Cow<'_, [u8]> {
        let fixed: &'static [u8] = match self {
            Key::Enter => b"\r",
            Key::Escape => b"\x1b",
            Key::Tab => b"\t",
            Key::BackTab => b"\x1b[Z",
            Key::Backspace => b"\x7f",
            Key::Delete => b"\x1b[3~",
            Key::Space => b" ",
            Key::Up => b"\x1b[A",
            Key::Down => b"\x1b[B",
            Key::Right => b"\x1b[C",
            Key::Left => b"\x1b[D",
            Key::Home => b"\x1b[H",
            Key::End => b"\x1b[F",
            Key::PageUp => b"\x1b[5~",
            Key::PageDown => b"\x1b[6~",
            Key::Ctrl(letter) => return Cow::Owned(vec![letter & 0x1f]),
            Key::Literal(text) => return Cow::Borrowed(text.as_bytes()),
        };
        Cow::Borrowed(fixed)
    }
}

/// Translate a key token straight to bytes.
pub fn translate_key(token: &str) -> Option<Vec<u8>> {
    Key::parse(token).map(|key| key.bytes().into_owned())
}

fn ctrl_letter(lower: &str) -> Option<u8> {
    let rest = lower
        .strip_prefix("ctrl+")
        .or_else(|| lower.strip_prefix("ctrl-"))?;
    match rest.as_bytes() {
        [letter] if letter.is_ascii_lowercase() => Some(*letter),
        _ => None,
    }
}
