//! Key translation
//!
//! Maps logical keys to the bytes a terminal program expects on its
//! standard input. The set of named keys is fixed; anything else is sent as
//! the literal character.

use bitflags::bitflags;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use crate::core::term::Frame;

bitflags! {
    /// Modifier keys
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Modifiers: u8 {
        const SHIFT = 0b0001;
        const CTRL  = 0b0010;
        const ALT   = 0b0100;
    }
}

impl From<KeyModifiers> for Modifiers {
    fn from(mods: KeyModifiers) -> Self {
        let mut result = Modifiers::empty();
        if mods.contains(KeyModifiers::SHIFT) {
            result |= Modifiers::SHIFT;
        }
        if mods.contains(KeyModifiers::CONTROL) {
            result |= Modifiers::CTRL;
        }
        if mods.contains(KeyModifiers::ALT) {
            result |= Modifiers::ALT;
        }
        result
    }
}

/// Logical keys
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Key {
    Left,
    Right,
    Up,
    Down,
    Home,
    End,
    PageUp,
    PageDown,
    Insert,
    Delete,
    Enter,
    Backspace,
    Tab,
    BackTab,
    Esc,
    /// F1 to F12
    F(u8),
    Char(char),
}

impl Key {
    /// Look up a named key, e.g. `"left"` or `"f5"`
    pub fn from_name(name: &str) -> Option<Key> {
        let key = match name.to_ascii_lowercase().as_str() {
            "left" => Key::Left,
            "right" => Key::Right,
            "up" => Key::Up,
            "down" => Key::Down,
            "home" => Key::Home,
            "end" => Key::End,
            "pageup" => Key::PageUp,
            "pagedown" => Key::PageDown,
            "insert" => Key::Insert,
            "delete" => Key::Delete,
            "enter" => Key::Enter,
            "backspace" => Key::Backspace,
            "tab" => Key::Tab,
            "backtab" => Key::BackTab,
            "escape" | "esc" => Key::Esc,
            other => {
                let n: u8 = other.strip_prefix('f')?.parse().ok()?;
                if !(1..=12).contains(&n) {
                    return None;
                }
                Key::F(n)
            }
        };
        Some(key)
    }

    /// Key and modifiers of a crossterm event. `None` for keys with no
    /// terminal encoding.
    pub fn from_event(event: &KeyEvent) -> Option<(Key, Modifiers)> {
        let mut mods = Modifiers::from(event.modifiers);
        let key = match event.code {
            KeyCode::Char(ch) => {
                // Shift is already part of the character
                mods.remove(Modifiers::SHIFT);
                Key::Char(ch)
            }
            KeyCode::Left => Key::Left,
            KeyCode::Right => Key::Right,
            KeyCode::Up => Key::Up,
            KeyCode::Down => Key::Down,
            KeyCode::Home => Key::Home,
            KeyCode::End => Key::End,
            KeyCode::PageUp => Key::PageUp,
            KeyCode::PageDown => Key::PageDown,
            KeyCode::Insert => Key::Insert,
            KeyCode::Delete => Key::Delete,
            KeyCode::Enter => Key::Enter,
            KeyCode::Backspace => Key::Backspace,
            KeyCode::Tab => Key::Tab,
            KeyCode::BackTab => {
                mods.remove(Modifiers::SHIFT);
                Key::BackTab
            }
            KeyCode::Esc => Key::Esc,
            KeyCode::F(n) if (1..=12).contains(&n) => Key::F(n),
            _ => return None,
        };
        Some((key, mods))
    }
}

/// Terminal modes that change how keys are encoded
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InputModes {
    /// DECCKM: arrows send `ESC O x`
    pub application_cursor: bool,
    pub bracketed_paste: bool,
}

impl From<&Frame> for InputModes {
    fn from(frame: &Frame) -> Self {
        Self {
            application_cursor: frame.application_cursor,
            bracketed_paste: frame.bracketed_paste,
        }
    }
}

pub struct KeyTranslator;

impl KeyTranslator {
    /// Translate a named key, or pass `character` through literally. Names
    /// outside the fixed table fall back to the character.
    pub fn translate_named(name: &str, character: Option<char>) -> Vec<u8> {
        match Key::from_name(name).or(character.map(Key::Char)) {
            Some(key) => Self::translate(key, Modifiers::empty(), InputModes::default()),
            None => Vec::new(),
        }
    }

    /// Translate a crossterm key event
    pub fn map(event: &KeyEvent, modes: InputModes) -> Option<Vec<u8>> {
        let (key, mods) = Key::from_event(event)?;
        Some(Self::translate(key, mods, modes))
    }

    pub fn translate(key: Key, mods: Modifiers, modes: InputModes) -> Vec<u8> {
        match key {
            Key::Char(ch) => Self::map_char(ch, mods),

            Key::Enter => vec![0x0D],
            Key::Backspace => {
                if mods.contains(Modifiers::ALT) {
                    vec![0x1B, 0x7F]
                } else {
                    vec![0x7F]
                }
            }
            Key::Tab if mods.contains(Modifiers::SHIFT) => b"\x1b[Z".to_vec(),
            Key::Tab => vec![0x09],
            Key::BackTab => b"\x1b[Z".to_vec(),
            Key::Esc => vec![0x1B],

            Key::Up => Self::arrow_key(b'A', mods, modes),
            Key::Down => Self::arrow_key(b'B', mods, modes),
            Key::Right => Self::arrow_key(b'C', mods, modes),
            Key::Left => Self::arrow_key(b'D', mods, modes),

            Key::Home => Self::special_key(b'H', mods),
            Key::End => Self::special_key(b'F', mods),
            Key::PageUp => Self::tilde_key(5, mods),
            Key::PageDown => Self::tilde_key(6, mods),
            Key::Insert => Self::tilde_key(2, mods),
            Key::Delete => Self::tilde_key(3, mods),

            Key::F(n) => Self::function_key(n, mods),
        }
    }

    /// Pasted text, wrapped in `ESC [200~ ... ESC [201~` when the program
    /// asked for bracketed paste
    pub fn paste(text: &str, modes: InputModes) -> Vec<u8> {
        if !modes.bracketed_paste {
            return text.as_bytes().to_vec();
        }
        // A pasted end marker would end the paste early
        let body = text.replace("\x1b[201~", "");
        let mut bytes = b"\x1b[200~".to_vec();
        bytes.extend_from_slice(body.as_bytes());
        bytes.extend_from_slice(b"\x1b[201~");
        bytes
    }

    fn map_char(ch: char, mods: Modifiers) -> Vec<u8> {
        // Ctrl + letter = control character
        if mods.contains(Modifiers::CTRL) && !mods.contains(Modifiers::ALT) {
            if ch.is_ascii_alphabetic() {
                return vec![(ch.to_ascii_lowercase() as u8) - b'a' + 1];
            }
            match ch {
                '@' | '`' | ' ' | '2' => return vec![0x00],
                '[' | '3' => return vec![0x1B],
                '\\' | '4' => return vec![0x1C],
                ']' | '5' => return vec![0x1D],
                '^' | '~' | '6' => return vec![0x1E],
                '_' | '?' | '7' => return vec![0x1F],
                _ => {}
            }
        }

        // Ctrl + Alt + letter
        if mods.contains(Modifiers::CTRL | Modifiers::ALT) && ch.is_ascii_alphabetic() {
            return vec![0x1B, (ch.to_ascii_lowercase() as u8) - b'a' + 1];
        }

        // Alt + key = ESC + key
        let mut bytes = Vec::with_capacity(5);
        if mods.contains(Modifiers::ALT) {
            bytes.push(0x1B);
        }
        let mut buf = [0u8; 4];
        bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
        bytes
    }

    fn arrow_key(key: u8, mods: Modifiers, modes: InputModes) -> Vec<u8> {
        if !mods.is_empty() {
            format!("\x1b[1;{}{}", Self::modifier_code(mods), key as char).into_bytes()
        } else if modes.application_cursor {
            vec![0x1B, b'O', key]
        } else {
            vec![0x1B, b'[', key]
        }
    }

    /// Home and End
    fn special_key(key: u8, mods: Modifiers) -> Vec<u8> {
        if mods.is_empty() {
            vec![0x1B, b'[', key]
        } else {
            format!("\x1b[1;{}{}", Self::modifier_code(mods), key as char).into_bytes()
        }
    }

    /// PageUp, PageDown, Insert, Delete
    fn tilde_key(code: u8, mods: Modifiers) -> Vec<u8> {
        if mods.is_empty() {
            format!("\x1b[{}~", code).into_bytes()
        } else {
            format!("\x1b[{};{}~", code, Self::modifier_code(mods)).into_bytes()
        }
    }

    fn function_key(n: u8, mods: Modifiers) -> Vec<u8> {
        // F1-F4 are SS3 keys, the rest use tilde codes
        let code = match n {
            1..=4 => {
                let key = b'P' + (n - 1);
                return if mods.is_empty() {
                    vec![0x1B, b'O', key]
                } else {
                    format!("\x1b[1;{}{}", Self::modifier_code(mods), key as char).into_bytes()
                };
            }
            5 => 15,
            6 => 17,
            7 => 18,
            8 => 19,
            9 => 20,
            10 => 21,
            11 => 23,
            12 => 24,
            _ => return Vec::new(),
        };
        Self::tilde_key(code, mods)
    }

    /// xterm modifier parameter
    fn modifier_code(mods: Modifiers) -> u8 {
        1 + if mods.contains(Modifiers::SHIFT) { 1 } else { 0 }
            + if mods.contains(Modifiers::ALT) { 2 } else { 0 }
            + if mods.contains(Modifiers::CTRL) { 4 } else { 0 }
    }
}
