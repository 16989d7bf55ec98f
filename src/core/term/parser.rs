//! VT sequence parser
//!
//! Parses ANSI/VT escape sequences and updates terminal state. Input is
//! already UTF-8 decoded; anything the parser does not understand drops it
//! back to the ground state without touching the screen.

use super::state::{AttrFlags, Color, TerminalState};

const MAX_PARAMS: usize = 32;
const MAX_OSC_LEN: usize = 4096;

/// Response that needs to be sent back to the PTY
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Operating status report: ESC [ 0 n
    StatusOk,
    /// Cursor position report: ESC [ row ; col R
    CursorPosition(u16, u16),
    /// Device attributes response
    DeviceAttributes,
    /// Secondary device attributes response
    SecondaryDeviceAttributes,
}

impl Response {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Response::StatusOk => b"\x1b[0n".to_vec(),
            Response::CursorPosition(row, col) => format!("\x1b[{};{}R", row, col).into_bytes(),
            // VT220
            Response::DeviceAttributes => b"\x1b[?62;c".to_vec(),
            Response::SecondaryDeviceAttributes => b"\x1b[>1;10;0c".to_vec(),
        }
    }
}

/// Parser state machine
pub struct VtParser {
    state: ParserState,
    params: Vec<u16>,
    intermediates: Vec<u8>,
    current_param: Option<u16>,
    osc_string: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
enum ParserState {
    #[default]
    Ground,
    Escape,
    EscapeIntermediate,
    CsiEntry,
    CsiParam,
    CsiIntermediate,
    /// CSI with bytes we cannot parse; consumed up to the final byte
    CsiIgnore,
    OscString,
    /// ESC received within OSC, waiting for backslash
    EscapeInOsc,
    /// DCS, SOS, PM and APC payloads are skipped up to ST
    IgnoreString,
    EscapeInIgnoreString,
}

impl Default for VtParser {
    fn default() -> Self {
        Self::new()
    }
}

impl VtParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::Ground,
            params: Vec::with_capacity(16),
            intermediates: Vec::with_capacity(4),
            current_param: None,
            osc_string: String::new(),
        }
    }

    /// True when no escape sequence is in progress
    pub fn is_ground(&self) -> bool {
        self.state == ParserState::Ground
    }

    /// Feed a single character to the parser
    pub fn feed(&mut self, ch: char, state: &mut TerminalState) -> Option<Response> {
        let in_string = matches!(
            self.state,
            ParserState::OscString
                | ParserState::EscapeInOsc
                | ParserState::IgnoreString
                | ParserState::EscapeInIgnoreString
        );

        // C0 controls act immediately, even in the middle of a sequence
        if (ch as u32) < 0x20 && !in_string {
            match ch {
                '\x1b' => self.enter_escape(),
                '\x07' => {}
                '\x08' => state.backspace(),
                '\x09' => state.horizontal_tab(),
                '\x0a' | '\x0b' | '\x0c' => {
                    state.linefeed();
                    if state.modes.linefeed_newline {
                        state.carriage_return();
                    }
                }
                '\x0d' => state.carriage_return(),
                // CAN / SUB abort the sequence
                '\x18' | '\x1a' => self.state = ParserState::Ground,
                _ => {}
            }
            return None;
        }

        match self.state {
            ParserState::Ground => {
                if !ch.is_control() {
                    state.put_char(ch);
                }
                None
            }
            ParserState::Escape => self.escape(ch, state),
            ParserState::EscapeIntermediate => {
                self.escape_intermediate(ch);
                None
            }
            ParserState::CsiEntry => self.csi_entry(ch, state),
            ParserState::CsiParam => self.csi_param(ch, state),
            ParserState::CsiIntermediate => self.csi_intermediate(ch, state),
            ParserState::CsiIgnore => {
                if ('\x40'..='\x7e').contains(&ch) {
                    self.state = ParserState::Ground;
                }
                None
            }
            ParserState::OscString => {
                self.osc_string_state(ch, state);
                None
            }
            ParserState::EscapeInOsc => self.escape_in_osc(ch, state),
            ParserState::IgnoreString => {
                match ch {
                    '\x1b' => self.state = ParserState::EscapeInIgnoreString,
                    '\x07' | '\u{9c}' => self.state = ParserState::Ground,
                    _ => {}
                }
                None
            }
            ParserState::EscapeInIgnoreString => {
                if ch == '\\' {
                    self.state = ParserState::Ground;
                    None
                } else {
                    self.enter_escape();
                    self.escape(ch, state)
                }
            }
        }
    }

    /// Handle ESC received within OSC sequence
    fn escape_in_osc(&mut self, ch: char, state: &mut TerminalState) -> Option<Response> {
        self.execute_osc(state);
        if ch == '\\' {
            // ST (ESC \) - String Terminator
            self.state = ParserState::Ground;
            return None;
        }
        // Not ST: the ESC started a new sequence
        self.enter_escape();
        self.escape(ch, state)
    }

    fn enter_escape(&mut self) {
        self.state = ParserState::Escape;
        self.params.clear();
        self.intermediates.clear();
        self.current_param = None;
    }

    fn escape(&mut self, ch: char, state: &mut TerminalState) -> Option<Response> {
        self.state = ParserState::Ground;
        match ch {
            '[' => {
                self.state = ParserState::CsiEntry;
                self.params.clear();
                self.intermediates.clear();
                self.current_param = None;
            }
            ']' => {
                self.state = ParserState::OscString;
                self.osc_string.clear();
            }
            'P' | 'X' | '^' | '_' => self.state = ParserState::IgnoreString,
            // DECSC / DECRC
            '7' => state.save_cursor(),
            '8' => state.restore_cursor(),
            // IND
            'D' => state.index(),
            // NEL
            'E' => {
                state.carriage_return();
                state.index();
            }
            // RI
            'M' => state.reverse_index(),
            // RIS - Full reset
            'c' => *state = TerminalState::new(state.size()),
            '=' | '>' => {} // keypad modes
            '\x20'..='\x2f' => {
                self.push_intermediate(ch);
                self.state = ParserState::EscapeIntermediate;
            }
            _ => {
                tracing::debug!("Unknown ESC sequence: {:?}", ch);
            }
        }
        None
    }

    fn escape_intermediate(&mut self, ch: char) {
        match ch {
            '\x20'..='\x2f' => {
                self.push_intermediate(ch);
            }
            // Charset designations and the like; nothing to apply
            _ => self.state = ParserState::Ground,
        }
    }

    fn csi_entry(&mut self, ch: char, state: &mut TerminalState) -> Option<Response> {
        match ch {
            '0'..='9' | ';' | ':' => {
                self.state = ParserState::CsiParam;
                self.csi_param(ch, state)
            }
            '?' | '>' | '!' | '=' | '<' => {
                self.push_intermediate(ch);
                None
            }
            '\x20'..='\x2f' => {
                self.push_intermediate(ch);
                self.state = ParserState::CsiIntermediate;
                None
            }
            '\x40'..='\x7e' => self.execute_csi(ch as u8, state),
            _ => {
                self.state = ParserState::CsiIgnore;
                None
            }
        }
    }

    fn csi_param(&mut self, ch: char, state: &mut TerminalState) -> Option<Response> {
        match ch {
            '0'..='9' => {
                let digit = ch as u16 - '0' as u16;
                self.current_param = Some(
                    self.current_param
                        .unwrap_or(0)
                        .saturating_mul(10)
                        .saturating_add(digit),
                );
                None
            }
            // Subparameters (colon) are flattened into the parameter list
            ';' | ':' => {
                self.push_param();
                None
            }
            '\x20'..='\x2f' => {
                if self.current_param.is_some() {
                    self.push_param();
                }
                self.push_intermediate(ch);
                self.state = ParserState::CsiIntermediate;
                None
            }
            '\x40'..='\x7e' => {
                if self.current_param.is_some() {
                    self.push_param();
                }
                self.execute_csi(ch as u8, state)
            }
            _ => {
                self.state = ParserState::CsiIgnore;
                None
            }
        }
    }

    fn push_param(&mut self) {
        let value = self.current_param.take().unwrap_or(0);
        if self.params.len() < MAX_PARAMS {
            self.params.push(value);
        }
    }

    fn push_intermediate(&mut self, ch: char) {
        if self.intermediates.len() < MAX_PARAMS {
            self.intermediates.push(ch as u8);
        }
    }

    fn csi_intermediate(&mut self, ch: char, state: &mut TerminalState) -> Option<Response> {
        match ch {
            '\x20'..='\x2f' => {
                self.push_intermediate(ch);
                None
            }
            '\x40'..='\x7e' => self.execute_csi(ch as u8, state),
            _ => {
                self.state = ParserState::CsiIgnore;
                None
            }
        }
    }

    fn osc_string_state(&mut self, ch: char, state: &mut TerminalState) {
        match ch {
            '\x07' | '\u{9c}' => {
                self.execute_osc(state);
                self.state = ParserState::Ground;
            }
            '\x1b' => self.state = ParserState::EscapeInOsc,
            _ => {
                if self.osc_string.len() < MAX_OSC_LEN {
                    self.osc_string.push(ch);
                }
            }
        }
    }

    fn execute_csi(&mut self, final_byte: u8, state: &mut TerminalState) -> Option<Response> {
        self.state = ParserState::Ground;

        let is_private = self.intermediates.contains(&b'?');
        let is_gt = self.intermediates.contains(&b'>');
        let has_other = self
            .intermediates
            .iter()
            .any(|&b| !matches!(b, b'?' | b'>'));
        let params = &self.params;
        // Most sequences treat a missing or zero count as 1
        let count = params.first().copied().unwrap_or(1).max(1);

        if has_other {
            tracing::debug!(
                "Ignoring CSI: intermediates={:?}, params={:?}, final={:?}",
                self.intermediates,
                params,
                final_byte as char
            );
            return None;
        }

        match (is_private, is_gt, final_byte) {
            // Cursor movement
            (false, false, b'A') => state.cursor_up(count),
            (false, false, b'B') | (false, false, b'e') => state.cursor_down(count),
            (false, false, b'C') | (false, false, b'a') => state.cursor_forward(count),
            (false, false, b'D') => state.cursor_backward(count),
            (false, false, b'E') => {
                // CNL - Cursor Next Line
                state.cursor_down(count);
                state.carriage_return();
            }
            (false, false, b'F') => {
                // CPL - Cursor Previous Line
                state.cursor_up(count);
                state.carriage_return();
            }
            (false, false, b'G') | (false, false, b'`') => state.cursor_column(count),
            (false, false, b'H') | (false, false, b'f') => {
                // CUP - Cursor Position
                let row = params.first().copied().unwrap_or(1);
                let col = params.get(1).copied().unwrap_or(1);
                state.cursor_position(row, col);
            }
            (false, false, b'd') => state.cursor_row(count),

            // Erase
            (false, false, b'J') | (true, false, b'J') => {
                state.erase_in_display(params.first().copied().unwrap_or(0));
            }
            (false, false, b'K') | (true, false, b'K') => {
                state.erase_in_line(params.first().copied().unwrap_or(0));
            }
            (false, false, b'X') => state.erase_chars(count),

            // Line and character editing
            (false, false, b'L') => state.insert_lines(count),
            (false, false, b'M') => state.delete_lines(count),
            (false, false, b'@') => state.insert_blank_chars(count),
            (false, false, b'P') => state.delete_chars(count),

            // Scroll
            (false, false, b'S') => state.scroll_up(count),
            (false, false, b'T') => state.scroll_down(count),
            (false, false, b'r') => {
                let top = params.first().copied().unwrap_or(1).max(1);
                let bottom = match params.get(1).copied() {
                    Some(b) if b > 0 => b,
                    _ => state.rows,
                };
                state.set_scroll_region(top, bottom);
                state.cursor_position(1, 1);
            }

            // SGR - Select Graphic Rendition
            (false, false, b'm') => Self::execute_sgr(params, state),

            // Save/restore cursor
            (false, false, b's') => state.save_cursor(),
            (false, false, b'u') => state.restore_cursor(),

            // Device Status Report
            (false, false, b'n') => {
                return match params.first() {
                    Some(5) => Some(Response::StatusOk),
                    Some(6) => {
                        let cursor = state.active_cursor();
                        let col = cursor.col.min(state.cols - 1);
                        Some(Response::CursorPosition(cursor.row + 1, col + 1))
                    }
                    _ => None,
                };
            }

            // Device Attributes
            (false, false, b'c') => return Some(Response::DeviceAttributes),
            (false, true, b'c') => return Some(Response::SecondaryDeviceAttributes),

            // Private modes (DEC)
            (true, false, b'h') | (true, false, b'l') => {
                let enable = final_byte == b'h';
                for &p in params {
                    state.set_private_mode(p, enable);
                }
            }

            // Standard modes
            (false, false, b'h') | (false, false, b'l') => {
                let enable = final_byte == b'h';
                for &p in params {
                    match p {
                        4 => state.modes.insert_mode = enable,
                        20 => state.modes.linefeed_newline = enable,
                        _ => {}
                    }
                }
            }

            _ => {
                tracing::debug!(
                    "Unknown CSI: intermediates={:?}, params={:?}, final={:?}",
                    self.intermediates,
                    params,
                    final_byte as char
                );
            }
        }
        None
    }

    fn execute_sgr(params: &[u16], state: &mut TerminalState) {
        if params.is_empty() {
            state.current_attrs.reset();
            return;
        }

        let attrs = &mut state.current_attrs;
        let mut iter = params.iter().copied();

        while let Some(param) = iter.next() {
            match param {
                0 => attrs.reset(),
                1 => attrs.flags |= AttrFlags::BOLD,
                2 => attrs.flags |= AttrFlags::DIM,
                3 => attrs.flags |= AttrFlags::ITALIC,
                4 => attrs.flags |= AttrFlags::UNDERLINE,
                5 | 6 => attrs.flags |= AttrFlags::BLINK,
                7 => attrs.flags |= AttrFlags::INVERSE,
                8 => attrs.flags |= AttrFlags::HIDDEN,
                9 => attrs.flags |= AttrFlags::STRIKETHROUGH,

                22 => attrs.flags &= !(AttrFlags::BOLD | AttrFlags::DIM),
                23 => attrs.flags &= !AttrFlags::ITALIC,
                24 => attrs.flags &= !AttrFlags::UNDERLINE,
                25 => attrs.flags &= !AttrFlags::BLINK,
                27 => attrs.flags &= !AttrFlags::INVERSE,
                28 => attrs.flags &= !AttrFlags::HIDDEN,
                29 => attrs.flags &= !AttrFlags::STRIKETHROUGH,

                30..=37 => attrs.fg = Color::Indexed((param - 30) as u8),
                38 => {
                    if let Some(color) = Self::extended_color(&mut iter) {
                        attrs.fg = color;
                    }
                }
                39 => attrs.fg = Color::Default,

                40..=47 => attrs.bg = Color::Indexed((param - 40) as u8),
                48 => {
                    if let Some(color) = Self::extended_color(&mut iter) {
                        attrs.bg = color;
                    }
                }
                49 => attrs.bg = Color::Default,

                90..=97 => attrs.fg = Color::Indexed((param - 90 + 8) as u8),
                100..=107 => attrs.bg = Color::Indexed((param - 100 + 8) as u8),

                _ => {}
            }
        }
    }

    /// `38;5;n` / `38;2;r;g;b` (and the 48 forms)
    fn extended_color(iter: &mut impl Iterator<Item = u16>) -> Option<Color> {
        match iter.next()? {
            5 => iter.next().map(|n| Color::Indexed(n.min(255) as u8)),
            2 => {
                let r = iter.next().unwrap_or(0).min(255) as u8;
                let g = iter.next().unwrap_or(0).min(255) as u8;
                let b = iter.next().unwrap_or(0).min(255) as u8;
                Some(Color::Rgb(r, g, b))
            }
            _ => None,
        }
    }

    fn execute_osc(&mut self, state: &mut TerminalState) {
        // "code;text"
        if let Some((code, text)) = self.osc_string.split_once(';') {
            if matches!(code, "0" | "2") {
                state.title = text.to_string();
            }
        }
        self.osc_string.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::TermSize;
    use crate::core::term::state::CellAttrs;

    fn feed_str(parser: &mut VtParser, state: &mut TerminalState, input: &str) -> Vec<Response> {
        input.chars().filter_map(|ch| parser.feed(ch, state)).collect()
    }

    #[test]
    fn test_cursor_movement() {
        let mut state = TerminalState::new(TermSize::new(24, 80));
        let mut parser = VtParser::new();

        feed_str(&mut parser, &mut state, "\x1b[5;10H");

        assert_eq!(state.active_cursor().row, 4);
        assert_eq!(state.active_cursor().col, 9);
        assert!(parser.is_ground());
    }

    #[test]
    fn test_cursor_movement_is_clamped() {
        let mut state = TerminalState::new(TermSize::new(24, 80));
        let mut parser = VtParser::new();

        feed_str(&mut parser, &mut state, "\x1b[999;99999H");
        assert_eq!((state.active_cursor().row, state.active_cursor().col), (23, 79));

        feed_str(&mut parser, &mut state, "\x1b[65535A\x1b[65535D");
        assert_eq!((state.active_cursor().row, state.active_cursor().col), (0, 0));
    }

    #[test]
    fn test_sgr_colors() {
        let mut state = TerminalState::new(TermSize::new(24, 80));
        let mut parser = VtParser::new();

        feed_str(&mut parser, &mut state, "\x1b[31m");
        assert_eq!(state.current_attrs.fg, Color::Indexed(1));

        feed_str(&mut parser, &mut state, "\x1b[1;7;48;2;10;20;30m");
        assert!(state.current_attrs.flags.contains(AttrFlags::BOLD | AttrFlags::INVERSE));
        assert_eq!(state.current_attrs.bg, Color::Rgb(10, 20, 30));

        feed_str(&mut parser, &mut state, "\x1b[m");
        assert_eq!(state.current_attrs, CellAttrs::default());
    }

    #[test]
    fn test_device_queries_produce_responses() {
        let mut state = TerminalState::new(TermSize::new(24, 80));
        let mut parser = VtParser::new();

        let responses = feed_str(&mut parser, &mut state, "\x1b[3;4H\x1b[6n\x1b[c\x1b[5n");
        assert_eq!(
            responses,
            vec![
                Response::CursorPosition(3, 4),
                Response::DeviceAttributes,
                Response::StatusOk
            ]
        );
        assert_eq!(Response::CursorPosition(3, 4).to_bytes(), b"\x1b[3;4R");
    }

    #[test]
    fn test_osc_title_and_ignored_strings() {
        let mut state = TerminalState::new(TermSize::new(2, 10));
        let mut parser = VtParser::new();

        feed_str(&mut parser, &mut state, "\x1b]2;my title\x07");
        assert_eq!(state.title, "my title");

        feed_str(&mut parser, &mut state, "\x1bPq#0;2;0;0;0\x1b\\ok");
        let text: String = state.active_screen().rows[0].cells[..2]
            .iter()
            .map(|c| c.display_char())
            .collect();
        assert_eq!(text, "ok");
    }

    #[test]
    fn test_garbage_never_panics() {
        let mut state = TerminalState::new(TermSize::new(3, 4));
        let mut parser = VtParser::new();
        let junk = "\x1b[\x1b]\x1b[?;;;;;;;;;;;;;;;;;;;;;;;;;;;;;;;;;;;;;;;;h\x1b[99999999999L\x1b[0;0r\
                    \x1b[38;5m\x1b[48;2m\x1b#8\x1b(B\x1b[>\u{fffd}q\x1b[ q\x1b[4294967295@\x1b[65535P\x7f";
        for _ in 0..4 {
            feed_str(&mut parser, &mut state, junk);
        }
        assert_eq!(state.active_screen().rows.len(), 3);
        assert!(state.active_screen().rows.iter().all(|r| r.cells.len() == 4));
    }
}
