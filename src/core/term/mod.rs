//! Terminal emulation
//!
//! [`Terminal`] is the state machine the I/O pump drives: `reset` allocates
//! a blank grid, `feed` decodes raw child output, `snapshot` renders a
//! [`Frame`]. It never fails on malformed input.

mod frame;
mod parser;
mod state;

pub use frame::{CursorPosition, Frame, FrameCell, FrameRow};
pub use parser::{Response, VtParser};
pub use state::{AttrFlags, Cell, CellAttrs, Color, CursorState, ScreenBuffer, TerminalModes, TerminalState};

use crate::core::message::TermSize;

/// Longest possible UTF-8 sequence
const UTF8_MAX: usize = 4;

pub struct Terminal {
    state: TerminalState,
    parser: VtParser,
    /// Trailing bytes of an incomplete UTF-8 sequence from the last feed
    pending: Vec<u8>,
}

impl Terminal {
    pub fn new(size: TermSize) -> Self {
        Self {
            state: TerminalState::new(size),
            parser: VtParser::new(),
            pending: Vec::with_capacity(UTF8_MAX),
        }
    }

    /// Discard everything and start over with a blank grid of `size`,
    /// cursor at home.
    pub fn reset(&mut self, size: TermSize) {
        *self = Self::new(size);
    }

    pub fn size(&self) -> TermSize {
        self.state.size()
    }

    pub fn state(&self) -> &TerminalState {
        &self.state
    }

    /// Decode a chunk of child output. Returns the replies owed to the
    /// child for any terminal queries in the chunk.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Response> {
        let mut responses = Vec::new();

        let owned;
        let input: &[u8] = if self.pending.is_empty() {
            bytes
        } else {
            let mut joined = std::mem::take(&mut self.pending);
            joined.extend_from_slice(bytes);
            owned = joined;
            &owned
        };

        let mut rest = input;
        while !rest.is_empty() {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.feed_str(text, &mut responses);
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    if let Ok(text) = std::str::from_utf8(valid) {
                        self.feed_str(text, &mut responses);
                    }
                    match err.error_len() {
                        Some(bad) => {
                            self.feed_char('\u{fffd}', &mut responses);
                            rest = &after[bad..];
                        }
                        None => {
                            // Incomplete sequence at the end of the chunk
                            self.pending.extend_from_slice(after);
                            break;
                        }
                    }
                }
            }
        }

        responses
    }

    fn feed_str(&mut self, text: &str, responses: &mut Vec<Response>) {
        for ch in text.chars() {
            self.feed_char(ch, responses);
        }
    }

    fn feed_char(&mut self, ch: char, responses: &mut Vec<Response>) {
        if let Some(response) = self.parser.feed(ch, &mut self.state) {
            responses.push(response);
        }
    }

    pub fn snapshot(&self) -> Frame {
        Frame::render(&self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_row(cols: u16) -> String {
        " ".repeat(cols as usize)
    }

    #[test]
    fn test_reset_yields_blank_grid_of_requested_size() {
        for &(rows, cols) in &[(1u16, 1u16), (24, 80), (3, 200), (50, 7)] {
            let terminal = Terminal::new(TermSize::new(rows, cols));
            let frame = terminal.snapshot();
            assert_eq!(frame.rows.len(), rows as usize);
            for (i, row) in frame.rows.iter().enumerate() {
                assert_eq!(row.cells.len(), cols as usize);
                assert_eq!(row.text(), blank_row(cols));
                for (j, cell) in row.cells.iter().enumerate() {
                    if i == 0 && j == 0 {
                        // cursor highlight
                        assert!(cell.attrs.flags.contains(AttrFlags::INVERSE));
                    } else {
                        assert!(cell.is_blank());
                    }
                }
            }
            assert_eq!(frame.cursor, CursorPosition::default());
        }
    }

    #[test]
    fn test_plain_text_starts_at_home() {
        let mut terminal = Terminal::new(TermSize::new(24, 80));
        terminal.feed(b"hello");
        let frame = terminal.snapshot();
        assert!(frame.lines()[0].starts_with("hello"));
        assert_eq!(frame.cursor, CursorPosition { row: 0, col: 5 });
    }

    #[test]
    fn test_cursor_move_then_char() {
        let mut terminal = Terminal::new(TermSize::new(24, 80));
        terminal.feed(b"\x1b[3;5HX");
        let frame = terminal.snapshot();
        for (row, line) in frame.lines().iter().enumerate() {
            if row == 2 {
                assert_eq!(line.trim_end(), "    X");
            } else {
                assert_eq!(line.trim(), "");
            }
        }
    }

    #[test]
    fn test_reset_discards_content() {
        let mut terminal = Terminal::new(TermSize::new(24, 80));
        terminal.feed(b"some text\r\nmore");
        terminal.reset(TermSize::new(30, 100));
        let frame = terminal.snapshot();
        assert_eq!(frame.size, TermSize::new(30, 100));
        assert_eq!(frame.rows.len(), 30);
        assert!(frame.lines().iter().all(|l| l == &blank_row(100)));
        assert_eq!(frame.cursor, CursorPosition::default());
    }

    #[test]
    fn test_utf8_split_across_feeds() {
        let mut terminal = Terminal::new(TermSize::new(2, 10));
        let bytes = "é日".as_bytes();
        terminal.feed(&bytes[..1]);
        terminal.feed(&bytes[1..3]);
        terminal.feed(&bytes[3..]);
        assert_eq!(terminal.snapshot().lines()[0].trim_end(), "é日");
    }

    #[test]
    fn test_invalid_utf8_becomes_replacement() {
        let mut terminal = Terminal::new(TermSize::new(1, 10));
        terminal.feed(b"a\xffb");
        assert_eq!(terminal.snapshot().lines()[0].trim_end(), "a\u{fffd}b");
    }

    #[test]
    fn test_c1_controls_do_not_reach_cells() {
        let mut terminal = Terminal::new(TermSize::new(1, 10));
        terminal.feed("x\u{85}\u{90}y\u{7f}".as_bytes());
        let frame = terminal.snapshot();
        assert_eq!(frame.lines()[0].trim_end(), "xy");
        assert_eq!(frame.cell(0, 0).unwrap().text, "x");
    }

    #[test]
    fn test_feed_returns_query_replies() {
        let mut terminal = Terminal::new(TermSize::new(24, 80));
        let replies = terminal.feed(b"ab\x1b[6n");
        assert_eq!(replies, vec![Response::CursorPosition(1, 3)]);
    }
}
