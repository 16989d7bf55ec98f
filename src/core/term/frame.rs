//! Frame snapshots
//!
//! A [`Frame`] is an owned copy of the visible screen. The cursor cell is
//! highlighted here, at render time, by flipping its INVERSE flag; the
//! screen buffer itself is never touched.

use super::state::{AttrFlags, CellAttrs, TerminalState};
use crate::core::message::TermSize;

/// Cursor coordinates, 0-indexed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CursorPosition {
    pub row: u16,
    pub col: u16,
}

/// One rendered cell. Wide characters occupy one cell followed by a
/// continuation cell with an empty `text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameCell {
    pub text: String,
    pub attrs: CellAttrs,
    pub continuation: bool,
}

impl FrameCell {
    pub fn is_blank(&self) -> bool {
        self.text == " " && self.attrs == CellAttrs::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRow {
    pub cells: Vec<FrameCell>,
}

impl FrameRow {
    /// Row content as plain text (one char per column, wide chars once)
    pub fn text(&self) -> String {
        self.cells
            .iter()
            .filter(|c| !c.continuation)
            .map(|c| c.text.as_str())
            .collect()
    }
}

/// Immutable snapshot of the screen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub size: TermSize,
    pub rows: Vec<FrameRow>,
    pub cursor: CursorPosition,
    pub cursor_visible: bool,
    pub title: String,
    /// DECCKM, needed by the consumer to translate arrow keys
    pub application_cursor: bool,
    pub bracketed_paste: bool,
}

impl Frame {
    /// Render the active screen of `state`, highlighting the cursor cell
    /// when the cursor lies within bounds.
    pub fn render(state: &TerminalState) -> Self {
        let cursor = state.active_cursor();
        let position = CursorPosition {
            row: cursor.row,
            col: cursor.col,
        };

        let mut rows: Vec<FrameRow> = state
            .active_screen()
            .rows
            .iter()
            .map(|row| FrameRow {
                cells: row
                    .cells
                    .iter()
                    .map(|cell| FrameCell {
                        text: if cell.is_continuation() {
                            String::new()
                        } else {
                            cell.display_char().to_string()
                        },
                        attrs: cell.attrs,
                        continuation: cell.is_continuation(),
                    })
                    .collect(),
            })
            .collect();

        if let Some(cell) = rows
            .get_mut(position.row as usize)
            .and_then(|row| row.cells.get_mut(position.col as usize))
        {
            cell.attrs.flags.toggle(AttrFlags::INVERSE);
        }

        Self {
            size: state.size(),
            rows,
            cursor: position,
            cursor_visible: cursor.visible,
            title: state.title.clone(),
            application_cursor: state.modes.application_cursor,
            bracketed_paste: state.modes.bracketed_paste,
        }
    }

    /// All rows as plain text
    pub fn lines(&self) -> Vec<String> {
        self.rows.iter().map(FrameRow::text).collect()
    }

    pub fn cell(&self, row: u16, col: u16) -> Option<&FrameCell> {
        self.rows.get(row as usize)?.cells.get(col as usize)
    }
}
