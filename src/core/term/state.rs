//! Terminal state management
//!
//! This module defines the terminal's screen buffer, cursor state, and attributes.

use bitflags::bitflags;
use unicode_width::UnicodeWidthChar;

use crate::core::message::TermSize;

/// Terminal state holding all screen data
pub struct TerminalState {
    pub cols: u16,
    pub rows: u16,
    pub primary_screen: ScreenBuffer,
    pub alternate_screen: ScreenBuffer,
    pub using_alternate: bool,
    pub primary_cursor: CursorState,
    pub alternate_cursor: CursorState,
    pub current_attrs: CellAttrs,
    pub modes: TerminalModes,
    pub title: String,
    /// Scroll region (top, bottom) - 0-indexed, inclusive
    pub scroll_region: (u16, u16),
}

impl TerminalState {
    pub fn new(size: TermSize) -> Self {
        let TermSize { rows, cols } = TermSize::new(size.rows, size.cols);
        Self {
            cols,
            rows,
            primary_screen: ScreenBuffer::new(cols, rows),
            alternate_screen: ScreenBuffer::new(cols, rows),
            using_alternate: false,
            primary_cursor: CursorState::default(),
            alternate_cursor: CursorState::default(),
            current_attrs: CellAttrs::default(),
            modes: TerminalModes::default(),
            title: String::new(),
            scroll_region: (0, rows - 1),
        }
    }

    pub fn size(&self) -> TermSize {
        TermSize {
            rows: self.rows,
            cols: self.cols,
        }
    }

    pub fn active_screen(&self) -> &ScreenBuffer {
        if self.using_alternate {
            &self.alternate_screen
        } else {
            &self.primary_screen
        }
    }

    pub fn active_screen_mut(&mut self) -> &mut ScreenBuffer {
        if self.using_alternate {
            &mut self.alternate_screen
        } else {
            &mut self.primary_screen
        }
    }

    pub fn active_cursor(&self) -> &CursorState {
        if self.using_alternate {
            &self.alternate_cursor
        } else {
            &self.primary_cursor
        }
    }

    pub fn active_cursor_mut(&mut self) -> &mut CursorState {
        if self.using_alternate {
            &mut self.alternate_cursor
        } else {
            &mut self.primary_cursor
        }
    }

    /// Put a character at the current cursor position
    pub fn put_char(&mut self, ch: char) {
        // C1 controls have no cell
        if ch.is_control() {
            return;
        }
        let width = ch.width().unwrap_or(0) as u16;

        if width == 0 {
            // Combining character - append to previous cell
            self.append_to_previous_cell(ch);
            return;
        }

        let cursor_col = self.active_cursor().col;

        // Deferred wrap: the cursor may sit one past the last column after
        // the final cell of a line was written.
        let wide_at_edge = width == 2 && self.cols > 1 && cursor_col.saturating_add(1) >= self.cols;
        if cursor_col >= self.cols || wide_at_edge {
            if self.modes.auto_wrap {
                self.active_cursor_mut().col = 0;
                self.linefeed();
            } else {
                self.active_cursor_mut().col = self.cols.saturating_sub(width);
            }
        }

        let (row, col) = {
            let cursor = self.active_cursor();
            (cursor.row as usize, cursor.col as usize)
        };

        if col >= self.cols as usize {
            return;
        }

        if self.modes.insert_mode {
            self.insert_blank_chars(width);
        }

        self.handle_wide_char_overwrite(row, col);

        let attrs = self.current_attrs;
        let cols = self.cols as usize;
        let screen = self.active_screen_mut();

        screen.rows[row].cells[col] = Cell {
            grapheme: ch.to_string(),
            width: width as u8,
            attrs,
        };

        // For wide characters, mark next cell as continuation (only if it fits)
        if width == 2 && col + 1 < cols {
            screen.rows[row].cells[col + 1] = Cell::continuation(attrs);
        }

        self.active_cursor_mut().col = (col as u16).saturating_add(width);
    }

    fn append_to_previous_cell(&mut self, ch: char) {
        let (row, col) = {
            let cursor = self.active_cursor();
            (cursor.row as usize, cursor.col as usize)
        };

        if col == 0 {
            return;
        }
        let cells = &mut self.active_screen_mut().rows[row].cells;
        let mut target = (col - 1).min(cells.len() - 1);
        if cells[target].is_continuation() && target > 0 {
            target -= 1;
        }
        cells[target].grapheme.push(ch);
    }

    fn handle_wide_char_overwrite(&mut self, row: usize, col: usize) {
        let attrs = self.current_attrs;
        let cols = self.cols as usize;
        let cells = &mut self.active_screen_mut().rows[row].cells;

        // Overwriting the right half of a wide char
        if col > 0 && cells[col].is_continuation() {
            cells[col - 1] = Cell::blank(attrs);
        }

        // Overwriting the left half of a wide char
        if cells[col].width == 2 && col + 1 < cols {
            cells[col + 1] = Cell::blank(attrs);
        }
    }

    /// Carriage return - move cursor to column 0
    pub fn carriage_return(&mut self) {
        self.active_cursor_mut().col = 0;
    }

    /// Line feed - move cursor down, scroll if needed
    pub fn linefeed(&mut self) {
        let cursor_row = self.active_cursor().row;
        let scroll_bottom = self.scroll_region.1;

        if cursor_row == scroll_bottom {
            self.scroll_up(1);
        } else if cursor_row < self.rows - 1 {
            self.active_cursor_mut().row += 1;
        }
    }

    /// Backspace - move cursor left
    pub fn backspace(&mut self) {
        let cols = self.cols;
        let cursor = self.active_cursor_mut();
        cursor.col = cursor.col.min(cols - 1).saturating_sub(1);
    }

    /// Horizontal tab
    pub fn horizontal_tab(&mut self) {
        let cols = self.cols;
        let cursor = self.active_cursor_mut();
        // Tab stops every 8 columns
        cursor.col = ((cursor.col / 8).saturating_add(1)).saturating_mul(8).min(cols - 1);
    }

    /// Scroll the scroll region up by n lines
    pub fn scroll_up(&mut self, n: u16) {
        let (top, bottom) = self.scroll_region;
        let (top, bottom) = (top as usize, bottom as usize);
        let cols = self.cols;
        let attrs = self.current_attrs.background_only();
        let screen = self.active_screen_mut();
        let n = (n as usize).min(bottom + 1 - top);

        for _ in 0..n {
            screen.rows.remove(top);
            screen.rows.insert(bottom, Row::with_attrs(cols, attrs));
        }
    }

    /// Scroll the scroll region down by n lines
    pub fn scroll_down(&mut self, n: u16) {
        let (top, bottom) = self.scroll_region;
        let (top, bottom) = (top as usize, bottom as usize);
        let cols = self.cols;
        let attrs = self.current_attrs.background_only();
        let screen = self.active_screen_mut();
        let n = (n as usize).min(bottom + 1 - top);

        for _ in 0..n {
            screen.rows.remove(bottom);
            screen.rows.insert(top, Row::with_attrs(cols, attrs));
        }
    }

    /// Cursor up
    pub fn cursor_up(&mut self, n: u16) {
        let top = self.scroll_region.0;
        let cursor = self.active_cursor_mut();
        let floor = if cursor.row >= top { top } else { 0 };
        cursor.row = cursor.row.saturating_sub(n).max(floor);
    }

    /// Cursor down
    pub fn cursor_down(&mut self, n: u16) {
        let bottom = self.scroll_region.1;
        let rows = self.rows;
        let cursor = self.active_cursor_mut();
        let ceiling = if cursor.row <= bottom { bottom } else { rows - 1 };
        cursor.row = cursor.row.saturating_add(n).min(ceiling);
    }

    /// Cursor forward (right)
    pub fn cursor_forward(&mut self, n: u16) {
        let cols = self.cols;
        let cursor = self.active_cursor_mut();
        cursor.col = cursor.col.saturating_add(n).min(cols - 1);
    }

    /// Cursor backward (left)
    pub fn cursor_backward(&mut self, n: u16) {
        let cols = self.cols;
        let cursor = self.active_cursor_mut();
        cursor.col = cursor.col.min(cols - 1).saturating_sub(n);
    }

    /// Set cursor position (1-indexed parameters)
    pub fn cursor_position(&mut self, row: u16, col: u16) {
        let rows = self.rows;
        let cols = self.cols;
        let cursor = self.active_cursor_mut();
        cursor.row = row.saturating_sub(1).min(rows - 1);
        cursor.col = col.saturating_sub(1).min(cols - 1);
    }

    /// Set cursor column (1-indexed)
    pub fn cursor_column(&mut self, col: u16) {
        let cols = self.cols;
        self.active_cursor_mut().col = col.saturating_sub(1).min(cols - 1);
    }

    /// Set cursor row (1-indexed)
    pub fn cursor_row(&mut self, row: u16) {
        let rows = self.rows;
        self.active_cursor_mut().row = row.saturating_sub(1).min(rows - 1);
    }

    /// Erase in display
    pub fn erase_in_display(&mut self, mode: u16) {
        let cursor_row = self.active_cursor().row as usize;
        let attrs = self.current_attrs.background_only();
        match mode {
            0 => {
                // From cursor to end
                self.erase_in_line(0);
                let screen = self.active_screen_mut();
                for row in screen.rows.iter_mut().skip(cursor_row + 1) {
                    row.clear(attrs);
                }
            }
            1 => {
                // From start to cursor
                let screen = self.active_screen_mut();
                for row in screen.rows.iter_mut().take(cursor_row) {
                    row.clear(attrs);
                }
                self.erase_in_line(1);
            }
            2 | 3 => {
                for row in self.active_screen_mut().rows.iter_mut() {
                    row.clear(attrs);
                }
            }
            _ => {}
        }
    }

    /// Erase in line
    pub fn erase_in_line(&mut self, mode: u16) {
        let (row, cursor_col) = {
            let cursor = self.active_cursor();
            (cursor.row as usize, cursor.col as usize)
        };
        let attrs = self.current_attrs.background_only();
        let cells = &mut self.active_screen_mut().rows[row].cells;
        let last = cells.len() - 1;

        match mode {
            0 => cells[cursor_col.min(last)..].iter_mut().for_each(|c| c.clear(attrs)),
            1 => cells[..=cursor_col.min(last)].iter_mut().for_each(|c| c.clear(attrs)),
            2 => cells.iter_mut().for_each(|c| c.clear(attrs)),
            _ => {}
        }
    }

    /// Erase n characters starting at the cursor, without moving anything
    pub fn erase_chars(&mut self, n: u16) {
        let (row, col) = {
            let cursor = self.active_cursor();
            (cursor.row as usize, cursor.col as usize)
        };
        let attrs = self.current_attrs.background_only();
        let cells = &mut self.active_screen_mut().rows[row].cells;
        let end = col.saturating_add(n as usize).min(cells.len());
        if col < end {
            cells[col..end].iter_mut().for_each(|c| c.clear(attrs));
        }
    }

    /// Shift cells right from the cursor, dropping what falls off the line
    pub fn insert_blank_chars(&mut self, n: u16) {
        let (row, col) = {
            let cursor = self.active_cursor();
            (cursor.row as usize, cursor.col as usize)
        };
        let attrs = self.current_attrs.background_only();
        let cells = &mut self.active_screen_mut().rows[row].cells;
        if col >= cells.len() {
            return;
        }
        let n = (n as usize).min(cells.len() - col);
        cells.truncate(cells.len() - n);
        for _ in 0..n {
            cells.insert(col, Cell::blank(attrs));
        }
    }

    /// Remove cells at the cursor, pulling the rest of the line left
    pub fn delete_chars(&mut self, n: u16) {
        let (row, col) = {
            let cursor = self.active_cursor();
            (cursor.row as usize, cursor.col as usize)
        };
        let attrs = self.current_attrs.background_only();
        let cells = &mut self.active_screen_mut().rows[row].cells;
        if col >= cells.len() {
            return;
        }
        let n = (n as usize).min(cells.len() - col);
        cells.drain(col..col + n);
        cells.extend(std::iter::repeat_with(|| Cell::blank(attrs)).take(n));
    }

    /// Insert lines at cursor position (inside the scroll region)
    pub fn insert_lines(&mut self, n: u16) {
        let cursor_row = self.active_cursor().row as usize;
        let (top, bottom) = (self.scroll_region.0 as usize, self.scroll_region.1 as usize);
        if cursor_row < top || cursor_row > bottom {
            return;
        }
        let cols = self.cols;
        let attrs = self.current_attrs.background_only();
        let screen = self.active_screen_mut();
        let n = (n as usize).min(bottom + 1 - cursor_row);

        for _ in 0..n {
            screen.rows.remove(bottom);
            screen.rows.insert(cursor_row, Row::with_attrs(cols, attrs));
        }
        self.carriage_return();
    }

    /// Delete lines at cursor position (inside the scroll region)
    pub fn delete_lines(&mut self, n: u16) {
        let cursor_row = self.active_cursor().row as usize;
        let (top, bottom) = (self.scroll_region.0 as usize, self.scroll_region.1 as usize);
        if cursor_row < top || cursor_row > bottom {
            return;
        }
        let cols = self.cols;
        let attrs = self.current_attrs.background_only();
        let screen = self.active_screen_mut();
        let n = (n as usize).min(bottom + 1 - cursor_row);

        for _ in 0..n {
            screen.rows.remove(cursor_row);
            screen.rows.insert(bottom, Row::with_attrs(cols, attrs));
        }
        self.carriage_return();
    }

    /// Set scroll region (1-indexed, inclusive)
    pub fn set_scroll_region(&mut self, top: u16, bottom: u16) {
        let rows = self.rows;
        let top = top.saturating_sub(1).min(rows - 1);
        let bottom = bottom.saturating_sub(1).min(rows - 1);
        if top < bottom {
            self.scroll_region = (top, bottom);
        }
    }

    /// Save cursor position
    pub fn save_cursor(&mut self) {
        let (col, row) = {
            let cursor = self.active_cursor();
            (cursor.col, cursor.row)
        };
        let attrs = self.current_attrs;
        self.active_cursor_mut().saved = Some(SavedCursor { col, row, attrs });
    }

    /// Restore cursor position
    pub fn restore_cursor(&mut self) {
        let (rows, cols) = (self.rows, self.cols);
        if let Some(saved) = self.active_cursor().saved.clone() {
            let cursor = self.active_cursor_mut();
            cursor.col = saved.col.min(cols - 1);
            cursor.row = saved.row.min(rows - 1);
            self.current_attrs = saved.attrs;
        }
    }

    /// Set private mode
    pub fn set_private_mode(&mut self, mode: u16, enable: bool) {
        match mode {
            1 => self.modes.application_cursor = enable,
            7 => self.modes.auto_wrap = enable,
            25 => self.active_cursor_mut().visible = enable,
            47 | 1047 => {
                if enable && !self.using_alternate {
                    self.alternate_screen = ScreenBuffer::new(self.cols, self.rows);
                }
                self.using_alternate = enable;
            }
            1048 => {
                if enable {
                    self.save_cursor();
                } else {
                    self.restore_cursor();
                }
            }
            1049 => {
                if enable {
                    self.save_cursor();
                    self.using_alternate = true;
                    self.alternate_screen = ScreenBuffer::new(self.cols, self.rows);
                    self.alternate_cursor = CursorState::default();
                } else {
                    self.using_alternate = false;
                    self.restore_cursor();
                }
            }
            2004 => self.modes.bracketed_paste = enable,
            _ => {
                tracing::trace!("Ignoring private mode {} ({})", mode, enable);
            }
        }
    }

    /// Reverse index - cursor up, scroll if at top
    pub fn reverse_index(&mut self) {
        if self.active_cursor().row == self.scroll_region.0 {
            self.scroll_down(1);
        } else {
            self.cursor_up(1);
        }
    }

    /// Index - cursor down, scroll if at bottom
    pub fn index(&mut self) {
        self.linefeed();
    }
}

/// One screen's worth of rows
pub struct ScreenBuffer {
    pub rows: Vec<Row>,
}

impl ScreenBuffer {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            rows: (0..rows).map(|_| Row::new(cols)).collect(),
        }
    }
}

/// A single row
pub struct Row {
    pub cells: Vec<Cell>,
}

impl Row {
    pub fn new(cols: u16) -> Self {
        Self::with_attrs(cols, CellAttrs::default())
    }

    fn with_attrs(cols: u16, attrs: CellAttrs) -> Self {
        Self {
            cells: vec![Cell::blank(attrs); cols as usize],
        }
    }

    pub fn clear(&mut self, attrs: CellAttrs) {
        for cell in &mut self.cells {
            cell.clear(attrs);
        }
    }
}

/// A single cell
#[derive(Clone, Debug, PartialEq)]
pub struct Cell {
    pub grapheme: String,
    pub width: u8,
    pub attrs: CellAttrs,
}

impl Default for Cell {
    fn default() -> Self {
        Self::blank(CellAttrs::default())
    }
}

impl Cell {
    pub fn blank(attrs: CellAttrs) -> Self {
        Self {
            grapheme: String::new(),
            width: 1,
            attrs,
        }
    }

    pub fn clear(&mut self, attrs: CellAttrs) {
        self.grapheme.clear();
        self.width = 1;
        self.attrs = attrs;
    }

    pub fn continuation(attrs: CellAttrs) -> Self {
        Self {
            grapheme: String::new(),
            width: 0,
            attrs,
        }
    }

    pub fn is_continuation(&self) -> bool {
        self.width == 0
    }

    pub fn is_blank(&self) -> bool {
        self.grapheme.is_empty() && self.width == 1 && self.attrs == CellAttrs::default()
    }

    /// Get the display character (space if empty)
    pub fn display_char(&self) -> &str {
        if self.grapheme.is_empty() {
            " "
        } else {
            &self.grapheme
        }
    }
}

/// Cell attributes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CellAttrs {
    pub fg: Color,
    pub bg: Color,
    pub flags: AttrFlags,
}

impl CellAttrs {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Erased cells keep the current background only
    fn background_only(&self) -> Self {
        Self {
            bg: self.bg,
            ..Self::default()
        }
    }
}

/// Color definition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Color {
    #[default]
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

impl Color {
    /// Convert to crossterm color
    pub fn to_crossterm(self) -> crossterm::style::Color {
        match self {
            Color::Default => crossterm::style::Color::Reset,
            Color::Indexed(n) => crossterm::style::Color::AnsiValue(n),
            Color::Rgb(r, g, b) => crossterm::style::Color::Rgb { r, g, b },
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct AttrFlags: u16 {
        const BOLD          = 0b0000_0000_0001;
        const DIM           = 0b0000_0000_0010;
        const ITALIC        = 0b0000_0000_0100;
        const UNDERLINE     = 0b0000_0000_1000;
        const BLINK         = 0b0000_0001_0000;
        const INVERSE       = 0b0000_0010_0000;
        const HIDDEN        = 0b0000_0100_0000;
        const STRIKETHROUGH = 0b0000_1000_0000;
    }
}

/// Cursor state
#[derive(Clone, Debug)]
pub struct CursorState {
    pub col: u16,
    pub row: u16,
    pub visible: bool,
    pub saved: Option<SavedCursor>,
}

impl Default for CursorState {
    fn default() -> Self {
        Self {
            col: 0,
            row: 0,
            visible: true,
            saved: None,
        }
    }
}

/// Saved cursor state
#[derive(Clone, Debug)]
pub struct SavedCursor {
    pub col: u16,
    pub row: u16,
    pub attrs: CellAttrs,
}

/// Terminal modes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TerminalModes {
    pub application_cursor: bool,
    pub auto_wrap: bool,
    pub insert_mode: bool,
    pub linefeed_newline: bool,
    pub bracketed_paste: bool,
}

impl Default for TerminalModes {
    fn default() -> Self {
        Self {
            application_cursor: false,
            auto_wrap: true,
            insert_mode: false,
            linefeed_newline: false,
            bracketed_paste: false,
        }
    }
}
