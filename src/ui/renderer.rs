//! Frame renderer using crossterm
//!
//! Draws [`Frame`]s on the host terminal. The cursor is already part of the
//! frame (an inverted cell), so the host cursor stays hidden.

use std::io::{self, Write};

use crossterm::{
    cursor::{Hide, MoveTo, Show},
    event::{DisableBracketedPaste, EnableBracketedPaste},
    queue,
    style::{Attribute, ResetColor, SetAttribute, SetBackgroundColor, SetForegroundColor},
    terminal::{
        self, Clear, ClearType, DisableLineWrap, EnableLineWrap, EnterAlternateScreen,
        LeaveAlternateScreen, SetTitle,
    },
};

use crate::core::term::{AttrFlags, CellAttrs, Frame, FrameRow};

pub struct Renderer {
    initialized: bool,
    /// Rows drawn last time; unchanged rows are skipped
    prev_rows: Vec<FrameRow>,
    prev_title: String,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub fn new() -> Self {
        Self {
            initialized: false,
            prev_rows: Vec::new(),
            prev_title: String::new(),
        }
    }

    /// Enter raw mode and the alternate screen
    pub fn init(&mut self) -> io::Result<()> {
        terminal::enable_raw_mode()?;

        let mut stdout = io::stdout();
        queue!(
            stdout,
            EnterAlternateScreen,
            EnableBracketedPaste,
            DisableLineWrap,
            Hide,
            Clear(ClearType::All),
            MoveTo(0, 0)
        )?;
        stdout.flush()?;
        self.initialized = true;
        Ok(())
    }

    /// Restore the host terminal
    pub fn cleanup(&mut self) -> io::Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;

        let mut stdout = io::stdout();
        let _ = queue!(
            stdout,
            ResetColor,
            SetAttribute(Attribute::Reset),
            Show,
            EnableLineWrap,
            DisableBracketedPaste,
            LeaveAlternateScreen
        );
        let _ = stdout.flush();

        terminal::disable_raw_mode()
    }

    /// Forget what is on screen so the next frame is drawn in full
    pub fn invalidate(&mut self) {
        self.prev_rows.clear();
    }

    pub fn render(&mut self, frame: &Frame) -> io::Result<()> {
        let stdout = io::stdout();
        let mut stdout = io::BufWriter::with_capacity(65536, stdout.lock());
        self.render_to(&mut stdout, frame)?;
        stdout.flush()
    }

    /// Draw every row that differs from the previous frame
    pub fn render_to<W: Write>(&mut self, out: &mut W, frame: &Frame) -> io::Result<()> {
        // Begin synchronized update (reduces flicker)
        write!(out, "\x1b[?2026h")?;

        if self.prev_rows.len() != frame.rows.len() {
            queue!(out, ResetColor, SetAttribute(Attribute::Reset), Clear(ClearType::All))?;
            self.prev_rows.clear();
        }

        for (row_idx, row) in frame.rows.iter().enumerate() {
            if self.prev_rows.get(row_idx) == Some(row) {
                continue;
            }
            self.render_row(out, row_idx as u16, row)?;
        }

        if frame.title != self.prev_title {
            queue!(out, SetTitle(&frame.title))?;
            self.prev_title = frame.title.clone();
        }

        queue!(out, ResetColor, SetAttribute(Attribute::Reset))?;
        write!(out, "\x1b[?2026l")?;

        self.prev_rows = frame.rows.clone();
        Ok(())
    }

    fn render_row<W: Write>(&self, out: &mut W, row_idx: u16, row: &FrameRow) -> io::Result<()> {
        queue!(out, MoveTo(0, row_idx))?;

        let mut current_attrs: Option<CellAttrs> = None;
        let mut line_buffer = String::with_capacity(256);

        for cell in row.cells.iter().filter(|c| !c.continuation) {
            if current_attrs != Some(cell.attrs) {
                if let Some(attrs) = current_attrs {
                    self.apply_attrs(out, &attrs)?;
                    write!(out, "{}", line_buffer)?;
                    line_buffer.clear();
                }
                current_attrs = Some(cell.attrs);
            }
            line_buffer.push_str(&cell.text);
        }

        if let Some(attrs) = current_attrs {
            self.apply_attrs(out, &attrs)?;
            write!(out, "{}", line_buffer)?;
        }
        Ok(())
    }

    fn apply_attrs<W: Write>(&self, out: &mut W, attrs: &CellAttrs) -> io::Result<()> {
        queue!(out, SetAttribute(Attribute::Reset))?;

        let styles = [
            (AttrFlags::BOLD, Attribute::Bold),
            (AttrFlags::DIM, Attribute::Dim),
            (AttrFlags::ITALIC, Attribute::Italic),
            (AttrFlags::UNDERLINE, Attribute::Underlined),
            (AttrFlags::BLINK, Attribute::SlowBlink),
            (AttrFlags::INVERSE, Attribute::Reverse),
            (AttrFlags::HIDDEN, Attribute::Hidden),
            (AttrFlags::STRIKETHROUGH, Attribute::CrossedOut),
        ];
        for (flag, attribute) in styles {
            if attrs.flags.contains(flag) {
                queue!(out, SetAttribute(attribute))?;
            }
        }

        queue!(
            out,
            SetForegroundColor(attrs.fg.to_crossterm()),
            SetBackgroundColor(attrs.bg.to_crossterm())
        )?;
        Ok(())
    }

    /// Host terminal size as (cols, rows)
    pub fn size() -> io::Result<(u16, u16)> {
        terminal::size()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}
