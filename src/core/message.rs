//! Messages exchanged between the consumer and the I/O pump.

use super::term::Frame;

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TermSize {
    pub rows: u16,
    pub cols: u16,
}

impl TermSize {
    /// Create a size, clamping both dimensions to at least one cell.
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            rows: rows.max(1),
            cols: cols.max(1),
        }
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl std::fmt::Display for TermSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Consumer -> pump
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Raw bytes for the child's standard input
    Stdin(Vec<u8>),
    /// New terminal dimensions. The first one spawns the child.
    Resize(TermSize),
    /// Ask the pump to re-announce the applied size
    Setup,
}

impl InboundMessage {
    pub fn stdin(bytes: impl Into<Vec<u8>>) -> Self {
        InboundMessage::Stdin(bytes.into())
    }

    pub fn resize(rows: u16, cols: u16) -> Self {
        InboundMessage::Resize(TermSize::new(rows, cols))
    }
}

/// Pump -> consumer
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// The child runs with this size; sent once after spawn and on `Setup`
    Ready(TermSize),
    /// One rendered snapshot per chunk of child output
    Frame(Frame),
    /// The child is gone. Always the last message.
    Disconnect,
}

impl OutboundMessage {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, OutboundMessage::Disconnect)
    }
}
