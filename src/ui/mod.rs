//! Consumer-side helpers for the `vtbridge` host.
//!
//! - **keymapper**: logical keys and crossterm events to PTY byte sequences
//! - **renderer**: draws frames on the host terminal with crossterm

pub mod keymapper;
pub mod renderer;

pub use keymapper::{InputModes, Key, KeyTranslator, Modifiers};
pub use renderer::Renderer;
