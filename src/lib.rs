//! vtbridge - run a full-screen terminal program behind a PTY and
//! re-render its screen as frames.
//!
//! The child is spawned on the first resize. Output is decoded by a VT
//! state machine and every chunk produces one [`Frame`]. Input goes the other
//! way as raw bytes, usually produced by the [`KeyTranslator`].
//!
//! ```no_run
//! # #[cfg(unix)]
//! # fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use vtbridge::{Bridge, BridgeConfig, OutboundMessage};
//!
//! let bridge = Bridge::from_config(&BridgeConfig::default())?;
//! bridge.resize(24, 80)?;
//! bridge.send_stdin(":q\r")?;
//! for msg in bridge.outbound().iter() {
//!     match msg {
//!         OutboundMessage::Frame(frame) => println!("{}", frame.lines().join("\n")),
//!         OutboundMessage::Ready(size) => println!("running at {}", size),
//!         OutboundMessage::Disconnect => break,
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod core;
pub mod error;
pub mod ui;

pub use bridge::{Bridge, BridgeOptions};
pub use config::BridgeConfig;
pub use crate::core::message::{InboundMessage, OutboundMessage, TermSize};
pub use crate::core::session::{Pty, Session, SpawnCommand, Spawner};
pub use crate::core::term::{Frame, FrameCell, FrameRow, Terminal};
pub use error::{BridgeError, ResizeError, SpawnError, WriteError};
pub use ui::{InputModes, Key, KeyTranslator, Modifiers};

#[cfg(unix)]
pub use crate::core::pty::{UnixPty, UnixSpawner};
