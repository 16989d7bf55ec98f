//! Core bridge components.
//!
//! - **term**: VT100/VT220 terminal state, escape sequence parser and frames
//! - **session**: one child on a PTY, behind the `Pty`/`Spawner` traits
//! - **pty**: Unix PTY backend (close-on-exec pair + fork/exec)
//! - **pump**: the thread that moves bytes between session, terminal and consumer
//!
//! # Architecture
//!
//! ```text
//! consumer ──InboundMessage──▶ Pump ──write/resize──▶ Session ──▶ child
//!     ▲                         │  ▲                     │
//!     └──OutboundMessage────────┘  └──────PtyEvent───────┘ (reader/writer threads)
//!                               │
//!                           Terminal (state + parser) ──snapshot──▶ Frame
//! ```

pub mod message;
#[cfg(unix)]
pub mod pty;
pub mod pump;
pub mod session;
pub mod term;
