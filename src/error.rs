//! Error types
//!
//! Each failure the bridge can report has its own type so the consumer can
//! tell a dead child (`WriteError::Disconnected`) from a broken spawn.
//! Malformed escape sequences are not errors at all: the parser absorbs them.

use std::io;
use thiserror::Error;

/// Process or PTY creation failed. No session exists afterwards.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Program not found: {0}")]
    ProgramNotFound(String),

    #[error("Failed to allocate pseudo terminal: {0}")]
    OpenPty(#[source] io::Error),

    #[error("Failed to fork child process: {0}")]
    Fork(#[source] io::Error),

    #[error("Failed to prepare PTY: {0}")]
    Io(#[source] io::Error),
}

/// Writing to the child's input failed.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Session has disconnected")]
    Disconnected,

    #[error("Failed to write to PTY: {0}")]
    Io(#[source] io::Error),
}

/// Applying a new window size to the PTY failed.
#[derive(Error, Debug)]
pub enum ResizeError {
    #[error("Session has disconnected")]
    Disconnected,

    #[error("ioctl(TIOCSWINSZ) failed: {0}")]
    Ioctl(#[source] io::Error),
}

/// Errors surfaced on the bridge's error queue.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Resize(#[from] ResizeError),

    #[error("Bridge has been shut down")]
    Closed,
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_errors_keep_message() {
        let err: BridgeError = WriteError::Disconnected.into();
        assert_eq!(err.to_string(), "Session has disconnected");
        assert!(matches!(err, BridgeError::Write(WriteError::Disconnected)));

        let err: BridgeError = SpawnError::ProgramNotFound("nope".into()).into();
        assert_eq!(err.to_string(), "Program not found: nope");
    }
}
