//! Consumer-side handle
//!
//! A [`Bridge`] owns the pump thread and the consumer ends of its queues.
//! Send [`InboundMessage`]s in, receive [`OutboundMessage`]s and
//! [`BridgeError`]s out. Dropping the bridge terminates the child.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::config::BridgeConfig;
use crate::core::message::{InboundMessage, OutboundMessage, TermSize};
use crate::core::pump::{Pump, PumpChannels, DEFAULT_READ_BUFFER};
use crate::core::session::{SpawnCommand, Spawner};
use crate::error::{BridgeError, Result, SpawnError, WriteError};

/// Queue and buffer sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeOptions {
    pub read_buffer_size: usize,
    pub outbound_capacity: Option<usize>,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER,
            outbound_capacity: None,
        }
    }
}

impl From<&BridgeConfig> for BridgeOptions {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            read_buffer_size: config.read_buffer_size,
            outbound_capacity: config.outbound_capacity,
        }
    }
}

pub struct Bridge {
    inbound: Option<Sender<InboundMessage>>,
    outbound: Receiver<OutboundMessage>,
    errors: Receiver<BridgeError>,
    disconnected: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

impl Bridge {
    /// Start a pump for `command`. The child is spawned by `spawner` on the
    /// first resize.
    pub fn new(spawner: Box<dyn Spawner>, command: SpawnCommand, options: BridgeOptions) -> std::io::Result<Self> {
        let (in_tx, in_rx) = unbounded();
        let (out_tx, out_rx) = match options.outbound_capacity {
            Some(capacity) => bounded(capacity.max(1)),
            None => unbounded(),
        };
        let (err_tx, err_rx) = unbounded();
        let disconnected = Arc::new(AtomicBool::new(false));

        let channels = PumpChannels {
            inbound: in_rx,
            outbound: out_tx,
            errors: err_tx,
            disconnected: disconnected.clone(),
        };
        let pump = Pump::new(spawner, command, channels).with_read_buffer(options.read_buffer_size);
        let handle = thread::Builder::new()
            .name("vtbridge-pump".to_string())
            .spawn(move || pump.run())?;

        Ok(Self {
            inbound: Some(in_tx),
            outbound: out_rx,
            errors: err_rx,
            disconnected,
            pump: Some(handle),
        })
    }

    /// Bridge running `config.command` on a Unix PTY
    #[cfg(unix)]
    pub fn from_config(config: &BridgeConfig) -> std::result::Result<Self, SpawnError> {
        let command = config.spawn_command()?;
        Self::new(Box::new(crate::core::pty::UnixSpawner), command, config.into()).map_err(SpawnError::Io)
    }

    pub fn send(&self, msg: InboundMessage) -> Result<()> {
        if matches!(msg, InboundMessage::Stdin(_)) && self.is_disconnected() {
            return Err(WriteError::Disconnected.into());
        }
        let inbound = self.inbound.as_ref().ok_or(BridgeError::Closed)?;
        inbound.send(msg).map_err(|_| BridgeError::Closed)
    }

    /// Queue bytes for the child's standard input. Fails once the child is
    /// known to be gone.
    pub fn send_stdin(&self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        self.send(InboundMessage::Stdin(bytes.into()))
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.send(InboundMessage::Resize(TermSize::new(rows, cols)))
    }

    pub fn setup(&self) -> Result<()> {
        self.send(InboundMessage::Setup)
    }

    /// Frames, acknowledgements and the final `Disconnect`
    pub fn outbound(&self) -> &Receiver<OutboundMessage> {
        &self.outbound
    }

    /// Failures that do not end the session by themselves
    pub fn errors(&self) -> &Receiver<BridgeError> {
        &self.errors
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Terminate the child and stop the pump. Undelivered outbound messages
    /// are discarded.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.pump.take() else {
            return;
        };
        drop(self.inbound.take());

        // Keep a bounded queue moving so the pump can reach its exit
        for _ in self.outbound.iter() {}

        if handle.join().is_err() {
            warn!("Pump thread panicked");
        }
        debug!("Bridge shut down");
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::testing::{FakeCall, FakeSpawner};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[test]
    fn test_stdin_rejected_after_disconnect() {
        let (spawner, output, _log) = FakeSpawner::new();
        let bridge = Bridge::new(Box::new(spawner), SpawnCommand::new("vim"), BridgeOptions::default()).unwrap();
        bridge.resize(24, 80).unwrap();
        assert!(matches!(bridge.outbound().recv_timeout(TIMEOUT).unwrap(), OutboundMessage::Ready(_)));

        drop(output);
        assert!(bridge.outbound().recv_timeout(TIMEOUT).unwrap().is_disconnect());
        assert!(bridge.is_disconnected());
        assert!(matches!(
            bridge.send_stdin("x"),
            Err(BridgeError::Write(WriteError::Disconnected))
        ));
    }

    #[test]
    fn test_shutdown_with_full_bounded_queue() {
        let (spawner, output, log) = FakeSpawner::new();
        let options = BridgeOptions {
            outbound_capacity: Some(1),
            ..BridgeOptions::default()
        };
        let mut bridge = Bridge::new(Box::new(spawner), SpawnCommand::new("vim"), options).unwrap();
        bridge.resize(24, 80).unwrap();
        for _ in 0..5 {
            output.send(b"x".to_vec()).unwrap();
        }

        bridge.shutdown();
        assert!(log.calls().contains(&FakeCall::Terminate));
        assert!(matches!(bridge.setup(), Err(BridgeError::Closed)));
    }

    #[test]
    fn test_bounded_queue_keeps_order() {
        let (spawner, output, _log) = FakeSpawner::new();
        let options = BridgeOptions {
            outbound_capacity: Some(1),
            ..BridgeOptions::default()
        };
        let bridge = Bridge::new(Box::new(spawner), SpawnCommand::new("vim"), options).unwrap();
        bridge.resize(1, 10).unwrap();
        for chunk in ["1", "2", "3"] {
            output.send(chunk.as_bytes().to_vec()).unwrap();
        }
        drop(output);

        let mut lines = Vec::new();
        loop {
            match bridge.outbound().recv_timeout(TIMEOUT).unwrap() {
                OutboundMessage::Frame(frame) => lines.push(frame.lines()[0].trim_end().to_string()),
                OutboundMessage::Ready(_) => {}
                OutboundMessage::Disconnect => break,
            }
        }
        assert_eq!(lines, vec!["1", "12", "123"]);
    }
}
