//! I/O pump
//!
//! The pump thread is the only code that touches both the [`Session`] and
//! the [`Terminal`]. It waits on two queues at once: inbound messages from
//! the consumer, and output events from the PTY reader thread.
//!
//! Protocol:
//! - nothing is spawned before the first `Resize`; the child starts with
//!   that size and `Ready(size)` is sent before any queued input is written
//! - every chunk of child output is decoded once and produces one `Frame`
//! - `Resize` applies the new size to the PTY first, then resets the grid
//! - EOF marks the session dead and sends exactly one `Disconnect`, after
//!   which no frames follow
//! - input is written on the session's writer thread, so a child that
//!   stops reading delays only its own input, never frames or teardown
//! - write failures go to the error queue and are never retried

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use tracing::{debug, error, info, warn};

use super::message::{InboundMessage, OutboundMessage, TermSize};
use super::session::{PtyEvent, Session, SpawnCommand, Spawner};
use super::term::Terminal;
use crate::error::{BridgeError, ResizeError, WriteError};

/// Default size of a single PTY read
pub const DEFAULT_READ_BUFFER: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// No size known yet; stdin and setup are queued
    AwaitingSize,
    Running,
    Disconnected,
}

/// Queue endpoints owned by the pump thread
pub struct PumpChannels {
    pub inbound: Receiver<InboundMessage>,
    pub outbound: Sender<OutboundMessage>,
    pub errors: Sender<BridgeError>,
    /// Set before `Disconnect` is sent so the consumer can reject stdin early
    pub disconnected: Arc<AtomicBool>,
}

pub struct Pump {
    spawner: Box<dyn Spawner>,
    command: SpawnCommand,
    read_buffer_size: usize,
    channels: PumpChannels,
    phase: Phase,
    session: Option<Session>,
    terminal: Option<Terminal>,
    /// Input received before the first resize, in arrival order
    pending: VecDeque<InboundMessage>,
    pty_tx: Sender<PtyEvent>,
    pty_rx: Receiver<PtyEvent>,
}

impl Pump {
    pub fn new(spawner: Box<dyn Spawner>, command: SpawnCommand, channels: PumpChannels) -> Self {
        let (pty_tx, pty_rx) = unbounded();
        Self {
            spawner,
            command,
            read_buffer_size: DEFAULT_READ_BUFFER,
            channels,
            phase: Phase::AwaitingSize,
            session: None,
            terminal: None,
            pending: VecDeque::new(),
            pty_tx,
            pty_rx,
        }
    }

    pub fn with_read_buffer(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Run until the inbound queue is closed, then tear the session down
    pub fn run(mut self) {
        debug!("Pump started");
        let inbound = self.channels.inbound.clone();
        let pty_rx = self.pty_rx.clone();

        loop {
            select! {
                recv(inbound) -> msg => match msg {
                    Ok(msg) => self.handle_inbound(msg),
                    Err(_) => break,
                },
                recv(pty_rx) -> event => match event {
                    Ok(PtyEvent::Output(bytes)) => self.handle_output(&bytes),
                    Ok(PtyEvent::WriteFailed(e)) => {
                        warn!("Write to child failed: {}", e);
                        self.report(WriteError::Io(e).into());
                    }
                    Ok(PtyEvent::Closed) | Err(_) => self.handle_closed(),
                },
            }
        }

        self.teardown();
    }

    fn handle_inbound(&mut self, msg: InboundMessage) {
        match (self.phase, msg) {
            (Phase::AwaitingSize, InboundMessage::Resize(size)) => self.start(size),
            (Phase::AwaitingSize, msg) => {
                debug!(?msg, "Queued until the first resize");
                self.pending.push_back(msg);
            }

            (Phase::Running, InboundMessage::Stdin(bytes)) => {
                if let Some(session) = self.session.as_mut() {
                    if let Err(e) = session.write(&bytes) {
                        warn!("Write to child failed: {}", e);
                        self.report(e.into());
                    }
                }
            }
            (Phase::Running, InboundMessage::Resize(size)) => self.resize(size),
            (Phase::Running, InboundMessage::Setup) => {
                if let Some(terminal) = self.terminal.as_ref() {
                    self.emit(OutboundMessage::Ready(terminal.size()));
                }
            }

            (Phase::Disconnected, InboundMessage::Stdin(_)) => {
                self.report(WriteError::Disconnected.into());
            }
            (Phase::Disconnected, InboundMessage::Resize(_)) => {
                self.report(ResizeError::Disconnected.into());
            }
            (Phase::Disconnected, InboundMessage::Setup) => {}
        }
    }

    /// First resize: spawn the child, acknowledge, then flush queued input
    fn start(&mut self, size: TermSize) {
        let command = self.command.with_size(size);
        let mut session = match Session::spawn(self.spawner.as_ref(), &command, size) {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to spawn {}: {}", command.program, e);
                self.report(e.into());
                self.disconnect();
                return;
            }
        };

        let started = session
            .start_reader(self.pty_tx.clone(), self.read_buffer_size)
            .and_then(|()| session.start_writer(self.pty_tx.clone()));
        if let Err(e) = started {
            error!("Failed to start PTY I/O threads: {}", e);
            self.report(crate::error::SpawnError::Io(e).into());
            drop(session);
            self.disconnect();
            return;
        }

        self.terminal = Some(Terminal::new(size));
        self.session = Some(session);
        self.phase = Phase::Running;
        self.emit(OutboundMessage::Ready(size));

        for msg in mem::take(&mut self.pending) {
            self.handle_inbound(msg);
        }
    }

    fn resize(&mut self, size: TermSize) {
        let (Some(session), Some(terminal)) = (self.session.as_mut(), self.terminal.as_mut()) else {
            return;
        };

        // The grid only follows once the kernel has the new size
        match session.resize(size) {
            Ok(()) => {
                terminal.reset(size);
                info!(%size, "Terminal resized");
            }
            Err(e) => {
                warn!("Resize to {} failed: {}", size, e);
                self.report(e.into());
            }
        }
    }

    fn handle_output(&mut self, bytes: &[u8]) {
        if self.phase != Phase::Running {
            return;
        }
        let (Some(session), Some(terminal)) = (self.session.as_mut(), self.terminal.as_mut()) else {
            return;
        };

        let responses = terminal.feed(bytes);
        for response in responses {
            if let Err(e) = session.write(&response.to_bytes()) {
                debug!(?response, "Could not answer terminal query: {}", e);
            }
        }

        let frame = terminal.snapshot();
        self.emit(OutboundMessage::Frame(frame));
    }

    fn handle_closed(&mut self) {
        if self.phase != Phase::Running {
            return;
        }
        if let Some(session) = self.session.as_ref() {
            info!(pid = session.pid(), "Child disconnected");
            session.mark_disconnected();
        }
        self.session = None;
        self.disconnect();
    }

    /// Send the one and only `Disconnect`, then fail whatever was queued
    fn disconnect(&mut self) {
        self.phase = Phase::Disconnected;
        self.channels.disconnected.store(true, Ordering::SeqCst);
        self.emit(OutboundMessage::Disconnect);

        for msg in mem::take(&mut self.pending) {
            self.handle_inbound(msg);
        }
    }

    fn teardown(&mut self) {
        if self.phase == Phase::Running {
            if let Some(session) = self.session.as_mut() {
                info!(pid = session.pid(), "Terminating child");
                session.terminate();
            }
            self.session = None;
            self.disconnect();
        }
        debug!("Pump stopped");
    }

    fn emit(&self, msg: OutboundMessage) {
        if self.channels.outbound.send(msg).is_err() {
            debug!("Outbound queue closed");
        }
    }

    fn report(&self, err: BridgeError) {
        let _ = self.channels.errors.send(err);
    }
}
