//! Session management
//!
//! A [`Session`] owns one child process attached to a PTY: its pid, the
//! master handle, the last applied size and the running flag. The PTY
//! itself sits behind the [`Pty`] trait so the pump can run against an
//! in-memory fake in tests.

use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use tracing::{debug, info, trace, warn};

use super::message::TermSize;
use crate::error::{ResizeError, SpawnError, WriteError};

/// Handle to a child process running on a pseudo terminal
pub trait Pty: Send {
    fn pid(&self) -> u32;

    /// A reader over the child's output. `Ok(0)` means EOF; `WouldBlock`
    /// and `TimedOut` mean nothing arrived yet.
    fn reader(&self) -> io::Result<Box<dyn Read + Send>>;

    /// A writer into the child's input. Writes that cannot make progress
    /// return `WouldBlock` after a short wait instead of blocking forever.
    fn writer(&self) -> io::Result<Box<dyn Write + Send>>;

    /// Apply a new window size so the child gets a resize notification
    fn resize(&mut self, size: TermSize) -> io::Result<()>;

    /// Best-effort, must not wait for the child to exit
    fn terminate(&mut self);
}

/// Creates PTY-attached children
pub trait Spawner: Send {
    fn spawn(&self, command: &SpawnCommand, size: TermSize) -> Result<Box<dyn Pty>, SpawnError>;
}

/// Program, arguments and environment of a child process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Explicit variables; later entries win over inherited ones
    pub env: Vec<(String, String)>,
    /// Start from a copy of the parent environment
    pub inherit_env: bool,
}

impl SpawnCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Split a shell-style command line into program and arguments
    pub fn parse(line: &str) -> Result<Self, SpawnError> {
        let mut words = shell_words::split(line)
            .map_err(|e| SpawnError::InvalidCommand(format!("{line}: {e}")))?
            .into_iter();
        let program = words
            .next()
            .ok_or_else(|| SpawnError::InvalidCommand(line.to_string()))?;
        Ok(Self {
            program,
            args: words.collect(),
            ..Self::default()
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set a variable, replacing an earlier value for the same key
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.env.retain(|(k, _)| *k != key);
        self.env.push((key, value.into()));
        self
    }

    pub fn inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    /// The same command with `COLUMNS` and `LINES` set for `size`
    pub fn with_size(&self, size: TermSize) -> Self {
        self.clone()
            .with_env("COLUMNS", size.cols.to_string())
            .with_env("LINES", size.rows.to_string())
    }

    /// The complete environment handed to the child
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = if self.inherit_env {
            std::env::vars().collect()
        } else {
            Vec::new()
        };
        for (key, value) in &self.env {
            env.retain(|(k, _)| k != key);
            env.push((key.clone(), value.clone()));
        }
        env
    }
}

/// Events from the reader and writer threads
#[derive(Debug)]
pub enum PtyEvent {
    Output(Vec<u8>),
    /// EOF or a read error. Always the last output event.
    Closed,
    /// Queued input could not be written; the session stays up
    WriteFailed(io::Error),
}

/// A running child on a PTY
pub struct Session {
    pid: u32,
    pty: Box<dyn Pty>,
    size: TermSize,
    running: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    reader_thread: Option<JoinHandle<()>>,
    /// Input queue drained by the writer thread
    input: Option<Sender<Vec<u8>>>,
    writer_thread: Option<JoinHandle<()>>,
}

impl Session {
    /// Spawn `command` on a PTY of `size`
    pub fn spawn(spawner: &dyn Spawner, command: &SpawnCommand, size: TermSize) -> Result<Self, SpawnError> {
        let pty = spawner.spawn(command, size)?;
        let pid = pty.pid();
        info!(pid, %size, program = %command.program, "Spawned child");

        Ok(Self {
            pid,
            pty,
            size,
            running: Arc::new(AtomicBool::new(true)),
            cancel: Arc::new(AtomicBool::new(false)),
            reader_thread: None,
            input: None,
            writer_thread: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn size(&self) -> TermSize {
        self.size
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the output flow. Chunks of up to `buffer_size` bytes are sent
    /// as [`PtyEvent::Output`], followed by one [`PtyEvent::Closed`].
    pub fn start_reader(&mut self, tx: Sender<PtyEvent>, buffer_size: usize) -> io::Result<()> {
        let mut reader = self.pty.reader()?;
        let running = self.running.clone();
        let cancel = self.cancel.clone();
        let pid = self.pid;

        let handle = thread::Builder::new()
            .name(format!("vtbridge-read-{pid}"))
            .spawn(move || {
                let mut buffer = vec![0u8; buffer_size.max(1)];

                loop {
                    if cancel.load(Ordering::SeqCst) {
                        debug!(pid, "Reader cancelled");
                        return;
                    }

                    match reader.read(&mut buffer) {
                        Ok(0) => break,
                        Ok(n) => {
                            trace!(pid, bytes = n, "PTY output");
                            if tx.send(PtyEvent::Output(buffer[..n].to_vec())).is_err() {
                                return;
                            }
                        }
                        Err(e)
                            if matches!(
                                e.kind(),
                                ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
                            ) =>
                        {
                            continue
                        }
                        Err(e) => {
                            debug!(pid, "PTY read failed: {}", e);
                            break;
                        }
                    }
                }

                running.store(false, Ordering::SeqCst);
                let _ = tx.send(PtyEvent::Closed);
            })?;

        self.reader_thread = Some(handle);
        Ok(())
    }

    /// Start the input flow. Bytes passed to [`Session::write`] are written
    /// in order on a separate thread, so a child that stops reading never
    /// stalls the caller. Failures arrive as [`PtyEvent::WriteFailed`].
    pub fn start_writer(&mut self, tx: Sender<PtyEvent>) -> io::Result<()> {
        let mut writer = self.pty.writer()?;
        let (input_tx, input_rx) = unbounded::<Vec<u8>>();
        let cancel = self.cancel.clone();
        let pid = self.pid;

        let handle = thread::Builder::new()
            .name(format!("vtbridge-write-{pid}"))
            .spawn(move || {
                for data in input_rx {
                    match write_queued(writer.as_mut(), &data, &cancel) {
                        Ok(true) => trace!(pid, bytes = data.len(), "PTY input"),
                        Ok(false) => {
                            debug!(pid, "Writer cancelled with input pending");
                            return;
                        }
                        Err(e) => {
                            debug!(pid, "PTY write failed: {}", e);
                            if tx.send(PtyEvent::WriteFailed(e)).is_err() {
                                return;
                            }
                        }
                    }
                }
            })?;

        self.input = Some(input_tx);
        self.writer_thread = Some(handle);
        Ok(())
    }

    /// Apply a new window size to the PTY
    pub fn resize(&mut self, size: TermSize) -> Result<(), ResizeError> {
        if !self.is_running() {
            return Err(ResizeError::Disconnected);
        }
        self.pty.resize(size).map_err(ResizeError::Ioctl)?;
        debug!(pid = self.pid, from = %self.size, to = %size, "Resized PTY");
        self.size = size;
        Ok(())
    }

    /// Queue bytes for the child's standard input. Never blocks; I/O errors
    /// are reported later by the writer thread.
    pub fn write(&mut self, data: &[u8]) -> Result<(), WriteError> {
        if !self.is_running() {
            return Err(WriteError::Disconnected);
        }
        let input = self.input.as_ref().ok_or(WriteError::Disconnected)?;
        input.send(data.to_vec()).map_err(|_| WriteError::Disconnected)
    }

    /// Mark the session terminated after the output flow reported EOF
    pub fn mark_disconnected(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Signal the child and stop the reader. Does not wait for the child.
    pub fn terminate(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.store(true, Ordering::SeqCst);
        self.pty.terminate();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.terminate();

        // Closing the queue lets the writer finish what it can, then exit
        self.input = None;
        if let Some(handle) = self.writer_thread.take() {
            if handle.join().is_err() {
                warn!(pid = self.pid, "Writer thread panicked");
            }
        }
        if let Some(handle) = self.reader_thread.take() {
            if handle.join().is_err() {
                warn!(pid = self.pid, "Reader thread panicked");
            }
        }
    }
}

/// Write all of `data`, waiting while the child is not reading. Returns
/// `Ok(false)` if `cancel` was set while the write could not make progress.
fn write_queued(writer: &mut dyn Write, mut data: &[u8], cancel: &AtomicBool) -> io::Result<bool> {
    while !data.is_empty() {
        match writer.write(data) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if cancel.load(Ordering::SeqCst) {
                    return Ok(false);
                }
            }
            Err(e) => return Err(e),
        }
    }
    writer.flush()?;
    Ok(true)
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory PTY used by the session and pump tests

    use super::*;
    use crossbeam_channel::{Receiver, RecvTimeoutError};
    use std::sync::Mutex;
    use std::time::Duration;

    /// How the fake child treats its input
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum FakeWrites {
        Accept,
        /// Never reads, like a child whose tty input queue is full
        Stall,
        Fail,
    }

    /// Everything the fake PTY observed, in order
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum FakeCall {
        Spawn(SpawnCommand, TermSize),
        Write(Vec<u8>),
        Resize(TermSize),
        Terminate,
    }

    #[derive(Clone, Default)]
    pub struct FakeLog(Arc<Mutex<Vec<FakeCall>>>);

    impl FakeLog {
        pub fn push(&self, call: FakeCall) {
            self.0.lock().unwrap().push(call);
        }

        pub fn calls(&self) -> Vec<FakeCall> {
            self.0.lock().unwrap().clone()
        }

        pub fn writes(&self) -> Vec<u8> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    FakeCall::Write(bytes) => Some(bytes),
                    _ => None,
                })
                .flatten()
                .collect()
        }

        pub fn spawn_count(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, FakeCall::Spawn(..)))
                .count()
        }
    }

    /// Output script: each sent chunk is one read; dropping the sender is EOF
    struct ChannelReader {
        rx: Receiver<Vec<u8>>,
    }

    impl Read for ChannelReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.rx.recv_timeout(Duration::from_millis(20)) {
                Ok(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    Ok(n)
                }
                Err(RecvTimeoutError::Timeout) => Err(ErrorKind::WouldBlock.into()),
                Err(RecvTimeoutError::Disconnected) => Ok(0),
            }
        }
    }

    struct FakeWriter {
        log: FakeLog,
        mode: FakeWrites,
    }

    impl Write for FakeWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.mode {
                FakeWrites::Accept => {
                    self.log.push(FakeCall::Write(buf.to_vec()));
                    Ok(buf.len())
                }
                FakeWrites::Stall => {
                    thread::sleep(Duration::from_millis(10));
                    Err(ErrorKind::WouldBlock.into())
                }
                FakeWrites::Fail => Err(ErrorKind::BrokenPipe.into()),
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    pub struct FakePty {
        log: FakeLog,
        output: Mutex<Option<Receiver<Vec<u8>>>>,
        writes: FakeWrites,
        terminated: bool,
    }

    impl Pty for FakePty {
        fn pid(&self) -> u32 {
            4242
        }

        fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
            let rx = self
                .output
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| io::Error::new(ErrorKind::Other, "reader already taken"))?;
            Ok(Box::new(ChannelReader { rx }))
        }

        fn writer(&self) -> io::Result<Box<dyn Write + Send>> {
            Ok(Box::new(FakeWriter {
                log: self.log.clone(),
                mode: self.writes,
            }))
        }

        fn resize(&mut self, size: TermSize) -> io::Result<()> {
            self.log.push(FakeCall::Resize(size));
            Ok(())
        }

        fn terminate(&mut self) {
            if !self.terminated {
                self.terminated = true;
                self.log.push(FakeCall::Terminate);
            }
        }
    }

    /// Spawner handing out one [`FakePty`] whose output is scripted through
    /// the sender returned by [`FakeSpawner::new`].
    pub struct FakeSpawner {
        log: FakeLog,
        output: Mutex<Option<Receiver<Vec<u8>>>>,
        writes: FakeWrites,
        fail: bool,
    }

    impl FakeSpawner {
        pub fn new() -> (Self, Sender<Vec<u8>>, FakeLog) {
            Self::with_writes(FakeWrites::Accept)
        }

        pub fn with_writes(writes: FakeWrites) -> (Self, Sender<Vec<u8>>, FakeLog) {
            let (tx, rx) = unbounded();
            let log = FakeLog::default();
            let spawner = Self {
                log: log.clone(),
                output: Mutex::new(Some(rx)),
                writes,
                fail: false,
            };
            (spawner, tx, log)
        }

        pub fn failing() -> (Self, FakeLog) {
            let (mut spawner, _tx, log) = Self::new();
            spawner.fail = true;
            (spawner, log)
        }
    }

    impl Spawner for FakeSpawner {
        fn spawn(&self, command: &SpawnCommand, size: TermSize) -> Result<Box<dyn Pty>, SpawnError> {
            if self.fail {
                return Err(SpawnError::ProgramNotFound(command.program.clone()));
            }
            self.log.push(FakeCall::Spawn(command.clone(), size));
            let output = self.output.lock().unwrap().take();
            Ok(Box::new(FakePty {
                log: self.log.clone(),
                output: Mutex::new(output),
                writes: self.writes,
                terminated: false,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crossbeam_channel::unbounded;
    use std::time::{Duration, Instant};

    #[test]
    fn test_parse_command_line() {
        let cmd = SpawnCommand::parse("vim -u 'my vimrc' file.txt").unwrap();
        assert_eq!(cmd.program, "vim");
        assert_eq!(cmd.args, vec!["-u", "my vimrc", "file.txt"]);

        assert!(SpawnCommand::parse("").is_err());
        assert!(SpawnCommand::parse("vim 'unterminated").is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let cmd = SpawnCommand::new("vim")
            .with_env("TERM", "xterm")
            .with_env("TERM", "linux")
            .with_size(TermSize::new(30, 100));
        assert_eq!(
            cmd.environment(),
            vec![
                ("TERM".to_string(), "linux".to_string()),
                ("COLUMNS".to_string(), "100".to_string()),
                ("LINES".to_string(), "30".to_string()),
            ]
        );
    }

    #[test]
    fn test_inherited_environment_is_overridden() {
        std::env::set_var("VTBRIDGE_SESSION_TEST", "parent");
        let env = SpawnCommand::new("sh")
            .inherit_env(true)
            .with_env("VTBRIDGE_SESSION_TEST", "child")
            .environment();
        let values: Vec<_> = env.iter().filter(|(k, _)| k == "VTBRIDGE_SESSION_TEST").collect();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].1, "child");
    }

    #[test]
    fn test_reader_reports_output_then_closed() {
        let (spawner, output, _log) = FakeSpawner::new();
        let mut session = Session::spawn(&spawner, &SpawnCommand::new("vim"), TermSize::default()).unwrap();
        let (tx, rx) = unbounded();
        session.start_reader(tx, 1024).unwrap();

        output.send(b"abc".to_vec()).unwrap();
        drop(output);

        let timeout = Duration::from_secs(2);
        assert!(matches!(rx.recv_timeout(timeout).unwrap(), PtyEvent::Output(bytes) if bytes == b"abc"));
        assert!(matches!(rx.recv_timeout(timeout).unwrap(), PtyEvent::Closed));
        assert!(!session.is_running());
    }

    #[test]
    fn test_write_after_terminate_fails() {
        let (spawner, _output, log) = FakeSpawner::new();
        let mut session = Session::spawn(&spawner, &SpawnCommand::new("vim"), TermSize::default()).unwrap();
        let (tx, _rx) = unbounded();
        session.start_writer(tx).unwrap();
        session.write(b"i").unwrap();
        session.terminate();

        assert!(matches!(session.write(b"x"), Err(WriteError::Disconnected)));
        assert!(matches!(session.resize(TermSize::new(10, 10)), Err(ResizeError::Disconnected)));
        drop(session);
        assert_eq!(log.writes(), b"i".to_vec());
        assert!(log.calls().contains(&FakeCall::Terminate));
    }

    #[test]
    fn test_write_without_writer_is_disconnected() {
        let (spawner, _output, _log) = FakeSpawner::new();
        let mut session = Session::spawn(&spawner, &SpawnCommand::new("vim"), TermSize::default()).unwrap();
        assert!(matches!(session.write(b"i"), Err(WriteError::Disconnected)));
    }

    #[test]
    fn test_stalled_child_does_not_block_writes_or_drop() {
        let (spawner, _output, log) = FakeSpawner::with_writes(FakeWrites::Stall);
        let mut session = Session::spawn(&spawner, &SpawnCommand::new("vim"), TermSize::default()).unwrap();
        let (tx, _rx) = unbounded();
        session.start_writer(tx).unwrap();

        let start = Instant::now();
        for _ in 0..64 {
            session.write(&[b'x'; 4096]).unwrap();
        }
        drop(session);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(log.writes().is_empty());
    }

    #[test]
    fn test_write_failure_is_reported_as_event() {
        let (spawner, _output, _log) = FakeSpawner::with_writes(FakeWrites::Fail);
        let mut session = Session::spawn(&spawner, &SpawnCommand::new("vim"), TermSize::default()).unwrap();
        let (tx, rx) = unbounded();
        session.start_writer(tx).unwrap();

        session.write(b"a").unwrap();
        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(event, PtyEvent::WriteFailed(e) if e.kind() == ErrorKind::BrokenPipe));
        // the session is still usable
        assert!(session.is_running());
        session.write(b"b").unwrap();
    }

    #[test]
    fn test_resize_updates_size() {
        let (spawner, _output, log) = FakeSpawner::new();
        let mut session = Session::spawn(&spawner, &SpawnCommand::new("vim"), TermSize::default()).unwrap();
        session.resize(TermSize::new(30, 100)).unwrap();
        assert_eq!(session.size(), TermSize::new(30, 100));
        assert!(log.calls().contains(&FakeCall::Resize(TermSize::new(30, 100))));
    }
}
