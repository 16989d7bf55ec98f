//! Unix pseudo-terminal backend
//!
//! Allocates a PTY pair, forks, and execs the child on the slave side as
//! its controlling terminal. The parent keeps the master fd for reading,
//! writing and window size changes. Both ends are close-on-exec from the
//! moment they exist, so concurrent spawns never leak them to each other.

use std::ffi::{CString, OsStr};
use std::io::{self, ErrorKind, Read, Write};
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::ptr;
#[cfg(not(target_os = "linux"))]
use std::sync::Mutex;
use std::thread;

use tracing::{debug, warn};

use super::message::TermSize;
use super::session::{Pty, SpawnCommand, Spawner};
use crate::error::SpawnError;

/// I/O threads wake up this often to notice cancellation
const POLL_TIMEOUT_MS: libc::c_int = 100;

/// Used when neither the command nor the parent defines `PATH`
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Spawns children under a fresh Unix PTY
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixSpawner;

impl Spawner for UnixSpawner {
    fn spawn(&self, command: &SpawnCommand, size: TermSize) -> Result<Box<dyn Pty>, SpawnError> {
        let pty = UnixPty::spawn(command, size)?;
        Ok(Box::new(pty))
    }
}

/// A child process attached to the slave side of a PTY
pub struct UnixPty {
    master_fd: RawFd,
    child_pid: libc::pid_t,
    terminated: bool,
}

impl UnixPty {
    pub fn spawn(command: &SpawnCommand, size: TermSize) -> Result<Self, SpawnError> {
        let env = command.environment();
        let program = resolve_program(&command.program, env_path(&env).as_deref())?;

        // Everything the child needs is allocated before fork
        let path = CString::new(program.as_os_str().as_bytes())
            .map_err(|_| SpawnError::InvalidCommand(command.program.clone()))?;
        let mut argv = Vec::with_capacity(command.args.len() + 1);
        argv.push(to_cstring(&command.program)?);
        for arg in &command.args {
            argv.push(to_cstring(arg)?);
        }
        let envp = env
            .iter()
            .map(|(key, value)| to_cstring(&format!("{key}={value}")))
            .collect::<Result<Vec<_>, _>>()?;

        let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|s| s.as_ptr()).collect();
        argv_ptrs.push(ptr::null());
        let mut envp_ptrs: Vec<*const libc::c_char> = envp.iter().map(|s| s.as_ptr()).collect();
        envp_ptrs.push(ptr::null());

        // SAFETY: all pointers handed to the child point into CStrings that
        // outlive the fork; the child only calls async-signal-safe functions.
        let (master_fd, child_pid) = unsafe { spawn_child(&path, &argv_ptrs, &envp_ptrs, size)? };

        debug!(pid = child_pid, program = %program.display(), "Forked PTY child");
        Ok(Self {
            master_fd,
            child_pid,
            terminated: false,
        })
    }
}

impl Pty for UnixPty {
    fn pid(&self) -> u32 {
        self.child_pid as u32
    }

    fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
        let fd = dup_master(self.master_fd)?;
        Ok(Box::new(FdReader { fd }))
    }

    fn writer(&self) -> io::Result<Box<dyn Write + Send>> {
        let fd = dup_master(self.master_fd)?;
        // O_NONBLOCK is shared with the reader's fd, which only reads after poll.
        // SAFETY: fd was just duplicated and is owned here.
        if let Err(err) = unsafe { set_nonblocking(fd) } {
            unsafe { close_fd(fd) };
            return Err(err);
        }
        Ok(Box::new(FdWriter { fd }))
    }

    fn resize(&mut self, size: TermSize) -> io::Result<()> {
        let ws = winsize(size);
        // SAFETY: ws is initialized and master_fd is open.
        if unsafe { libc::ioctl(self.master_fd, libc::TIOCSWINSZ, &ws) } != 0 {
            return Err(io::Error::last_os_error());
        }
        if !self.terminated {
            // SAFETY: the pid belongs to our child and has not been reaped yet.
            let _ = unsafe { libc::kill(self.child_pid, libc::SIGWINCH) };
        }
        Ok(())
    }

    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        let pid = self.child_pid;
        // SAFETY: the pid is reaped only by the thread below, after these signals.
        unsafe {
            if libc::kill(pid, libc::SIGHUP) != 0 {
                debug!(pid, "SIGHUP failed: {}", io::Error::last_os_error());
            }
            let _ = libc::kill(pid, libc::SIGTERM);
        }

        // Reap without blocking the caller
        let spawned = thread::Builder::new()
            .name(format!("vtbridge-reap-{pid}"))
            .spawn(move || {
                let mut status = 0;
                // SAFETY: waitpid on our own child; status is a valid out pointer.
                let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
                if ret < 0 {
                    debug!(pid, "waitpid failed: {}", io::Error::last_os_error());
                } else {
                    debug!(pid, status, "Child reaped");
                }
            });
        if let Err(err) = spawned {
            warn!(pid, "Could not start reaper thread: {}", err);
        }
    }
}

impl Drop for UnixPty {
    fn drop(&mut self) {
        self.terminate();
        // SAFETY: master_fd is owned by self and closed exactly once.
        unsafe {
            close_fd(self.master_fd);
        }
    }
}

/// Blocking reader over a duplicated master fd.
///
/// Waits at most `POLL_TIMEOUT_MS` per call and reports `WouldBlock` when
/// nothing arrived, so the caller can check for cancellation. `EIO` from the
/// master means the slave side closed and is reported as EOF.
struct FdReader {
    fd: RawFd,
}

impl Read for FdReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd is a single valid pollfd.
        let ready = unsafe { libc::poll(&mut pfd, 1, POLL_TIMEOUT_MS) };
        if ready < 0 {
            return Err(io::Error::last_os_error());
        }
        if ready == 0 {
            return Err(ErrorKind::WouldBlock.into());
        }

        // SAFETY: buf is a valid writable slice and fd is open.
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EIO) {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(n as usize)
    }
}

impl Drop for FdReader {
    fn drop(&mut self) {
        // SAFETY: fd is owned by this reader.
        unsafe {
            close_fd(self.fd);
        }
    }
}

/// Non-blocking writer over a duplicated master fd.
///
/// When the child's input queue is full, waits at most `POLL_TIMEOUT_MS`
/// and then reports `WouldBlock`.
struct FdWriter {
    fd: RawFd,
}

impl Write for FdWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLOUT,
            revents: 0,
        };
        // SAFETY: pfd is a single valid pollfd.
        let ready = unsafe { libc::poll(&mut pfd, 1, POLL_TIMEOUT_MS) };
        if ready < 0 {
            return Err(io::Error::last_os_error());
        }
        if ready == 0 {
            return Err(ErrorKind::WouldBlock.into());
        }

        // SAFETY: buf is a valid slice and fd is open.
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for FdWriter {
    fn drop(&mut self) {
        // SAFETY: fd is owned by this writer.
        unsafe {
            close_fd(self.fd);
        }
    }
}

fn dup_master(master_fd: RawFd) -> io::Result<RawFd> {
    // SAFETY: master_fd is open for the lifetime of the caller; the duplicate
    // belongs to whoever receives it.
    let fd = unsafe { libc::fcntl(master_fd, libc::F_DUPFD_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Open a master/slave pair with `O_CLOEXEC` set atomically on both ends.
///
/// # Safety
///
/// The caller owns both returned fds.
#[cfg(target_os = "linux")]
unsafe fn open_pty_pair(ws: &libc::winsize) -> io::Result<(RawFd, RawFd)> {
    let master_fd = libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY | libc::O_CLOEXEC);
    if master_fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let fail = |master_fd: RawFd| {
        let err = io::Error::last_os_error();
        close_fd(master_fd);
        err
    };

    if libc::grantpt(master_fd) != 0 || libc::unlockpt(master_fd) != 0 {
        return Err(fail(master_fd));
    }
    let mut name = [0 as libc::c_char; 128];
    if libc::ptsname_r(master_fd, name.as_mut_ptr(), name.len()) != 0 {
        return Err(fail(master_fd));
    }
    let slave_fd = libc::open(name.as_ptr(), libc::O_RDWR | libc::O_NOCTTY | libc::O_CLOEXEC);
    if slave_fd < 0 {
        return Err(fail(master_fd));
    }
    if libc::ioctl(master_fd, libc::TIOCSWINSZ, ws) != 0 {
        let err = io::Error::last_os_error();
        close_fd(slave_fd);
        close_fd(master_fd);
        return Err(err);
    }
    Ok((master_fd, slave_fd))
}

/// Held from `openpty` until after `fork` where no atomic close-on-exec
/// allocation exists.
#[cfg(not(target_os = "linux"))]
static SPAWN_LOCK: Mutex<()> = Mutex::new(());

/// # Safety
///
/// The caller owns both returned fds and must fork before releasing
/// `SPAWN_LOCK`.
#[cfg(not(target_os = "linux"))]
unsafe fn open_pty_pair(ws: &libc::winsize) -> io::Result<(RawFd, RawFd)> {
    let mut master_fd: RawFd = -1;
    let mut slave_fd: RawFd = -1;
    let mut ws = *ws;

    #[allow(clippy::unnecessary_mut_passed)]
    if libc::openpty(&mut master_fd, &mut slave_fd, ptr::null_mut(), ptr::null_mut(), &mut ws) != 0 {
        return Err(io::Error::last_os_error());
    }
    if let Err(err) = set_cloexec(master_fd).and_then(|_| set_cloexec(slave_fd)) {
        close_fd(master_fd);
        close_fd(slave_fd);
        return Err(err);
    }
    Ok((master_fd, slave_fd))
}

/// Fork a child on a new PTY and exec `path`.
///
/// # Safety
///
/// `argv` and `envp` must be null-terminated arrays of pointers into live
/// C strings. The caller owns the returned master fd.
unsafe fn spawn_child(
    path: &CString,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
    size: TermSize,
) -> Result<(RawFd, libc::pid_t), SpawnError> {
    #[cfg(not(target_os = "linux"))]
    let _guard = SPAWN_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    let (master_fd, slave_fd) = open_pty_pair(&winsize(size)).map_err(SpawnError::OpenPty)?;

    let pid = libc::fork();
    if pid < 0 {
        let err = io::Error::last_os_error();
        close_fd(master_fd);
        close_fd(slave_fd);
        return Err(SpawnError::Fork(err));
    }

    if pid == 0 {
        child_exec(master_fd, slave_fd, path, argv, envp);
    }

    close_fd(slave_fd);
    Ok((master_fd, pid))
}

/// Runs in the forked child. Never returns.
///
/// # Safety
///
/// Must only be called in the child right after `fork()`. Only
/// async-signal-safe functions are used; no allocation happens here.
unsafe fn child_exec(
    master_fd: RawFd,
    slave_fd: RawFd,
    path: &CString,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
) -> ! {
    let fail = |msg: &[u8]| -> ! {
        let _ = libc::write(libc::STDERR_FILENO, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::_exit(127);
    };

    libc::close(master_fd);

    if libc::setsid() == -1 {
        fail(b"vtbridge: setsid failed\n");
    }
    if libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) == -1 {
        fail(b"vtbridge: ioctl(TIOCSCTTY) failed\n");
    }
    if libc::dup2(slave_fd, libc::STDIN_FILENO) < 0
        || libc::dup2(slave_fd, libc::STDOUT_FILENO) < 0
        || libc::dup2(slave_fd, libc::STDERR_FILENO) < 0
    {
        fail(b"vtbridge: dup2 failed\n");
    }
    if slave_fd > libc::STDERR_FILENO {
        libc::close(slave_fd);
    }

    // The Rust runtime ignores SIGPIPE; the child expects the default.
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    let mut empty: libc::sigset_t = mem::zeroed();
    libc::sigemptyset(&mut empty);
    libc::sigprocmask(libc::SIG_SETMASK, &empty, ptr::null_mut());

    libc::execve(path.as_ptr(), argv.as_ptr(), envp.as_ptr());
    fail(b"vtbridge: execve failed\n");
}

fn winsize(size: TermSize) -> libc::winsize {
    libc::winsize {
        ws_row: size.rows.max(1),
        ws_col: size.cols.max(1),
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = libc::fcntl(fd, libc::F_GETFD);
    if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

unsafe fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = libc::fcntl(fd, libc::F_GETFL);
    if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

unsafe fn close_fd(fd: RawFd) {
    if fd >= 0 {
        let _ = libc::close(fd);
    }
}

fn to_cstring(value: &str) -> Result<CString, SpawnError> {
    CString::new(value).map_err(|_| SpawnError::InvalidCommand(value.to_string()))
}

fn env_path(env: &[(String, String)]) -> Option<String> {
    env.iter()
        .find(|(key, _)| key == "PATH")
        .map(|(_, value)| value.clone())
        .or_else(|| std::env::var("PATH").ok())
}

/// Find the executable the way `execvp` would, but in the parent so a
/// missing program is reported as an error instead of a dead child.
fn resolve_program(program: &str, path: Option<&str>) -> Result<PathBuf, SpawnError> {
    if program.is_empty() {
        return Err(SpawnError::InvalidCommand(program.to_string()));
    }
    if program.contains('/') {
        let candidate = PathBuf::from(program);
        return if is_executable(&candidate) {
            Ok(candidate)
        } else {
            Err(SpawnError::ProgramNotFound(program.to_string()))
        };
    }

    let search = path.unwrap_or(DEFAULT_PATH);
    std::env::split_paths(OsStr::new(search))
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| SpawnError::ProgramNotFound(program.to_string()))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
