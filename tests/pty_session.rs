//! End-to-end tests against a real PTY and /bin/sh

#![cfg(unix)]

use std::time::{Duration, Instant};

use vtbridge::{
    Bridge, BridgeError, BridgeOptions, Frame, OutboundMessage, SpawnCommand, SpawnError, TermSize,
    UnixSpawner, WriteError,
};

const DEADLINE: Duration = Duration::from_secs(10);

fn sh(script: &str) -> SpawnCommand {
    SpawnCommand::new("/bin/sh")
        .args(["-c", script])
        .with_env("PATH", "/usr/bin:/bin")
        .with_env("TERM", "linux")
}

fn bridge(command: SpawnCommand) -> Bridge {
    Bridge::new(Box::new(UnixSpawner), command, BridgeOptions::default()).unwrap()
}

/// Everything up to and including `Disconnect`
fn collect(bridge: &Bridge) -> Vec<OutboundMessage> {
    let start = Instant::now();
    let mut messages = Vec::new();
    while start.elapsed() < DEADLINE {
        match bridge.outbound().recv_timeout(Duration::from_millis(100)) {
            Ok(msg) => {
                let done = msg.is_disconnect();
                messages.push(msg);
                if done {
                    return messages;
                }
            }
            Err(_) => continue,
        }
    }
    panic!("no disconnect within {:?}: {:?}", DEADLINE, messages);
}

fn last_frame(messages: &[OutboundMessage]) -> &Frame {
    messages
        .iter()
        .rev()
        .find_map(|m| match m {
            OutboundMessage::Frame(frame) => Some(frame),
            _ => None,
        })
        .expect("at least one frame")
}

fn screen_text(frame: &Frame) -> String {
    frame.lines().join("\n")
}

#[test]
fn test_output_is_decoded_into_frames() {
    let bridge = bridge(sh("printf 'hello\\r\\n\\033[1mworld'; sleep 0.2"));
    bridge.resize(5, 20).unwrap();

    let messages = collect(&bridge);
    assert!(matches!(messages[0], OutboundMessage::Ready(size) if size == TermSize::new(5, 20)));
    assert!(messages.last().unwrap().is_disconnect());
    assert_eq!(messages.iter().filter(|m| m.is_disconnect()).count(), 1);

    let frame = last_frame(&messages);
    assert_eq!(frame.rows.len(), 5);
    assert!(frame.lines()[0].starts_with("hello"));
    assert!(frame.lines()[1].starts_with("world"));
    assert!(frame.cell(1, 0).unwrap().attrs.flags.contains(vtbridge::core::term::AttrFlags::BOLD));
}

#[test]
fn test_child_sees_size_and_environment() {
    let bridge = bridge(sh("echo \"$TERM $COLUMNS $LINES\"; stty size; sleep 0.2"));
    bridge.resize(10, 40).unwrap();

    let text = screen_text(last_frame(&collect(&bridge)));
    assert!(text.contains("linux 40 10"), "{}", text);
    assert!(text.contains("10 40"), "{}", text);
}

#[test]
fn test_resize_reaches_child() {
    let bridge = bridge(sh("sleep 0.5; stty size; sleep 0.2"));
    bridge.resize(10, 40).unwrap();
    bridge.resize(20, 50).unwrap();

    let messages = collect(&bridge);
    let frame = last_frame(&messages);
    assert_eq!(frame.size, TermSize::new(20, 50));
    assert!(screen_text(frame).contains("20 50"));
}

#[test]
fn test_stdin_before_resize_is_delivered() {
    let bridge = bridge(sh("read line; echo \"got $line\"; sleep 0.2"));
    bridge.send_stdin("ping\r").unwrap();
    bridge.resize(5, 20).unwrap();

    let messages = collect(&bridge);
    assert!(matches!(messages[0], OutboundMessage::Ready(_)));
    assert!(screen_text(last_frame(&messages)).contains("got ping"));
}

#[test]
fn test_write_after_exit_fails() {
    let bridge = bridge(sh("exit 0"));
    bridge.resize(5, 20).unwrap();
    collect(&bridge);

    assert!(bridge.is_disconnected());
    assert!(matches!(
        bridge.send_stdin("too late"),
        Err(BridgeError::Write(WriteError::Disconnected))
    ));
}

#[test]
fn test_missing_program_reports_spawn_error() {
    let bridge = bridge(SpawnCommand::new("vtbridge-no-such-program").with_env("PATH", "/bin"));
    bridge.resize(5, 20).unwrap();

    let messages = collect(&bridge);
    assert_eq!(messages.len(), 1);
    let err = bridge.errors().recv_timeout(DEADLINE).unwrap();
    assert!(matches!(err, BridgeError::Spawn(SpawnError::ProgramNotFound(_))));
}

#[test]
fn test_shutdown_terminates_running_child() {
    let mut bridge = bridge(sh("sleep 30"));
    bridge.resize(5, 20).unwrap();
    assert!(matches!(
        bridge.outbound().recv_timeout(DEADLINE).unwrap(),
        OutboundMessage::Ready(_)
    ));

    let start = Instant::now();
    bridge.shutdown();
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_stdin_flood_does_not_stall_frames_or_shutdown() {
    let bridge = bridge(sh("while :; do echo tick; sleep 0.1; done"));
    bridge.resize(5, 20).unwrap();
    assert!(matches!(
        bridge.outbound().recv_timeout(DEADLINE).unwrap(),
        OutboundMessage::Ready(_)
    ));

    // Far more than the tty input queue holds; the child never reads it
    let line = format!("{}\n", "x".repeat(63));
    for _ in 0..64 {
        bridge.send_stdin(line.repeat(64)).unwrap();
    }
    while bridge.outbound().try_recv().is_ok() {}

    let start = Instant::now();
    let mut fresh_frame = false;
    while start.elapsed() < Duration::from_secs(2) {
        if let Ok(OutboundMessage::Frame(_)) = bridge.outbound().recv_timeout(Duration::from_millis(100)) {
            fresh_frame = true;
            break;
        }
    }
    assert!(fresh_frame, "no frame while input is backed up");

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    std::thread::spawn(move || {
        let mut bridge = bridge;
        bridge.shutdown();
        let _ = done_tx.send(());
    });
    assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok(), "shutdown hung");
}

#[cfg(target_os = "linux")]
#[test]
fn test_child_inherits_only_standard_fds() {
    // A second live session must not leak its PTY into the first
    let other = bridge(sh("sleep 5"));
    other.resize(5, 20).unwrap();

    let bridge = bridge(sh("ls -1 /proc/self/fd; sleep 0.2"));
    bridge.resize(10, 20).unwrap();

    let frame = last_frame(&collect(&bridge)).clone();
    let fds: Vec<String> = frame
        .lines()
        .iter()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect();
    // 0-2 plus the directory handle `ls` opens itself
    assert_eq!(fds, vec!["0", "1", "2", "3"]);
}
