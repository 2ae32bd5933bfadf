//! End-to-end tests against the real `resqued start` binary, observing
//! the handoff protocol through the status pipe.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tempfile::{tempdir, TempDir};

/// Fd number the master finds in --status-pipe after the pre-exec dup.
const STATUS_FD: i32 = 3;

struct MasterUnderTest {
    child: Child,
    status: Receiver<String>,
    pidfile: PathBuf,
    _dir: TempDir,
}

fn spawn_master(config_text: &str) -> MasterUnderTest {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("resqued.toml");
    let pidfile = dir.path().join("resqued.pid");
    std::fs::write(&config_path, config_text).unwrap();

    let (status_read, status_write) = nix::unistd::pipe().unwrap();
    let status_write_fd = status_write.as_raw_fd();

    let mut command = Command::new(env!("CARGO_BIN_EXE_resqued"));
    command
        .arg("start")
        .arg("--config")
        .arg(&config_path)
        .arg("--pidfile")
        .arg(&pidfile)
        .arg("--status-pipe")
        .arg(STATUS_FD.to_string());
    // SAFETY: dup2 is async-signal-safe; it pins the status pipe to a
    // known fd number in the child before exec.
    unsafe {
        command.pre_exec(move || {
            if libc::dup2(status_write_fd, STATUS_FD) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let child = command.spawn().unwrap();
    drop(status_write);

    // A reader thread turns the status pipe into a channel so every
    // expectation below can carry a deadline.
    let (tx, rx) = channel();
    let reader = BufReader::new(File::from(status_read));
    std::thread::spawn(move || {
        for line in reader.lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    MasterUnderTest {
        child,
        status: rx,
        pidfile,
        _dir: dir,
    }
}

impl MasterUnderTest {
    fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    fn signal(&self, sig: Signal) {
        kill(self.pid(), sig).unwrap();
    }

    /// Wait up to `timeout` for a status line matching `pred`; lines that
    /// do not match are remembered for the panic message but otherwise
    /// skipped.
    fn expect_status<F>(&self, what: &str, timeout: Duration, mut pred: F) -> String
    where
        F: FnMut(&StatusLine) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut seen = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.status.recv_timeout(remaining) {
                Ok(raw) => {
                    let line = StatusLine::parse(&raw);
                    if pred(&line) {
                        return raw;
                    }
                    seen.push(raw);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    panic!("never saw {}; saw instead: {:?}", what, seen);
                }
            }
        }
    }

    /// Assert that nothing matching `pred` shows up for `window`.
    fn expect_no_status<F>(&self, what: &str, window: Duration, mut pred: F)
    where
        F: FnMut(&StatusLine) -> bool,
    {
        let deadline = Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            match self.status.recv_timeout(remaining) {
                Ok(raw) => {
                    let line = StatusLine::parse(&raw);
                    assert!(!pred(&line), "unexpectedly saw {}: {}", what, raw);
                }
                Err(_) => return,
            }
        }
    }

    fn wait_for_exit(&mut self) -> i32 {
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status.code().unwrap_or(-1);
            }
            assert!(Instant::now() < deadline, "master never exited");
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for MasterUnderTest {
    fn drop(&mut self) {
        if self.child.try_wait().ok().flatten().is_none() {
            let _ = kill(self.pid(), Signal::SIGKILL);
            let _ = self.child.wait();
        }
    }
}

#[derive(Debug)]
struct StatusLine {
    kind: String,
    pid: u32,
    status: String,
}

impl StatusLine {
    fn parse(raw: &str) -> StatusLine {
        let mut parts = raw.split(',');
        let kind = parts.next().unwrap_or_default().to_string();
        let pid = parts.next().unwrap_or_default().parse().unwrap_or(0);
        let status = parts.next().unwrap_or_default().to_string();
        StatusLine { kind, pid, status }
    }

    fn is(&self, kind: &str, status: &str) -> bool {
        self.kind == kind && self.status == status
    }
}

const TWO_QUEUE_CONFIG: &str = r#"
command = ["sleep", "60"]

[[pool]]
queues = ["a"]

[[pool]]
queues = ["b"]
"#;

#[test]
fn cold_start_reload_handoff_and_graceful_shutdown() {
    let mut master = spawn_master(TWO_QUEUE_CONFIG);
    let long = Duration::from_secs(15);

    // Cold start: listener boots, promotes, and staffs both queues.
    let first = StatusLine::parse(&master.expect_status("listener start", long, |l| {
        l.is("listener", "start")
    }));
    master.expect_status("listener ready", long, |l| {
        l.is("listener", "ready") && l.pid == first.pid
    });
    let mut old_workers = HashSet::new();
    while old_workers.len() < 2 {
        let line = StatusLine::parse(&master.expect_status("worker start", long, |l| {
            l.is("worker", "start")
        }));
        old_workers.insert(line.pid);
    }

    // The pidfile names the running master.
    let recorded: u32 = std::fs::read_to_string(&master.pidfile)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert_eq!(recorded, master.child.id());

    // Reload: a second listener boots and takes over; the old generation
    // drains worker by worker and each drained slot restaffs.
    master.signal(Signal::SIGHUP);
    let second = StatusLine::parse(&master.expect_status("second listener start", long, |l| {
        l.is("listener", "start") && l.pid != first.pid
    }));
    master.expect_status("second listener ready", long, |l| {
        l.is("listener", "ready") && l.pid == second.pid
    });

    let mut stopped = HashSet::new();
    let mut new_workers = HashSet::new();
    while stopped.len() < 2 || new_workers.len() < 2 {
        let raw = master.expect_status("handoff traffic", long, |l| {
            l.kind == "worker" || l.is("listener", "stop")
        });
        let line = StatusLine::parse(&raw);
        match (line.kind.as_str(), line.status.as_str()) {
            ("worker", "stop") => {
                assert!(old_workers.contains(&line.pid), "stop for unknown {}", raw);
                stopped.insert(line.pid);
            }
            ("worker", "start") => {
                assert!(!old_workers.contains(&line.pid), "old pid restarted {}", raw);
                new_workers.insert(line.pid);
            }
            ("listener", "stop") => assert_eq!(line.pid, first.pid),
            _ => {}
        }
    }

    // Graceful shutdown reaps everything and removes the pidfile.
    master.signal(Signal::SIGQUIT);
    assert_eq!(master.wait_for_exit(), 0);
    assert!(!master.pidfile.exists());
}

#[test]
fn usr2_pauses_and_cont_resumes() {
    let mut master = spawn_master(
        r#"
        command = ["sleep", "60"]
        [[pool]]
        queues = ["mail"]
        "#,
    );
    let long = Duration::from_secs(15);

    let first = StatusLine::parse(&master.expect_status("listener start", long, |l| {
        l.is("listener", "start")
    }));
    master.expect_status("listener ready", long, |l| {
        l.is("listener", "ready") && l.pid == first.pid
    });
    master.expect_status("worker start", long, |l| l.is("worker", "start"));

    // Pause: the current listener drains and nothing replaces it.
    master.signal(Signal::SIGUSR2);
    master.expect_status("listener stop", long, |l| {
        l.is("listener", "stop") && l.pid == first.pid
    });
    master.expect_no_status("a listener start while paused", Duration::from_secs(2), |l| {
        l.is("listener", "start")
    });

    // Resume: a fresh listener boots and restaffs the queue.
    master.signal(Signal::SIGCONT);
    let second = StatusLine::parse(&master.expect_status("listener start after CONT", long, |l| {
        l.is("listener", "start")
    }));
    assert_ne!(second.pid, first.pid);
    master.expect_status("worker start after CONT", long, |l| l.is("worker", "start"));

    master.signal(Signal::SIGQUIT);
    assert_eq!(master.wait_for_exit(), 0);
}

#[test]
fn a_crash_looping_listener_is_throttled_by_backoff() {
    // Invalid TOML: every listener dies during config evaluation.
    let mut master = spawn_master("queues = [");

    let first_start = Instant::now();
    master.expect_status("first listener start", Duration::from_secs(15), |l| {
        l.is("listener", "start")
    });

    // Respawns are spaced by the growing backoff; within a few seconds we
    // see a couple of starts and never a ready.
    let mut starts = 1;
    let window = Duration::from_secs(4);
    loop {
        let remaining = window.saturating_sub(first_start.elapsed());
        if remaining.is_zero() {
            break;
        }
        match master.status.recv_timeout(remaining) {
            Ok(raw) => {
                let line = StatusLine::parse(&raw);
                assert!(!line.is("listener", "ready"), "broken config became ready");
                if line.is("listener", "start") {
                    starts += 1;
                }
            }
            Err(_) => break,
        }
    }
    assert!(
        (2..=4).contains(&starts),
        "expected throttled respawns, saw {} starts in {:?}",
        starts,
        window
    );

    master.signal(Signal::SIGQUIT);
    assert_eq!(master.wait_for_exit(), 0);
}
