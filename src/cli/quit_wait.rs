//! The `quit-and-wait` subcommand: pidfile helper for process managers.
//!
//! Reads the master pid, sends `SIGQUIT`, and polls liveness with
//! `kill(pid, 0)`. Exits 0 once the process is gone. The helper gives up
//! 5 seconds *before* the grace period ends (exit 99) so its caller
//! still has time to escalate within its own deadline.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info};

use crate::error::{ResquedError, Result};
use crate::pidfile;

/// Margin reserved for the caller's own cleanup.
const GRACE_MARGIN: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub fn quit_and_wait(pidfile_path: &Path, grace_period: u64) -> Result<()> {
    let pid = pidfile::read(pidfile_path)?;

    match kill(Pid::from_raw(pid as i32), Signal::SIGQUIT) {
        Ok(()) => info!(pid, "sent QUIT"),
        Err(Errno::ESRCH) => {
            debug!(pid, "process already gone");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    let budget = Duration::from_secs(grace_period).saturating_sub(GRACE_MARGIN);
    let deadline = Instant::now() + budget;
    loop {
        if !pidfile::process_alive(pid) {
            info!(pid, "process exited");
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(ResquedError::GraceTimeout { pid });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::tempdir;

    #[test]
    fn returns_ok_for_an_already_dead_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resqued.pid");

        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        std::fs::write(&path, format!("{}\n", pid)).unwrap();

        quit_and_wait(&path, 30).unwrap();
    }

    #[test]
    fn quits_a_cooperating_process() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resqued.pid");

        // sleep dies to SIGQUIT immediately. Reap it from another thread
        // so the liveness probe sees the pid disappear rather than a
        // zombie held by this test.
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        std::fs::write(&path, format!("{}\n", child.id())).unwrap();
        let reaper = std::thread::spawn(move || {
            let _ = child.wait();
        });

        quit_and_wait(&path, 30).unwrap();
        reaper.join().unwrap();
    }

    #[test]
    fn errors_on_unreadable_pidfile() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resqued.pid");
        std::fs::write(&path, "garbage\n").unwrap();

        let err = quit_and_wait(&path, 30).unwrap_err();
        assert!(matches!(err, ResquedError::PidfileUnreadable { .. }));
    }

    #[test]
    fn errors_on_missing_pidfile() {
        let dir = tempdir().unwrap();
        let err = quit_and_wait(&dir.path().join("nope.pid"), 30).unwrap_err();
        assert!(matches!(err, ResquedError::Io(_)));
    }
}
