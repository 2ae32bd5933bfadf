//! Listener-side bookkeeping for one forked worker.
//!
//! A record cycles `idle -> running -> idle` as its child process is
//! spawned and reaped, throttled by a per-worker [`Backoff`]. During a
//! handoff a record starts out `blocked` on a pid from the previous
//! listener generation and becomes `idle` only once the master reports
//! that pid gone, so two generations never drain the same queue set at
//! once. `disposed` is terminal and set only while the listener itself is
//! shutting down.

use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::backoff::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Blocked { peer: u32 },
    Disposed,
}

#[derive(Debug)]
pub struct WorkerRecord {
    queue_key: String,
    command: Vec<String>,
    state: WorkerState,
    child: Option<Child>,
    pid: Option<u32>,
    backoff: Backoff,
}

impl WorkerRecord {
    pub fn new(queue_key: String, command: Vec<String>) -> WorkerRecord {
        WorkerRecord {
            queue_key,
            command,
            state: WorkerState::Idle,
            child: None,
            pid: None,
            backoff: Backoff::new(),
        }
    }

    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, WorkerState::Running)
    }

    /// Idle and not blocked on a previous-generation worker.
    pub fn is_startable(&self) -> bool {
        matches!(self.state, WorkerState::Idle)
    }

    /// Block this slot until `peer` (a worker in an older listener) exits.
    pub fn wait_for(&mut self, peer: u32) {
        debug_assert!(matches!(self.state, WorkerState::Idle));
        self.state = WorkerState::Blocked { peer };
    }

    /// A worker pid in another generation exited; unblock if it was ours.
    pub fn peer_exited(&mut self, pid: u32) -> bool {
        if self.state == (WorkerState::Blocked { peer: pid }) {
            self.state = WorkerState::Idle;
            true
        } else {
            false
        }
    }

    /// Spawn the worker process iff the record is idle and its backoff
    /// permits. Returns the new pid on success.
    ///
    /// A spawn failure (say, a missing program) counts as a death for the
    /// backoff so a broken command cannot cause a spawn storm.
    pub fn try_start(&mut self) -> Option<u32> {
        if !self.is_startable() || self.backoff.waiting() {
            return None;
        }

        let mut command = Command::new(&self.command[0]);
        command
            .args(&self.command[1..])
            .env("QUEUES", &self.queue_key)
            .stdin(Stdio::null());

        match command.spawn() {
            Ok(child) => {
                let pid = child.id();
                self.child = Some(child);
                self.pid = Some(pid);
                self.state = WorkerState::Running;
                self.backoff.started();
                Some(pid)
            }
            Err(e) => {
                warn!(
                    queue_key = %self.queue_key,
                    program = %self.command[0],
                    error = %e,
                    "failed to spawn worker"
                );
                self.backoff.died();
                None
            }
        }
    }

    /// Non-blocking reap. Returns `(pid, status)` when the child exited;
    /// the status is `None` for the child-absent race.
    pub fn reap(&mut self) -> Option<(u32, Option<ExitStatus>)> {
        let child = self.child.as_mut()?;
        let status = match child.try_wait() {
            Ok(Some(status)) => Some(status),
            Ok(None) => return None,
            Err(e) => {
                // Already collected elsewhere; treat as exited.
                debug!(pid = self.pid, error = %e, "try_wait failed; assuming worker is gone");
                None
            }
        };
        self.finished();
        self.pid.take().map(|pid| (pid, status))
    }

    fn finished(&mut self) {
        self.child = None;
        self.state = WorkerState::Idle;
        self.backoff.died();
    }

    /// Forward a signal to the running worker. `ESRCH` means it already
    /// exited and will be reaped shortly.
    pub fn kill(&self, sig: Signal) {
        if !self.is_running() {
            return;
        }
        if let Some(pid) = self.pid {
            match kill(Pid::from_raw(pid as i32), sig) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => debug!(pid, signal = %sig, error = %e, "failed to signal worker"),
            }
        }
    }

    /// Seconds until the next legal start, or `None` if unthrottled.
    pub fn backing_off_for(&self) -> Option<Duration> {
        self.backoff.how_long()
    }

    /// Blocking reap for shutdown stragglers.
    pub fn wait_blocking(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.wait();
        }
        self.pid = None;
        self.state = WorkerState::Disposed;
    }

    /// Mark the slot terminal; the listener is going away.
    pub fn dispose(&mut self) {
        self.state = WorkerState::Disposed;
    }
}
