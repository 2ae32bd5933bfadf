//! Optional machine-readable status sink.
//!
//! When the master is started with `--status-pipe FD`, lifecycle records
//! are written there as `listener,<pid>,<status>` and
//! `worker,<pid>,<status>` lines. This is pure observation: writes are
//! best-effort and nothing in the supervisor depends on them.

use std::fs::File;
use std::io::Write;
use std::os::fd::{FromRawFd, RawFd};

use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub enum ListenerStatus {
    Start,
    Ready,
    Stop,
}

impl ListenerStatus {
    fn as_str(self) -> &'static str {
        match self {
            ListenerStatus::Start => "start",
            ListenerStatus::Ready => "ready",
            ListenerStatus::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum WorkerStatus {
    Start,
    Stop,
}

impl WorkerStatus {
    fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Start => "start",
            WorkerStatus::Stop => "stop",
        }
    }
}

#[derive(Debug)]
pub struct StatusSink {
    out: Option<File>,
}

impl StatusSink {
    pub fn disabled() -> StatusSink {
        StatusSink { out: None }
    }

    /// Take ownership of an inherited descriptor (`--status-pipe FD`).
    pub fn from_raw_fd(fd: RawFd) -> StatusSink {
        // SAFETY: the operator handed us this fd on the command line; we
        // are its only user and it stays owned by this sink. Setting
        // close-on-exec keeps it out of listeners and workers.
        let file = unsafe {
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            File::from_raw_fd(fd)
        };
        StatusSink { out: Some(file) }
    }

    pub fn from_file(file: File) -> StatusSink {
        StatusSink { out: Some(file) }
    }

    pub fn listener(&mut self, pid: u32, status: ListenerStatus) {
        self.emit(&format!("listener,{},{}", pid, status.as_str()));
    }

    pub fn worker(&mut self, pid: u32, status: WorkerStatus) {
        self.emit(&format!("worker,{},{}", pid, status.as_str()));
    }

    fn emit(&mut self, line: &str) {
        if let Some(out) = &mut self.out {
            if let Err(e) = writeln!(out, "{}", line) {
                debug!(error = %e, "status sink write failed");
            }
        }
    }
}
