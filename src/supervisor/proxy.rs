//! Master-side handle for one live listener.
//!
//! Owns the child handle and the master's end of the reporting socket.
//! Parses the listener's status lines into [`ProxyEvent`]s, mirrors its
//! currently-working workers in `running_workers`, and carries the
//! master-to-listener direction of the socket (worker-exit forwarding
//! during a handoff).

use std::collections::HashMap;
use std::io::{self, Read};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::process::{Child, ExitStatus};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::wire::{LineBuffer, Report};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    /// The listener finished booting and may be promoted.
    Running,
    WorkerStarted { pid: u32, queue_key: String },
    WorkerFinished { pid: u32 },
    /// The listener's end of the socket closed.
    Eof,
}

#[derive(Debug)]
pub struct ListenerProxy {
    pid: u32,
    listener_id: u64,
    child: Child,
    stream: UnixStream,
    buf: LineBuffer,
    running_workers: HashMap<u32, String>,
    promoted: bool,
    eof: bool,
    disposed: bool,
}

impl ListenerProxy {
    pub fn new(listener_id: u64, child: Child, stream: UnixStream) -> io::Result<ListenerProxy> {
        stream.set_nonblocking(true)?;
        Ok(ListenerProxy {
            pid: child.id(),
            listener_id,
            child,
            stream,
            buf: LineBuffer::new(),
            running_workers: HashMap::new(),
            promoted: false,
            eof: false,
            disposed: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn listener_id(&self) -> u64 {
        self.listener_id
    }

    /// Has this listener reported `RUNNING`?
    pub fn is_promoted(&self) -> bool {
        self.promoted
    }

    /// Workers this listener currently has working, pid -> queue key.
    pub fn running_workers(&self) -> &HashMap<u32, String> {
        &self.running_workers
    }

    /// The socket fd to select on, while it is still worth watching.
    pub fn watch_fd(&self) -> Option<RawFd> {
        if self.eof || self.disposed {
            None
        } else {
            Some(self.stream.as_raw_fd())
        }
    }

    /// Drain everything readable from the reporting socket and return the
    /// parsed events in arrival order. The `running_workers` mirror is
    /// updated as a side effect. `Eof` is reported at most once.
    pub fn poll_events(&mut self) -> Vec<ProxyEvent> {
        let mut events = Vec::new();
        if self.eof || self.disposed {
            return events;
        }

        let mut read_buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut read_buf) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => self.buf.extend(&read_buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(pid = self.pid, error = %e, "reporting socket read failed");
                    self.eof = true;
                    break;
                }
            }
        }

        while let Some(line) = self.buf.next_line() {
            match Report::parse(&line) {
                Some(Report::Running) => {
                    self.promoted = true;
                    events.push(ProxyEvent::Running);
                }
                Some(Report::WorkerStarted { pid, queue_key }) => {
                    self.running_workers.insert(pid, queue_key.clone());
                    events.push(ProxyEvent::WorkerStarted { pid, queue_key });
                }
                Some(Report::WorkerFinished { pid }) => {
                    if self.running_workers.remove(&pid).is_none() {
                        // Ordering guarantee from the listener: "-pid"
                        // only ever follows "+pid".
                        warn!(listener = self.pid, pid, "worker finished without a start report");
                    }
                    events.push(ProxyEvent::WorkerFinished { pid });
                }
                None => warn!(listener = self.pid, %line, "unparseable report line"),
            }
        }

        if self.eof {
            events.push(ProxyEvent::Eof);
        }
        events
    }

    /// Tell this listener that a worker pid in another generation exited,
    /// unblocking any worker slot waiting on it.
    pub fn forward_worker_exit(&mut self, pid: u32) {
        if self.eof || self.disposed {
            return;
        }
        if let Err(e) = super::wire::write_line(&mut self.stream, &pid.to_string()) {
            debug!(listener = self.pid, error = %e, "could not forward worker exit");
        }
    }

    /// Signal the listener process; `ESRCH` means it is already gone.
    pub fn kill(&self, sig: Signal) {
        match kill(Pid::from_raw(self.pid as i32), sig) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => debug!(pid = self.pid, signal = %sig, error = %e, "failed to signal listener"),
        }
    }

    /// Non-blocking reap. Outer `Some` means the listener exited; the
    /// inner status is `None` for the child-absent race.
    pub fn try_reap(&mut self) -> Option<Option<ExitStatus>> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(Some(status)),
            Ok(None) => None,
            Err(e) => {
                debug!(pid = self.pid, error = %e, "try_wait failed; assuming listener is gone");
                Some(None)
            }
        }
    }

    /// Close the socket and release resources. Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        let _ = self.stream.shutdown(Shutdown::Both);
        self.running_workers.clear();
    }
}
