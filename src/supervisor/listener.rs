//! The listener process: one configuration generation's worker pool.
//!
//! A listener is the master's own binary re-exec'd as `resqued listener`.
//! It reconstructs itself from `RESQUED_*` environment variables,
//! evaluates the config snapshot, builds its worker records (pairing them
//! against the previous generation's still-running workers), reports
//! `RUNNING` upstream, and then supervises its workers until told to shut
//! down - or until the reporting socket reaches EOF, which means the
//! master is gone and the listener quits itself.

use std::env;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::{raise, Signal};
use tracing::{debug, info, warn};

use crate::config::{self, Config};
use crate::error::{ResquedError, Result};
use crate::supervisor::signals::{SignalQueue, SupervisorSignal};
use crate::supervisor::waiter::SleepyWaiter;
use crate::supervisor::wire::{
    self, parse_pid, OldWorker, Report, ENV_CONFIG_PATH, ENV_LISTENER_ID, ENV_MASTER_VERSION,
    ENV_SOCKET, ENV_STATE,
};
use crate::supervisor::worker::WorkerRecord;

/// Longest the listener sleeps between housekeeping passes.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// Cadence of kill volleys while burning down workers.
const BURN_DOWN_PAUSE: Duration = Duration::from_secs(1);

pub struct Listener {
    id: u64,
    stream: UnixStream,
    buf: wire::LineBuffer,
    workers: Vec<WorkerRecord>,
    signals: SignalQueue,
    waiter: SleepyWaiter,
    master_gone: bool,
}

impl Listener {
    /// Reconstruct the listener from the environment the master set up.
    ///
    /// Signal handlers are installed before the config is evaluated so a
    /// slow config load cannot lose a shutdown request. Malformed
    /// optional variables are warned about and treated as empty; only the
    /// socket fd is load-bearing enough to refuse startup over.
    pub fn from_env() -> Result<Listener> {
        let socket = env::var(ENV_SOCKET).map_err(|_| ResquedError::MissingEnv(ENV_SOCKET))?;
        let fd: RawFd = parse_pid(&socket).map(|fd| fd as RawFd).ok_or_else(|| {
            ResquedError::MalformedEnv {
                name: ENV_SOCKET,
                value: socket.clone(),
            }
        })?;
        // SAFETY: the master created this fd for us, cleared its
        // close-on-exec flag, and published the number in the
        // environment; nothing else in this process owns it.
        let stream = unsafe { UnixStream::from_raw_fd(fd) };
        stream.set_nonblocking(true)?;
        // Re-arm close-on-exec so workers do not inherit the reporting
        // socket and hold it open past our own exit.
        // SAFETY: fcntl on an fd we own.
        unsafe {
            if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) == -1 {
                return Err(io::Error::last_os_error().into());
            }
        }

        let id = match env::var(ENV_LISTENER_ID) {
            Ok(raw) => match raw.parse::<u64>() {
                Ok(id) => id,
                Err(_) => {
                    warn!(value = %raw, "malformed listener id; using 0");
                    0
                }
            },
            Err(_) => 0,
        };

        let signals = SignalQueue::install(
            &[
                SupervisorSignal::Cont,
                SupervisorSignal::Quit,
                SupervisorSignal::Int,
                SupervisorSignal::Term,
            ],
            &[Signal::SIGCHLD],
        )?;
        let waiter = SleepyWaiter::new(&signals);

        let config_paths: Vec<PathBuf> = env::var(ENV_CONFIG_PATH)
            .unwrap_or_default()
            .split(':')
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect();
        let config = config::load(&config_paths)?;

        let old_workers = wire::decode_state(&env::var(ENV_STATE).unwrap_or_default());
        let workers = build_workers(&config, &old_workers);

        if let Ok(version) = env::var(ENV_MASTER_VERSION) {
            debug!(listener_id = id, master_version = %version, "listener booting");
        }

        Ok(Listener {
            id,
            stream,
            buf: wire::LineBuffer::new(),
            workers,
            signals,
            waiter,
            master_gone: false,
        })
    }

    /// Report `RUNNING`, supervise workers until a shutdown signal, then
    /// burn the workers down with that signal.
    pub fn run(mut self) -> Result<()> {
        info!(listener_id = self.id, workers = self.workers.len(), "listener running");
        self.report(Report::Running);

        let sig = self.run_workers();
        self.burn_down_workers(sig);
        info!(listener_id = self.id, "listener exiting");
        Ok(())
    }

    /// The main supervision loop. Returns the signal to shut down with.
    fn run_workers(&mut self) -> Signal {
        loop {
            self.reap_workers();
            self.drain_master();
            if !self.master_gone {
                self.start_workers();
            }

            match self.signals.pop() {
                None => {
                    let _ = self.waiter.wait(Some(self.sleep_for()), &[self.stream.as_raw_fd()]);
                }
                Some(SupervisorSignal::Cont) => {
                    debug!("forwarding CONT to workers");
                    for worker in &self.workers {
                        worker.kill(Signal::SIGCONT);
                    }
                }
                Some(SupervisorSignal::Quit) => return Signal::SIGQUIT,
                Some(SupervisorSignal::Int) => return Signal::SIGINT,
                Some(SupervisorSignal::Term) => return Signal::SIGTERM,
                // Not registered for this process kind.
                Some(_) => {}
            }
        }
    }

    /// Reap exited workers (`WNOHANG` semantics) and report each upstream.
    fn reap_workers(&mut self) {
        for i in 0..self.workers.len() {
            if let Some((pid, status)) = self.workers[i].reap() {
                info!(pid, queue_key = %self.workers[i].queue_key(), ?status, "worker exited");
                self.report(Report::WorkerFinished { pid });
            }
        }
    }

    /// Drain pids the master forwarded: each names a worker in another
    /// generation that exited, unblocking any slot waiting on it. EOF
    /// means the master itself is gone - quit ourselves.
    fn drain_master(&mut self) {
        if self.master_gone {
            return;
        }
        let mut read_buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut read_buf) {
                Ok(0) => {
                    self.master_died();
                    break;
                }
                Ok(n) => self.buf.extend(&read_buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "error reading from master");
                    self.master_died();
                    break;
                }
            }
        }

        while let Some(line) = self.buf.next_line() {
            match parse_pid(&line) {
                Some(pid) => {
                    for worker in &mut self.workers {
                        if worker.peer_exited(pid) {
                            debug!(peer = pid, queue_key = %worker.queue_key(), "worker slot unblocked");
                        }
                    }
                }
                None => warn!(%line, "unparseable message from master"),
            }
        }
    }

    /// Start every idle worker whose backoff permits, reporting each pid
    /// upstream before the next slot is considered.
    fn start_workers(&mut self) {
        for i in 0..self.workers.len() {
            if let Some(pid) = self.workers[i].try_start() {
                info!(pid, queue_key = %self.workers[i].queue_key(), "worker started");
                let queue_key = self.workers[i].queue_key().to_string();
                self.report(Report::WorkerStarted { pid, queue_key });
                if self.master_gone {
                    return;
                }
            }
        }
    }

    /// Sleep at most [`MAX_SLEEP`], or until the earliest worker backoff
    /// expires, whichever is sooner.
    fn sleep_for(&self) -> Duration {
        let mut timeout = MAX_SLEEP;
        for worker in &self.workers {
            if worker.is_startable() {
                if let Some(remaining) = worker.backing_off_for() {
                    timeout = timeout.min(remaining);
                }
            }
        }
        timeout
    }

    /// Send a report upstream. A broken pipe means the master died; the
    /// listener then quits itself via its own signal queue.
    fn report(&mut self, report: Report) {
        if self.master_gone {
            return;
        }
        if let Err(e) = wire::write_line(&mut self.stream, &report.to_string()) {
            warn!(error = %e, "reporting socket write failed");
            self.master_died();
        }
    }

    fn master_died(&mut self) {
        if self.master_gone {
            return;
        }
        warn!("master is gone; shutting down");
        self.master_gone = true;
        // Suicide by our own QUIT so the shutdown takes the normal path.
        let _ = raise(Signal::SIGQUIT);
    }

    /// Kill volleys at >=1s cadence until every worker is reaped. The
    /// overall grace period is the master's (or quit-and-wait's) problem,
    /// not measured here.
    fn burn_down_workers(&mut self, sig: Signal) {
        info!(signal = %sig, "burning down workers");
        loop {
            self.reap_workers();
            if !self.workers.iter().any(|w| w.is_running()) {
                break;
            }
            for worker in &self.workers {
                worker.kill(sig);
            }
            std::thread::sleep(BURN_DOWN_PAUSE);
        }
        // Straggler sweep: anything try_wait missed gets a blocking reap.
        for worker in &mut self.workers {
            worker.wait_blocking();
        }
    }
}

/// Build worker records from the config, pairing each inherited running
/// worker with one matching idle slot: that slot starts out blocked and
/// only becomes startable once the old pid is reported gone.
fn build_workers(config: &Config, old_workers: &[OldWorker]) -> Vec<WorkerRecord> {
    let mut workers = Vec::new();
    for pool in &config.pools {
        for _ in 0..pool.workers {
            workers.push(WorkerRecord::new(pool.queue_key(), pool.command.clone()));
        }
    }

    for old in old_workers {
        match workers
            .iter_mut()
            .find(|w| w.is_startable() && w.queue_key() == old.queue_key)
        {
            Some(worker) => worker.wait_for(old.pid),
            None => debug!(
                pid = old.pid,
                queue_key = %old.queue_key,
                "no slot for inherited worker; it will drain unmatched"
            ),
        }
    }
    workers
}
