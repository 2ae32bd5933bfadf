//! The master process: top-level supervisor of listener generations.
//!
//! The master owns at most one *current* listener (the generation allowed
//! to fork new workers) and, during a reload, one *last-good* listener
//! still draining its workers. Reloads hand off queue-by-queue: the new
//! listener inherits the union of every live generation's running workers
//! through `RESQUED_STATE`, starts the matching slots blocked, and the
//! master forwards each old worker's exit over the new listener's socket
//! so its replacement may start.
//!
//! Signal cheat-sheet: `HUP` reload, `USR2` pause, `CONT` resume,
//! `INT`/`TERM`/`QUIT` shutdown (propagated to listeners; waits for them
//! to drain unless `--fast-exit`), `CHLD` wakes the loop for reaping.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::logging::LogHandle;
use crate::pidfile::Pidfile;
use crate::supervisor::backoff::Backoff;
use crate::supervisor::proxy::{ListenerProxy, ProxyEvent};
use crate::supervisor::signals::{SignalQueue, SupervisorSignal};
use crate::supervisor::status::{ListenerStatus, StatusSink, WorkerStatus};
use crate::supervisor::waiter::SleepyWaiter;
use crate::supervisor::wire::{
    encode_state, OldWorker, ENV_CONFIG_PATH, ENV_LISTENER_ID, ENV_MASTER_VERSION, ENV_SOCKET,
    ENV_STATE,
};

/// Longest the master sleeps between housekeeping passes.
const MAX_SLEEP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct MasterOptions {
    pub config_paths: Vec<PathBuf>,
    pub pidfile: Option<PathBuf>,
    pub exec_on_hup: bool,
    pub fast_exit: bool,
    pub status_pipe: Option<RawFd>,
}

pub struct Master {
    opts: MasterOptions,
    paused: bool,
    /// Pid of the listener allowed to fork new workers.
    current: Option<u32>,
    /// Pid of the previous generation still draining during a handoff.
    last_good: Option<u32>,
    /// Every listener the master has spawned and not yet reaped.
    listeners: HashMap<u32, ListenerProxy>,
    /// Monotonic id source; listener ids are never reused.
    listeners_created: u64,
    listener_backoff: Backoff,
    signals: SignalQueue,
    waiter: SleepyWaiter,
    status: StatusSink,
    log: LogHandle,
}

impl Master {
    pub fn new(opts: MasterOptions, log: LogHandle) -> Result<Master> {
        let signals = SignalQueue::install(
            &[
                SupervisorSignal::Hup,
                SupervisorSignal::Usr2,
                SupervisorSignal::Cont,
                SupervisorSignal::Int,
                SupervisorSignal::Term,
                SupervisorSignal::Quit,
            ],
            &[Signal::SIGCHLD],
        )?;
        let waiter = SleepyWaiter::new(&signals);
        let status = match opts.status_pipe {
            Some(fd) => StatusSink::from_raw_fd(fd),
            None => StatusSink::disabled(),
        };

        Ok(Master {
            opts,
            paused: false,
            current: None,
            last_good: None,
            listeners: HashMap::new(),
            listeners_created: 0,
            listener_backoff: Backoff::new(),
            signals,
            waiter,
            status,
            log,
        })
    }

    /// Supervise until a shutdown signal arrives and all listeners drain.
    pub fn run(&mut self) -> Result<()> {
        let _pidfile = match &self.opts.pidfile {
            Some(path) => Some(Pidfile::acquire(path)?),
            None => None,
        };
        info!(pid = std::process::id(), version = env!("CARGO_PKG_VERSION"), "master started");

        loop {
            self.drain_listeners();
            self.reap_listeners();
            self.maybe_spawn_listener();

            match self.signals.pop() {
                None => self.sleep(),
                Some(SupervisorSignal::Hup) => self.reload(),
                Some(SupervisorSignal::Usr2) => self.pause(),
                Some(SupervisorSignal::Cont) => self.resume(),
                Some(sig) => {
                    self.shutdown(sig.as_nix());
                    break;
                }
            }
        }

        info!("master exiting");
        Ok(())
    }

    /// Consume everything the listeners reported since the last pass.
    fn drain_listeners(&mut self) {
        let pids: Vec<u32> = self.listeners.keys().copied().collect();
        for pid in pids {
            let events = match self.listeners.get_mut(&pid) {
                Some(proxy) => proxy.poll_events(),
                None => continue,
            };
            for event in events {
                match event {
                    ProxyEvent::Running => self.listener_running(pid),
                    ProxyEvent::WorkerStarted { pid: worker_pid, queue_key } => {
                        debug!(listener = pid, worker = worker_pid, %queue_key, "worker started");
                        self.status.worker(worker_pid, WorkerStatus::Start);
                    }
                    ProxyEvent::WorkerFinished { pid: worker_pid } => {
                        self.worker_finished(pid, worker_pid);
                    }
                    ProxyEvent::Eof => {
                        debug!(listener = pid, "reporting socket closed");
                    }
                }
            }
        }
    }

    /// A listener finished booting. If it is the current one, the
    /// previous generation can start draining; a stale boot (already
    /// replaced by a newer HUP) is told to drain instead.
    fn listener_running(&mut self, pid: u32) {
        info!(listener = pid, "listener ready");
        self.status.listener(pid, ListenerStatus::Ready);

        if self.current == Some(pid) {
            if let Some(old) = self.last_good.take() {
                info!(old_listener = old, "handing off; draining previous generation");
                self.kill_listener(old, Signal::SIGQUIT);
            }
        } else {
            debug!(listener = pid, "stale listener became ready; draining it");
            self.kill_listener(pid, Signal::SIGQUIT);
        }
    }

    /// A worker exited somewhere. Forward its pid to the current listener
    /// so a blocked replacement slot may start.
    fn worker_finished(&mut self, from: u32, worker_pid: u32) {
        debug!(listener = from, worker = worker_pid, "worker finished");
        self.status.worker(worker_pid, WorkerStatus::Stop);

        if let Some(current) = self.current {
            if current != from {
                if let Some(proxy) = self.listeners.get_mut(&current) {
                    proxy.forward_worker_exit(worker_pid);
                }
            }
        }
    }

    /// Reap exited listeners and adjust bookkeeping. Only the death of
    /// the *current* listener escalates the backoff: last-good and stale
    /// generations are supposed to exit.
    fn reap_listeners(&mut self) {
        let pids: Vec<u32> = self.listeners.keys().copied().collect();
        for pid in pids {
            let exited = match self.listeners.get_mut(&pid) {
                Some(proxy) => proxy.try_reap(),
                None => continue,
            };
            if let Some(status) = exited {
                info!(listener = pid, ?status, "listener exited");
                self.status.listener(pid, ListenerStatus::Stop);

                if self.current == Some(pid) {
                    self.current = None;
                    self.listener_backoff.died();
                }
                if self.last_good == Some(pid) {
                    self.last_good = None;
                }
                if let Some(mut proxy) = self.listeners.remove(&pid) {
                    proxy.dispose();
                }
            }
        }
    }

    /// Spawn a listener when there is no current one, we are not paused,
    /// and the crash backoff permits.
    fn maybe_spawn_listener(&mut self) {
        if self.paused || self.current.is_some() || self.listener_backoff.waiting() {
            return;
        }
        if let Err(e) = self.spawn_listener() {
            error!(error = %e, "failed to spawn listener");
            self.listener_backoff.died();
        }
    }

    fn spawn_listener(&mut self) -> Result<()> {
        let old_workers: Vec<OldWorker> = self
            .listeners
            .values()
            .flat_map(|proxy| {
                proxy.running_workers().iter().map(|(&pid, queue_key)| OldWorker {
                    pid,
                    queue_key: queue_key.clone(),
                })
            })
            .collect();

        self.listeners_created += 1;
        let listener_id = self.listeners_created;

        let (master_end, listener_end) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;

        let config_paths = self
            .opts
            .config_paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":");

        let mut command = Command::new(std::env::current_exe()?);
        command
            .arg("listener")
            .env(ENV_SOCKET, listener_end.as_raw_fd().to_string())
            .env(ENV_CONFIG_PATH, config_paths)
            .env(ENV_STATE, encode_state(&old_workers))
            .env(ENV_LISTENER_ID, listener_id.to_string())
            .env(ENV_MASTER_VERSION, env!("CARGO_PKG_VERSION"));

        let raw_listener_end = listener_end.as_raw_fd();
        // SAFETY: the pre_exec hook runs in the forked child before exec
        // and only calls async-signal-safe fcntl to let the socket fd
        // survive the exec.
        unsafe {
            command.pre_exec(move || {
                if libc::fcntl(raw_listener_end, libc::F_SETFD, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn()?;
        let pid = child.id();
        // The listener's end lives on in the child; close our copy now so
        // the child sees EOF if we die.
        drop(listener_end);

        self.listener_backoff.started();
        let proxy = ListenerProxy::new(listener_id, child, UnixStream::from(master_end))?;
        info!(listener = pid, listener_id, inherited_workers = old_workers.len(), "listener spawned");
        self.status.listener(pid, ListenerStatus::Start);
        self.listeners.insert(pid, proxy);
        self.current = Some(pid);
        Ok(())
    }

    /// `HUP`: reopen logs, then replace the current listener. A promoted
    /// current listener becomes last-good until its successor is ready; a
    /// still-booting one has no workers yet and is simply discarded.
    fn reload(&mut self) {
        info!("reload requested");
        if self.opts.exec_on_hup {
            warn!("--exec-on-hup is not implemented; reloading in place");
        }
        if let Err(e) = self.log.reopen() {
            warn!(error = %e, "failed to reopen log file");
        }

        match self.current.take() {
            None => {}
            Some(pid) => {
                let promoted = self
                    .listeners
                    .get(&pid)
                    .map(|proxy| proxy.is_promoted())
                    .unwrap_or(false);
                if promoted {
                    if let Some(older) = self.last_good.replace(pid) {
                        // Two reloads in flight: the older generation was
                        // draining anyway, make it official.
                        self.kill_listener(older, Signal::SIGQUIT);
                    }
                } else {
                    debug!(listener = pid, "discarding still-booting listener");
                    self.kill_listener(pid, Signal::SIGQUIT);
                }
            }
        }
        // The next loop pass spawns the replacement.
    }

    /// `USR2`: stop processing jobs. The current listener drains; no new
    /// listener spawns until `CONT`.
    fn pause(&mut self) {
        info!("pausing job processing");
        self.paused = true;
        if let Some(pid) = self.current.take() {
            self.kill_listener(pid, Signal::SIGQUIT);
        }
    }

    /// `CONT`: resume. Forwarded to all listeners; the next loop pass
    /// spawns a fresh current listener.
    fn resume(&mut self) {
        info!("resuming job processing");
        self.paused = false;
        for proxy in self.listeners.values() {
            proxy.kill(Signal::SIGCONT);
        }
    }

    /// Propagate the shutdown signal and, unless `--fast-exit`, wait for
    /// every listener to be reaped.
    fn shutdown(&mut self, sig: Signal) {
        info!(signal = %sig, fast_exit = self.opts.fast_exit, "shutting down");
        for proxy in self.listeners.values() {
            proxy.kill(sig);
        }
        if self.opts.fast_exit {
            return;
        }

        while !self.listeners.is_empty() {
            self.drain_listeners();
            self.reap_listeners();
            if self.listeners.is_empty() {
                break;
            }
            let fds = self.watch_fds();
            let _ = self.waiter.wait(Some(Duration::from_secs(1)), &fds);
        }
    }

    fn sleep(&mut self) {
        let mut timeout = MAX_SLEEP;
        if let Some(remaining) = self.listener_backoff.how_long() {
            timeout = timeout.min(remaining);
        }
        let fds = self.watch_fds();
        let _ = self.waiter.wait(Some(timeout), &fds);
    }

    fn watch_fds(&self) -> Vec<RawFd> {
        self.listeners
            .values()
            .filter_map(|proxy| proxy.watch_fd())
            .collect()
    }

    fn kill_listener(&self, pid: u32, sig: Signal) {
        if let Some(proxy) = self.listeners.get(&pid) {
            proxy.kill(sig);
        }
    }
}

// The master's observable behavior is exercised end-to-end in
// tests/supervisor_e2e.rs against the real binary.
