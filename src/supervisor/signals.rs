//! Async-signal-safe signal queue with a self-pipe wakeup.
//!
//! Signal handlers are not allowed to do real work: the installed handler
//! only bumps a per-signal counter and writes one byte to a non-blocking
//! pipe. The main loop sleeps in [`super::waiter::SleepyWaiter`] on the
//! pipe's read end and pops queued signals once awake. Duplicate signals
//! are preserved (each delivery is one pop); relative ordering across
//! different signals is not.
//!
//! Each process kind (master, listener) installs exactly one queue and
//! passes it to its supervisor object. `SIGCHLD` is registered wake-only:
//! it nudges the pipe but enqueues nothing, since reaping happens at the
//! top of every loop iteration anyway.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use nix::fcntl::OFlag;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::pipe2;

use crate::error::Result;

/// Signals the supervision loops act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorSignal {
    Hup,
    Usr2,
    Cont,
    Int,
    Term,
    Quit,
}

impl SupervisorSignal {
    const SLOTS: usize = 6;

    fn slot(self) -> usize {
        match self {
            SupervisorSignal::Hup => 0,
            SupervisorSignal::Usr2 => 1,
            SupervisorSignal::Cont => 2,
            SupervisorSignal::Int => 3,
            SupervisorSignal::Term => 4,
            SupervisorSignal::Quit => 5,
        }
    }

    fn from_signo(signo: libc::c_int) -> Option<Self> {
        match signo {
            libc::SIGHUP => Some(SupervisorSignal::Hup),
            libc::SIGUSR2 => Some(SupervisorSignal::Usr2),
            libc::SIGCONT => Some(SupervisorSignal::Cont),
            libc::SIGINT => Some(SupervisorSignal::Int),
            libc::SIGTERM => Some(SupervisorSignal::Term),
            libc::SIGQUIT => Some(SupervisorSignal::Quit),
            _ => None,
        }
    }

    pub fn as_nix(self) -> Signal {
        match self {
            SupervisorSignal::Hup => Signal::SIGHUP,
            SupervisorSignal::Usr2 => Signal::SIGUSR2,
            SupervisorSignal::Cont => Signal::SIGCONT,
            SupervisorSignal::Int => Signal::SIGINT,
            SupervisorSignal::Term => Signal::SIGTERM,
            SupervisorSignal::Quit => Signal::SIGQUIT,
        }
    }
}

// Shared with the signal handlers, which cannot capture state.
static PENDING: [AtomicUsize; SupervisorSignal::SLOTS] = [
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
];
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

fn nudge() {
    let fd = WAKE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = [1u8];
        // SAFETY: write(2) on a non-blocking pipe fd is async-signal-safe;
        // a full pipe or racing close is fine to ignore, the loop is
        // already awake in that case.
        unsafe {
            let _ = libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

extern "C" fn enqueue_handler(signo: libc::c_int) {
    if let Some(sig) = SupervisorSignal::from_signo(signo) {
        PENDING[sig.slot()].fetch_add(1, Ordering::Relaxed);
    }
    nudge();
}

extern "C" fn wake_handler(_signo: libc::c_int) {
    nudge();
}

/// The process-wide signal queue plus its self-pipe.
#[derive(Debug)]
pub struct SignalQueue {
    read: OwnedFd,
    write: OwnedFd,
    registered: Vec<SupervisorSignal>,
}

impl SignalQueue {
    /// Install handlers: `queued` signals are recorded for [`pop`], the
    /// `wake_only` set merely interrupts the current sleep.
    ///
    /// `SA_RESTART` is deliberately not set, so a signal interrupts a
    /// blocking `poll` instead of silently restarting it.
    ///
    /// [`pop`]: SignalQueue::pop
    pub fn install(queued: &[SupervisorSignal], wake_only: &[Signal]) -> Result<SignalQueue> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        WAKE_FD.store(write.as_raw_fd(), Ordering::SeqCst);

        for sig in queued {
            PENDING[sig.slot()].store(0, Ordering::SeqCst);
            register(sig.as_nix(), SigHandler::Handler(enqueue_handler))?;
        }
        for sig in wake_only {
            register(*sig, SigHandler::Handler(wake_handler))?;
        }

        Ok(SignalQueue {
            read,
            write,
            registered: queued.to_vec(),
        })
    }

    /// Pop one queued signal, if any.
    pub fn pop(&mut self) -> Option<SupervisorSignal> {
        for sig in &self.registered {
            let slot = &PENDING[sig.slot()];
            if slot.load(Ordering::Relaxed) > 0 {
                slot.fetch_sub(1, Ordering::Relaxed);
                return Some(*sig);
            }
        }
        None
    }

    /// Read end of the self-pipe; the waiter sleeps on this.
    pub fn wake_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Nudge the event loop from regular (non-handler) code.
    pub fn awake(&self) {
        let byte = [1u8];
        // SAFETY: self.write is an open pipe fd owned by this queue.
        unsafe {
            let _ = libc::write(
                self.write.as_raw_fd(),
                byte.as_ptr() as *const libc::c_void,
                1,
            );
        }
    }
}

fn register(sig: Signal, handler: SigHandler) -> Result<()> {
    // Block everything while a handler runs; the handler bodies only touch
    // atomics and write(2).
    let action = SigAction::new(handler, SaFlags::empty(), SigSet::all());
    // SAFETY: the handlers installed here are async-signal-safe.
    unsafe { sigaction(sig, &action) }?;
    Ok(())
}
