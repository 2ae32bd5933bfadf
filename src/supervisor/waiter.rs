//! Selectable sleep for the supervision loops.
//!
//! [`SleepyWaiter::wait`] blocks until the timeout elapses, one of the
//! given descriptors becomes readable, or a signal handler writes to the
//! self-pipe. `EINTR` counts as a wakeup. The self-pipe is drained on
//! every return so stale wake bytes never cause a spurious instant wake
//! on the next call.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use super::signals::SignalQueue;

#[derive(Debug)]
pub struct SleepyWaiter {
    wake_fd: RawFd,
}

impl SleepyWaiter {
    pub fn new(signals: &SignalQueue) -> SleepyWaiter {
        SleepyWaiter {
            wake_fd: signals.wake_fd(),
        }
    }

    /// Sleep until `timeout` elapses, any fd in `fds` is readable, or the
    /// self-pipe is written. `None` sleeps until woken.
    pub fn wait(&self, timeout: Option<Duration>, fds: &[RawFd]) -> io::Result<()> {
        let mut pfds = Vec::with_capacity(fds.len() + 1);
        pfds.push(libc::pollfd {
            fd: self.wake_fd,
            events: libc::POLLIN,
            revents: 0,
        });
        for &fd in fds {
            pfds.push(libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            });
        }

        let timeout_ms = match timeout {
            None => -1,
            Some(d) if d.is_zero() => 0,
            // Round up so sub-millisecond timeouts cannot spin.
            Some(d) => i32::try_from(d.as_millis().max(1)).unwrap_or(i32::MAX),
        };

        // SAFETY: pfds is a valid array of initialized pollfds for the
        // duration of the call.
        let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
            // A signal interrupted the sleep; that is a wakeup.
        }

        self.drain();
        Ok(())
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: reading our own non-blocking pipe fd into a stack
            // buffer.
            let n = unsafe {
                libc::read(self.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n < buf.len() as isize {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    fn test_waiter() -> (SleepyWaiter, UnixStream) {
        // A plain socketpair stands in for the self-pipe: the waiter only
        // ever reads the fd.
        let (read, write) = UnixStream::pair().unwrap();
        read.set_nonblocking(true).unwrap();
        let waiter = SleepyWaiter {
            wake_fd: read.as_raw_fd(),
        };
        // Leak the read end so the fd outlives this helper.
        std::mem::forget(read);
        (waiter, write)
    }

    #[test]
    fn times_out() {
        let (waiter, _write) = test_waiter();
        let start = Instant::now();
        waiter.wait(Some(Duration::from_millis(50)), &[]).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn wakes_on_watched_fd() {
        let (waiter, _write) = test_waiter();
        let (watched, mut peer) = UnixStream::pair().unwrap();
        peer.write_all(b"x").unwrap();

        let start = Instant::now();
        waiter
            .wait(Some(Duration::from_secs(5)), &[watched.as_raw_fd()])
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wakes_on_self_pipe_and_drains_it() {
        let (waiter, mut write) = test_waiter();
        write.write_all(b"!").unwrap();

        let start = Instant::now();
        waiter.wait(Some(Duration::from_secs(5)), &[]).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));

        // The wake byte was consumed, so the next wait sleeps.
        let start = Instant::now();
        waiter.wait(Some(Duration::from_millis(50)), &[]).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
