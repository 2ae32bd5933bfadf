//! Wire formats shared between master and listener.
//!
//! Two encodings live here:
//!
//! - The reporting socket protocol: newline-delimited UTF-8 lines written
//!   by the listener (`RUNNING`, `+<pid>,<queueKey>`, `-<pid>`) and by the
//!   master (one decimal pid per line for every worker exit observed in
//!   another listener generation).
//! - The environment handed to a freshly exec'd listener: the `RESQUED_*`
//!   variables, including the `'||'`-joined `pid|queueKey` state string
//!   that carries the previous generation's running workers.
//!
//! Pids are parsed as plain decimal with no sign; anything else is logged
//! as a warning and ignored rather than propagated as an error.

use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use tracing::warn;

/// Fd number of the listener's end of the reporting socket.
pub const ENV_SOCKET: &str = "RESQUED_SOCKET";
/// `':'`-joined config paths.
pub const ENV_CONFIG_PATH: &str = "RESQUED_CONFIG_PATH";
/// `'||'`-joined `pid|queueKey` items for the previous generation.
pub const ENV_STATE: &str = "RESQUED_STATE";
/// Decimal listener id, assigned by the master and never reused.
pub const ENV_LISTENER_ID: &str = "RESQUED_LISTENER_ID";
/// Version string of the master that spawned us.
pub const ENV_MASTER_VERSION: &str = "RESQUED_MASTER_VERSION";

/// A single status line on the reporting socket, listener -> master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    /// First line the socket ever carries; promotes the listener.
    Running,
    /// A worker began work on `queue_key`.
    WorkerStarted { pid: u32, queue_key: String },
    /// A worker was reaped.
    WorkerFinished { pid: u32 },
}

impl Report {
    /// Parse one line (without the trailing newline). Returns `None` for
    /// anything malformed.
    pub fn parse(line: &str) -> Option<Report> {
        if line == "RUNNING" {
            return Some(Report::Running);
        }
        if let Some(rest) = line.strip_prefix('+') {
            let (pid, queue_key) = rest.split_once(',')?;
            let pid = parse_pid(pid)?;
            if queue_key.is_empty() {
                return None;
            }
            return Some(Report::WorkerStarted {
                pid,
                queue_key: queue_key.to_string(),
            });
        }
        if let Some(rest) = line.strip_prefix('-') {
            return Some(Report::WorkerFinished {
                pid: parse_pid(rest)?,
            });
        }
        None
    }
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Report::Running => write!(f, "RUNNING"),
            Report::WorkerStarted { pid, queue_key } => write!(f, "+{},{}", pid, queue_key),
            Report::WorkerFinished { pid } => write!(f, "-{}", pid),
        }
    }
}

/// Parse a pid as plain decimal. Rejects signs, whitespace, and empty
/// strings; `u32::from_str` would accept a leading `+`.
pub fn parse_pid(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// A running worker inherited from a previous listener generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OldWorker {
    pub pid: u32,
    pub queue_key: String,
}

/// Encode old workers for `RESQUED_STATE`.
pub fn encode_state(workers: &[OldWorker]) -> String {
    workers
        .iter()
        .map(|w| format!("{}|{}", w.pid, w.queue_key))
        .collect::<Vec<_>>()
        .join("||")
}

/// Decode `RESQUED_STATE`. Malformed items are warned about and dropped;
/// an empty string decodes to no workers.
pub fn decode_state(state: &str) -> Vec<OldWorker> {
    if state.is_empty() {
        return Vec::new();
    }
    let mut workers = Vec::new();
    for item in state.split("||") {
        match item.split_once('|') {
            Some((pid, queue_key)) if !queue_key.is_empty() => match parse_pid(pid) {
                Some(pid) => workers.push(OldWorker {
                    pid,
                    queue_key: queue_key.to_string(),
                }),
                None => warn!(item, "ignoring state item with malformed pid"),
            },
            _ => warn!(item, "ignoring malformed state item"),
        }
    }
    workers
}

/// Accumulates bytes from non-blocking reads and yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete line, without its newline.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=pos).take(pos).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

/// Write `line` plus a newline to a non-blocking stream, waiting for
/// writability when the socket buffer is momentarily full.
///
/// Status traffic is tiny, so hitting `WouldBlock` at all means the peer
/// has stopped draining; after `WRITE_STALL_LIMIT` we give up and report
/// the error so the caller can treat the peer as gone.
pub fn write_line(stream: &mut UnixStream, line: &str) -> io::Result<()> {
    const WRITE_STALL_LIMIT: Duration = Duration::from_secs(5);

    let mut data = Vec::with_capacity(line.len() + 1);
    data.extend_from_slice(line.as_bytes());
    data.push(b'\n');

    let deadline = Instant::now() + WRITE_STALL_LIMIT;
    let mut written = 0;
    while written < data.len() {
        match stream.write(&data[written..]) {
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "reporting socket peer stopped draining",
                    ));
                }
                poll_writable(stream, Duration::from_millis(100))?;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn poll_writable(stream: &UnixStream, timeout: Duration) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let mut pfd = libc::pollfd {
        fd: stream.as_raw_fd(),
        events: libc::POLLOUT,
        revents: 0,
    };
    // SAFETY: pfd points at one valid pollfd for the duration of the call.
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as i32) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_report_lines() {
        assert_eq!(Report::parse("RUNNING"), Some(Report::Running));
        assert_eq!(
            Report::parse("+123,high,low"),
            Some(Report::WorkerStarted {
                pid: 123,
                queue_key: "high,low".to_string(),
            })
        );
        assert_eq!(
            Report::parse("-123"),
            Some(Report::WorkerFinished { pid: 123 })
        );
    }

    #[test]
    fn rejects_malformed_report_lines() {
        assert_eq!(Report::parse(""), None);
        assert_eq!(Report::parse("RUNNING "), None);
        assert_eq!(Report::parse("+,x"), None);
        assert_eq!(Report::parse("+12"), None);
        assert_eq!(Report::parse("+12,"), None);
        assert_eq!(Report::parse("-"), None);
        assert_eq!(Report::parse("-+12"), None);
        assert_eq!(Report::parse("hello"), None);
    }

    #[test]
    fn report_lines_round_trip() {
        for report in [
            Report::Running,
            Report::WorkerStarted {
                pid: 4088,
                queue_key: "low".to_string(),
            },
            Report::WorkerFinished { pid: 4088 },
        ] {
            assert_eq!(Report::parse(&report.to_string()).as_ref(), Some(&report));
        }
    }

    #[test]
    fn pid_parsing_is_strict_decimal() {
        assert_eq!(parse_pid("42"), Some(42));
        assert_eq!(parse_pid("+42"), None);
        assert_eq!(parse_pid("-42"), None);
        assert_eq!(parse_pid(" 42"), None);
        assert_eq!(parse_pid("42x"), None);
        assert_eq!(parse_pid(""), None);
    }

    #[test]
    fn state_round_trips() {
        let workers = vec![
            OldWorker {
                pid: 101,
                queue_key: "high,low".to_string(),
            },
            OldWorker {
                pid: 102,
                queue_key: "mail".to_string(),
            },
        ];
        assert_eq!(encode_state(&workers), "101|high,low||102|mail");
        assert_eq!(decode_state(&encode_state(&workers)), workers);
    }

    #[test]
    fn state_decoding_drops_malformed_items() {
        assert_eq!(decode_state(""), Vec::new());
        assert_eq!(
            decode_state("bogus||+7|mail||103|mail||104"),
            vec![OldWorker {
                pid: 103,
                queue_key: "mail".to_string(),
            }]
        );
    }

    #[test]
    fn line_buffer_handles_partial_reads() {
        let mut buf = LineBuffer::new();
        buf.extend(b"RUN");
        assert_eq!(buf.next_line(), None);
        buf.extend(b"NING\n+12,");
        assert_eq!(buf.next_line(), Some("RUNNING".to_string()));
        assert_eq!(buf.next_line(), None);
        buf.extend(b"mail\n-12\n");
        assert_eq!(buf.next_line(), Some("+12,mail".to_string()));
        assert_eq!(buf.next_line(), Some("-12".to_string()));
        assert_eq!(buf.next_line(), None);
    }
}
