//! Logging setup for the master and listener processes.
//!
//! Uses `tracing` with an `EnvFilter` read from `RESQUED_LOG` (default
//! `info`). Logs go to stderr, or to a file when `--log-file` is given;
//! the file sits behind a reopenable handle so the master can reopen it
//! in place on `SIGHUP` for log rotation.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::error::Result;

#[derive(Debug)]
enum LogTarget {
    Stderr,
    File { path: PathBuf, file: File },
}

/// Cloneable handle to the active log destination.
#[derive(Debug, Clone)]
pub struct LogHandle {
    target: Arc<Mutex<LogTarget>>,
}

impl LogHandle {
    /// Reopen the log file (no-op for stderr). Called on `SIGHUP` so an
    /// external rotator can move the old file aside first.
    pub fn reopen(&self) -> io::Result<()> {
        let mut target = self.target.lock().unwrap();
        if let LogTarget::File { path, file } = &mut *target {
            *file = open_log_file(path)?;
        }
        Ok(())
    }
}

impl Write for LogHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut *self.target.lock().unwrap() {
            LogTarget::Stderr => io::stderr().write(buf),
            LogTarget::File { file, .. } => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *self.target.lock().unwrap() {
            LogTarget::Stderr => io::stderr().flush(),
            LogTarget::File { file, .. } => file.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogHandle {
    type Writer = LogHandle;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Initialize the global subscriber and panic hook.
///
/// Safe to call more than once in one process (tests); later calls keep
/// the first subscriber but still return a usable handle.
pub fn init(log_file: Option<&Path>) -> Result<LogHandle> {
    let target = match log_file {
        Some(path) => LogTarget::File {
            path: path.to_path_buf(),
            file: open_log_file(path)?,
        },
        None => LogTarget::Stderr,
    };
    let handle = LogHandle {
        target: Arc::new(Mutex::new(target)),
    };

    let filter = EnvFilter::try_from_env("RESQUED_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(handle.clone())
        .with_ansi(false)
        .with_target(true)
        .try_init();

    install_panic_hook();
    Ok(handle)
}

/// Log panics before unwinding; the supervisor otherwise dies silently
/// when stderr is redirected.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let message = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());
        tracing::error!(%location, "panic: {}", message);
        default_hook(info);
    }));
}
