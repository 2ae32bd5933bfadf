//! Scoped pidfile for the master process.
//!
//! The file is created with exclusive semantics while the master runs and
//! removed on every exit path via `Drop`. A leftover file whose pid no
//! longer names a live process is treated as stale and taken over; a live
//! pid refuses startup.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::{ResquedError, Result};
use crate::supervisor::wire::parse_pid;

#[derive(Debug)]
pub struct Pidfile {
    path: PathBuf,
    pid: u32,
}

impl Pidfile {
    /// Create `path` exclusively and write our pid into it.
    ///
    /// # Errors
    ///
    /// Returns [`ResquedError::PidfileContention`] when the file exists
    /// and its pid is alive, or an IO error for anything else.
    pub fn acquire(path: &Path) -> Result<Pidfile> {
        let pid = std::process::id();
        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{}", pid)?;
                    return Ok(Pidfile {
                        path: path.to_path_buf(),
                        pid,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt == 0 => {
                    match read(path) {
                        Ok(old_pid) if process_alive(old_pid) => {
                            return Err(ResquedError::PidfileContention {
                                path: path.to_path_buf(),
                                pid: old_pid,
                            });
                        }
                        Ok(old_pid) => {
                            warn!(path = %path.display(), old_pid, "removing stale pidfile");
                            fs::remove_file(path)?;
                        }
                        Err(_) => {
                            warn!(path = %path.display(), "removing unreadable pidfile");
                            fs::remove_file(path)?;
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        // Lost the creation race twice; whoever beat us owns it now.
        Err(ResquedError::PidfileContention {
            path: path.to_path_buf(),
            pid: read(path).unwrap_or(0),
        })
    }
}

impl Drop for Pidfile {
    fn drop(&mut self) {
        // Only remove the file while it still holds our pid, so a
        // successor that already took over is left alone.
        match read(&self.path) {
            Ok(pid) if pid == self.pid => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "failed to remove pidfile");
                }
            }
            _ => debug!(path = %self.path.display(), "pidfile no longer ours; leaving it"),
        }
    }
}

/// Read a pid out of `path`.
pub fn read(path: &Path) -> Result<u32> {
    let text = fs::read_to_string(path)?;
    parse_pid(text.trim()).ok_or_else(|| ResquedError::PidfileUnreadable {
        path: path.to_path_buf(),
    })
}

/// Liveness probe via `kill(pid, 0)`. `EPERM` means the process exists
/// but belongs to someone else; that still counts as alive.
pub fn process_alive(pid: u32) -> bool {
    matches!(
        kill(Pid::from_raw(pid as i32), None),
        Ok(()) | Err(Errno::EPERM)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::tempdir;

    #[test]
    fn acquires_and_removes_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resqued.pid");

        {
            let _pidfile = Pidfile::acquire(&path).unwrap();
            assert_eq!(read(&path).unwrap(), std::process::id());
        }
        assert!(!path.exists());
    }

    #[test]
    fn refuses_when_holder_is_alive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resqued.pid");
        fs::write(&path, format!("{}\n", std::process::id())).unwrap();

        let err = Pidfile::acquire(&path).unwrap_err();
        assert!(matches!(err, ResquedError::PidfileContention { .. }));
        assert!(path.exists());
    }

    #[test]
    fn takes_over_a_stale_pidfile() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resqued.pid");

        // A reaped child's pid is as good as guaranteed dead.
        let mut child = Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        fs::write(&path, format!("{}\n", dead_pid)).unwrap();

        let pidfile = Pidfile::acquire(&path).unwrap();
        assert_eq!(read(&path).unwrap(), std::process::id());
        drop(pidfile);
        assert!(!path.exists());
    }

    #[test]
    fn takes_over_garbage_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resqued.pid");
        fs::write(&path, "not a pid\n").unwrap();

        let _pidfile = Pidfile::acquire(&path).unwrap();
        assert_eq!(read(&path).unwrap(), std::process::id());
    }

    #[test]
    fn drop_leaves_a_successors_file_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resqued.pid");

        let pidfile = Pidfile::acquire(&path).unwrap();
        fs::write(&path, "99999999\n").unwrap();
        drop(pidfile);
        assert!(path.exists());
    }
}
