//! The `start` subcommand: run the master supervisor.

use std::os::fd::RawFd;
use std::path::PathBuf;

use crate::error::{ResquedError, Result};
use crate::logging;
use crate::supervisor::{Master, MasterOptions};

pub fn start(
    config: Vec<PathBuf>,
    pidfile: Option<PathBuf>,
    exec_on_hup: bool,
    fast_exit: bool,
    status_pipe: Option<i32>,
    log_file: Option<PathBuf>,
) -> Result<()> {
    let log = logging::init(log_file.as_deref())?;

    if config.is_empty() {
        return Err(ResquedError::InvalidArgument(
            "at least one --config is required".to_string(),
        ));
    }
    if let Some(fd) = status_pipe {
        if fd < 0 {
            return Err(ResquedError::InvalidArgument(format!(
                "--status-pipe must be a non-negative fd, got {}",
                fd
            )));
        }
    }

    let opts = MasterOptions {
        config_paths: config,
        pidfile,
        exec_on_hup,
        fast_exit,
        status_pipe: status_pipe.map(|fd| fd as RawFd),
    };
    Master::new(opts, log)?.run()
}
