use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Resqued - a process supervisor for pools of background queue workers
#[derive(Parser)]
#[command(name = "resqued")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the master supervisor
    Start {
        /// Configuration file; may be given multiple times, evaluated in order
        #[arg(long = "config", value_name = "PATH", required = true)]
        config: Vec<PathBuf>,

        /// Write the master pid here while running
        #[arg(long, value_name = "PATH")]
        pidfile: Option<PathBuf>,

        /// Re-exec the master on HUP instead of reloading in place
        /// (not implemented; falls back to an in-place reload)
        #[arg(long)]
        exec_on_hup: bool,

        /// Exit immediately on INT/TERM/QUIT instead of waiting for
        /// listeners to drain
        #[arg(long)]
        fast_exit: bool,

        /// Inherited file descriptor for machine-readable lifecycle records
        #[arg(long, value_name = "FD")]
        status_pipe: Option<i32>,

        /// Append logs to this file; reopened on HUP
        #[arg(long, value_name = "PATH")]
        log_file: Option<PathBuf>,
    },

    /// Internal: run a listener (invoked by the master via exec)
    #[command(hide = true)]
    Listener,

    /// Send QUIT to the master in PIDFILE and wait for it to exit
    ///
    /// Exits 0 once the process is gone, or 99 if it is still alive
    /// 5 seconds before the grace period would expire.
    QuitAndWait {
        /// Pidfile written by `resqued start --pidfile`
        pidfile: PathBuf,

        /// Overall grace period in seconds
        #[arg(long, value_name = "SEC", default_value_t = 30)]
        grace_period: u64,
    },
}
