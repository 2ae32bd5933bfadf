use std::path::PathBuf;

use thiserror::Error;

/// Exit codes as specified in the design doc
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const USAGE: i32 = 1;
    pub const INTERNAL: i32 = 1;
    /// `quit-and-wait` gave up before the supervised process exited.
    pub const GRACE_TIMEOUT: i32 = 99;
}

#[derive(Error, Debug)]
pub enum ResquedError {
    #[error("pidfile {} is held by running process {}", .path.display(), .pid)]
    PidfileContention { path: PathBuf, pid: u32 },

    #[error("pidfile {} does not contain a pid", .path.display())]
    PidfileUnreadable { path: PathBuf },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid config {}: {}", .path.display(), .message)]
    Config { path: PathBuf, message: String },

    #[error("failed to parse config {}: {}", .path.display(), .source)]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),

    #[error("malformed environment variable {name}: {value:?}")]
    MalformedEnv { name: &'static str, value: String },

    #[error("process {pid} did not exit within the grace period")]
    GraceTimeout { pid: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    Sys(#[from] nix::errno::Errno),
}

impl ResquedError {
    pub fn exit_code(&self) -> i32 {
        match self {
            // Errors the operator fixes by invoking resqued differently.
            ResquedError::PidfileContention { .. }
            | ResquedError::PidfileUnreadable { .. }
            | ResquedError::InvalidArgument(_)
            | ResquedError::Config { .. }
            | ResquedError::ConfigParse { .. }
            | ResquedError::MissingEnv(_)
            | ResquedError::MalformedEnv { .. } => exit_codes::USAGE,

            // The quit-and-wait helper's contract with process managers.
            ResquedError::GraceTimeout { .. } => exit_codes::GRACE_TIMEOUT,

            ResquedError::Io(_) | ResquedError::Sys(_) => exit_codes::INTERNAL,
        }
    }
}

pub type Result<T> = std::result::Result<T, ResquedError>;
