//! Worker pool configuration.
//!
//! The listener evaluates one or more TOML files in order; each file's
//! `[[pool]]` tables append to the pool list and a top-level `command`
//! sets the default argv for pools that follow it:
//!
//! ```toml
//! command = ["run-worker"]
//!
//! [[pool]]
//! queues = ["high", "low"]
//! workers = 2
//!
//! [[pool]]
//! queues = ["mail"]
//! command = ["run-worker", "--mail"]
//! ```
//!
//! A pool's queue key is its queue names joined with `,` in configured
//! order; the key is how workers are paired across listener generations,
//! so queue names may not contain `,`, `|`, or whitespace.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ResquedError, Result};

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    command: Option<Vec<String>>,
    #[serde(default, rename = "pool")]
    pools: Vec<RawPool>,
}

#[derive(Debug, Deserialize)]
struct RawPool {
    queues: Vec<String>,
    #[serde(default = "default_workers")]
    workers: usize,
    #[serde(default)]
    command: Option<Vec<String>>,
}

fn default_workers() -> usize {
    1
}

/// One worker pool: `workers` processes draining the same queue set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool {
    pub queues: Vec<String>,
    pub workers: usize,
    pub command: Vec<String>,
}

impl Pool {
    /// Canonical identifier for the queue set this pool consumes.
    pub fn queue_key(&self) -> String {
        self.queues.join(",")
    }
}

/// A fully evaluated configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub pools: Vec<Pool>,
}

/// Evaluate `paths` in order into a single snapshot.
///
/// # Errors
///
/// Fails on unreadable files, TOML syntax errors, empty queue lists,
/// invalid queue names, or a pool with no effective command.
pub fn load(paths: &[PathBuf]) -> Result<Config> {
    let mut default_command: Option<Vec<String>> = None;
    let mut pools = Vec::new();

    for path in paths {
        let text = fs::read_to_string(path).map_err(|e| ResquedError::Config {
            path: path.clone(),
            message: format!("unreadable: {}", e),
        })?;
        let raw: RawConfig = toml::from_str(&text).map_err(|source| ResquedError::ConfigParse {
            path: path.clone(),
            source,
        })?;

        if let Some(command) = raw.command {
            validate_command(path, &command)?;
            default_command = Some(command);
        }

        for raw_pool in raw.pools {
            pools.push(resolve_pool(path, raw_pool, default_command.as_ref())?);
        }
    }

    Ok(Config { pools })
}

fn resolve_pool(path: &Path, raw: RawPool, default_command: Option<&Vec<String>>) -> Result<Pool> {
    if raw.queues.is_empty() {
        return Err(ResquedError::Config {
            path: path.to_path_buf(),
            message: "pool has an empty queue list".to_string(),
        });
    }
    for queue in &raw.queues {
        if queue.is_empty() || queue.contains([',', '|']) || queue.contains(char::is_whitespace) {
            return Err(ResquedError::Config {
                path: path.to_path_buf(),
                message: format!("invalid queue name {:?}", queue),
            });
        }
    }
    if raw.workers == 0 {
        return Err(ResquedError::Config {
            path: path.to_path_buf(),
            message: format!("pool {:?} has zero workers", raw.queues.join(",")),
        });
    }

    let command = match raw.command.or_else(|| default_command.cloned()) {
        Some(command) => {
            validate_command(path, &command)?;
            command
        }
        None => {
            return Err(ResquedError::Config {
                path: path.to_path_buf(),
                message: format!(
                    "pool {:?} has no command and no default command is set",
                    raw.queues.join(",")
                ),
            });
        }
    };

    Ok(Pool {
        queues: raw.queues,
        workers: raw.workers,
        command,
    })
}

fn validate_command(path: &Path, command: &[String]) -> Result<()> {
    if command.is_empty() || command[0].is_empty() {
        return Err(ResquedError::Config {
            path: path.to_path_buf(),
            message: "command must have at least a program name".to_string(),
        });
    }
    Ok(())
}
