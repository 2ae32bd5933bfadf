//! Resqued - a process supervisor for pools of background queue workers
//!
//! A long-lived master process manages a generation of listener child
//! processes; each listener evaluates a config snapshot, forks a set of
//! workers, and supervises them as they drain work queues. The design
//! centers on zero-downtime reloads: on `HUP` a new listener boots with
//! the old generation's running workers marked as blocked peers, takes
//! over once ready, and the old generation drains worker by worker so no
//! queue is ever processed by two generations at once.

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod pidfile;
pub mod supervisor;

pub use error::{ResquedError, Result};
