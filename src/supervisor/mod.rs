//! The two-level supervision state machine.
//!
//! A master process owns a generation of listener children; each listener
//! owns a set of worker children built from its config snapshot. All
//! coordination is POSIX-native: signals (queued through a self-pipe),
//! `waitpid`-style reaping, and a socketpair per listener carrying
//! newline-delimited status lines. Every process is single-threaded; the
//! only suspension point is the [`waiter::SleepyWaiter`].

pub mod backoff;
pub mod listener;
pub mod master;
pub mod proxy;
pub mod signals;
pub mod status;
pub mod waiter;
pub mod wire;
pub mod worker;

pub use listener::Listener;
pub use master::{Master, MasterOptions};
