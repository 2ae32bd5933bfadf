//! The internal `listener` subcommand, invoked by the master via exec.

use crate::error::Result;
use crate::logging;
use crate::supervisor::Listener;

pub fn listener() -> Result<()> {
    logging::init(None)?;
    Listener::from_env()?.run()
}
