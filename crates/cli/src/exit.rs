#![forbid(unsafe_code)]

//! Process exit codes.

use monitor::Error;

pub const SUCCESS: u8 = 0;
/// Bad arguments or an unreadable configuration.
pub const USAGE: u8 = 1;
/// The introspection session could not be opened.
pub const SESSION_INIT: u8 = 2;
/// The guest could not be paused for setup.
pub const PAUSE: u8 = 3;
/// The initial watchpoint set could not be built.
pub const REGISTRATION: u8 = 4;
pub const RUNTIME: u8 = 5;

/// Pick the exit code for an error that ended the run.
pub fn for_error(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<config::Error>().is_some() {
        return USAGE;
    }
    match err.downcast_ref::<Error>() {
        Some(Error::CollaboratorInit { .. }) => SESSION_INIT,
        Some(Error::Pause(_)) => PAUSE,
        Some(err) if err.is_registration() => REGISTRATION,
        Some(Error::Config(_)) => USAGE,
        _ => RUNTIME,
    }
}
