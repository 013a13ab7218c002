#![forbid(unsafe_code)]

//! External forensic checks run after an object class changed.

use config::{Checks, ObjectClass};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How often a running check is polled for exit, timeout and abort.
const WAIT_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("failed to start {class} check `{program}`: {source}")]
    Spawn {
        class: ObjectClass,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for {class} check `{program}`: {source}")]
    Wait {
        class: ObjectClass,
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The check ran to completion; its verdict is not interpreted.
    Completed,
    /// Nothing is configured for this class.
    NotConfigured,
    /// The check outlived its time limit and was killed.
    TimedOut,
    /// Monitoring is shutting down; the check was killed or never started.
    Aborted,
}

pub trait ForensicCheck {
    /// Run the check for `class`. Implementations that block must give up
    /// promptly once `abort` is set.
    fn run(&mut self, class: ObjectClass, abort: &AtomicBool) -> Result<CheckOutcome, CheckError>;
}

/// Runs nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCheck;

impl ForensicCheck for NoopCheck {
    fn run(&mut self, _class: ObjectClass, _abort: &AtomicBool) -> Result<CheckOutcome, CheckError> {
        Ok(CheckOutcome::NotConfigured)
    }
}

/// Runs the configured command line for a class and waits for it, at most
/// [`Checks::timeout`] long.
///
/// The child inherits stdout/stderr and sees `HAWK_CLASS` and `HAWK_GUEST`
/// in its environment.
#[derive(Debug, Clone)]
pub struct CommandCheck {
    guest: String,
    checks: Checks,
}

impl CommandCheck {
    pub fn new(guest: impl Into<String>, checks: Checks) -> Self {
        Self {
            guest: guest.into(),
            checks,
        }
    }
}

impl ForensicCheck for CommandCheck {
    fn run(&mut self, class: ObjectClass, abort: &AtomicBool) -> Result<CheckOutcome, CheckError> {
        let Some((program, args)) = self.checks.command(class).and_then(|argv| argv.split_first())
        else {
            return Ok(CheckOutcome::NotConfigured);
        };
        if abort.load(Ordering::SeqCst) {
            return Ok(CheckOutcome::Aborted);
        }

        debug!(%class, program, ?args, "running forensic check");
        let mut child = Command::new(program)
            .args(args)
            .env("HAWK_CLASS", class.name())
            .env("HAWK_GUEST", &self.guest)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| CheckError::Spawn {
                class,
                program: program.clone(),
                source,
            })?;

        let deadline = Instant::now() + self.checks.timeout;
        let waited = wait(&mut child, deadline, abort).map_err(|source| CheckError::Wait {
            class,
            program: program.clone(),
            source,
        })?;

        match waited {
            Waited::Exited(status) => {
                if !status.success() {
                    warn!(%class, program, %status, "forensic check exited unsuccessfully");
                }
                Ok(CheckOutcome::Completed)
            }
            Waited::TimedOut => {
                warn!(%class, program, timeout = ?self.checks.timeout, "forensic check timed out; killed");
                Ok(CheckOutcome::TimedOut)
            }
            Waited::Aborted => {
                debug!(%class, program, "forensic check killed for shutdown");
                Ok(CheckOutcome::Aborted)
            }
        }
    }
}

enum Waited {
    Exited(ExitStatus),
    TimedOut,
    Aborted,
}

/// Wait for `child` to exit, killing it at `deadline` or once `abort` is set.
fn wait(child: &mut Child, deadline: Instant, abort: &AtomicBool) -> std::io::Result<Waited> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Waited::Exited(status));
        }
        let waited = if abort.load(Ordering::SeqCst) {
            Waited::Aborted
        } else if Instant::now() >= deadline {
            Waited::TimedOut
        } else {
            std::thread::sleep(WAIT_INTERVAL);
            continue;
        };
        // The child may exit between the poll and the kill.
        if let Err(err) = child.kill() {
            debug!(%err, "kill failed");
        }
        child.wait()?;
        return Ok(waited);
    }
}
