#![deny(unsafe_code)]

//! Interruption signals.
//!
//! The handler only stores into atomics. Everything else that follows a
//! signal (the urgent shutdown push, teardown) happens on the poll thread
//! once it notices the flag.

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use std::ffi::c_int;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

/// Signals that stop monitoring.
pub const INTERRUPT_SIGNALS: [Signal; 4] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGALRM,
];

static INTERRUPT: OnceLock<Arc<AtomicBool>> = OnceLock::new();
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_signal(signum: c_int) {
    LAST_SIGNAL.store(signum, Ordering::Relaxed);
    if let Some(flag) = INTERRUPT.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

/// Route [`INTERRUPT_SIGNALS`] to the returned flag.
pub fn install() -> nix::Result<Arc<AtomicBool>> {
    let flag = Arc::clone(INTERRUPT.get_or_init(|| Arc::new(AtomicBool::new(false))));
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in INTERRUPT_SIGNALS {
        // SAFETY: the handler only touches atomics and an initialised OnceLock.
        #[allow(unsafe_code)]
        unsafe {
            sigaction(signal, &action)?;
        }
    }
    Ok(flag)
}

/// The most recent interruption signal received, if any.
pub fn last_signal() -> Option<Signal> {
    match LAST_SIGNAL.load(Ordering::Relaxed) {
        0 => None,
        signum => Signal::try_from(signum).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::raise;

    #[test]
    fn alarm_sets_the_flag() {
        let flag = install().unwrap();
        assert!(Arc::ptr_eq(&flag, &install().unwrap()));

        raise(Signal::SIGALRM).unwrap();

        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(last_signal(), Some(Signal::SIGALRM));
    }
}
