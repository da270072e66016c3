//! Master-side signal reception.
//!
//! The master has no event loop; it blocks in `waitpid`. Handlers are
//! installed without `SA_RESTART` so any signal breaks that wait with
//! `EINTR`, and the handler body only flips an atomic flag. The monitor
//! loop collects flags between waits.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// Signals the supervisor reacts to, in dispatch-priority order.
pub const SUPERVISED: [Signal; 9] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGTSTP,
    Signal::SIGQUIT,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGABRT, // SIGIOT: status dump request
    Signal::SIGIO,   // connection-listing dump request
];

const NSIG: usize = 64;

static FLAGS: [AtomicBool; NSIG] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const FLAG: AtomicBool = AtomicBool::new(false);
    [FLAG; NSIG]
};

extern "C" fn flag_signal(signum: libc::c_int) {
    if (signum as usize) < NSIG {
        FLAGS[signum as usize].store(true, Ordering::Relaxed);
    }
}

/// Installs the master handler table. SIGPIPE is ignored outright: a write
/// to a dead worker pipe must surface as EPIPE, not kill the master.
pub fn install() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(flag_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for &signal in &SUPERVISED {
        unsafe {
            sigaction(signal, &action)?;
        }
    }
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGPIPE, &ignore)?;
    }
    Ok(())
}

/// Drains every flagged signal, in [`SUPERVISED`] order.
pub fn take_pending() -> Vec<Signal> {
    let mut pending = Vec::new();
    for &signal in &SUPERVISED {
        if FLAGS[signal as usize].swap(false, Ordering::Relaxed) {
            pending.push(signal);
        }
    }
    pending
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_coalesce_and_drain_once() {
        flag_signal(libc::SIGUSR1);
        flag_signal(libc::SIGUSR1);
        flag_signal(libc::SIGIO);
        let pending = take_pending();
        assert_eq!(pending, vec![Signal::SIGUSR1, Signal::SIGIO]);
        assert!(take_pending().is_empty());
    }
}
