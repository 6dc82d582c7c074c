// SPDX-License-Identifier: MIT

//! The one-shot start gate.
//!
//! The dispatcher is born disarmed and does nothing on its ticks until an
//! external trigger arms it; once armed it stays armed for the life of the
//! process. The trigger is SIGINT, and the handler does nothing beyond a
//! single atomic store through the registered gate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use nix::errno::Errno;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// Armed/disarmed state with explicit transitions. There is no disarm.
#[derive(Debug, Default)]
pub struct StartGate {
    armed: AtomicBool,
}

impl StartGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }
}

// The handler needs a path to the gate; set once at install time.
static GATE: OnceLock<Arc<StartGate>> = OnceLock::new();

extern "C" fn on_start_signal(_: libc::c_int) {
    // Async-signal-safe: OnceLock::get is a plain load, arm a plain store.
    if let Some(gate) = GATE.get() {
        gate.arm();
    }
}

/// Route SIGINT to the gate. SA_RESTART keeps the blocking stdin intake and
/// waitpid calls from being interrupted by the arm signal.
pub fn install_sigint_trigger(gate: Arc<StartGate>) -> nix::Result<()> {
    GATE.set(gate).map_err(|_| Errno::EEXIST)?;
    let action = SigAction::new(
        SigHandler::Handler(on_start_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGINT, &action) }?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_starts_disarmed_and_stays_armed() {
        let gate = StartGate::new();
        assert!(!gate.is_armed());
        gate.arm();
        assert!(gate.is_armed());
        gate.arm();
        assert!(gate.is_armed());
    }
}
