use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use nix::libc;
use nix::sys::signal::{self, SigHandler, Signal};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Route Ctrl-C into a latch the completion wait can observe, instead of
/// letting it kill the process mid-download.
pub fn install_sigint_handler() -> Result<()> {
    unsafe {
        signal::signal(Signal::SIGINT, SigHandler::Handler(handle_sigint))?;
    }
    Ok(())
}

pub fn reset_interrupt_flag() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

#[cfg(test)]
pub(crate) fn interrupt_for_tests() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Serializes every test that touches the process-wide latch.
#[cfg(test)]
pub(crate) static TEST_LATCH_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
