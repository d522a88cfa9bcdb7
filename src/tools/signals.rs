//! Cancellation on SIGINT.
//!
//! The handler only flips an atomic; workers poll it between chunks
//! and the coordinators run their cleanup (stop the host job, kill
//! spawned NBD processes) before exiting non-zero. Partial files are
//! left in place for diagnosis.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{bail, Error};
use nix::sys::signal::{signal, SigHandler, Signal};

static CANCELLED: AtomicBool = AtomicBool::new(false);
static WARNINGS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn handle_sigint(_signal: libc::c_int) {
    CANCELLED.store(true, Ordering::SeqCst);
}

/// Install the SIGINT handler. Call once at binary startup.
pub fn register() -> Result<(), Error> {
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(handle_sigint)) }?;
    Ok(())
}

/// Request cancellation programmatically (first worker failure).
pub fn cancel() {
    CANCELLED.store(true, Ordering::SeqCst);
}

pub fn cancelled() -> bool {
    CANCELLED.load(Ordering::SeqCst)
}

/// The raw flag, for components that poll a shutdown condition.
pub fn flag() -> &'static AtomicBool {
    &CANCELLED
}

/// Bail out of a worker loop when cancellation was requested.
pub fn check() -> Result<(), Error> {
    if cancelled() {
        bail!("interrupted");
    }
    Ok(())
}

/// Count a warning towards the strict-mode exit code.
pub fn count_warning() {
    WARNINGS.fetch_add(1, Ordering::SeqCst);
}

pub fn warnings() -> usize {
    WARNINGS.load(Ordering::SeqCst)
}
