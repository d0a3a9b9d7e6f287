//! Operator cancellation.
//!
//! The process-wide variant is fed by SIGINT/SIGTERM handlers that only
//! store the signal number; the supervising loop polls it between waits.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

#[cfg(unix)]
pub const SIGINT: i32 = libc::SIGINT;
#[cfg(not(unix))]
pub const SIGINT: i32 = 2;

#[cfg(unix)]
pub const SIGTERM: i32 = libc::SIGTERM;
#[cfg(not(unix))]
pub const SIGTERM: i32 = 15;

static PROCESS_SIGNAL: AtomicI32 = AtomicI32::new(0);

#[derive(Debug, Clone)]
enum Source {
    Process,
    Manual(Arc<AtomicI32>),
}

/// Cloneable handle reporting whether (and by which signal) a run was cancelled.
#[derive(Debug, Clone)]
pub struct Cancellation {
    source: Source,
}

impl Cancellation {
    /// A handle that only fires when [`Cancellation::cancel`] is called.
    pub fn new() -> Self {
        Self {
            source: Source::Manual(Arc::new(AtomicI32::new(0))),
        }
    }

    /// Route SIGINT and SIGTERM for this process into the returned handle.
    pub fn install() -> Self {
        install_signal_handlers();
        Self {
            source: Source::Process,
        }
    }

    fn slot(&self) -> &AtomicI32 {
        match &self.source {
            Source::Process => &PROCESS_SIGNAL,
            Source::Manual(flag) => flag,
        }
    }

    /// Record `signal` as the reason for cancellation. The first signal wins.
    pub fn cancel(&self, signal: i32) {
        let _ = self
            .slot()
            .compare_exchange(0, signal, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn received(&self) -> Option<i32> {
        match self.slot().load(Ordering::SeqCst) {
            0 => None,
            signal => Some(signal),
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn install_signal_handlers() {
    extern "C" fn handler(signal: libc::c_int) {
        let _ = PROCESS_SIGNAL.compare_exchange(0, signal, Ordering::SeqCst, Ordering::SeqCst);
    }

    unsafe {
        let handler_ptr = handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::signal(libc::SIGINT, handler_ptr);
        libc::signal(libc::SIGTERM, handler_ptr);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}
