//! Cooperative cancellation shared by every task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-wide exit request. `exit` asks for a clean termination (shut down
/// sockets, stop the concentrator), `quit` for an abrupt one. Signal handlers
/// and the autoquit logic only ever set these flags; every task polls
/// [`ExitSignal::should_run`] at its loop head.
#[derive(Debug, Default)]
pub struct ExitSignal {
    exit: Arc<AtomicBool>,
    quit: Arc<AtomicBool>,
}

impl ExitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_run(&self) -> bool {
        !self.exit.load(Ordering::Relaxed) && !self.quit.load(Ordering::Relaxed)
    }

    pub fn is_exit(&self) -> bool {
        self.exit.load(Ordering::Relaxed)
    }

    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::Relaxed);
    }

    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::Relaxed);
    }

    /// Flag backing the clean-exit request, for `signal_hook` registration.
    pub fn exit_flag(&self) -> Arc<AtomicBool> {
        self.exit.clone()
    }

    /// Flag backing the abrupt-exit request, for `signal_hook` registration.
    pub fn quit_flag(&self) -> Arc<AtomicBool> {
        self.quit.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_stop_the_loop() {
        let sig = ExitSignal::new();
        assert!(sig.should_run());
        sig.request_exit();
        assert!(!sig.should_run());
        assert!(sig.is_exit());

        let sig = ExitSignal::new();
        sig.request_quit();
        assert!(!sig.should_run());
        assert!(!sig.is_exit());
    }
}
