//! Injected logging abstraction.
//!
//! The engine never writes to stdout or a logging framework directly. Callers
//! hand it a [`Logger`] implementation; the engine reports pass progress and
//! failures through it, in addition to the structured [`crate::EventLog`].
//! Library consumers that do not care pass [`NullLogger`]; the CLI binary
//! brings its own console implementation.

use crate::events::EventLog;

/// Sink for human-readable progress messages.
///
/// Implementations must be callable from worker threads; passes may log while
/// running under rayon.
pub trait Logger: Send + Sync {
    /// Reports routine progress.
    fn info(&self, message: &str);

    /// Reports something unexpected but recoverable.
    fn warning(&self, message: &str);

    /// Reports a failure.
    fn error(&self, message: &str);

    /// Reports a notable positive outcome.
    fn success(&self, message: &str);
}

/// Logger that discards every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogger;

impl Logger for NullLogger {
    fn info(&self, _message: &str) {}
    fn warning(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
    fn success(&self, _message: &str) {}
}

/// Adapter that records logger calls as diagnostic events.
///
/// Useful when the caller wants log output folded into the run's event
/// stream instead of a separate sink.
pub struct EventLogger<'a> {
    log: &'a EventLog,
}

impl<'a> EventLogger<'a> {
    /// Creates an adapter writing into `log`.
    #[must_use]
    pub fn new(log: &'a EventLog) -> Self {
        EventLogger { log }
    }
}

impl Logger for EventLogger<'_> {
    fn info(&self, message: &str) {
        self.log.info(message);
    }

    fn warning(&self, message: &str) {
        self.log.warn(message);
    }

    fn error(&self, message: &str) {
        self.log.error(message);
    }

    fn success(&self, message: &str) {
        self.log.success(message);
    }
}
