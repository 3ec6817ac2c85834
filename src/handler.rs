//! Pluggable reaction to errors that happen outside any single request:
//! a failed `accept()` on the server, a lost connection on the client.

use log::{error, warn};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The instance can keep running if the handler agrees.
    Recoverable,
    /// The instance is already going down; the handler is only informed.
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    Continue,
    Terminate,
}

pub trait ErrorHandler: Send + Sync {
    fn handle(&self, error: &Error, severity: Severity) -> ErrorAction;
}

/// Keep going, say nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreErrors;

impl ErrorHandler for IgnoreErrors {
    fn handle(&self, _error: &Error, _severity: Severity) -> ErrorAction {
        ErrorAction::Continue
    }
}

/// Log and keep going.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrors;

impl ErrorHandler for LogErrors {
    fn handle(&self, error: &Error, severity: Severity) -> ErrorAction {
        match severity {
            Severity::Recoverable => warn!("{error}"),
            Severity::Fatal => error!("{error}"),
        }
        ErrorAction::Continue
    }
}

/// Log and stop at the first error.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminateOnError;

impl ErrorHandler for TerminateOnError {
    fn handle(&self, error: &Error, _severity: Severity) -> ErrorAction {
        error!("{error}");
        ErrorAction::Terminate
    }
}

impl<F> ErrorHandler for F
where
    F: Fn(&Error, Severity) -> ErrorAction + Send + Sync,
{
    fn handle(&self, error: &Error, severity: Severity) -> ErrorAction {
        self(error, severity)
    }
}
