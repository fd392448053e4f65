//! Error types and error handling strategy for keylock.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Every blocking operation reports *why* it stopped waiting: the
//!   deadline elapsed, an external signal fired, or an orchestrating
//!   primitive refused the request
//! - Failures in a multi-key acquisition propagate unchanged through the
//!   orchestrating call after its partial holdings have been unwound
//!
//! Invalid construction or call arguments (a semaphore limit of zero, a
//! zero acquisition weight) are programmer errors and panic via `assert!`
//! rather than returning an error.

use core::fmt;
use std::sync::Arc;
use std::time::Instant;

/// The reason attached to an external cancellation signal.
///
/// The reason given to [`CancelSignal::cancel`](crate::cx::CancelSignal::cancel)
/// is surfaced verbatim on every wait aborted by that signal, via
/// [`Error::cancel_reason`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelReason {
    message: Arc<str>,
}

impl CancelReason {
    /// Creates a cancellation reason with the given message.
    #[must_use]
    pub fn new(message: impl Into<Arc<str>>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the reason message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Default for CancelReason {
    fn default() -> Self {
        Self::new("cancelled")
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// An external cancel signal aborted the wait.
    Cancelled,
    /// A blocking wait exceeded its deadline.
    DeadlineExceeded,
    /// A lock box request targeted a live key with conflicting parameters.
    BoxConflict,
    /// A monitor re-locked a key it holds with a different lock type.
    LockTypeMismatch,
    /// The monitor deadlock detector identified a hold-and-wait cycle.
    DeadlockDetected,
}

impl ErrorKind {
    /// Returns a short human-readable name for the kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline exceeded",
            Self::BoxConflict => "lock box conflict",
            Self::LockTypeMismatch => "lock type mismatch",
            Self::DeadlockDetected => "deadlock detected",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The main error type for keylock operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    reason: Option<CancelReason>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            reason: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Creates a cancellation error from a signal reason.
    #[must_use]
    pub fn cancelled(reason: CancelReason) -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            message: None,
            reason: Some(reason),
            source: None,
        }
    }

    /// Creates a deadline-exceeded error for the given deadline.
    #[must_use]
    pub fn deadline_exceeded(deadline: Instant) -> Self {
        let overshoot = Instant::now().saturating_duration_since(deadline);
        Self::new(ErrorKind::DeadlineExceeded)
            .with_message(format!("deadline elapsed {overshoot:?} ago"))
    }

    /// Creates a lock box conflict error for a key.
    #[must_use]
    pub fn box_conflict(key: &str, detail: impl fmt::Display) -> Self {
        Self::new(ErrorKind::BoxConflict).with_message(format!(
            "key {key:?} is live with different parameters: {detail}"
        ))
    }

    /// Creates a lock type mismatch error for a key held by a monitor.
    #[must_use]
    pub fn lock_type_mismatch(
        key: &str,
        held: impl fmt::Display,
        requested: impl fmt::Display,
    ) -> Self {
        Self::new(ErrorKind::LockTypeMismatch).with_message(format!(
            "key {key:?} is held as {held}, cannot re-lock as {requested}"
        ))
    }

    /// Creates a deadlock error for the acquisition that closed the cycle.
    #[must_use]
    pub fn deadlock(key: &str, ty: impl fmt::Display) -> Self {
        Self::new(ErrorKind::DeadlockDetected)
            .with_message(format!("acquiring {key:?} as {ty} would close a wait cycle"))
    }

    /// Returns true if an external signal aborted the operation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Returns true if the operation exceeded its deadline.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::DeadlineExceeded)
    }

    /// Returns true if the deadlock detector raised this error.
    #[must_use]
    pub const fn is_deadlock(&self) -> bool {
        matches!(self.kind, ErrorKind::DeadlockDetected)
    }

    /// Returns the signal reason for a cancellation error, verbatim.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<&CancelReason> {
        self.reason.as_ref()
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(reason) = &self.reason {
            write!(f, ": {reason}")?;
        }
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// A specialized Result type for keylock operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug)]
    struct Underlying;

    impl fmt::Display for Underlying {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "underlying")
        }
    }

    impl std::error::Error for Underlying {}

    #[test]
    fn display_without_message() {
        let err = Error::new(ErrorKind::DeadlockDetected);
        assert_eq!(err.to_string(), "deadlock detected");
    }

    #[test]
    fn display_with_message() {
        let err = Error::new(ErrorKind::BoxConflict).with_message("key taken");
        assert_eq!(err.to_string(), "lock box conflict: key taken");
    }

    #[test]
    fn cancel_reason_is_verbatim() {
        let err = Error::cancelled(CancelReason::new("shutdown requested"));
        assert!(err.is_cancelled());
        assert_eq!(
            err.cancel_reason().map(CancelReason::message),
            Some("shutdown requested")
        );
        assert_eq!(err.to_string(), "cancelled: shutdown requested");
    }

    #[test]
    fn predicates_match_kind() {
        assert!(Error::deadline_exceeded(Instant::now()).is_timeout());
        assert!(!Error::deadline_exceeded(Instant::now()).is_cancelled());
        assert!(Error::deadlock("a", "write").is_deadlock());
    }

    #[test]
    fn source_chain_is_exposed() {
        let err = Error::new(ErrorKind::BoxConflict)
            .with_message("outer")
            .with_source(Underlying);
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "underlying");
    }

    #[test]
    fn mismatch_message_names_both_types() {
        let err = Error::lock_type_mismatch("k", "read", "write");
        let msg = err.to_string();
        assert!(msg.contains("read"), "{msg}");
        assert!(msg.contains("write"), "{msg}");
    }
}
