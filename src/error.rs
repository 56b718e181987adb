//! Error types and error handling strategy.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Errors compose with the [`Outcome`](crate::types::Outcome) severity
//!   lattice: panics are isolated and converted to `Outcome::Panicked`
//! - Cancellation is an error *kind*, so handlers can always distinguish a
//!   deliberate cancellation from a genuine failure
//! - Consistency violations (arbiter double-resume, illegal stage
//!   transitions) are not represented here at all: they panic and must never
//!   be caught, since recovering would hide a structural bug

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The operation was cancelled.
    Cancelled,
    /// A result was requested from a task that has not reached a terminal
    /// state.
    NotCompleted,
    /// The task body panicked.
    Panicked,
    /// Invalid lifecycle state transition.
    InvalidStateTransition,
    /// Internal runtime error (bug).
    Internal,
    /// User-provided error.
    User,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::NotCompleted => write!(f, "not completed"),
            Self::Panicked => write!(f, "panicked"),
            Self::InvalidStateTransition => write!(f, "invalid state transition"),
            Self::Internal => write!(f, "internal"),
            Self::User => write!(f, "user"),
        }
    }
}

/// The main error type for runtime operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Creates a user error with a message.
    #[must_use]
    pub fn user(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::User).with_message(message)
    }

    /// Attaches a message to this error.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attaches a source error.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the attached message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Convenience alias for results with the runtime error type.
pub type Result<T> = std::result::Result<T, Error>;
