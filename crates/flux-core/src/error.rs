//! Closed error taxonomy for the pipeline core (spec §7).
//!
//! Every failure an operator or the executor can report boils down to one of
//! these kinds. Downstream code matches on [`ErrorKind`] to decide whether a
//! failure aborts a pipeline before it starts (`Configuration`), turns into a
//! per-batch warning (`Runtime`), or is fatal.

use thiserror::Error;

/// The closed set of error kinds from spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Parse,
    TypeMismatch,
    KindMismatch,
    Configuration,
    Runtime,
    Io,
    StateCorruption,
    Cancelled,
    ResourceExhausted,
}

impl ErrorKind {
    /// Whether this error kind must prevent a pipeline from starting at all
    /// (raised during `instantiate`, before any data flows).
    pub fn is_configuration_time(self) -> bool {
        matches!(self, ErrorKind::Configuration | ErrorKind::KindMismatch)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Parse => "parse",
            ErrorKind::TypeMismatch => "type_mismatch",
            ErrorKind::KindMismatch => "kind_mismatch",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Runtime => "runtime",
            ErrorKind::Io => "io",
            ErrorKind::StateCorruption => "state_corruption",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ResourceExhausted => "resource_exhausted",
        };
        f.write_str(s)
    }
}

/// The pipeline core's error type. Every fallible operation returns
/// `Result<T, PipelineError>`; the `kind` drives how the executor and
/// composer react to a failure.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(kind: ErrorKind, message: impl Into<String>, source: anyhow::Error) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn kind_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::KindMismatch, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }

    pub fn state_corruption(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StateCorruption, message)
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        Self::with_source(ErrorKind::Io, e.to_string(), e.into())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
