//! Structured diagnostics channel (spec §4.H, §6.4).
//!
//! Diagnostics are first-class values, not exceptions: an operator that hits
//! a recoverable problem (a type mismatch, an overflowing computation) emits
//! a [`Diagnostic`] on the control plane's sink and carries on, rather than
//! unwinding. Only `Severity::Error` also causes the emitting operator's
//! `run`/`instantiate` call to return a failing [`crate::error::PipelineError`].

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Note,
    Warning,
    Error,
}

/// A byte range into the original TQL source text. The core never
/// interprets these beyond carrying them along; rendering source snippets
/// is the out-of-scope diagnostics-formatting layer's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub begin: usize,
    pub end: usize,
}

impl Location {
    pub fn new(begin: usize, end: usize) -> Self {
        Self { begin, end }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub locations: Vec<Location>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub hints: Vec<String>,
}

impl Diagnostic {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            locations: Vec::new(),
            notes: Vec::new(),
            hints: Vec::new(),
        }
    }

    pub fn note(message: impl Into<String>) -> Self {
        Self::new(Severity::Note, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn primary(mut self, location: Location) -> Self {
        self.locations.push(location);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.push(hint.into());
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Error
    }

    /// Render as the wire JSON object described in spec §6.4.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("Diagnostic always serializes")
    }
}

/// The sink every operator's control plane handle writes diagnostics to.
/// Diagnostics travel out-of-band from data, owned by the control plane
/// rather than by any single operator.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, diagnostic: Diagnostic);
}

/// An in-memory sink, mostly useful for tests and for the CLI's default
/// "print diagnostics to stderr" behavior.
#[derive(Default)]
pub struct CollectingSink {
    diagnostics: std::sync::Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics.lock().expect("poisoned"))
    }
}

impl DiagnosticSink for CollectingSink {
    fn emit(&self, diagnostic: Diagnostic) {
        self.diagnostics.lock().expect("poisoned").push(diagnostic);
    }
}

/// Emits every diagnostic as a `tracing` event at a severity-matched level,
/// for environments where structured collection isn't wired up yet.
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Note => tracing::info!(message = %diagnostic.message, "diagnostic"),
            Severity::Warning => tracing::warn!(message = %diagnostic.message, "diagnostic"),
            Severity::Error => tracing::error!(message = %diagnostic.message, "diagnostic"),
        }
    }
}
