//! Control plane API (spec §4.I): the surface each operator instance sees to
//! emit diagnostics, resolve secrets, and cooperate with the executor.

use std::sync::Arc;

use crate::diagnostics::{Diagnostic, DiagnosticSink};

/// A named reference to a secret, as an operator would declare it in its
/// configuration (e.g. `secret("kafka-password")`). Resolution itself is out
/// of scope (secret stores are an external collaborator, spec §1); the core
/// only defines the contract operators call through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecretRef(pub String);

impl SecretRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

/// Resolves named secret references to their values. The real implementation
/// lives outside this core (spec §1); `flux-exec` wires a resolver in when it
/// builds each operator's [`ControlPlane`] handle.
#[async_trait::async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, refs: &[SecretRef]) -> crate::error::Result<Vec<String>>;
}

/// A resolver that always fails; used when a pipeline never needs secrets but
/// still wants a concrete [`ControlPlane`].
pub struct NoSecrets;

#[async_trait::async_trait]
impl SecretResolver for NoSecrets {
    async fn resolve(&self, refs: &[SecretRef]) -> crate::error::Result<Vec<String>> {
        if refs.is_empty() {
            return Ok(Vec::new());
        }
        Err(crate::error::PipelineError::configuration(format!(
            "no secret store configured; cannot resolve {:?}",
            refs.iter().map(|r| &r.0).collect::<Vec<_>>()
        )))
    }
}

/// The handle every operator instance receives from the executor (spec
/// §4.I). Cheaply cloneable: it is handed to every operator task spawned for
/// a pipeline run.
#[derive(Clone)]
pub struct ControlPlane {
    diagnostics: Arc<dyn DiagnosticSink>,
    secrets: Arc<dyn SecretResolver>,
    shutting_down: Arc<std::sync::atomic::AtomicBool>,
    failure: Arc<std::sync::Mutex<Option<String>>>,
    allow_unsafe_pipelines: bool,
}

impl ControlPlane {
    pub fn new(diagnostics: Arc<dyn DiagnosticSink>, secrets: Arc<dyn SecretResolver>) -> Self {
        Self {
            diagnostics,
            secrets,
            shutting_down: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            failure: Arc::new(std::sync::Mutex::new(None)),
            allow_unsafe_pipelines: false,
        }
    }

    pub fn with_unsafe_pipelines_allowed(mut self, allowed: bool) -> Self {
        self.allow_unsafe_pipelines = allowed;
        self
    }

    pub fn emit(&self, diagnostic: Diagnostic) {
        let is_fatal = diagnostic.is_fatal();
        let message = diagnostic.message.clone();
        self.diagnostics.emit(diagnostic);
        // Spec §4.H: "`error` severity also causes the emitting operator to
        // return a failure result, which the executor surfaces to the
        // pipeline caller." An operator mid-stream can't return an `Err`
        // from a `Stream` item, so it marks the shared control plane instead
        // and the executor's per-operator task checks this once the
        // operator's output stream ends (`schedule::run_operator`).
        if is_fatal {
            self.mark_failed(message);
        }
    }

    pub async fn resolve_secrets(&self, refs: &[SecretRef]) -> crate::error::Result<Vec<String>> {
        self.secrets.resolve(refs).await
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn allow_unsafe_pipelines(&self) -> bool {
        self.allow_unsafe_pipelines
    }

    /// Called by the executor when cancellation is requested (spec §4.F).
    /// Not part of the public operator-facing contract in §4.I, but
    /// operators observe its effect through `is_shutting_down`. Public so
    /// `flux-exec`'s scheduler can call it from the cancellation path; an
    /// operator itself has no legitimate reason to call this on its own
    /// handle.
    pub fn mark_shutting_down(&self) {
        self.shutting_down
            .store(true, std::sync::atomic::Ordering::Relaxed);
    }

    /// Records that the operator holding this handle hit a fatal failure.
    /// Only the first failure is kept; later ones are assumed to be
    /// downstream fallout from the same root cause.
    pub fn mark_failed(&self, message: impl Into<String>) {
        let mut failure = self.failure.lock().expect("poisoned");
        if failure.is_none() {
            *failure = Some(message.into());
        }
    }

    /// The first fatal-failure message recorded via [`Self::emit`] or
    /// [`Self::mark_failed`], if any.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().expect("poisoned").clone()
    }
}
