//! Diagnostics reported by the dispatch loop
//!
//! Messages that fail validation or whose actions fail are consumed rather
//! than retried. Each such event is reported here (and through `tracing`)
//! so that hosts can surface it.

use crate::validation::FieldError;
use cadence_types::{ActorId, Sequence};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "info"),
        }
    }
}

/// What went wrong
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagnosticKind {
    MalformedMessage,
    UnknownMessageType,
    SchemaNotFound,
    PayloadValidation { errors: Vec<FieldError> },
    GuardEvaluation,
    ActionExecution,
    Subscription,
}

/// A diagnostic message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub actor: ActorId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<Sequence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(flatten)]
    pub kind: DiagnosticKind,
    pub message: String,
}

impl Diagnostic {
    pub fn new(
        severity: Severity,
        actor: ActorId,
        kind: DiagnosticKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            actor,
            sequence: None,
            message_type: None,
            kind,
            message: message.into(),
        }
    }

    pub fn error(actor: ActorId, kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, actor, kind, message)
    }

    pub fn warning(actor: ActorId, kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, actor, kind, message)
    }

    /// Attach the inbox entry the diagnostic is about
    pub fn for_message(mut self, sequence: Sequence, message_type: impl Into<String>) -> Self {
        self.sequence = Some(sequence);
        self.message_type = Some(message_type.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.severity, self.actor)?;
        if let Some(seq) = self.sequence {
            write!(f, " {}", seq)?;
        }
        if let Some(kind) = &self.message_type {
            write!(f, " '{}'", kind)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Receiver of runtime diagnostics
pub trait DiagnosticSink: Send + Sync {
    fn emit_diagnostic(&self, diagnostic: Diagnostic);
}

/// Collector for diagnostics
///
/// Every diagnostic is also logged through `tracing` at a level matching
/// its severity.
#[derive(Debug, Default)]
pub struct DiagnosticCollector {
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl DiagnosticCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a diagnostic with explicit parameters
    pub fn emit(
        &self,
        severity: Severity,
        actor: ActorId,
        kind: DiagnosticKind,
        message: impl Into<String>,
    ) {
        self.emit_diagnostic(Diagnostic::new(severity, actor, kind, message));
    }

    /// Emit an error diagnostic
    pub fn error(&self, actor: ActorId, kind: DiagnosticKind, message: impl Into<String>) {
        self.emit(Severity::Error, actor, kind, message);
    }

    /// Emit a warning diagnostic
    pub fn warning(&self, actor: ActorId, kind: DiagnosticKind, message: impl Into<String>) {
        self.emit(Severity::Warning, actor, kind, message);
    }

    /// Emit an info diagnostic
    pub fn info(&self, actor: ActorId, kind: DiagnosticKind, message: impl Into<String>) {
        self.emit(Severity::Info, actor, kind, message);
    }

    /// Get all diagnostics
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().clone()
    }

    /// Get diagnostics by severity
    pub fn diagnostics_by_severity(&self, severity: Severity) -> Vec<Diagnostic> {
        self.diagnostics
            .lock()
            .iter()
            .filter(|d| d.severity == severity)
            .cloned()
            .collect()
    }

    /// Get errors
    pub fn errors(&self) -> Vec<Diagnostic> {
        self.diagnostics_by_severity(Severity::Error)
    }

    /// Get warnings
    pub fn warnings(&self) -> Vec<Diagnostic> {
        self.diagnostics_by_severity(Severity::Warning)
    }

    /// Diagnostics emitted for one actor
    pub fn for_actor(&self, actor: &ActorId) -> Vec<Diagnostic> {
        self.diagnostics
            .lock()
            .iter()
            .filter(|d| &d.actor == actor)
            .cloned()
            .collect()
    }

    /// Check if there are any errors
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .lock()
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Check if there are any diagnostics
    pub fn has_diagnostics(&self) -> bool {
        !self.diagnostics.lock().is_empty()
    }

    /// Take all diagnostics, clearing the collector
    pub fn take_diagnostics(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.diagnostics.lock())
    }

    pub fn clear(&self) {
        self.diagnostics.lock().clear();
    }

    /// Get the number of diagnostics
    pub fn diagnostic_count(&self) -> usize {
        self.diagnostics.lock().len()
    }
}

impl DiagnosticSink for DiagnosticCollector {
    fn emit_diagnostic(&self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Error | Severity::Warning => tracing::warn!(
                actor = %diagnostic.actor,
                sequence = ?diagnostic.sequence.map(|s| s.as_u64()),
                "{}",
                diagnostic.message
            ),
            Severity::Info => tracing::info!(actor = %diagnostic.actor, "{}", diagnostic.message),
        }
        self.diagnostics.lock().push(diagnostic);
    }
}
