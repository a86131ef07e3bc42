//! Error types for the cadence runtime

use crate::expr::ExprError;
use crate::tools::ToolError;
use crate::validation::FieldError;
use cadence_store::StoreError;
use cadence_types::{ActorId, Sequence};
use thiserror::Error;

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("actor {0} not found")]
    ActorNotFound(ActorId),

    #[error("actor {0} already exists")]
    ActorExists(ActorId),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Machine(#[from] MachineError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Errors raised at the inbox boundary
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Producer bug: the payload still holds an expression
    #[error("payload contains an unresolved expression at '{path}'")]
    UnresolvedPayload { path: String },

    #[error("inbox entry {sequence} is not a message: {reason}")]
    MalformedEntry { sequence: Sequence, reason: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Consumer-side rejections produced by the validation pipeline
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("message type '{kind}' is not accepted by {actor}")]
    UnknownMessageType { actor: ActorId, kind: String },

    #[error("no schema registered for message type '{0}'")]
    SchemaNotFound(String),

    #[error("payload of '{kind}' failed validation: {}", join_field_errors(.errors))]
    PayloadValidation { kind: String, errors: Vec<FieldError> },
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.path, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// State machine definition and execution errors
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("invalid machine definition: {0}")]
    Definition(String),

    #[error("expression error: {0}")]
    Expression(#[from] ExprError),

    #[error("guard evaluation failed: {0}")]
    GuardEvaluation(String),

    #[error("action '{action}' failed: {reason}")]
    ActionExecution { action: String, reason: String },

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type using RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;
