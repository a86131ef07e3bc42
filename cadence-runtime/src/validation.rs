//! Message validation pipeline
//!
//! Every message taken from an inbox passes three ordered checks before the
//! state machine sees it: the type must be on the actor's whitelist, a
//! schema must be registered for the type, and the payload must satisfy
//! that schema. The first failing check decides the rejection. A message
//! that passes is wrapped in `ValidatedMessage`, the only form the
//! interpreter accepts.

use crate::error::ValidationError;
use cadence_types::{ActorId, Message, Sequence, Value};
use jsonschema::JSONSchema;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// A problem with one field of a payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// JSON pointer into the payload
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Schema of one message type
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub kind: String,
    pub definition: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<FieldError>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn failed(errors: Vec<FieldError>) -> Self {
        Self {
            valid: false,
            errors,
        }
    }
}

/// Source of message schemas
pub trait SchemaRegistry: Send + Sync {
    fn resolve(&self, kind: &str) -> Option<Schema>;

    fn validate(&self, value: &Value, schema: &Schema) -> ValidationReport;
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema for '{kind}' does not compile: {reason}")]
    Compile { kind: String, reason: String },
}

struct Entry {
    schema: Schema,
    compiled: Arc<JSONSchema>,
}

/// Registry backed by JSON Schema documents
///
/// Schemas are compiled when registered, so a broken schema is reported at
/// load time instead of on the first message.
#[derive(Default)]
pub struct JsonSchemaRegistry {
    schemas: RwLock<HashMap<String, Entry>>,
}

fn compile(kind: &str, definition: &Value) -> Result<JSONSchema, SchemaError> {
    JSONSchema::compile(definition).map_err(|e| SchemaError::Compile {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

fn field_errors(compiled: &JSONSchema, value: &Value) -> Vec<FieldError> {
    match compiled.validate(value) {
        Ok(()) => Vec::new(),
        Err(errors) => errors
            .map(|error| {
                let path = error.instance_path.to_string();
                let path = if path.is_empty() { "/".to_string() } else { path };
                FieldError::new(path, error.to_string())
            })
            .collect(),
    }
}

impl JsonSchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: impl Into<String>, definition: Value) -> Result<(), SchemaError> {
        let kind = kind.into();
        let compiled = compile(&kind, &definition)?;
        self.schemas.write().insert(
            kind.clone(),
            Entry {
                schema: Schema { kind, definition },
                compiled: Arc::new(compiled),
            },
        );
        Ok(())
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.schemas.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.schemas.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.read().is_empty()
    }
}

impl SchemaRegistry for JsonSchemaRegistry {
    fn resolve(&self, kind: &str) -> Option<Schema> {
        self.schemas.read().get(kind).map(|e| e.schema.clone())
    }

    fn validate(&self, value: &Value, schema: &Schema) -> ValidationReport {
        let registered = self
            .schemas
            .read()
            .get(&schema.kind)
            .filter(|e| e.schema.definition == schema.definition)
            .map(|e| e.compiled.clone());

        let errors = match registered {
            Some(compiled) => field_errors(&compiled, value),
            None => match compile(&schema.kind, &schema.definition) {
                Ok(compiled) => field_errors(&compiled, value),
                Err(err) => vec![FieldError::new("/", err.to_string())],
            },
        };

        if errors.is_empty() {
            ValidationReport::ok()
        } else {
            ValidationReport::failed(errors)
        }
    }
}

/// A message that passed the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedMessage {
    message: Message,
}

impl ValidatedMessage {
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn kind(&self) -> &str {
        &self.message.kind
    }

    pub fn payload(&self) -> &Value {
        &self.message.payload
    }

    pub fn sequence(&self) -> Sequence {
        self.message.sequence
    }

    pub fn into_message(self) -> Message {
        self.message
    }
}

/// Run the pipeline for one message
pub fn validate_message(
    accepts: &BTreeSet<String>,
    registry: &dyn SchemaRegistry,
    actor: &ActorId,
    message: Message,
) -> Result<ValidatedMessage, ValidationError> {
    if !accepts.contains(&message.kind) {
        return Err(ValidationError::UnknownMessageType {
            actor: actor.clone(),
            kind: message.kind,
        });
    }

    let schema = registry
        .resolve(&message.kind)
        .ok_or_else(|| ValidationError::SchemaNotFound(message.kind.clone()))?;

    let report = registry.validate(&message.payload, &schema);
    if !report.valid {
        return Err(ValidationError::PayloadValidation {
            kind: message.kind,
            errors: report.errors,
        });
    }

    Ok(ValidatedMessage { message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn message(kind: &str, payload: Value) -> Message {
        Message {
            kind: kind.to_string(),
            payload,
            source: ActorId::new("ui"),
            target: ActorId::new("counter"),
            sequence: Sequence::new(1),
            timestamp: Utc::now(),
            processed: false,
        }
    }

    fn registry() -> JsonSchemaRegistry {
        let registry = JsonSchemaRegistry::new();
        registry
            .register(
                "INC",
                json!({
                    "type": "object",
                    "properties": {"by": {"type": "integer", "minimum": 1}},
                    "required": ["by"]
                }),
            )
            .unwrap();
        registry
    }

    fn accepts(kinds: &[&str]) -> BTreeSet<String> {
        kinds.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_valid_message_passes() {
        let validated = validate_message(
            &accepts(&["INC"]),
            &registry(),
            &ActorId::new("counter"),
            message("INC", json!({"by": 2})),
        )
        .unwrap();
        assert_eq!(validated.kind(), "INC");
        assert_eq!(validated.payload()["by"], 2);
    }

    #[test]
    fn test_contract_check_runs_first() {
        // Not whitelisted and also without a schema: the whitelist decides
        let err = validate_message(
            &accepts(&["INC"]),
            &registry(),
            &ActorId::new("counter"),
            message("RESET", json!({})),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownMessageType {
                actor: ActorId::new("counter"),
                kind: "RESET".to_string()
            }
        );
    }

    #[test]
    fn test_missing_schema() {
        let err = validate_message(
            &accepts(&["INC", "RESET"]),
            &registry(),
            &ActorId::new("counter"),
            message("RESET", json!({})),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::SchemaNotFound("RESET".to_string()));
    }

    #[test]
    fn test_payload_errors_carry_paths() {
        let err = validate_message(
            &accepts(&["INC"]),
            &registry(),
            &ActorId::new("counter"),
            message("INC", json!({"by": 0})),
        )
        .unwrap_err();
        let ValidationError::PayloadValidation { kind, errors } = err else {
            panic!("expected payload validation error");
        };
        assert_eq!(kind, "INC");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "/by");
    }

    #[test]
    fn test_broken_schema_rejected_at_registration() {
        let registry = JsonSchemaRegistry::new();
        let err = registry
            .register("X", json!({"type": "not-a-type"}))
            .unwrap_err();
        assert!(matches!(err, SchemaError::Compile { kind, .. } if kind == "X"));
        assert!(registry.is_empty());
    }
}
