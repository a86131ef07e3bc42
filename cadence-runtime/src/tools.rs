//! Tool invocation for `tool` actions
//!
//! The runtime only needs `ToolRegistry::execute`; how tools are registered
//! is up to the host. `ToolSet` is a simple registry of synchronous
//! closures, optionally with built-in tools that write to the store's
//! record collections.

use crate::actor::ActorHandle;
use async_trait::async_trait;
use cadence_store::{ReplicatedStore, Source, StoreError};
use cadence_types::{ActorId, Query, Value};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("invalid payload for tool '{tool}': {reason}")]
    InvalidPayload { tool: String, reason: String },

    #[error("tool '{tool}' failed: {reason}")]
    Failed { tool: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Executes named tools on behalf of actors
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    async fn execute(&self, tool: &str, payload: Value, actor: &ActorHandle)
        -> Result<Value, ToolError>;
}

type ToolFn = Arc<dyn Fn(Value, &ActorId) -> Result<Value, ToolError> + Send + Sync>;

/// Registry of closure-backed tools
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: HashMap<String, ToolFn>,
    store: Option<Arc<dyn ReplicatedStore>>,
}

#[derive(Deserialize)]
struct RecordRef {
    collection: String,
    id: String,
    #[serde(default)]
    record: Option<Value>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable the `store/put`, `store/get` and `store/remove` tools
    pub fn with_store(mut self, store: Arc<dyn ReplicatedStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn register<F>(&mut self, name: impl Into<String>, tool: F)
    where
        F: Fn(Value, &ActorId) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        self.tools.insert(name.into(), Arc::new(tool));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        if self.store.is_some() {
            names.extend(["store/get", "store/put", "store/remove"].map(String::from));
        }
        names.sort();
        names
    }

    async fn builtin(
        &self,
        store: &Arc<dyn ReplicatedStore>,
        tool: &str,
        payload: Value,
    ) -> Result<Value, ToolError> {
        let target: RecordRef =
            serde_json::from_value(payload).map_err(|e| ToolError::InvalidPayload {
                tool: tool.to_string(),
                reason: e.to_string(),
            })?;

        match tool {
            "store/put" => {
                let record = target.record.ok_or_else(|| ToolError::InvalidPayload {
                    tool: tool.to_string(),
                    reason: "missing field `record`".to_string(),
                })?;
                store.put(&target.collection, &target.id, record.clone()).await?;
                Ok(record)
            }
            "store/remove" => Ok(store
                .remove(&target.collection, &target.id)
                .await?
                .unwrap_or(Value::Null)),
            "store/get" => Ok(store
                .read(
                    &Source::Collection(target.collection),
                    &Query::Key(target.id),
                )
                .get()),
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }
}

#[async_trait]
impl ToolRegistry for ToolSet {
    async fn execute(
        &self,
        tool: &str,
        payload: Value,
        actor: &ActorHandle,
    ) -> Result<Value, ToolError> {
        if let Some(f) = self.tools.get(tool) {
            return f(payload, actor.id());
        }
        match &self.store {
            Some(store) if tool.starts_with("store/") => self.builtin(store, tool, payload).await,
            _ => Err(ToolError::UnknownTool(tool.to_string())),
        }
    }
}
