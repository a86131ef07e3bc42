//! Shared fixtures for runtime integration tests

#![allow(dead_code)]

use cadence_runtime::{
    ActorHandle, ActorSpec, DiagnosticCollector, DispatchConfig, JsonSchemaRegistry, ManualTick,
    PassReport, RenderLog, Runtime, RuntimeConfig, ToolSet,
};
use cadence_store::{MemoryStore, ReplicatedStore};
use cadence_types::{ActorId, Map, Message, MessageDraft, Value};
use serde_json::json;
use std::sync::Arc;

pub struct Harness {
    pub runtime: Runtime,
    pub store: Arc<MemoryStore>,
    pub schemas: Arc<JsonSchemaRegistry>,
    pub tick: Arc<ManualTick>,
    pub renders: Arc<RenderLog>,
    pub diagnostics: Arc<DiagnosticCollector>,
}

/// Explicit passes only; flushes run when the test says so
pub fn manual_config() -> RuntimeConfig {
    RuntimeConfig {
        dispatch: DispatchConfig {
            auto: false,
            max_batch: None,
        },
        ..RuntimeConfig::default()
    }
}

pub fn object(value: Value) -> Map {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {}", other),
    }
}

pub fn counter_machine() -> Value {
    json!({
        "initial": "active",
        "states": {
            "active": {
                "entry": [{"updateContext": {"count": 0}}],
                "on": {
                    "INC": {
                        "guard": {"$lt": ["$count", 100]},
                        "actions": [{"updateContext": {"count": {"$add": ["$count", "$$by"]}}}]
                    },
                    "STOP": "stopped"
                }
            },
            "stopped": {
                "on": {"RESUME": "active"}
            }
        }
    })
}

impl Harness {
    pub fn new() -> Self {
        Self::build(manual_config(), |tools| tools)
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::build(config, |tools| tools)
    }

    pub fn with_tools(register: impl FnOnce(ToolSet) -> ToolSet) -> Self {
        Self::build(manual_config(), register)
    }

    fn build(config: RuntimeConfig, register: impl FnOnce(ToolSet) -> ToolSet) -> Self {
        let store = Arc::new(MemoryStore::new());
        let schemas = Arc::new(JsonSchemaRegistry::new());
        let tick = Arc::new(ManualTick::new());
        let renders = Arc::new(RenderLog::new());
        let diagnostics = Arc::new(DiagnosticCollector::new());
        let tools = register(ToolSet::new().with_store(store.clone()));

        schemas
            .register(
                "INC",
                json!({
                    "type": "object",
                    "required": ["by"],
                    "properties": {"by": {"type": "integer"}}
                }),
            )
            .unwrap();
        for kind in ["STOP", "RESUME"] {
            schemas.register(kind, json!({})).unwrap();
        }

        let runtime = Runtime::builder()
            .config(config)
            .store(store.clone())
            .schemas(schemas.clone())
            .tools(Arc::new(tools))
            .renderer(renders.clone())
            .tick(tick.clone())
            .diagnostics(diagnostics.clone())
            .build()
            .unwrap();

        Self {
            runtime,
            store,
            schemas,
            tick,
            renders,
            diagnostics,
        }
    }

    pub async fn put_document(&self, document: &str, value: Value) {
        self.store.merge(document, object(value)).await.unwrap();
    }

    /// Spawn an actor running `machine`, accepting `accepts`
    pub async fn spawn_with_machine(&self, id: &str, machine: Value, accepts: &[&str]) -> ActorHandle {
        let machine_doc = format!("machines/{}", id);
        self.put_document(&machine_doc, machine).await;
        self.put_document(&format!("config/{}", id), json!({"state": machine_doc}))
            .await;

        let mut spec = ActorSpec::new(id);
        for kind in accepts {
            spec = spec.accept(*kind);
        }
        self.runtime.spawn_actor(spec).await.unwrap()
    }

    pub async fn counter(&self, id: &str) -> ActorHandle {
        self.spawn_with_machine(id, counter_machine(), &["INC", "STOP", "RESUME"])
            .await
    }

    pub async fn send(&self, to: &str, kind: &str, payload: Value) -> Message {
        self.runtime
            .send_message(&ActorId::new(to), MessageDraft::new(kind, payload, "test"))
            .await
            .unwrap()
    }

    /// One pass that must not find the guard taken
    pub async fn pass(&self, id: &str) -> PassReport {
        self.runtime
            .process_pending(&ActorId::new(id))
            .await
            .unwrap()
            .report()
            .cloned()
            .expect("dispatch pass was busy")
    }

    pub async fn watermark(&self, id: &str) -> u64 {
        self.runtime
            .channel()
            .watermark(&format!("config/{}", id))
            .await
            .unwrap()
            .as_u64()
    }
}
