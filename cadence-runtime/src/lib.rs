//! Cadence runtime - actors over a replicated store
//!
//! This crate runs reactive actors whose state lives in a `ReplicatedStore`:
//!
//! - **Channels**: per-actor inbox logs with store-assigned sequences
//! - **Dispatch**: one pass at a time per actor, watermark-tracked
//! - **Validation**: accepted message types plus JSON Schema payload checks
//! - **Machines**: declarative state machines with guards and actions
//! - **Subscriptions**: live configuration references and context queries
//! - **Scheduling**: rerenders coalesced to one flush per tick
//!
//! ## Data flow
//!
//! ```text
//!  send_message ──► inbox/<id> (log)
//!                       │ subscription
//!                       ▼
//!                  Dispatcher ── watermark ──► config/<id>
//!                       │ validate
//!                       ▼
//!                  Interpreter ── patch ─────► context/<id>
//!                       │                          │
//!                       ▼                          ▼
//!             SubscriptionManager ◄──── context changes
//!                       │ derived values
//!                       ▼
//!              RerenderScheduler ──► Renderer (once per tick)
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use cadence_runtime::{ActorSpec, Runtime};
//! use cadence_types::{ActorId, MessageDraft};
//! use serde_json::json;
//!
//! # async fn demo() -> cadence_runtime::Result<()> {
//! let runtime = Runtime::builder().build()?;
//! runtime
//!     .spawn_actor(ActorSpec::new("counter").accept("INC"))
//!     .await?;
//! runtime
//!     .send_message(
//!         &ActorId::new("counter"),
//!         MessageDraft::new("INC", json!({"by": 1}), "ui"),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod channel;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod expr;
pub mod machine;
pub mod runtime;
pub mod scheduler;
pub mod subscriptions;
pub mod tools;
pub mod validation;

pub use actor::{Actor, ActorHandle, ActorSpec};
pub use channel::{Backlog, ChannelSnapshot, ChannelSubscription, MessageChannel};
pub use config::{ConfigError, DispatchConfig, DocumentLayout, RuntimeConfig, SchedulerConfig, TickMode};
pub use context::Context;
pub use diagnostics::{Diagnostic, DiagnosticCollector, DiagnosticKind, DiagnosticSink, Severity};
pub use dispatch::{DispatchOutcome, PassReport};
pub use error::{ChannelError, MachineError, Result, RuntimeError, ValidationError};
pub use expr::{Expr, ExprError, Scope};
pub use machine::{
    Action, ActionEffects, MachineDefinition, NoEffects, StateMachine, StateNode, Step,
    StepResult, Transition,
};
pub use runtime::{Runtime, RuntimeBuilder, RuntimeStats};
pub use scheduler::{
    ManualTick, NoopRenderer, RenderLog, Renderer, RerenderScheduler, TickExecutor, TokioTick,
};
pub use subscriptions::{Subscription, SubscriptionKey, SubscriptionManager};
pub use tools::{ToolError, ToolRegistry, ToolSet};
pub use validation::{
    validate_message, FieldError, JsonSchemaRegistry, Schema, SchemaError, SchemaRegistry,
    ValidatedMessage, ValidationReport,
};
