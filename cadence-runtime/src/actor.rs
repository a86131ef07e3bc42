//! Actors
//!
//! An actor is the unit of isolation: it owns an inbox, a configuration
//! document, a context document, an optional state machine and the live
//! subscriptions that keep its in-memory state in sync with the store.
//! Only the runtime creates actors; everything else holds an `ActorHandle`.

use crate::context::Context;
use crate::machine::{MachineDefinition, StateMachine, Step};
use crate::subscriptions::{SubscriptionKey, SubscriptionSet};
use cadence_types::{ActorId, ConfigKind, Map, Value};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub type ActorHandle = Arc<Actor>;

/// Everything needed to spawn an actor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorSpec {
    pub id: ActorId,
    /// Configuration document; defaults to `config/<id>`
    #[serde(default)]
    pub config: Option<String>,
    /// Message types accepted until an `interface` reference says otherwise
    #[serde(default)]
    pub accepts: BTreeSet<String>,
}

impl ActorSpec {
    pub fn new(id: impl Into<ActorId>) -> Self {
        Self {
            id: id.into(),
            config: None,
            accepts: BTreeSet::new(),
        }
    }

    pub fn with_config(mut self, document: impl Into<String>) -> Self {
        self.config = Some(document.into());
        self
    }

    pub fn accept(mut self, kind: impl Into<String>) -> Self {
        self.accepts.insert(kind.into());
        self
    }
}

pub(crate) struct ActorState {
    pub(crate) context: Context,
    pub(crate) machine: Option<StateMachine>,
    pub(crate) accepts: BTreeSet<String>,
    /// Last value seen per configuration reference
    pub(crate) mirrored: BTreeMap<ConfigKind, Value>,
    /// A machine was attached and its initial entry actions have not run
    pub(crate) pending_start: bool,
}

pub struct Actor {
    id: ActorId,
    inbox: String,
    config_doc: String,
    context_doc: String,
    config: Map,
    pub(crate) state: RwLock<ActorState>,
    pub(crate) subscriptions: Mutex<SubscriptionSet>,
    dispatch_guard: tokio::sync::Mutex<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Actor {
    pub(crate) fn new(
        id: ActorId,
        inbox: String,
        config_doc: String,
        context_doc: String,
        config: Map,
        accepts: BTreeSet<String>,
    ) -> Self {
        Self {
            id,
            inbox,
            config_doc,
            context_doc,
            config,
            state: RwLock::new(ActorState {
                context: Context::default(),
                machine: None,
                accepts,
                mirrored: BTreeMap::new(),
                pending_start: false,
            }),
            subscriptions: Mutex::new(SubscriptionSet::default()),
            dispatch_guard: tokio::sync::Mutex::new(()),
            pump: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &ActorId {
        &self.id
    }

    pub fn inbox(&self) -> &str {
        &self.inbox
    }

    pub fn config_document(&self) -> &str {
        &self.config_doc
    }

    pub fn context_document(&self) -> &str {
        &self.context_doc
    }

    /// Configuration document as read at spawn
    pub fn config(&self) -> &Map {
        &self.config
    }

    /// Document named by a configuration reference
    pub fn config_ref(&self, kind: ConfigKind) -> Option<&str> {
        match kind {
            ConfigKind::Context => Some(&self.context_doc),
            _ => self.config.get(kind.as_str()).and_then(Value::as_str),
        }
    }

    /// Named child actors from the `children` map
    pub fn children(&self) -> BTreeMap<String, ActorId> {
        self.config
            .get("children")
            .and_then(Value::as_object)
            .map(|children| {
                children
                    .iter()
                    .filter_map(|(name, id)| Some((name.clone(), ActorId::new(id.as_str()?))))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn child(&self, name: &str) -> Option<ActorId> {
        self.children().remove(name)
    }

    pub fn current_state(&self) -> Option<String> {
        self.state
            .read()
            .machine
            .as_ref()
            .map(|m| m.current().to_string())
    }

    pub fn machine_definition(&self) -> Option<Arc<MachineDefinition>> {
        self.state
            .read()
            .machine
            .as_ref()
            .map(|m| m.definition().clone())
    }

    pub fn context(&self) -> Context {
        self.state.read().context.clone()
    }

    /// Merged context value of one key
    pub fn context_value(&self, key: &str) -> Option<Value> {
        self.state.read().context.get(key)
    }

    /// Last value received for a configuration reference
    pub fn mirrored(&self, kind: ConfigKind) -> Option<Value> {
        self.state.read().mirrored.get(&kind).cloned()
    }

    pub fn view(&self) -> Option<Value> {
        self.mirrored(ConfigKind::View)
    }

    pub fn style(&self) -> Option<Value> {
        self.mirrored(ConfigKind::Style)
    }

    pub fn brand(&self) -> Option<Value> {
        self.mirrored(ConfigKind::Brand)
    }

    /// Accepted message types
    pub fn accepts(&self) -> BTreeSet<String> {
        self.state.read().accepts.clone()
    }

    /// Whether a dispatch pass is running
    pub fn is_dispatching(&self) -> bool {
        self.dispatch_guard.try_lock().is_err()
    }

    pub fn subscription_keys(&self) -> Vec<SubscriptionKey> {
        self.subscriptions.lock().keys()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub(crate) fn try_begin_dispatch(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        self.dispatch_guard.try_lock().ok()
    }

    pub(crate) fn machine_snapshot(&self) -> Option<(Arc<MachineDefinition>, String, Context)> {
        let state = self.state.read();
        let machine = state.machine.as_ref()?;
        Some((
            machine.definition().clone(),
            machine.current().to_string(),
            state.context.clone(),
        ))
    }

    pub(crate) fn take_pending_start(&self) -> Option<Arc<MachineDefinition>> {
        let mut state = self.state.write();
        if !state.pending_start {
            return None;
        }
        state.pending_start = false;
        state.machine.as_ref().map(|m| m.definition().clone())
    }

    pub(crate) fn commit_step(&self, definition: &Arc<MachineDefinition>, step: &Step) {
        let mut state = self.state.write();
        state.context.apply_patch(&step.patch);
        if let Some(machine) = state.machine.as_mut() {
            if !machine.enter(&step.to) {
                tracing::debug!(
                    actor = %self.id,
                    target = %step.to,
                    swapped = !Arc::ptr_eq(machine.definition(), definition),
                    "target state no longer defined"
                );
            }
        }
    }

    pub(crate) fn set_pump(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.pump.lock().replace(handle) {
            previous.abort();
        }
    }

    pub(crate) fn stop_pump(&self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for Actor {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

impl std::fmt::Debug for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actor")
            .field("id", &self.id)
            .field("inbox", &self.inbox)
            .field("config", &self.config_doc)
            .field("context", &self.context_doc)
            .finish()
    }
}
