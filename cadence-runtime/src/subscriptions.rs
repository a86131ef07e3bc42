//! Subscription management
//!
//! Keeps an actor's in-memory state in sync with the store. Two kinds of
//! subscription exist:
//!
//! - configuration references (`view`, `style`, `brand`, `state`,
//!   `interface`, `context`), each a live read of a document whose value is
//!   mirrored into the actor;
//! - query descriptors found in the raw context, each a live read of a
//!   collection whose result lands in the derived context layer.
//!
//! Query filters may reference other context keys (`{"id": "$sparkId"}`).
//! When those keys change the query is re-resolved, and if the resolved
//! query differs the old subscription is retired and a new one opened.
//! Every callback compares the incoming value with the current one first,
//! so replays and duplicates cost nothing.

use crate::actor::{Actor, ActorHandle};
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink};
use crate::expr::substitute_context;
use crate::machine::{MachineDefinition, StateMachine};
use crate::scheduler::RerenderScheduler;
use cadence_store::{ReactiveStore, ReplicatedStore, Source, Unsubscribe};
use cadence_types::{ConfigKind, Filter, Map, Query, QueryDescriptor, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubscriptionKey {
    Config(ConfigKind),
    /// Query descriptor under this context key
    Query(String),
}

/// A live read and the means to end it
pub struct Subscription {
    store: ReactiveStore<Value>,
    unsubscribe: Unsubscribe,
    source: Source,
    query: Query,
}

impl Subscription {
    pub fn value(&self) -> Value {
        self.store.get()
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    fn reads(&self, source: &Source, query: &Query) -> bool {
        &self.source == source && &self.query == query
    }

    pub fn release(self) {
        self.unsubscribe.call();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("source", &self.source)
            .field("query", &self.query)
            .finish()
    }
}

/// An actor's subscriptions, one per key
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    entries: BTreeMap<SubscriptionKey, Subscription>,
}

impl SubscriptionSet {
    /// Store a subscription, returning the one it replaces
    pub fn insert(&mut self, key: SubscriptionKey, sub: Subscription) -> Option<Subscription> {
        self.entries.insert(key, sub)
    }

    pub fn remove(&mut self, key: &SubscriptionKey) -> Option<Subscription> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &SubscriptionKey) -> Option<&Subscription> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> Vec<Subscription> {
        std::mem::take(&mut self.entries).into_values().collect()
    }
}

/// How a descriptor is currently answered
#[derive(Debug, Clone, PartialEq)]
enum Resolution {
    Read(Source, Query),
    /// A reference resolved to null; no store read is needed
    Constant(Value),
}

fn resolve(descriptor: &QueryDescriptor, raw: &Map) -> Result<Resolution, String> {
    let source = Source::Collection(descriptor.collection.clone());
    let Some(filter) = &descriptor.filter else {
        return Ok(Resolution::Read(source, Query::All));
    };

    match substitute_context(&Value::Object(filter.clone()), raw) {
        None => {
            let point = filter.len() == 1 && filter.contains_key("id");
            Ok(Resolution::Constant(if point {
                Value::Null
            } else {
                Value::Array(Vec::new())
            }))
        }
        Some(resolved) => {
            let filter = Filter::parse(&resolved).map_err(|e| e.to_string())?;
            Ok(Resolution::Read(source, Query::for_filter(Some(filter))))
        }
    }
}

#[derive(Clone)]
pub struct SubscriptionManager {
    store: Arc<dyn ReplicatedStore>,
    scheduler: Arc<RerenderScheduler>,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl SubscriptionManager {
    pub fn new(
        store: Arc<dyn ReplicatedStore>,
        scheduler: Arc<RerenderScheduler>,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            store,
            scheduler,
            diagnostics,
        }
    }

    /// Open every configuration and query subscription of an actor
    pub fn initialize(&self, actor: &ActorHandle) {
        for kind in ConfigKind::ALL {
            let Some(document) = actor.config_ref(kind).map(str::to_string) else {
                continue;
            };
            let source = Source::Document(document);
            let store = self.store.read(&source, &Query::All);

            let weak = Arc::downgrade(actor);
            let manager = self.clone();
            let unsubscribe = store.subscribe(move |value| {
                if let Some(actor) = weak.upgrade() {
                    manager.apply_config(&actor, kind, value);
                }
            });
            self.apply_config(actor, kind, &store.get());

            self.install(
                actor,
                SubscriptionKey::Config(kind),
                Subscription {
                    store,
                    unsubscribe,
                    source,
                    query: Query::All,
                },
            );
        }

        // Queries already opened while applying the context are kept as is
        let keys: Vec<String> = actor
            .state
            .read()
            .context
            .descriptors()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        self.refresh_queries(actor, &keys);
        debug!(actor = %actor.id(), subscriptions = actor.subscription_count(), "subscriptions initialized");
    }

    /// Re-resolve queries affected by changed context keys
    ///
    /// A descriptor is affected if its own key changed or its filter
    /// references a changed key. Its subscription is replaced only if the
    /// resolved query differs from the one currently open. Query
    /// subscriptions whose key no longer holds a descriptor are retired.
    pub fn refresh_queries(&self, actor: &ActorHandle, changed: &[String]) {
        let changed: BTreeSet<&str> = changed.iter().map(String::as_str).collect();

        let (affected, raw, live) = {
            let state = actor.state.read();
            let descriptors = state.context.descriptors();
            let affected: Vec<(String, QueryDescriptor)> = descriptors
                .iter()
                .filter(|(key, d)| {
                    changed.contains(key.as_str())
                        || d.references().iter().any(|r| changed.contains(r.as_str()))
                })
                .cloned()
                .collect();
            let live: BTreeSet<String> = descriptors.into_iter().map(|(key, _)| key).collect();
            (affected, state.context.raw().clone(), live)
        };
        let stale: Vec<SubscriptionKey> = actor
            .subscription_keys()
            .into_iter()
            .filter(|key| matches!(key, SubscriptionKey::Query(k) if !live.contains(k)))
            .collect();

        for key in stale {
            let removed = actor.subscriptions.lock().remove(&key);
            if let Some(sub) = removed {
                debug!(actor = %actor.id(), key = ?key, "query retired");
                sub.release();
            }
        }

        for (key, descriptor) in affected {
            match resolve(&descriptor, &raw) {
                Ok(resolution) => self.apply_resolution(actor, key, resolution),
                Err(reason) => self.diagnostics.emit_diagnostic(Diagnostic::warning(
                    actor.id().clone(),
                    DiagnosticKind::Subscription,
                    format!("query '{}' has an invalid filter: {}", key, reason),
                )),
            }
        }
    }

    /// Release every subscription of an actor
    pub fn cleanup(&self, actor: &Actor) {
        let subscriptions = actor.subscriptions.lock().drain();
        let count = subscriptions.len();
        for sub in subscriptions {
            sub.release();
        }
        debug!(actor = %actor.id(), released = count, "subscriptions released");
    }

    fn install(&self, actor: &Actor, key: SubscriptionKey, sub: Subscription) {
        let previous = actor.subscriptions.lock().insert(key, sub);
        if let Some(previous) = previous {
            previous.release();
        }
    }

    fn apply_resolution(&self, actor: &ActorHandle, key: String, resolution: Resolution) {
        let sub_key = SubscriptionKey::Query(key.clone());
        match resolution {
            Resolution::Constant(value) => {
                let removed = actor.subscriptions.lock().remove(&sub_key);
                if let Some(sub) = removed {
                    sub.release();
                }
                self.set_derived(actor, &key, value);
            }
            Resolution::Read(source, query) => {
                let unchanged = actor
                    .subscriptions
                    .lock()
                    .get(&sub_key)
                    .map(|sub| sub.reads(&source, &query))
                    .unwrap_or(false);
                if unchanged {
                    return;
                }

                debug!(actor = %actor.id(), key = %key, source = %source, point = query.is_point_lookup(), "query subscribed");
                let store = self.store.read(&source, &query);
                let weak: Weak<Actor> = Arc::downgrade(actor);
                let manager = self.clone();
                let callback_key = key.clone();
                let unsubscribe = store.subscribe(move |value| {
                    if let Some(actor) = weak.upgrade() {
                        manager.set_derived(&actor, &callback_key, value.clone());
                    }
                });
                self.set_derived(actor, &key, store.get());
                self.install(
                    actor,
                    sub_key,
                    Subscription {
                        store,
                        unsubscribe,
                        source,
                        query,
                    },
                );
            }
        }
    }

    fn set_derived(&self, actor: &Actor, key: &str, value: Value) {
        let changed = actor.state.write().context.apply_derived(key, value);
        if changed {
            self.scheduler.schedule(actor.id());
        }
    }

    fn apply_config(&self, actor: &ActorHandle, kind: ConfigKind, value: &Value) {
        if kind == ConfigKind::Context {
            self.apply_context(actor, value);
            return;
        }

        {
            let mut state = actor.state.write();
            if state.mirrored.get(&kind) == Some(value) {
                return;
            }
            state.mirrored.insert(kind, value.clone());
        }

        match kind {
            ConfigKind::State if !value.is_null() => match MachineDefinition::from_value(value) {
                Ok(definition) => attach_machine(actor, Arc::new(definition)),
                Err(err) => {
                    self.diagnostics.emit_diagnostic(Diagnostic::error(
                        actor.id().clone(),
                        DiagnosticKind::Subscription,
                        format!("state definition rejected: {}", err),
                    ));
                    return;
                }
            },
            ConfigKind::Interface => {
                if let Some(accepts) = value.get("accepts").and_then(Value::as_array) {
                    actor.state.write().accepts = accepts
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect();
                }
            }
            _ => {}
        }

        debug!(actor = %actor.id(), reference = %kind, "configuration updated");
        self.scheduler.schedule(actor.id());
    }

    fn apply_context(&self, actor: &ActorHandle, value: &Value) {
        let incoming = match value {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        let changed = {
            let mut state = actor.state.write();
            if state.context.raw() == &incoming {
                return;
            }
            state.context.replace_raw(incoming)
        };
        if changed.is_empty() {
            return;
        }
        self.refresh_queries(actor, &changed);
        self.scheduler.schedule(actor.id());
    }
}

/// Swap in a new definition, or attach a first machine
fn attach_machine(actor: &Actor, definition: Arc<MachineDefinition>) {
    let mut guard = actor.state.write();
    let state = &mut *guard;
    match state.machine.as_mut() {
        Some(machine) => {
            machine.replace_definition(definition);
        }
        None => {
            state.machine = Some(StateMachine::new(definition));
            state.pending_start = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor(value: Value) -> QueryDescriptor {
        QueryDescriptor::detect(&value).unwrap()
    }

    fn raw(value: Value) -> Map {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_resolve_point_lookup() {
        let d = descriptor(json!({"collection": "spark", "filter": {"id": "$sparkId"}}));
        assert_eq!(
            resolve(&d, &raw(json!({"sparkId": "X"}))).unwrap(),
            Resolution::Read(
                Source::Collection("spark".into()),
                Query::Key("X".to_string())
            )
        );
        assert_eq!(
            resolve(&d, &raw(json!({"sparkId": null}))).unwrap(),
            Resolution::Constant(Value::Null)
        );
    }

    #[test]
    fn test_resolve_scan() {
        let d = descriptor(json!({"collection": "todos", "filter": {"owner": "$user", "done": false}}));
        let resolved = resolve(&d, &raw(json!({"user": "ada"}))).unwrap();
        let Resolution::Read(_, Query::Filter(filter)) = resolved else {
            panic!("expected a filtered scan");
        };
        assert!(filter.matches(&json!({"owner": "ada", "done": false})));

        assert_eq!(
            resolve(&d, &raw(json!({}))).unwrap(),
            Resolution::Constant(json!([]))
        );
        assert_eq!(
            resolve(&descriptor(json!({"collection": "todos"})), &Map::new()).unwrap(),
            Resolution::Read(Source::Collection("todos".into()), Query::All)
        );
    }

    #[test]
    fn test_resolve_invalid_filter() {
        let d = descriptor(json!({"collection": "todos", "filter": {"n": {"$near": 1}}}));
        assert!(resolve(&d, &Map::new()).is_err());
    }
}
