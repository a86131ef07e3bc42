//! Runtime facade
//!
//! The `Runtime` owns the actors of one process and wires every component
//! together: the message channel, the dispatcher, the subscription manager
//! and the rerender scheduler, all over one shared `ReplicatedStore`.

use crate::actor::{Actor, ActorHandle, ActorSpec};
use crate::channel::MessageChannel;
use crate::config::{RuntimeConfig, TickMode};
use crate::diagnostics::{DiagnosticCollector, DiagnosticSink};
use crate::dispatch::{DispatchOutcome, Dispatcher, PassReport};
use crate::error::{Result, RuntimeError};
use crate::machine::Interpreter;
use crate::scheduler::{ManualTick, NoopRenderer, Renderer, RerenderScheduler, TickExecutor, TokioTick};
use crate::subscriptions::SubscriptionManager;
use crate::tools::{ToolRegistry, ToolSet};
use crate::validation::{JsonSchemaRegistry, SchemaRegistry};
use cadence_store::{MemoryStore, ReplicatedStore};
use cadence_types::{ActorId, Message, MessageDraft, Sequence};
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

const PUMP_RETRY: Duration = Duration::from_millis(1);

/// Runtime statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub actors: usize,
    pub subscriptions: usize,
    pub renders: u64,
    /// Completed dispatch passes
    pub passes: u64,
}

struct RuntimeInner {
    config: RuntimeConfig,
    store: Arc<dyn ReplicatedStore>,
    channel: MessageChannel,
    scheduler: Arc<RerenderScheduler>,
    subscriptions: SubscriptionManager,
    dispatcher: Dispatcher,
    diagnostics: Arc<dyn DiagnosticSink>,
    manual_tick: Option<Arc<ManualTick>>,
    actors: RwLock<HashMap<ActorId, ActorHandle>>,
}

/// Handle to a running set of actors
///
/// Cloning is cheap; every clone drives the same actors.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

/// Assembles a `Runtime`
///
/// Every collaborator has a default: an in-memory store, an empty JSON
/// Schema registry, store-backed tools, no rendering, and a tick executor
/// chosen by `scheduler.tick`.
#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    store: Option<Arc<dyn ReplicatedStore>>,
    schemas: Option<Arc<dyn SchemaRegistry>>,
    tools: Option<Arc<dyn ToolRegistry>>,
    renderer: Option<Arc<dyn Renderer>>,
    executor: Option<Arc<dyn TickExecutor>>,
    diagnostics: Option<Arc<dyn DiagnosticSink>>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn ReplicatedStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn schemas(mut self, schemas: Arc<dyn SchemaRegistry>) -> Self {
        self.schemas = Some(schemas);
        self
    }

    pub fn tools(mut self, tools: Arc<dyn ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn tick(mut self, executor: Arc<dyn TickExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn diagnostics(mut self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn build(self) -> Result<Runtime> {
        self.config
            .validate()
            .map_err(|e| RuntimeError::Config(e.to_string()))?;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn ReplicatedStore>);
        let schemas = self
            .schemas
            .unwrap_or_else(|| Arc::new(JsonSchemaRegistry::new()) as Arc<dyn SchemaRegistry>);
        let tools = self.tools.unwrap_or_else(|| {
            Arc::new(ToolSet::new().with_store(store.clone())) as Arc<dyn ToolRegistry>
        });
        let renderer = self
            .renderer
            .unwrap_or_else(|| Arc::new(NoopRenderer) as Arc<dyn Renderer>);
        let mut manual_tick = None;
        let executor = match (self.executor, self.config.scheduler.tick) {
            (Some(executor), _) => executor,
            (None, TickMode::Tokio) => Arc::new(TokioTick) as Arc<dyn TickExecutor>,
            (None, TickMode::Manual) => {
                let tick = Arc::new(ManualTick::new());
                manual_tick = Some(tick.clone());
                tick as Arc<dyn TickExecutor>
            }
        };
        let diagnostics = self
            .diagnostics
            .unwrap_or_else(|| Arc::new(DiagnosticCollector::new()) as Arc<dyn DiagnosticSink>);

        let channel = MessageChannel::new(store.clone(), self.config.documents.clone());
        let scheduler = Arc::new(RerenderScheduler::new(executor, renderer));
        let subscriptions =
            SubscriptionManager::new(store.clone(), scheduler.clone(), diagnostics.clone());
        let interpreter = Interpreter::new(store.clone(), channel.clone(), tools);
        let dispatcher = Dispatcher::new(
            channel.clone(),
            schemas,
            interpreter,
            subscriptions.clone(),
            scheduler.clone(),
            diagnostics.clone(),
            self.config.dispatch.max_batch,
        );

        Ok(Runtime {
            inner: Arc::new(RuntimeInner {
                config: self.config,
                store,
                channel,
                scheduler,
                subscriptions,
                dispatcher,
                diagnostics,
                manual_tick,
                actors: RwLock::new(HashMap::new()),
            }),
        })
    }
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn ReplicatedStore> {
        &self.inner.store
    }

    pub fn channel(&self) -> &MessageChannel {
        &self.inner.channel
    }

    pub fn scheduler(&self) -> &Arc<RerenderScheduler> {
        &self.inner.scheduler
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.inner.subscriptions
    }

    pub fn diagnostics(&self) -> &Arc<dyn DiagnosticSink> {
        &self.inner.diagnostics
    }

    /// The tick executor built for `tick: manual`, if any
    pub fn manual_tick(&self) -> Option<&Arc<ManualTick>> {
        self.inner.manual_tick.as_ref()
    }

    pub fn actor(&self, id: &ActorId) -> Option<ActorHandle> {
        self.inner.actors.read().get(id).cloned()
    }

    pub fn actor_ids(&self) -> Vec<ActorId> {
        let mut ids: Vec<ActorId> = self.inner.actors.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Create an actor, open its subscriptions and start its machine
    ///
    /// The configuration document is read once here for the references it
    /// names; the documents those references point to are followed live.
    pub async fn spawn_actor(&self, spec: ActorSpec) -> Result<ActorHandle> {
        let id = spec.id.clone();
        if self.inner.actors.read().contains_key(&id) {
            return Err(RuntimeError::ActorExists(id));
        }

        let layout = &self.inner.config.documents;
        let config_doc = spec.config.clone().unwrap_or_else(|| layout.config(&id));
        let config = self
            .inner
            .store
            .get(&config_doc)
            .await?
            .unwrap_or_default();
        let context_doc = config
            .get("context")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| layout.context(&id));

        let actor = Arc::new(Actor::new(
            id.clone(),
            layout.inbox(&id),
            config_doc,
            context_doc,
            config,
            spec.accepts,
        ));

        {
            let mut actors = self.inner.actors.write();
            if actors.contains_key(&id) {
                return Err(RuntimeError::ActorExists(id));
            }
            actors.insert(id.clone(), actor.clone());
        }

        self.inner.subscriptions.initialize(&actor);
        self.inner.dispatcher.start(&actor).await;
        self.inner.scheduler.schedule(&id);

        if self.inner.config.dispatch.auto {
            self.start_pump(&actor);
            if let Err(err) = self.inner.dispatcher.process_pending(&actor).await {
                // Children belong to other spawns; only this actor goes
                if self.inner.actors.write().remove(&id).is_some() {
                    self.teardown(&actor);
                }
                warn!(actor = %id, error = %err, "initial dispatch failed, spawn abandoned");
                return Err(err);
            }
        }

        info!(
            actor = %id,
            state = ?actor.current_state(),
            subscriptions = actor.subscription_count(),
            "actor spawned"
        );
        Ok(actor)
    }

    /// Follow the actor's inbox and dispatch whenever it changes
    fn start_pump(&self, actor: &ActorHandle) {
        let mut inbox = self.inner.channel.subscribe(actor.id());
        let runtime: Weak<RuntimeInner> = Arc::downgrade(&self.inner);
        let id = actor.id().clone();

        let handle = tokio::spawn(async move {
            let mut handled = Sequence::ZERO;
            while let Some(snapshot) = inbox.next().await {
                // Only the newest queued snapshot matters
                let snapshot = inbox.latest(snapshot);
                if !snapshot.has_work_above(handled) {
                    continue;
                }
                let Some(inner) = runtime.upgrade() else {
                    break;
                };
                let runtime = Runtime { inner };
                loop {
                    match runtime.process_pending(&id).await {
                        // The running pass selected its entries before this change
                        Ok(DispatchOutcome::Busy) => {
                            tokio::time::sleep(PUMP_RETRY).await;
                        }
                        Ok(DispatchOutcome::Completed(report)) => {
                            handled = handled.max(report.watermark);
                            break;
                        }
                        Err(err) => {
                            warn!(actor = %id, error = %err, "dispatch pass failed");
                            break;
                        }
                    }
                }
            }
            debug!(actor = %id, "inbox pump stopped");
        });
        actor.set_pump(handle);
    }

    /// Destroy an actor and, first, its live children
    ///
    /// Returns false if no such actor exists.
    pub fn destroy_actor(&self, id: &ActorId) -> bool {
        let Some(actor) = self.inner.actors.write().remove(id) else {
            return false;
        };

        for child in actor.children().into_values() {
            if self.destroy_actor(&child) {
                debug!(parent = %id, child = %child, "child destroyed");
            }
        }

        self.teardown(&actor);
        info!(actor = %id, "actor destroyed");
        true
    }

    /// Stop an actor that is no longer registered
    fn teardown(&self, actor: &ActorHandle) {
        actor.stop_pump();
        self.inner.subscriptions.cleanup(actor);
        self.inner.scheduler.forget(actor.id());
    }

    /// Append a message to an actor's inbox
    pub async fn send_message(&self, target: &ActorId, draft: MessageDraft) -> Result<Message> {
        Ok(self.inner.channel.send(target, draft).await?)
    }

    /// Run one dispatch pass for an actor
    pub async fn process_pending(&self, id: &ActorId) -> Result<DispatchOutcome> {
        let actor = self
            .actor(id)
            .ok_or_else(|| RuntimeError::ActorNotFound(id.clone()))?;
        self.inner.dispatcher.process_pending(&actor).await
    }

    /// Dispatch until every inbox is empty
    ///
    /// Runs passes over all actors in id order, round after round, until a
    /// round dispatches nothing or `max_rounds` is reached. Returns the
    /// combined report.
    pub async fn drain(&self, max_rounds: usize) -> Result<PassReport> {
        let mut total = PassReport::default();
        for _ in 0..max_rounds {
            let mut progressed = false;
            for id in self.actor_ids() {
                match self.process_pending(&id).await? {
                    DispatchOutcome::Completed(report) => {
                        progressed |= !report.is_idle();
                        total.absorb(&report);
                    }
                    DispatchOutcome::Busy => {
                        progressed = true;
                        tokio::task::yield_now().await;
                    }
                }
            }
            if !progressed {
                return Ok(total);
            }
        }
        warn!(rounds = max_rounds, "inboxes still busy after drain limit");
        Ok(total)
    }

    pub fn stats(&self) -> RuntimeStats {
        let actors = self.inner.actors.read();
        RuntimeStats {
            actors: actors.len(),
            subscriptions: actors.values().map(|a| a.subscription_count()).sum(),
            renders: self.inner.scheduler.flush_count(),
            passes: self.inner.dispatcher.pass_count(),
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("actors", &self.actor_ids())
            .finish()
    }
}
