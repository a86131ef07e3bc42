//! Transition execution
//!
//! `MachineDefinition::step` is the pure core: given a state, a context, an
//! event and its payload it selects a transition and runs its actions
//! against a working copy of the context. Side effects (tools, sends) go
//! through `ActionEffects`, so identical inputs with identical effect
//! results always produce the same step.
//!
//! `Interpreter` binds that core to a live actor: it persists the resulting
//! context patch and then commits the new state in memory.

use super::{Action, MachineDefinition, Transition};
use crate::actor::ActorHandle;
use crate::channel::MessageChannel;
use crate::context::Context;
use crate::error::MachineError;
use crate::expr::{Expr, Scope};
use crate::tools::ToolRegistry;
use crate::validation::ValidatedMessage;
use async_trait::async_trait;
use cadence_store::ReplicatedStore;
use cadence_types::{ActorId, Map, MessageDraft, Value};
use std::sync::Arc;
use tracing::debug;

/// Side effects available to actions
#[async_trait]
pub trait ActionEffects: Send + Sync {
    async fn call_tool(&self, name: &str, payload: Value) -> Result<Value, MachineError>;

    async fn send(&self, target: ActorId, kind: &str, payload: Value) -> Result<(), MachineError>;
}

/// Effects for pure evaluation: every effectful action fails
pub struct NoEffects;

#[async_trait]
impl ActionEffects for NoEffects {
    async fn call_tool(&self, name: &str, _payload: Value) -> Result<Value, MachineError> {
        Err(MachineError::ActionExecution {
            action: "tool".to_string(),
            reason: format!("no tools available to call '{}'", name),
        })
    }

    async fn send(&self, target: ActorId, _kind: &str, _payload: Value) -> Result<(), MachineError> {
        Err(MachineError::ActionExecution {
            action: "send".to_string(),
            reason: format!("no channel available to reach {}", target),
        })
    }
}

/// A completed transition
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub from: String,
    pub to: String,
    /// Context keys written by the actions
    pub patch: Map,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    /// No transition for this event in the current state
    Unhandled,
    /// Every candidate guard was false; `error` holds the first guard that
    /// failed to evaluate
    GuardRejected { error: Option<String> },
    Transitioned(Step),
}

struct Working<'a> {
    context: Map,
    patch: Map,
    payload: &'a Value,
}

impl Working<'_> {
    fn scope<'s>(&'s self, state: &'s str) -> Scope<'s> {
        Scope {
            context: &self.context,
            payload: self.payload,
            state,
        }
    }

    fn write(&mut self, key: &str, value: Value) {
        self.context.insert(key.to_string(), value.clone());
        self.patch.insert(key.to_string(), value);
    }
}

fn action_error(action: &Action, reason: impl ToString) -> MachineError {
    MachineError::ActionExecution {
        action: action.name().to_string(),
        reason: reason.to_string(),
    }
}

async fn run_action(
    action: &Action,
    working: &mut Working<'_>,
    state: &str,
    effects: &dyn ActionEffects,
) -> Result<(), MachineError> {
    match action {
        Action::UpdateContext(updates) => {
            // All values see the context as it was before this action
            let mut values = Vec::with_capacity(updates.len());
            {
                let scope = working.scope(state);
                for (key, expr) in updates {
                    values.push((key, expr.eval(&scope).map_err(|e| action_error(action, e))?));
                }
            }
            for (key, value) in values {
                working.write(key, value);
            }
        }
        Action::Tool {
            name,
            payload,
            assign,
        } => {
            let payload = eval_optional(payload.as_ref(), working, state, action)?;
            let result = effects.call_tool(name, payload).await?;
            if let Some(key) = assign {
                working.write(key, result);
            }
        }
        Action::Send {
            target,
            kind,
            payload,
        } => {
            let target = {
                let scope = working.scope(state);
                match target.eval(&scope).map_err(|e| action_error(action, e))? {
                    Value::String(id) if !id.is_empty() => ActorId::new(id),
                    other => {
                        return Err(action_error(
                            action,
                            format!("target must be an actor id, got {}", other),
                        ))
                    }
                }
            };
            let payload = eval_optional(payload.as_ref(), working, state, action)?;
            effects.send(target, kind, payload).await?;
        }
    }
    Ok(())
}

fn eval_optional(
    expr: Option<&Expr>,
    working: &Working<'_>,
    state: &str,
    action: &Action,
) -> Result<Value, MachineError> {
    match expr {
        Some(expr) => expr
            .eval(&working.scope(state))
            .map_err(|e| action_error(action, e)),
        None => Ok(Value::Null),
    }
}

impl MachineDefinition {
    fn select<'d>(
        &self,
        transitions: &'d [Transition],
        scope: &Scope<'_>,
    ) -> (Option<&'d Transition>, Option<String>) {
        let mut first_error = None;
        for transition in transitions {
            let passes = match &transition.guard {
                None => true,
                Some(guard) => match guard.test(scope) {
                    Ok(passes) => passes,
                    Err(err) => {
                        if first_error.is_none() {
                            first_error = Some(err.to_string());
                        }
                        false
                    }
                },
            };
            if passes {
                return (Some(transition), first_error);
            }
        }
        (None, first_error)
    }

    /// Compute the effect of `event` in `state`
    ///
    /// Exit actions of the source state, the transition's actions and entry
    /// actions of the target run in that order against a working copy of
    /// the merged context. Targetless transitions run only their own
    /// actions. The first failing action abandons the step.
    pub async fn step(
        &self,
        state: &str,
        context: &Context,
        event: &str,
        payload: &Value,
        effects: &dyn ActionEffects,
    ) -> Result<StepResult, MachineError> {
        let Some(node) = self.state(state) else {
            return Ok(StepResult::Unhandled);
        };
        let Some(transitions) = node.on.get(event) else {
            return Ok(StepResult::Unhandled);
        };

        let mut working = Working {
            context: context.merged(),
            patch: Map::new(),
            payload,
        };

        let (selected, guard_error) = self.select(transitions, &working.scope(state));
        let Some(transition) = selected else {
            return Ok(StepResult::GuardRejected { error: guard_error });
        };

        let to = match &transition.target {
            None => {
                for action in &transition.actions {
                    run_action(action, &mut working, state, effects).await?;
                }
                state.to_string()
            }
            Some(target) => {
                let target_node = self.state(target).ok_or_else(|| {
                    MachineError::Definition(format!("unknown target state '{}'", target))
                })?;
                for action in node.exit.iter().chain(&transition.actions) {
                    run_action(action, &mut working, state, effects).await?;
                }
                for action in &target_node.entry {
                    run_action(action, &mut working, target, effects).await?;
                }
                target.clone()
            }
        };

        Ok(StepResult::Transitioned(Step {
            from: state.to_string(),
            to,
            patch: working.patch,
        }))
    }

    /// Run the entry actions of the initial state
    pub async fn enter_initial(
        &self,
        context: &Context,
        effects: &dyn ActionEffects,
    ) -> Result<Step, MachineError> {
        let initial = self.initial();
        let payload = Value::Null;
        let mut working = Working {
            context: context.merged(),
            patch: Map::new(),
            payload: &payload,
        };
        if let Some(node) = self.state(initial) {
            for action in &node.entry {
                run_action(action, &mut working, initial, effects).await?;
            }
        }
        Ok(Step {
            from: initial.to_string(),
            to: initial.to_string(),
            patch: working.patch,
        })
    }
}

/// Effects bound to a live actor
struct ActorEffects<'a> {
    actor: &'a ActorHandle,
    channel: &'a MessageChannel,
    tools: &'a dyn ToolRegistry,
}

#[async_trait]
impl<'a> ActionEffects for ActorEffects<'a> {
    async fn call_tool(&self, name: &str, payload: Value) -> Result<Value, MachineError> {
        Ok(self.tools.execute(name, payload, self.actor).await?)
    }

    async fn send(&self, target: ActorId, kind: &str, payload: Value) -> Result<(), MachineError> {
        let draft = MessageDraft::new(kind, payload, self.actor.id().clone());
        self.channel
            .send(&target, draft)
            .await
            .map(|_| ())
            .map_err(|e| MachineError::ActionExecution {
                action: "send".to_string(),
                reason: e.to_string(),
            })
    }
}

/// Result of delivering one message to an actor's machine
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TransitionOutcome {
    Unhandled,
    GuardRejected {
        error: Option<String>,
    },
    Transitioned {
        from: String,
        to: String,
        /// Context keys written by the transition
        changed: Vec<String>,
    },
}

pub(crate) struct Interpreter {
    store: Arc<dyn ReplicatedStore>,
    channel: MessageChannel,
    tools: Arc<dyn ToolRegistry>,
}

impl Interpreter {
    pub(crate) fn new(
        store: Arc<dyn ReplicatedStore>,
        channel: MessageChannel,
        tools: Arc<dyn ToolRegistry>,
    ) -> Self {
        Self {
            store,
            channel,
            tools,
        }
    }

    fn effects<'a>(&'a self, actor: &'a ActorHandle) -> ActorEffects<'a> {
        ActorEffects {
            actor,
            channel: &self.channel,
            tools: self.tools.as_ref(),
        }
    }

    /// Deliver a validated message
    pub(crate) async fn send(
        &self,
        actor: &ActorHandle,
        message: &ValidatedMessage,
    ) -> Result<TransitionOutcome, MachineError> {
        let Some((definition, state, context)) = actor.machine_snapshot() else {
            debug!(actor = %actor.id(), kind = %message.kind(), "no machine attached");
            return Ok(TransitionOutcome::Unhandled);
        };

        let result = definition
            .step(
                &state,
                &context,
                message.kind(),
                message.payload(),
                &self.effects(actor),
            )
            .await?;

        match result {
            StepResult::Unhandled => Ok(TransitionOutcome::Unhandled),
            StepResult::GuardRejected { error } => Ok(TransitionOutcome::GuardRejected { error }),
            StepResult::Transitioned(step) => {
                let changed = step.patch.keys().cloned().collect();
                let (from, to) = (step.from.clone(), step.to.clone());
                self.commit(actor, &definition, step).await?;
                debug!(actor = %actor.id(), %from, %to, "transition");
                Ok(TransitionOutcome::Transitioned { from, to, changed })
            }
        }
    }

    /// Run initial entry actions if a machine was attached since the last
    /// pass. Returns the context keys written.
    pub(crate) async fn start(
        &self,
        actor: &ActorHandle,
    ) -> Result<Option<Vec<String>>, MachineError> {
        let Some(definition) = actor.take_pending_start() else {
            return Ok(None);
        };
        let context = actor.context();
        let step = definition
            .enter_initial(&context, &self.effects(actor))
            .await?;
        let changed = step.patch.keys().cloned().collect();
        self.commit(actor, &definition, step).await?;
        debug!(actor = %actor.id(), state = %definition.initial(), "machine started");
        Ok(Some(changed))
    }

    /// Persist the patch, then apply it and the new state in memory
    async fn commit(
        &self,
        actor: &ActorHandle,
        definition: &Arc<MachineDefinition>,
        step: Step,
    ) -> Result<(), MachineError> {
        if !step.patch.is_empty() {
            self.store
                .merge(actor.context_document(), step.patch.clone())
                .await?;
        }
        actor.commit_step(definition, &step);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn counter() -> MachineDefinition {
        MachineDefinition::from_value(&json!({
            "initial": "idle",
            "states": {
                "idle": {
                    "exit": [{"updateContext": {"left": true}}],
                    "on": {
                        "INC": {
                            "guard": {"$lt": ["$count", 3]},
                            "actions": [{"updateContext": {"count": {"$add": ["$count", "$$by"]}}}]
                        },
                        "GO": {"target": "running", "actions": [{"updateContext": {"go": 1}}]},
                        "BAD": {"guard": {"$gt": ["$name", 1]}}
                    }
                },
                "running": {
                    "entry": [{"updateContext": {"entered": {"$inState": "running"}}}]
                }
            }
        }))
        .unwrap()
    }

    fn context(value: Value) -> Context {
        Context::new(value.as_object().cloned().unwrap_or_default())
    }

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<(ActorId, String, Value)>>,
    }

    #[async_trait]
    impl ActionEffects for Recording {
        async fn call_tool(&self, name: &str, payload: Value) -> Result<Value, MachineError> {
            Ok(json!({"tool": name, "echo": payload}))
        }

        async fn send(&self, target: ActorId, kind: &str, payload: Value) -> Result<(), MachineError> {
            self.sent.lock().push((target, kind.to_string(), payload));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_targetless_transition_updates_context() {
        let def = counter();
        let result = def
            .step("idle", &context(json!({"count": 1})), "INC", &json!({"by": 2}), &NoEffects)
            .await
            .unwrap();
        let StepResult::Transitioned(step) = result else {
            panic!("expected transition");
        };
        assert_eq!(step.to, "idle");
        // Exit actions do not run for targetless transitions
        assert_eq!(Value::Object(step.patch), json!({"count": 3}));
    }

    #[tokio::test]
    async fn test_exit_transition_entry_order() {
        let def = counter();
        let result = def
            .step("idle", &context(json!({})), "GO", &Value::Null, &NoEffects)
            .await
            .unwrap();
        let StepResult::Transitioned(step) = result else {
            panic!("expected transition");
        };
        assert_eq!(step.from, "idle");
        assert_eq!(step.to, "running");
        assert_eq!(
            Value::Object(step.patch),
            json!({"left": true, "go": 1, "entered": true})
        );
    }

    #[tokio::test]
    async fn test_guard_rejection_and_unhandled() {
        let def = counter();
        let ctx = context(json!({"count": 3}));
        assert_eq!(
            def.step("idle", &ctx, "INC", &json!({"by": 1}), &NoEffects)
                .await
                .unwrap(),
            StepResult::GuardRejected { error: None }
        );
        assert_eq!(
            def.step("idle", &ctx, "NOPE", &Value::Null, &NoEffects)
                .await
                .unwrap(),
            StepResult::Unhandled
        );
        assert_eq!(
            def.step("running", &ctx, "INC", &Value::Null, &NoEffects)
                .await
                .unwrap(),
            StepResult::Unhandled
        );
    }

    #[tokio::test]
    async fn test_guard_error_is_rejection_with_message() {
        let def = counter();
        let result = def
            .step("idle", &context(json!({})), "BAD", &Value::Null, &NoEffects)
            .await
            .unwrap();
        assert!(matches!(result, StepResult::GuardRejected { error: Some(_) }));
    }

    #[tokio::test]
    async fn test_effects_are_routed() {
        let def = MachineDefinition::from_value(&json!({
            "initial": "a",
            "states": {"a": {"on": {"PING": {"actions": [
                {"tool": {"name": "lookup", "payload": {"q": "$$q"}, "assign": "found"}},
                {"send": {"target": "$$replyTo", "type": "PONG", "payload": {"found": "$found"}}}
            ]}}}}
        }))
        .unwrap();
        let effects = Recording::default();
        let result = def
            .step(
                "a",
                &context(json!({})),
                "PING",
                &json!({"q": "x", "replyTo": "b"}),
                &effects,
            )
            .await
            .unwrap();

        let expected_found = json!({"tool": "lookup", "echo": {"q": "x"}});
        let StepResult::Transitioned(step) = result else {
            panic!("expected transition");
        };
        assert_eq!(step.patch["found"], expected_found);

        let sent = effects.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ActorId::new("b"));
        assert_eq!(sent[0].1, "PONG");
        assert_eq!(sent[0].2, json!({"found": expected_found}));
    }

    #[tokio::test]
    async fn test_failing_action_abandons_step() {
        let def = MachineDefinition::from_value(&json!({
            "initial": "a",
            "states": {"a": {"on": {"GO": {"actions": [
                {"updateContext": {"x": 1}},
                {"tool": {"name": "missing"}}
            ]}}}}
        }))
        .unwrap();
        let err = def
            .step("a", &context(json!({})), "GO", &Value::Null, &NoEffects)
            .await
            .unwrap_err();
        assert!(matches!(err, MachineError::ActionExecution { .. }));
    }

    #[tokio::test]
    async fn test_enter_initial_runs_entry_actions() {
        let def = MachineDefinition::from_value(&json!({
            "initial": "a",
            "states": {"a": {"entry": [{"updateContext": {"ready": true}}]}}
        }))
        .unwrap();
        let step = def.enter_initial(&Context::default(), &NoEffects).await.unwrap();
        assert_eq!(step.to, "a");
        assert_eq!(Value::Object(step.patch), json!({"ready": true}));
    }
}
