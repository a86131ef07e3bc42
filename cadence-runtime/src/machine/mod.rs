//! State machine definitions
//!
//! A definition is loaded from a JSON (or YAML) document:
//!
//! ```yaml
//! initial: idle
//! states:
//!   idle:
//!     entry:
//!       - updateContext: { count: 0 }
//!     on:
//!       INC:
//!         guard: { $lt: ["$count", 10] }
//!         actions:
//!           - updateContext: { count: { $add: ["$count", 1] } }
//!       STOP: done
//!   done: {}
//! ```
//!
//! An event may map to a target name, a single transition, or a list of
//! transitions tried in order. Guards and action arguments are parsed into
//! `Expr` here, so malformed definitions are rejected before any message is
//! dispatched.

mod interpreter;

pub use interpreter::{ActionEffects, NoEffects, Step, StepResult};
pub(crate) use interpreter::{Interpreter, TransitionOutcome};

use crate::error::MachineError;
use crate::expr::Expr;
use cadence_types::Value;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// An executable action
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Shallow overwrite of context keys
    UpdateContext(Vec<(String, Expr)>),
    /// Invoke a host tool, optionally storing the result in the context
    Tool {
        name: String,
        payload: Option<Expr>,
        assign: Option<String>,
    },
    /// Send a message to another (or the same) actor
    Send {
        target: Expr,
        kind: String,
        payload: Option<Expr>,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::UpdateContext(_) => "updateContext",
            Action::Tool { .. } => "tool",
            Action::Send { .. } => "send",
        }
    }

    fn parse(value: &Value) -> Result<Action, MachineError> {
        let obj = value
            .as_object()
            .filter(|obj| obj.len() == 1)
            .ok_or_else(|| {
                MachineError::Definition(format!("action must be a single-key object, got {}", value))
            })?;

        if let Some(updates) = obj.get("updateContext") {
            let updates = updates.as_object().ok_or_else(|| {
                MachineError::Definition("updateContext expects an object".to_string())
            })?;
            let mut parsed = Vec::with_capacity(updates.len());
            for (key, expr) in updates {
                parsed.push((key.clone(), Expr::parse(expr)?));
            }
            return Ok(Action::UpdateContext(parsed));
        }

        if let Some(tool) = obj.get("tool") {
            let spec: ToolSpec = serde_json::from_value(tool.clone())
                .map_err(|e| MachineError::Definition(format!("invalid tool action: {}", e)))?;
            return Ok(Action::Tool {
                name: spec.name,
                payload: spec.payload.as_ref().map(Expr::parse).transpose()?,
                assign: spec.assign,
            });
        }

        if let Some(send) = obj.get("send") {
            let spec: SendSpec = serde_json::from_value(send.clone())
                .map_err(|e| MachineError::Definition(format!("invalid send action: {}", e)))?;
            return Ok(Action::Send {
                target: Expr::parse(&spec.target)?,
                kind: spec.kind,
                payload: spec.payload.as_ref().map(Expr::parse).transpose()?,
            });
        }

        Err(MachineError::Definition(format!(
            "unknown action '{}'",
            obj.keys().next().map(String::as_str).unwrap_or_default()
        )))
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ToolSpec {
    name: String,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    assign: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SendSpec {
    target: Value,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<Value>,
}

/// A guarded edge out of a state
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// `None` keeps the current state and skips exit/entry actions
    pub target: Option<String>,
    pub guard: Option<Expr>,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateNode {
    pub entry: Vec<Action>,
    pub exit: Vec<Action>,
    /// Candidate transitions per event, tried in order
    pub on: BTreeMap<String, Vec<Transition>>,
}

/// A validated, parsed machine definition
#[derive(Debug, Clone, PartialEq)]
pub struct MachineDefinition {
    initial: String,
    states: BTreeMap<String, StateNode>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDefinition {
    initial: String,
    #[serde(default)]
    states: BTreeMap<String, RawState>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawState {
    #[serde(default)]
    entry: Vec<Value>,
    #[serde(default)]
    exit: Vec<Value>,
    #[serde(default)]
    on: BTreeMap<String, RawTransitions>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTransitions {
    Target(String),
    One(RawTransition),
    Many(Vec<RawTransition>),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTransition {
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    guard: Option<Value>,
    #[serde(default)]
    actions: Vec<Value>,
}

fn parse_actions(actions: &[Value]) -> Result<Vec<Action>, MachineError> {
    actions.iter().map(Action::parse).collect()
}

impl RawTransition {
    fn compile(self) -> Result<Transition, MachineError> {
        Ok(Transition {
            target: self.target,
            guard: self.guard.as_ref().map(Expr::parse).transpose()?,
            actions: parse_actions(&self.actions)?,
        })
    }
}

impl MachineDefinition {
    pub fn from_value(value: &Value) -> Result<Self, MachineError> {
        let raw: RawDefinition = serde_json::from_value(value.clone())
            .map_err(|e| MachineError::Definition(e.to_string()))?;

        let mut states = BTreeMap::new();
        for (name, raw_state) in raw.states {
            let mut on = BTreeMap::new();
            for (event, transitions) in raw_state.on {
                let compiled = match transitions {
                    RawTransitions::Target(target) => vec![Transition {
                        target: Some(target),
                        guard: None,
                        actions: Vec::new(),
                    }],
                    RawTransitions::One(t) => vec![t.compile()?],
                    RawTransitions::Many(ts) => ts
                        .into_iter()
                        .map(RawTransition::compile)
                        .collect::<Result<_, _>>()?,
                };
                on.insert(event, compiled);
            }
            states.insert(
                name,
                StateNode {
                    entry: parse_actions(&raw_state.entry)?,
                    exit: parse_actions(&raw_state.exit)?,
                    on,
                },
            );
        }

        let definition = Self {
            initial: raw.initial,
            states,
        };
        definition.check_targets()?;
        Ok(definition)
    }

    fn check_targets(&self) -> Result<(), MachineError> {
        if !self.states.contains_key(&self.initial) {
            return Err(MachineError::Definition(format!(
                "initial state '{}' is not defined",
                self.initial
            )));
        }
        for (name, node) in &self.states {
            for (event, transitions) in &node.on {
                for target in transitions.iter().filter_map(|t| t.target.as_ref()) {
                    if !self.states.contains_key(target) {
                        return Err(MachineError::Definition(format!(
                            "transition '{}' of state '{}' targets unknown state '{}'",
                            event, name, target
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn initial(&self) -> &str {
        &self.initial
    }

    pub fn state(&self, name: &str) -> Option<&StateNode> {
        self.states.get(name)
    }

    pub fn has_state(&self, name: &str) -> bool {
        self.states.contains_key(name)
    }

    pub fn state_names(&self) -> impl Iterator<Item = &str> {
        self.states.keys().map(String::as_str)
    }

    /// Events handled in `state`
    pub fn events(&self, state: &str) -> Vec<&str> {
        self.states
            .get(state)
            .map(|node| node.on.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

/// A running instance: a definition plus the active state
#[derive(Debug, Clone)]
pub struct StateMachine {
    definition: Arc<MachineDefinition>,
    current: String,
}

impl StateMachine {
    pub fn new(definition: Arc<MachineDefinition>) -> Self {
        let current = definition.initial().to_string();
        Self {
            definition,
            current,
        }
    }

    pub fn current(&self) -> &str {
        &self.current
    }

    pub fn definition(&self) -> &Arc<MachineDefinition> {
        &self.definition
    }

    /// Make `state` active if the definition has it
    pub fn enter(&mut self, state: &str) -> bool {
        if self.definition.has_state(state) {
            self.current = state.to_string();
            true
        } else {
            false
        }
    }

    /// Swap in a new definition
    ///
    /// The active state is kept if the new definition still defines it;
    /// otherwise the machine resets to the new initial state and this
    /// returns false.
    pub fn replace_definition(&mut self, definition: Arc<MachineDefinition>) -> bool {
        let kept = definition.has_state(&self.current);
        if !kept {
            self.current = definition.initial().to_string();
        }
        self.definition = definition;
        kept
    }
}
