//! Shared types for cadence
//!
//! This crate provides the identity, message and query types used across
//! the cadence runtime: actor identifiers, inbox sequence numbers, the
//! message record appended to inboxes, and the filter/query vocabulary
//! understood by replicated stores.

mod filter;

pub use filter::{compare_values, Condition, Filter, FilterError, Query, QueryDescriptor};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Structured value used for payloads, context and store records
pub type Value = serde_json::Value;

/// Key/value map used for documents and contexts
pub type Map = serde_json::Map<String, Value>;

/// Actor identifier
///
/// Actor ids are stable, human-readable names. They also name the actor's
/// inbox log and default documents in the replicated store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ActorId {
    fn from(id: &str) -> Self {
        ActorId(id.to_string())
    }
}

impl From<String> for ActorId {
    fn from(id: String) -> Self {
        ActorId(id)
    }
}

/// Position of an entry in an append-only log
///
/// Sequences start at 1; `Sequence::ZERO` is the watermark of an inbox
/// where nothing has been dispatched yet.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sequence(pub u64);

impl Sequence {
    pub const ZERO: Sequence = Sequence(0);

    pub fn new(seq: u64) -> Self {
        Self(seq)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Sequence {
        Sequence(self.0 + 1)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for Sequence {
    fn from(seq: u64) -> Self {
        Sequence(seq)
    }
}

/// A message before it has been appended to an inbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDraft {
    /// Message type name, matched against the target's whitelist
    #[serde(rename = "type")]
    pub kind: String,
    /// Fully resolved payload
    #[serde(default)]
    pub payload: Value,
    /// Sending actor
    pub source: ActorId,
}

impl MessageDraft {
    pub fn new(kind: impl Into<String>, payload: Value, source: impl Into<ActorId>) -> Self {
        Self {
            kind: kind.into(),
            payload,
            source: source.into(),
        }
    }
}

/// An immutable message record stored in an actor's inbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    pub source: ActorId,
    pub target: ActorId,
    /// Assigned by the log on append
    #[serde(default)]
    pub sequence: Sequence,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub processed: bool,
}

impl Message {
    pub fn from_draft(draft: MessageDraft, target: ActorId, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: draft.kind,
            payload: draft.payload,
            source: draft.source,
            target,
            sequence: Sequence::ZERO,
            timestamp,
            processed: false,
        }
    }
}

/// Configuration references an actor's configuration document may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigKind {
    View,
    Style,
    Brand,
    State,
    Interface,
    Context,
}

impl ConfigKind {
    pub const ALL: [ConfigKind; 6] = [
        ConfigKind::View,
        ConfigKind::Style,
        ConfigKind::Brand,
        ConfigKind::State,
        ConfigKind::Interface,
        ConfigKind::Context,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKind::View => "view",
            ConfigKind::Style => "style",
            ConfigKind::Brand => "brand",
            ConfigKind::State => "state",
            ConfigKind::Interface => "interface",
            ConfigKind::Context => "context",
        }
    }
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown config reference '{}'", s))
    }
}
