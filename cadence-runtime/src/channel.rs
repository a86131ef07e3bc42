//! Inbox-based message channel
//!
//! Every actor owns one append-only log in the replicated store. Sending
//! appends to the target's inbox; receiving is a live read of that log. The
//! channel checks only that payloads are fully resolved: message types and
//! schemas are the consumer's concern.
//!
//! The watermark (highest dispatched sequence) lives in the actor's
//! configuration document and only ever moves forward.

use crate::config::DocumentLayout;
use crate::error::ChannelError;
use crate::expr::unresolved_path;
use cadence_store::{LogEntry, ReactiveStore, ReplicatedStore, Source, StoreError, Unsubscribe};
use cadence_types::{ActorId, Message, MessageDraft, Query, Sequence, Value};
use chrono::Utc;
use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use serde_json::json;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, warn};

type Result<T> = std::result::Result<T, ChannelError>;

/// Full ordered contents of an inbox at one point in time
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSnapshot {
    pub entries: Vec<LogEntry>,
}

impl ChannelSnapshot {
    /// Entries not yet flagged as processed
    pub fn unprocessed(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(|e| !e.processed)
    }

    /// Whether an unprocessed entry lies above `watermark`
    pub fn has_work_above(&self, watermark: Sequence) -> bool {
        self.unprocessed().any(|e| e.sequence > watermark)
    }
}

/// Inbox entries relative to a watermark
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Backlog {
    /// Unprocessed entries above the watermark, in sequence order
    pub pending: Vec<LogEntry>,
    /// Unprocessed entries at or below the watermark
    pub stale: Vec<Sequence>,
}

/// Live view of one inbox as a stream of snapshots
///
/// Dropping the subscription detaches from the log and lets the store
/// release the underlying view.
pub struct ChannelSubscription {
    receiver: mpsc::UnboundedReceiver<ChannelSnapshot>,
    // The store tracks views weakly; this keeps the log view alive
    _view: ReactiveStore<Value>,
    unsubscribe: Option<Unsubscribe>,
}

impl ChannelSubscription {
    /// The newest of `current` and the snapshots already queued
    pub fn latest(&mut self, current: ChannelSnapshot) -> ChannelSnapshot {
        let mut latest = current;
        while let Ok(Some(next)) = self.receiver.try_next() {
            latest = next;
        }
        latest
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe.call();
        }
        self.receiver.close();
    }
}

impl Stream for ChannelSubscription {
    type Item = ChannelSnapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_next_unpin(cx)
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

/// Sends to and reads from actor inboxes
#[derive(Clone)]
pub struct MessageChannel {
    store: Arc<dyn ReplicatedStore>,
    layout: DocumentLayout,
    watermark_lock: Arc<tokio::sync::Mutex<()>>,
}

impl MessageChannel {
    pub fn new(store: Arc<dyn ReplicatedStore>, layout: DocumentLayout) -> Self {
        Self {
            store,
            layout,
            watermark_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn inbox(&self, actor: &ActorId) -> String {
        self.layout.inbox(actor)
    }

    /// Append a message to the target's inbox
    ///
    /// Fails with `UnresolvedPayload` before anything is written if the
    /// payload still contains an expression.
    pub async fn send(&self, target: &ActorId, draft: MessageDraft) -> Result<Message> {
        if let Some(path) = unresolved_path(&draft.payload) {
            warn!(target = %target, kind = %draft.kind, %path, "rejected unresolved payload");
            return Err(ChannelError::UnresolvedPayload { path });
        }

        let mut message = Message::from_draft(draft, target.clone(), Utc::now());
        let value = serde_json::to_value(&message).map_err(StoreError::from)?;
        message.sequence = self.store.append(&self.inbox(target), value).await?;

        debug!(
            target = %target,
            source = %message.source,
            kind = %message.kind,
            sequence = message.sequence.as_u64(),
            "message sent"
        );
        Ok(message)
    }

    /// Decode a log entry into the message it holds
    pub fn decode(entry: &LogEntry) -> Result<Message> {
        let mut message: Message =
            serde_json::from_value(entry.value.clone()).map_err(|e| ChannelError::MalformedEntry {
                sequence: entry.sequence,
                reason: e.to_string(),
            })?;
        message.sequence = entry.sequence;
        message.processed = entry.processed;
        Ok(message)
    }

    /// Follow an inbox
    pub fn subscribe(&self, actor: &ActorId) -> ChannelSubscription {
        let (sender, receiver) = mpsc::unbounded();
        let view = self
            .store
            .read(&Source::Log(self.inbox(actor)), &Query::All);
        let label = actor.clone();
        let unsubscribe = view.subscribe(move |value: &Value| {
            match serde_json::from_value::<Vec<LogEntry>>(value.clone()) {
                Ok(entries) => {
                    // A closed receiver means the subscriber is going away
                    let _ = sender.unbounded_send(ChannelSnapshot { entries });
                }
                Err(err) => warn!(actor = %label, error = %err, "unreadable inbox snapshot"),
            }
        });
        ChannelSubscription {
            receiver,
            _view: view,
            unsubscribe: Some(unsubscribe),
        }
    }

    /// Every message in an inbox, in sequence order
    pub async fn messages(&self, actor: &ActorId) -> Result<Vec<Message>> {
        self.store
            .entries(&self.inbox(actor))
            .await?
            .iter()
            .map(Self::decode)
            .collect()
    }

    /// Split the unprocessed entries of an inbox around `watermark`
    pub async fn backlog(&self, actor: &ActorId, watermark: Sequence) -> Result<Backlog> {
        let mut entries = self.store.entries(&self.inbox(actor)).await?;
        entries.sort_by_key(|e| e.sequence);

        let mut backlog = Backlog::default();
        for entry in entries.into_iter().filter(|e| !e.processed) {
            if entry.sequence > watermark {
                backlog.pending.push(entry);
            } else {
                backlog.stale.push(entry.sequence);
            }
        }
        Ok(backlog)
    }

    /// Unprocessed entries above `watermark`, in sequence order
    pub async fn pending(&self, actor: &ActorId, watermark: Sequence) -> Result<Vec<LogEntry>> {
        Ok(self.backlog(actor, watermark).await?.pending)
    }

    pub async fn mark_processed(&self, actor: &ActorId, sequence: Sequence) -> Result<()> {
        self.store
            .mark_processed(&self.inbox(actor), sequence)
            .await?;
        Ok(())
    }

    /// Fresh read of the watermark stored in a configuration document
    pub async fn watermark(&self, config_doc: &str) -> Result<Sequence> {
        let doc = self.store.get(config_doc).await?;
        Ok(doc
            .as_ref()
            .and_then(|d| d.get(&self.layout.watermark_key))
            .and_then(Value::as_u64)
            .map(Sequence::new)
            .unwrap_or(Sequence::ZERO))
    }

    /// Max-merge write of the watermark
    ///
    /// The write happens only if `new` is above the persisted value.
    /// Returns whether it did.
    pub async fn persist_watermark(&self, config_doc: &str, new: Sequence) -> Result<bool> {
        let _serial = self.watermark_lock.lock().await;
        let current = self.watermark(config_doc).await?;
        if new <= current {
            return Ok(false);
        }
        self.store
            .update(config_doc, &self.layout.watermark_key, json!(new.as_u64()))
            .await?;
        debug!(document = config_doc, from = current.as_u64(), to = new.as_u64(), "watermark advanced");
        Ok(true)
    }
}
