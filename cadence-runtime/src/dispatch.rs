//! Sequential per-actor dispatch
//!
//! A pass takes the actor's dispatch guard, reads the watermark fresh from
//! the configuration document, and feeds every unprocessed inbox entry above
//! it through validation and into the state machine, in sequence order.
//! Each entry is flagged as processed whatever the outcome; failures become
//! diagnostics, never retries. The pass ends by max-merging the highest
//! sequence it handled into the watermark.
//!
//! If a pass is already running for the actor, a new call returns
//! `DispatchOutcome::Busy` at once. The running pass re-reads nothing it has
//! already selected, so messages arriving meanwhile are picked up by the
//! next pass.

use crate::actor::ActorHandle;
use crate::channel::MessageChannel;
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink};
use crate::error::{Result, ValidationError};
use crate::machine::{Interpreter, TransitionOutcome};
use crate::scheduler::RerenderScheduler;
use crate::subscriptions::SubscriptionManager;
use crate::validation::{validate_message, SchemaRegistry};
use cadence_types::{Message, Sequence};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Counts for one completed pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Entries taken from the inbox
    pub dispatched: usize,
    pub transitions: usize,
    /// No transition for the event in the current state
    pub unhandled: usize,
    /// Every guard evaluated false
    pub guarded: usize,
    /// Failed validation
    pub rejected: usize,
    /// Unreadable entries and failed actions
    pub failed: usize,
    /// Already covered by the watermark; marked without dispatch
    pub skipped: usize,
    /// Watermark after the pass
    pub watermark: Sequence,
}

impl PassReport {
    /// Whether the pass touched the inbox at all
    pub fn is_idle(&self) -> bool {
        self.dispatched == 0 && self.skipped == 0
    }

    pub fn absorb(&mut self, other: &PassReport) {
        self.dispatched += other.dispatched;
        self.transitions += other.transitions;
        self.unhandled += other.unhandled;
        self.guarded += other.guarded;
        self.rejected += other.rejected;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.watermark = self.watermark.max(other.watermark);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Another pass holds the guard
    Busy,
    Completed(PassReport),
}

impl DispatchOutcome {
    pub fn is_busy(&self) -> bool {
        matches!(self, DispatchOutcome::Busy)
    }

    pub fn report(&self) -> Option<&PassReport> {
        match self {
            DispatchOutcome::Busy => None,
            DispatchOutcome::Completed(report) => Some(report),
        }
    }
}

fn validation_kind(err: &ValidationError) -> DiagnosticKind {
    match err {
        ValidationError::UnknownMessageType { .. } => DiagnosticKind::UnknownMessageType,
        ValidationError::SchemaNotFound(_) => DiagnosticKind::SchemaNotFound,
        ValidationError::PayloadValidation { errors, .. } => DiagnosticKind::PayloadValidation {
            errors: errors.clone(),
        },
    }
}

pub(crate) struct Dispatcher {
    channel: MessageChannel,
    schemas: Arc<dyn SchemaRegistry>,
    interpreter: Interpreter,
    subscriptions: SubscriptionManager,
    scheduler: Arc<RerenderScheduler>,
    diagnostics: Arc<dyn DiagnosticSink>,
    max_batch: Option<usize>,
    passes: AtomicU64,
}

impl Dispatcher {
    pub(crate) fn new(
        channel: MessageChannel,
        schemas: Arc<dyn SchemaRegistry>,
        interpreter: Interpreter,
        subscriptions: SubscriptionManager,
        scheduler: Arc<RerenderScheduler>,
        diagnostics: Arc<dyn DiagnosticSink>,
        max_batch: Option<usize>,
    ) -> Self {
        Self {
            channel,
            schemas,
            interpreter,
            subscriptions,
            scheduler,
            diagnostics,
            max_batch,
            passes: AtomicU64::new(0),
        }
    }

    pub(crate) fn pass_count(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Run the initial entry actions of a newly attached machine
    pub(crate) async fn start(&self, actor: &ActorHandle) {
        if let Some(_guard) = actor.try_begin_dispatch() {
            self.start_machine(actor).await;
        }
    }

    async fn start_machine(&self, actor: &ActorHandle) {
        match self.interpreter.start(actor).await {
            Ok(Some(changed)) => {
                info!(actor = %actor.id(), state = ?actor.current_state(), "machine started");
                self.subscriptions.refresh_queries(actor, &changed);
                self.scheduler.schedule(actor.id());
            }
            Ok(None) => {}
            Err(err) => self.diagnostics.emit_diagnostic(Diagnostic::error(
                actor.id().clone(),
                DiagnosticKind::ActionExecution,
                format!("initial entry actions failed: {}", err),
            )),
        }
    }

    pub(crate) async fn process_pending(&self, actor: &ActorHandle) -> Result<DispatchOutcome> {
        let Some(_guard) = actor.try_begin_dispatch() else {
            debug!(actor = %actor.id(), "dispatch pass already running");
            return Ok(DispatchOutcome::Busy);
        };

        self.start_machine(actor).await;

        let watermark = self.channel.watermark(actor.config_document()).await?;
        let backlog = self.channel.backlog(actor.id(), watermark).await?;
        let mut report = PassReport {
            watermark,
            ..PassReport::default()
        };

        for sequence in backlog.stale {
            self.channel.mark_processed(actor.id(), sequence).await?;
            report.skipped += 1;
        }

        let limit = self.max_batch.unwrap_or(usize::MAX);
        let mut highest = watermark;
        for entry in backlog.pending.into_iter().take(limit) {
            report.dispatched += 1;
            match MessageChannel::decode(&entry) {
                Ok(message) => self.dispatch_one(actor, message, &mut report).await,
                Err(err) => {
                    report.failed += 1;
                    self.diagnostics.emit_diagnostic(Diagnostic::error(
                        actor.id().clone(),
                        DiagnosticKind::MalformedMessage,
                        err.to_string(),
                    ));
                }
            }
            self.channel.mark_processed(actor.id(), entry.sequence).await?;
            highest = highest.max(entry.sequence);
        }

        if highest > watermark {
            self.channel
                .persist_watermark(actor.config_document(), highest)
                .await?;
        }
        report.watermark = highest;
        self.passes.fetch_add(1, Ordering::Relaxed);

        if !report.is_idle() {
            debug!(
                actor = %actor.id(),
                dispatched = report.dispatched,
                transitions = report.transitions,
                watermark = report.watermark.as_u64(),
                "dispatch pass complete"
            );
        }
        Ok(DispatchOutcome::Completed(report))
    }

    async fn dispatch_one(&self, actor: &ActorHandle, message: Message, report: &mut PassReport) {
        let sequence = message.sequence;
        let kind = message.kind.clone();

        let accepts = actor.accepts();
        let validated = match validate_message(&accepts, self.schemas.as_ref(), actor.id(), message)
        {
            Ok(validated) => validated,
            Err(err) => {
                report.rejected += 1;
                self.diagnostics.emit_diagnostic(
                    Diagnostic::error(actor.id().clone(), validation_kind(&err), err.to_string())
                        .for_message(sequence, &kind),
                );
                return;
            }
        };

        match self.interpreter.send(actor, &validated).await {
            Ok(TransitionOutcome::Transitioned { from, to, changed }) => {
                report.transitions += 1;
                debug!(actor = %actor.id(), %sequence, %kind, %from, %to, "message applied");
                self.subscriptions.refresh_queries(actor, &changed);
                self.scheduler.schedule(actor.id());
            }
            Ok(TransitionOutcome::Unhandled) => {
                report.unhandled += 1;
                debug!(actor = %actor.id(), %sequence, %kind, "no transition");
            }
            Ok(TransitionOutcome::GuardRejected { error }) => {
                report.guarded += 1;
                if let Some(error) = error {
                    self.diagnostics.emit_diagnostic(
                        Diagnostic::warning(actor.id().clone(), DiagnosticKind::GuardEvaluation, error)
                            .for_message(sequence, &kind),
                    );
                }
            }
            Err(err) => {
                report.failed += 1;
                self.diagnostics.emit_diagnostic(
                    Diagnostic::error(actor.id().clone(), DiagnosticKind::ActionExecution, err.to_string())
                        .for_message(sequence, &kind),
                );
            }
        }
    }
}
