//! Run a manifest against an in-memory store.

use crate::manifest::{Manifest, Step};
use anyhow::{Context, Result};
use cadence_runtime::{
    Diagnostic, DiagnosticCollector, JsonSchemaRegistry, PassReport, RenderLog, Runtime,
};
use cadence_store::{MemoryStore, ReplicatedStore};
use cadence_types::{ActorId, Map, MessageDraft};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub json: bool,
    pub max_rounds: usize,
}

#[derive(Serialize)]
struct ActorReport {
    id: ActorId,
    state: Option<String>,
    watermark: u64,
    context: Map,
}

#[derive(Serialize)]
struct RunReport {
    steps: usize,
    totals: PassReport,
    renders: usize,
    actors: Vec<ActorReport>,
    diagnostics: Vec<Diagnostic>,
}

struct Session {
    runtime: Runtime,
    store: Arc<MemoryStore>,
    renders: Arc<RenderLog>,
    diagnostics: Arc<DiagnosticCollector>,
}

impl Session {
    async fn start(manifest: &Manifest) -> Result<Self> {
        let store = Arc::new(MemoryStore::new());
        for (name, document) in manifest.documents()? {
            store
                .merge(&name, document)
                .await
                .with_context(|| format!("Failed to seed document '{}'", name))?;
        }
        for (collection, records) in &manifest.collections {
            for (id, record) in records {
                store.put(collection, id, record.clone()).await?;
            }
        }

        let schemas = Arc::new(JsonSchemaRegistry::new());
        for (kind, schema) in manifest.schemas()? {
            schemas.register(kind, schema)?;
        }

        let renders = Arc::new(RenderLog::new());
        let diagnostics = Arc::new(DiagnosticCollector::new());
        let runtime = Runtime::builder()
            .config(manifest.runtime.clone())
            .store(store.clone())
            .schemas(schemas)
            .renderer(renders.clone())
            .diagnostics(diagnostics.clone())
            .build()?;

        for spec in &manifest.actors {
            runtime
                .spawn_actor(spec.clone())
                .await
                .with_context(|| format!("Failed to spawn actor '{}'", spec.id))?;
        }

        Ok(Self {
            runtime,
            store,
            renders,
            diagnostics,
        })
    }

    async fn apply(&self, step: &Step) -> Result<()> {
        match step {
            Step::Send(send) => {
                let draft = MessageDraft::new(&send.kind, send.payload.clone(), send.from.clone());
                let message = self.runtime.send_message(&send.to, draft).await?;
                tracing::debug!(to = %send.to, sequence = %message.sequence, "message sent");
            }
            Step::Update {
                document,
                key,
                value,
            } => self.store.update(document, key, value.clone()).await?,
            Step::Put {
                collection,
                id,
                record,
            } => self.store.put(collection, id, record.clone()).await?,
            Step::Destroy { actor } => {
                if !self.runtime.destroy_actor(actor) {
                    tracing::warn!(actor = %actor, "no such actor to destroy");
                }
            }
        }
        Ok(())
    }

    async fn report(&self, steps: usize, totals: PassReport) -> Result<RunReport> {
        let mut actors = Vec::new();
        for id in self.runtime.actor_ids() {
            let Some(actor) = self.runtime.actor(&id) else {
                continue;
            };
            let watermark = self
                .runtime
                .channel()
                .watermark(actor.config_document())
                .await?;
            actors.push(ActorReport {
                id,
                state: actor.current_state(),
                watermark: watermark.as_u64(),
                context: actor.context().merged(),
            });
        }

        Ok(RunReport {
            steps,
            totals,
            renders: self.renders.count(),
            actors,
            diagnostics: self.diagnostics.diagnostics(),
        })
    }
}

/// Spawn the manifest's actors, play its script and print the end state
pub async fn run_manifest(path: &Path, opts: RunOptions) -> Result<()> {
    let manifest = Manifest::from_file(path)
        .with_context(|| format!("Failed to load manifest {}", path.display()))?;
    let session = Session::start(&manifest).await?;

    let mut totals = session.runtime.drain(opts.max_rounds).await?;
    for (index, step) in manifest.script.iter().enumerate() {
        session
            .apply(step)
            .await
            .with_context(|| format!("Script step {} failed", index + 1))?;
        totals.absorb(&session.runtime.drain(opts.max_rounds).await?);
    }
    session.runtime.scheduler().flush();

    let report = session.report(manifest.script.len(), totals).await?;
    if opts.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    let t = &report.totals;
    println!(
        "Ran {} steps: {} dispatched, {} transitions, {} rejected, {} failed",
        report.steps, t.dispatched, t.transitions, t.rejected, t.failed
    );

    for actor in &report.actors {
        let state = actor.state.as_deref().unwrap_or("-");
        println!("{}  state={}  watermark={}", actor.id, state, actor.watermark);
        for (key, value) in &actor.context {
            println!("  {} = {}", key, value);
        }
    }

    if !report.diagnostics.is_empty() {
        println!("Diagnostics:");
        for diag in &report.diagnostics {
            println!("- {}", diag);
        }
    }
}
