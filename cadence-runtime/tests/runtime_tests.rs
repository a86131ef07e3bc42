//! Runtime assembly and the automatic inbox pump

mod common;

use cadence_runtime::{
    ActorSpec, DispatchConfig, RenderLog, Runtime, RuntimeConfig, SchedulerConfig, TickMode,
};
use async_trait::async_trait;
use cadence_store::{LogEntry, MemoryStore, ReactiveStore, ReplicatedStore, Source, StoreError};
use cadence_types::{ActorId, Map, MessageDraft, Query, Sequence, Value};
use common::{counter_machine, object, Harness};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Memory store whose inbox reads can be switched off
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_entries: AtomicBool,
}

#[async_trait]
impl ReplicatedStore for FlakyStore {
    fn read(&self, source: &Source, query: &Query) -> ReactiveStore<Value> {
        self.inner.read(source, query)
    }

    async fn get(&self, document: &str) -> cadence_store::Result<Option<Map>> {
        self.inner.get(document).await
    }

    async fn merge(&self, document: &str, patch: Map) -> cadence_store::Result<()> {
        self.inner.merge(document, patch).await
    }

    async fn append(&self, log: &str, entry: Value) -> cadence_store::Result<Sequence> {
        self.inner.append(log, entry).await
    }

    async fn entries(&self, log: &str) -> cadence_store::Result<Vec<LogEntry>> {
        if self.fail_entries.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("inbox unavailable".into()));
        }
        self.inner.entries(log).await
    }

    async fn mark_processed(&self, log: &str, sequence: Sequence) -> cadence_store::Result<()> {
        self.inner.mark_processed(log, sequence).await
    }

    async fn put(&self, collection: &str, id: &str, record: Value) -> cadence_store::Result<()> {
        self.inner.put(collection, id, record).await
    }

    async fn remove(&self, collection: &str, id: &str) -> cadence_store::Result<Option<Value>> {
        self.inner.remove(collection, id).await
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

#[tokio::test]
async fn test_pump_dispatches_on_send() {
    let h = Harness::with_config(RuntimeConfig::default());
    let actor = h.counter("counter").await;

    h.send("counter", "INC", json!({"by": 2})).await;
    h.send("counter", "INC", json!({"by": 3})).await;

    assert!(eventually(|| actor.context_value("count") == Some(json!(5))).await);
    assert!(eventually(|| !actor.is_dispatching()).await);
}

#[tokio::test]
async fn test_spawn_dispatches_existing_backlog() {
    let h = Harness::with_config(RuntimeConfig::default());
    h.put_document("machines/counter", counter_machine()).await;
    h.put_document("config/counter", json!({"state": "machines/counter"}))
        .await;
    h.runtime
        .channel()
        .send(
            &ActorId::new("counter"),
            MessageDraft::new("INC", json!({"by": 4}), "earlier"),
        )
        .await
        .unwrap();

    let actor = h
        .runtime
        .spawn_actor(ActorSpec::new("counter").accept("INC"))
        .await
        .unwrap();

    assert_eq!(actor.context_value("count"), Some(json!(4)));
    assert_eq!(h.watermark("counter").await, 1);
}

#[tokio::test]
async fn test_tokio_tick_flushes_renders() {
    let store = Arc::new(MemoryStore::new());
    let renders = Arc::new(RenderLog::new());
    let runtime = Runtime::builder()
        .store(store.clone())
        .renderer(renders.clone())
        .build()
        .unwrap();

    runtime.spawn_actor(ActorSpec::new("panel")).await.unwrap();
    store
        .update("context/panel", "title", json!("hello"))
        .await
        .unwrap();

    let panel = ActorId::new("panel");
    assert!(eventually(|| renders.count_for(&panel) >= 1).await);
    assert!(runtime.stats().renders >= 1);
}

#[tokio::test]
async fn test_manual_tick_from_config() {
    let runtime = Runtime::builder()
        .config(RuntimeConfig {
            dispatch: DispatchConfig {
                auto: false,
                max_batch: None,
            },
            scheduler: SchedulerConfig {
                tick: TickMode::Manual,
            },
            ..RuntimeConfig::default()
        })
        .build()
        .unwrap();

    runtime.spawn_actor(ActorSpec::new("a")).await.unwrap();
    let tick = runtime.manual_tick().unwrap();
    assert_eq!(tick.pending(), 1);
    tick.run_pending();
    assert_eq!(runtime.stats().renders, 1);
}

#[tokio::test]
async fn test_invalid_config_is_refused() {
    let result = Runtime::builder()
        .config(RuntimeConfig {
            dispatch: DispatchConfig {
                auto: true,
                max_batch: Some(0),
            },
            ..RuntimeConfig::default()
        })
        .build();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_stats_count_actors_and_subscriptions() {
    let h = Harness::new();
    h.put_document("views/a", json!({})).await;
    h.put_document("config/a", json!({"view": "views/a"})).await;
    h.runtime.spawn_actor(ActorSpec::new("a")).await.unwrap();
    h.runtime.spawn_actor(ActorSpec::new("b")).await.unwrap();

    let stats = h.runtime.stats();
    assert_eq!(stats.actors, 2);
    // view + context for a, context for b
    assert_eq!(stats.subscriptions, 3);
    assert_eq!(
        h.runtime.actor_ids(),
        vec![ActorId::new("a"), ActorId::new("b")]
    );
}

#[tokio::test]
async fn test_custom_context_document() {
    let h = Harness::new();
    h.put_document("shared/ctx", json!({"greeting": "hi"})).await;
    h.put_document("config/a", json!({"context": "shared/ctx"})).await;
    let actor = h.runtime.spawn_actor(ActorSpec::new("a")).await.unwrap();

    assert_eq!(actor.context_document(), "shared/ctx");
    assert_eq!(actor.context_value("greeting"), Some(json!("hi")));
}

#[tokio::test]
async fn test_failed_initial_pass_leaves_nothing_behind() {
    let store = Arc::new(FlakyStore::default());
    store
        .merge("machines/counter", object(counter_machine()))
        .await
        .unwrap();
    store
        .merge("config/counter", object(json!({"state": "machines/counter"})))
        .await
        .unwrap();
    store.fail_entries.store(true, Ordering::SeqCst);

    let runtime = Runtime::builder().store(store.clone()).build().unwrap();
    let id = ActorId::new("counter");

    let err = runtime
        .spawn_actor(ActorSpec::new("counter").accept("INC"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("inbox unavailable"), "{}", err);
    assert!(runtime.actor(&id).is_none());
    assert_eq!(runtime.stats().subscriptions, 0);
    assert!(eventually(|| store.inner.stats().open_views == 0).await);

    store.fail_entries.store(false, Ordering::SeqCst);
    let actor = runtime
        .spawn_actor(ActorSpec::new("counter").accept("INC"))
        .await
        .unwrap();
    assert_eq!(actor.current_state().as_deref(), Some("active"));
}

#[tokio::test]
async fn test_pump_ignores_its_own_marks() {
    let h = Harness::with_config(RuntimeConfig::default());
    let actor = h.counter("counter").await;
    let after_spawn = h.runtime.stats().passes;

    h.send("counter", "INC", json!({"by": 1})).await;
    assert!(eventually(|| actor.context_value("count") == Some(json!(1))).await);
    assert!(eventually(|| !actor.is_dispatching()).await);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // One pass for the send; marking it processed starts no other
    assert_eq!(h.runtime.stats().passes, after_spawn + 1);
    assert_eq!(h.watermark("counter").await, 1);
}
