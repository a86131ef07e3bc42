//! Single-process replicated store
//!
//! `MemoryStore` keeps logs, documents and collections in memory and keeps
//! every live read it has handed out up to date. It is the default backend
//! for tests, the command-line harness and single-replica embeddings.

use crate::reactive::{ReactiveStore, WeakReactiveStore};
use crate::{LogEntry, ReplicatedStore, Result, Source, StoreError};
use async_trait::async_trait;
use cadence_types::{Map, Query, Sequence, Value};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct State {
    documents: HashMap<String, Map>,
    collections: HashMap<String, BTreeMap<String, Value>>,
    logs: HashMap<String, Vec<LogEntry>>,
}

/// A live read handed out by `read`
struct View {
    id: u64,
    source: Source,
    query: Query,
    store: WeakReactiveStore<Value>,
    // Held across evaluate and set, so a slower publisher can never
    // overwrite a newer value with an older one
    gate: Arc<Mutex<()>>,
}

/// Counters describing how the store has been read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Collection reads answered by id
    pub point_lookups: u64,
    /// Collection reads answered by scanning
    pub scans: u64,
    /// Live reads that still have an owner
    pub open_views: usize,
}

/// In-memory implementation of `ReplicatedStore`
///
/// Every async operation yields to the scheduler once before touching
/// state, so callers observe the same suspension points a networked
/// backend would introduce.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    views: Arc<Mutex<Vec<View>>>,
    next_view: AtomicU64,
    point_lookups: AtomicU64,
    scans: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> StoreStats {
        let mut views = self.views.lock();
        views.retain(|v| v.store.upgrade().is_some());
        StoreStats {
            point_lookups: self.point_lookups.load(Ordering::SeqCst),
            scans: self.scans.load(Ordering::SeqCst),
            open_views: views.len(),
        }
    }

    /// Names of all documents currently stored
    pub fn document_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.read().documents.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn evaluate(&self, source: &Source, query: &Query) -> Value {
        let state = self.state.read();
        match source {
            Source::Document(id) => state
                .documents
                .get(id)
                .map(|doc| Value::Object(doc.clone()))
                .unwrap_or(Value::Null),
            Source::Log(id) => Value::Array(
                state
                    .logs
                    .get(id)
                    .map(|entries| {
                        entries
                            .iter()
                            .map(|e| {
                                json!({
                                    "sequence": e.sequence,
                                    "value": e.value,
                                    "processed": e.processed,
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
            ),
            Source::Collection(name) => {
                let records = state.collections.get(name);
                match query {
                    Query::Key(id) => {
                        self.point_lookups.fetch_add(1, Ordering::SeqCst);
                        records
                            .and_then(|r| r.get(id))
                            .cloned()
                            .unwrap_or(Value::Null)
                    }
                    Query::All => {
                        self.scans.fetch_add(1, Ordering::SeqCst);
                        Value::Array(
                            records
                                .map(|r| r.values().cloned().collect())
                                .unwrap_or_default(),
                        )
                    }
                    Query::Filter(filter) => {
                        self.scans.fetch_add(1, Ordering::SeqCst);
                        Value::Array(
                            records
                                .map(|r| r.values().filter(|v| filter.matches(v)).cloned().collect())
                                .unwrap_or_default(),
                        )
                    }
                }
            }
        }
    }

    /// Re-evaluate every live read of `source` and push changed values
    fn publish(&self, source: &Source) {
        let targets: Vec<(Query, ReactiveStore<Value>, Arc<Mutex<()>>)> = {
            let mut views = self.views.lock();
            views.retain(|v| v.store.upgrade().is_some());
            views
                .iter()
                .filter(|v| &v.source == source)
                .filter_map(|v| {
                    v.store
                        .upgrade()
                        .map(|s| (v.query.clone(), s, v.gate.clone()))
                })
                .collect()
        };

        for (query, store, gate) in targets {
            let _gate = gate.lock();
            let value = self.evaluate(source, &query);
            if store.with(|current| current != &value) {
                store.set(value);
            }
        }
    }
}

#[async_trait]
impl ReplicatedStore for MemoryStore {
    fn read(&self, source: &Source, query: &Query) -> ReactiveStore<Value> {
        let store = ReactiveStore::new(Value::Null);
        let id = self.next_view.fetch_add(1, Ordering::SeqCst);
        let gate = Arc::new(Mutex::new(()));

        // Registered before the first evaluation so no write is missed
        self.views.lock().push(View {
            id,
            source: source.clone(),
            query: query.clone(),
            store: store.downgrade(),
            gate: gate.clone(),
        });
        {
            let _gate = gate.lock();
            store.set(self.evaluate(source, query));
        }

        let views = Arc::downgrade(&self.views);
        let label = source.to_string();
        store.on_release(move || {
            if let Some(views) = views.upgrade() {
                views.lock().retain(|v| v.id != id);
            }
            tracing::debug!(source = %label, view = id, "live read released");
        });
        store
    }

    async fn get(&self, document: &str) -> Result<Option<Map>> {
        tokio::task::yield_now().await;
        Ok(self.state.read().documents.get(document).cloned())
    }

    async fn merge(&self, document: &str, patch: Map) -> Result<()> {
        tokio::task::yield_now().await;
        {
            let mut state = self.state.write();
            let doc = state.documents.entry(document.to_string()).or_default();
            for (key, value) in patch {
                doc.insert(key, value);
            }
        }
        self.publish(&Source::Document(document.to_string()));
        Ok(())
    }

    async fn append(&self, log: &str, entry: Value) -> Result<Sequence> {
        tokio::task::yield_now().await;
        let sequence = {
            let mut state = self.state.write();
            let entries = state.logs.entry(log.to_string()).or_default();
            let sequence = entries
                .last()
                .map(|e| e.sequence.next())
                .unwrap_or(Sequence::new(1));
            entries.push(LogEntry {
                sequence,
                value: entry,
                processed: false,
            });
            sequence
        };
        self.publish(&Source::Log(log.to_string()));
        Ok(sequence)
    }

    async fn entries(&self, log: &str) -> Result<Vec<LogEntry>> {
        tokio::task::yield_now().await;
        Ok(self.state.read().logs.get(log).cloned().unwrap_or_default())
    }

    async fn mark_processed(&self, log: &str, sequence: Sequence) -> Result<()> {
        tokio::task::yield_now().await;
        {
            let mut state = self.state.write();
            let entry = state
                .logs
                .get_mut(log)
                .and_then(|entries| entries.iter_mut().find(|e| e.sequence == sequence))
                .ok_or_else(|| StoreError::EntryNotFound {
                    log: log.to_string(),
                    sequence,
                })?;
            if entry.processed {
                return Ok(());
            }
            entry.processed = true;
        }
        self.publish(&Source::Log(log.to_string()));
        Ok(())
    }

    async fn put(&self, collection: &str, id: &str, record: Value) -> Result<()> {
        tokio::task::yield_now().await;
        self.state
            .write()
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), record);
        self.publish(&Source::Collection(collection.to_string()));
        Ok(())
    }

    async fn remove(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        tokio::task::yield_now().await;
        let removed = self
            .state
            .write()
            .collections
            .get_mut(collection)
            .and_then(|records| records.remove(id));
        if removed.is_some() {
            self.publish(&Source::Collection(collection.to_string()));
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::Filter;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_document_merge_and_get() {
        let store = MemoryStore::new();
        store.update("config/a", "view", json!("view/a")).await.unwrap();
        store.update("config/a", "watermark", json!(3)).await.unwrap();

        let doc = store.get("config/a").await.unwrap().unwrap();
        assert_eq!(doc["view"], "view/a");
        assert_eq!(doc["watermark"], 3);
        assert!(store.get("config/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_sequences() {
        let store = MemoryStore::new();
        let s1 = store.append("inbox/a", json!({"n": 1})).await.unwrap();
        let s2 = store.append("inbox/a", json!({"n": 2})).await.unwrap();
        let other = store.append("inbox/b", json!({"n": 1})).await.unwrap();

        assert_eq!(s1, Sequence::new(1));
        assert_eq!(s2, Sequence::new(2));
        assert_eq!(other, Sequence::new(1));

        store.mark_processed("inbox/a", s1).await.unwrap();
        let entries = store.entries("inbox/a").await.unwrap();
        assert!(entries[0].processed);
        assert!(!entries[1].processed);

        let missing = store.mark_processed("inbox/a", Sequence::new(9)).await;
        assert!(matches!(missing, Err(StoreError::EntryNotFound { .. })));
    }

    #[tokio::test]
    async fn test_live_document_read_follows_writes() {
        let store = MemoryStore::new();
        let view = store.read(&Source::Document("context/a".into()), &Query::All);
        assert_eq!(view.get(), Value::Null);

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let _unsub = view.subscribe(move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        store.update("context/a", "count", json!(1)).await.unwrap();
        assert_eq!(view.get(), json!({"count": 1}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_point_lookup_is_not_a_scan() {
        let store = MemoryStore::new();
        store.put("spark", "X", json!({"id": "X", "name": "x"})).await.unwrap();
        store.put("spark", "Y", json!({"id": "Y", "name": "y"})).await.unwrap();

        let view = store.read(
            &Source::Collection("spark".into()),
            &Query::Key("X".to_string()),
        );
        assert_eq!(view.get()["name"], "x");

        let stats = store.stats();
        assert_eq!(stats.point_lookups, 1);
        assert_eq!(stats.scans, 0);
    }

    #[tokio::test]
    async fn test_filtered_view_updates_only_on_relevant_change() {
        let store = MemoryStore::new();
        let view = store.read(
            &Source::Collection("todos".into()),
            &Query::Filter(Filter::eq("done", json!(false))),
        );
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let _unsub = view.subscribe(move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        store.put("todos", "1", json!({"id": "1", "done": false})).await.unwrap();
        store.put("todos", "2", json!({"id": "2", "done": true})).await.unwrap();

        assert_eq!(view.get().as_array().unwrap().len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_closes_view() {
        let store = MemoryStore::new();
        let view = store.read(&Source::Log("inbox/a".into()), &Query::All);
        let unsub = view.subscribe(|_| {});
        assert_eq!(store.stats().open_views, 1);

        unsub.call();
        assert_eq!(store.stats().open_views, 0);

        // A released view no longer follows the log
        store.append("inbox/a", json!({})).await.unwrap();
        assert_eq!(view.get(), json!([]));
    }
}
