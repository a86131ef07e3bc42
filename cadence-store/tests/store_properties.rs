//! Property tests for the in-memory store

use cadence_store::{MemoryStore, ReplicatedStore, Source};
use cadence_types::{Filter, Query, Sequence};
use proptest::prelude::*;
use serde_json::json;

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #[test]
    fn prop_appends_get_consecutive_sequences(count in 1usize..50) {
        let (assigned, listed) = block_on(async {
            let store = MemoryStore::new();
            let mut assigned = Vec::new();
            for i in 0..count {
                assigned.push(store.append("inbox/a", json!({ "n": i })).await.unwrap());
            }
            let listed: Vec<Sequence> = store
                .entries("inbox/a")
                .await
                .unwrap()
                .into_iter()
                .map(|e| e.sequence)
                .collect();
            (assigned, listed)
        });

        let expected: Vec<Sequence> = (1..=count as u64).map(Sequence::new).collect();
        prop_assert_eq!(&assigned, &expected);
        prop_assert_eq!(&listed, &expected);
    }

    #[test]
    fn prop_filtered_view_matches_fresh_read(
        owners in prop::collection::vec(0u8..3, 0..30),
        removals in prop::collection::vec(0usize..30, 0..10),
    ) {
        let (live, fresh) = block_on(async {
            let store = MemoryStore::new();
            let source = Source::Collection("todos".into());
            let query = Query::Filter(Filter::eq("owner", json!(1)));
            let view = store.read(&source, &query);

            for (i, owner) in owners.iter().enumerate() {
                store
                    .put("todos", &format!("{:02}", i), json!({ "owner": owner, "i": i }))
                    .await
                    .unwrap();
            }
            for r in &removals {
                store.remove("todos", &format!("{:02}", r)).await.unwrap();
            }

            (view.get(), store.read(&source, &query).get())
        });

        prop_assert_eq!(live, fresh);
    }
}
