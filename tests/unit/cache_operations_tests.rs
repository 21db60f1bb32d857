//! Cache operations: building, finding, filtering, events, invalidation
//! and removal.

#[path = "../utils/mod.rs"]
mod utils;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_query_rs::{
    QueryCacheEvent, QueryClient, QueryFilters, QueryKey, QueryObserverOptions, QueryOptions,
    query_fn,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use utils::{sleep_ms, wait_for, Calls};

#[tokio::test]
async fn test_one_entry_per_canonical_hash() {
    let client = QueryClient::new();
    client
        .set_query_data(
            QueryKey::new([json!("todos"), json!({"page": 1, "size": 10})]),
            json!("a"),
        )
        .unwrap();
    client
        .set_query_data(
            QueryKey::new([json!("todos"), json!({"size": 10, "page": 1})]),
            json!("b"),
        )
        .unwrap();

    assert_eq!(client.cache().len(), 1);
    assert_eq!(
        client.get_query_data::<Value>(QueryKey::new([json!("todos"), json!({"page": 1, "size": 10})])),
        Some(json!("b"))
    );
}

#[tokio::test]
async fn test_find_all_with_prefix_and_predicate() {
    let client = QueryClient::new();
    client
        .set_query_data(QueryKey::new(["todos", "1"]), json!({"done": false}))
        .unwrap();
    client
        .set_query_data(QueryKey::new(["todos", "2"]), json!({"done": true}))
        .unwrap();
    client.set_query_data("users", json!([])).unwrap();

    let todos = client
        .cache()
        .find_all(&QueryFilters::new().with_key(QueryKey::new(["todos"])));
    assert_eq!(todos.len(), 2);

    let done = client.cache().find_all(
        &QueryFilters::new()
            .with_key(QueryKey::new(["todos"]))
            .with_predicate(|query| {
                query
                    .state()
                    .data
                    .and_then(|d| d.get("done").cloned())
                    .map_or(false, |done| done == json!(true))
            }),
    );
    assert_eq!(done.len(), 1);
}

#[tokio::test]
async fn test_active_filter_tracks_observers() {
    let client = QueryClient::new();
    client.set_query_data("watched", json!(1)).unwrap();
    client.set_query_data("ignored", json!(2)).unwrap();

    let observer = client.watch_query(
        QueryObserverOptions::new("watched")
            .with_query_fn(query_fn(|| async { Ok(json!(1)) })),
    );
    let sub = observer.subscribe(|_| {});

    let active = client.cache().find_all(&QueryFilters::new().active(true));
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].key(), &QueryKey::from("watched"));

    let inactive = client.cache().find_all(&QueryFilters::new().active(false));
    assert_eq!(inactive.len(), 1);

    observer.unsubscribe(sub);
    assert!(client.cache().find_all(&QueryFilters::new().active(true)).is_empty());
}

#[tokio::test]
async fn test_fetching_filter() {
    let client = QueryClient::new();
    let fetch = client.fetch_query_data::<Value, _, _>(
        "slow",
        || async {
            sleep_ms(50).await;
            Ok(json!(1))
        },
        QueryOptions::default(),
    );
    let probe = async {
        sleep_ms(10).await;
        client.is_fetching(QueryFilters::new())
    };
    let (result, fetching) = tokio::join!(fetch, probe);
    result.unwrap();

    assert_eq!(fetching, 1);
    assert_eq!(client.is_fetching(QueryFilters::new()), 0);
}

#[tokio::test]
async fn test_cache_events_for_lifecycle() {
    let client = QueryClient::new();
    let events: Arc<Mutex<Vec<QueryCacheEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let log = events.clone();
    let sub = client.cache().subscribe(move |event, _query| {
        log.lock().push(event);
    });

    client.set_query_data("e", json!(1)).unwrap();
    client.set_query_data("e", json!(2)).unwrap();
    let query = client.cache().get(&QueryKey::from("e").hash()).unwrap();
    client.cache().remove(&query);

    let seen = events.lock().clone();
    assert_eq!(seen[0], QueryCacheEvent::Added);
    assert!(seen.contains(&QueryCacheEvent::Updated));
    assert_eq!(*seen.last().unwrap(), QueryCacheEvent::Removed);

    client.cache().unsubscribe(sub);
}

#[tokio::test]
async fn test_invalidate_marks_stale_and_refetches_active() {
    let client = QueryClient::new();
    let calls = Calls::new();

    let observer = client.watch_query(
        QueryObserverOptions::new("inv")
            .with_stale_time(Duration::from_secs(60))
            .with_query_fn(query_fn({
                let calls = calls.clone();
                move || {
                    let calls = calls.clone();
                    async move {
                        calls.record();
                        Ok(json!(calls.get()))
                    }
                }
            })),
    );
    let sub = observer.subscribe(|_| {});
    assert!(wait_for(200, || calls.get() == 1).await);

    client
        .invalidate_queries(QueryFilters::new().with_key("inv").exact())
        .await;
    assert_eq!(calls.get(), 2);

    let state = client.get_query_state("inv").unwrap();
    // The refetch succeeded, which clears the invalidation mark again.
    assert!(!state.is_invalidated);
    assert_eq!(state.data, Some(json!(2)));

    observer.unsubscribe(sub);
}

#[tokio::test]
async fn test_invalidate_without_observers_only_marks() {
    let client = QueryClient::new();
    let calls = Calls::new();
    client
        .prefetch_query(
            "idle-inv",
            {
                let calls = calls.clone();
                move || {
                    let calls = calls.clone();
                    async move {
                        calls.record();
                        Ok(json!("x"))
                    }
                }
            },
            QueryOptions::default(),
        )
        .await;
    assert_eq!(calls.get(), 1);

    client
        .invalidate_queries(QueryFilters::new().with_key("idle-inv").exact())
        .await;

    assert_eq!(calls.get(), 1);
    assert!(client.get_query_state("idle-inv").unwrap().is_invalidated);
}

#[tokio::test]
async fn test_refetch_queries_ignores_staleness() {
    let client = QueryClient::new();
    let calls = Calls::new();
    let options = QueryOptions::default().with_stale_time(Duration::from_secs(600));

    client
        .prefetch_query(
            "refetch-me",
            {
                let calls = calls.clone();
                move || {
                    let calls = calls.clone();
                    async move {
                        calls.record();
                        Ok(json!(calls.get()))
                    }
                }
            },
            options,
        )
        .await;
    assert_eq!(calls.get(), 1);

    client
        .refetch_queries(QueryFilters::new().with_key("refetch-me").exact())
        .await;
    assert_eq!(calls.get(), 2);
    assert_eq!(client.get_query_data::<u32>("refetch-me"), Some(2));
}

#[tokio::test]
async fn test_remove_queries_by_prefix() {
    let client = QueryClient::new();
    client.set_query_data(QueryKey::new(["a", "1"]), json!(1)).unwrap();
    client.set_query_data(QueryKey::new(["a", "2"]), json!(2)).unwrap();
    client.set_query_data(QueryKey::new(["b", "1"]), json!(3)).unwrap();

    client.remove_queries(QueryFilters::new().with_key(QueryKey::new(["a"])));

    assert_eq!(client.cache().len(), 1);
    assert_eq!(client.get_query_data::<i32>(QueryKey::new(["b", "1"])), Some(3));
}

#[tokio::test]
async fn test_clear_empties_both_caches() {
    let client = QueryClient::new();
    client.set_query_data("x", json!(1)).unwrap();
    client.set_query_data("y", json!(2)).unwrap();

    client.clear();
    assert!(client.cache().is_empty());
    assert!(client.mutation_cache().is_empty());
}

#[tokio::test]
async fn test_observer_data_matches_get_query_data_after_flush() {
    let client = QueryClient::new();
    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let notifications = Arc::new(AtomicU32::new(0));

    let observer = client.watch_query(
        QueryObserverOptions::new("sync")
            .with_query_fn(query_fn(|| async { Ok(json!("fetched")) })),
    );
    let log = seen.clone();
    let count = notifications.clone();
    let sub = observer.subscribe(move |result| {
        count.fetch_add(1, Ordering::SeqCst);
        if let Some(data) = result.data {
            log.lock().push(data);
        }
    });

    assert!(wait_for(200, || notifications.load(Ordering::SeqCst) >= 2).await);

    // Every observed payload must agree with the cache at that moment; the
    // final one is the settled value.
    assert_eq!(seen.lock().last(), Some(&json!("fetched")));
    assert_eq!(client.get_query_data::<Value>("sync"), Some(json!("fetched")));

    observer.unsubscribe(sub);
}
