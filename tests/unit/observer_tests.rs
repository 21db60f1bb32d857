//! Observer behavior: notifications, batching, derived views, timers and
//! the fan-out list observer.

#[path = "../utils/mod.rs"]
mod utils;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_query_rs::{
    notify_manager, query_fn, NotifyOnChangeProps, QueryClient, QueryKey, QueryObserverOptions,
    QueryStatus, ResultField, NEVER,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use utils::{sleep_ms, wait_for, Calls};

#[tokio::test]
async fn test_batched_updates_yield_one_notification_with_final_value() {
    let client = QueryClient::new();
    client.set_query_data("batched", json!(0)).unwrap();

    let observer = client.watch_query(
        QueryObserverOptions::new("batched")
            .enabled(false)
            .with_stale_time(NEVER),
    );
    let notifications = Arc::new(AtomicU32::new(0));
    let last: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
    let count = notifications.clone();
    let seen = last.clone();
    let sub = observer.subscribe(move |result| {
        count.fetch_add(1, Ordering::SeqCst);
        *seen.lock() = result.data;
    });

    notify_manager().batch(|| {
        client.set_query_data("batched", json!(1)).unwrap();
        client.set_query_data("batched", json!(2)).unwrap();
        client.set_query_data("batched", json!(3)).unwrap();
        // Nothing delivered while the batch is open.
        assert_eq!(notifications.load(Ordering::SeqCst), 0);
    });

    assert_eq!(notifications.load(Ordering::SeqCst), 1);
    assert_eq!(last.lock().clone(), Some(json!(3)));

    observer.unsubscribe(sub);
}

#[tokio::test]
async fn test_subscribe_fetches_and_settles() {
    let client = QueryClient::new();
    let observer = client.watch_query(
        QueryObserverOptions::new("mount")
            .with_query_fn(query_fn(|| async {
                sleep_ms(10).await;
                Ok(json!({"ready": true}))
            })),
    );

    let results = Arc::new(Mutex::new(Vec::new()));
    let log = results.clone();
    let sub = observer.subscribe(move |result| {
        log.lock().push(result);
    });

    assert!(wait_for(300, || {
        results
            .lock()
            .last()
            .map_or(false, |r| r.status == QueryStatus::Success)
    })
    .await);

    let log = results.lock();
    assert!(log.iter().any(|r| r.is_loading));
    let settled = log.last().unwrap();
    assert_eq!(settled.data, Some(json!({"ready": true})));
    assert!(!settled.is_fetching);

    drop(log);
    observer.unsubscribe(sub);
}

#[tokio::test]
async fn test_disabled_observer_never_fetches() {
    let client = QueryClient::new();
    let calls = Calls::new();
    let observer = client.watch_query(
        QueryObserverOptions::new("disabled")
            .enabled(false)
            .with_query_fn(query_fn({
                let calls = calls.clone();
                move || {
                    let calls = calls.clone();
                    async move {
                        calls.record();
                        Ok(json!(1))
                    }
                }
            })),
    );
    let sub = observer.subscribe(|_| {});

    sleep_ms(50).await;
    assert_eq!(calls.get(), 0);
    assert!(observer.get_current_result().is_idle);

    observer.unsubscribe(sub);
}

#[tokio::test]
async fn test_select_projects_and_caches() {
    let client = QueryClient::new();
    client
        .set_query_data("rows", json!({"items": [1, 2, 3], "total": 3}))
        .unwrap();

    let select_runs = Arc::new(AtomicU32::new(0));
    let runs = select_runs.clone();
    let observer = client.watch_query(
        QueryObserverOptions::new("rows")
            .enabled(false)
            .with_select(move |raw| {
                runs.fetch_add(1, Ordering::SeqCst);
                raw.get("items").cloned().unwrap_or(Value::Null)
            }),
    );
    let sub = observer.subscribe(|_| {});

    assert_eq!(observer.get_current_result().data, Some(json!([1, 2, 3])));
    // Re-reading without a data change reuses the cached projection.
    let _ = observer.get_current_result();
    let _ = observer.get_current_result();
    assert_eq!(select_runs.load(Ordering::SeqCst), 1);

    client
        .set_query_data("rows", json!({"items": [4], "total": 1}))
        .unwrap();
    assert_eq!(observer.get_current_result().data, Some(json!([4])));
    assert_eq!(select_runs.load(Ordering::SeqCst), 2);

    observer.unsubscribe(sub);
}

#[tokio::test]
async fn test_notify_on_change_props_list_filters_notifications() {
    let client = QueryClient::new();
    client.set_query_data("picky", json!("a")).unwrap();

    let observer = client.watch_query(
        QueryObserverOptions::new("picky")
            .enabled(false)
            .with_stale_time(NEVER)
            .with_notify_on_change_props(NotifyOnChangeProps::List(vec![ResultField::Data])),
    );
    let notifications = Arc::new(AtomicU32::new(0));
    let count = notifications.clone();
    let sub = observer.subscribe(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
    });

    // Same data, fresher timestamp: data itself is unchanged, no delivery.
    let query = client.cache().get(&QueryKey::from("picky").hash()).unwrap();
    query.set_data(json!("a"), None);
    assert_eq!(notifications.load(Ordering::SeqCst), 0);

    client.set_query_data("picky", json!("b")).unwrap();
    assert_eq!(notifications.load(Ordering::SeqCst), 1);

    observer.unsubscribe(sub);
}

#[tokio::test]
async fn test_tracked_props_learn_from_reads() {
    let client = QueryClient::new();
    client.set_query_data("tracked", json!("a")).unwrap();

    let observer = client.watch_query(
        QueryObserverOptions::new("tracked")
            .enabled(false)
            .with_stale_time(NEVER)
            .with_notify_on_change_props(NotifyOnChangeProps::Tracked),
    );
    let notifications = Arc::new(AtomicU32::new(0));
    let count = notifications.clone();
    let sub = observer.subscribe(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
    });

    // No fields read yet: changes stay silent.
    client.set_query_data("tracked", json!("b")).unwrap();
    assert_eq!(notifications.load(Ordering::SeqCst), 0);

    // Read `data`; now data changes notify.
    let tracked = observer.tracked_result();
    assert_eq!(tracked.data(), &Some(json!("b")));
    client.set_query_data("tracked", json!("c")).unwrap();
    assert_eq!(notifications.load(Ordering::SeqCst), 1);

    observer.unsubscribe(sub);
}

#[tokio::test]
async fn test_keep_previous_data_across_key_switch() {
    let client = QueryClient::new();

    let options = |page: u32| {
        QueryObserverOptions::new(QueryKey::new([json!("pages"), json!(page)]))
            .keep_previous_data()
            .with_query_fn(query_fn(move || async move {
                sleep_ms(40).await;
                Ok(json!({ "page": page }))
            }))
    };

    let observer = client.watch_query(options(1));
    let results = Arc::new(Mutex::new(Vec::new()));
    let log = results.clone();
    let sub = observer.subscribe(move |result| {
        log.lock().push(result);
    });
    assert!(wait_for(300, || {
        results
            .lock()
            .last()
            .map_or(false, |r| r.data == Some(json!({"page": 1})))
    })
    .await);

    observer.set_options(options(2));
    let early = observer.get_current_result();
    assert_eq!(early.data, Some(json!({"page": 1})));
    assert!(early.is_previous_data);

    assert!(wait_for(300, || {
        results
            .lock()
            .last()
            .map_or(false, |r| r.data == Some(json!({"page": 2})))
    })
    .await);
    let settled = observer.get_current_result();
    assert!(!settled.is_previous_data);

    observer.unsubscribe(sub);
}

#[tokio::test]
async fn test_stale_timer_re_notifies_without_refetch() {
    let client = QueryClient::new();
    let calls = Calls::new();
    client.set_query_data("aging", json!("fresh")).unwrap();

    let observer = client.watch_query(
        QueryObserverOptions::new("aging")
            .with_stale_time(Duration::from_millis(60))
            .with_refetch_on_mount(async_query_rs::RefetchPolicy::Never)
            .with_query_fn(query_fn({
                let calls = calls.clone();
                move || {
                    let calls = calls.clone();
                    async move {
                        calls.record();
                        Ok(json!("refetched"))
                    }
                }
            })),
    );
    let stale_flips = Arc::new(AtomicU32::new(0));
    let flips = stale_flips.clone();
    let sub = observer.subscribe(move |result| {
        if result.is_stale {
            flips.fetch_add(1, Ordering::SeqCst);
        }
    });

    assert!(!observer.get_current_result().is_stale);
    assert!(wait_for(300, || stale_flips.load(Ordering::SeqCst) >= 1).await);

    // Stale expiry notifies; it does not fetch.
    assert_eq!(calls.get(), 0);
    assert_eq!(observer.get_current_result().data, Some(json!("fresh")));

    observer.unsubscribe(sub);
}

#[tokio::test]
async fn test_refetch_interval_drives_periodic_fetches() {
    let client = QueryClient::new();
    let calls = Calls::new();

    let observer = client.watch_query(
        QueryObserverOptions::new("ticker")
            .with_refetch_interval(Duration::from_millis(25))
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

    assert!(wait_for(500, || calls.get() >= 3).await);

    observer.unsubscribe(sub);
    let settled = calls.get();
    sleep_ms(80).await;
    // Unsubscribing cancels the interval.
    assert!(calls.get() <= settled + 1);
}

#[tokio::test]
async fn test_unsubscribed_query_is_collected() {
    let client = QueryClient::new();
    let observer = client.watch_query(
        QueryObserverOptions::new("short-lived")
            .with_cache_time(Duration::from_millis(40))
            .with_query_fn(query_fn(|| async { Ok(json!(1)) })),
    );
    let sub = observer.subscribe(|_| {});
    assert!(wait_for(200, || client.get_query_data::<i32>("short-lived").is_some()).await);

    // Observed queries survive their retention window.
    sleep_ms(60).await;
    assert!(client.get_query_state("short-lived").is_some());

    observer.unsubscribe(sub);
    assert!(wait_for(300, || client.get_query_state("short-lived").is_none()).await);
}

#[tokio::test]
async fn test_queries_observer_combines_and_diffs() {
    let client = QueryClient::new();

    let slot = |name: &str| {
        let value = json!({ "name": name });
        QueryObserverOptions::new(QueryKey::new(["list", name]))
            .with_query_fn(query_fn(move || {
                let value = value.clone();
                async move { Ok(value) }
            }))
    };

    let observer = client.watch_queries(vec![slot("a"), slot("b")]);
    let combined: Arc<Mutex<Vec<Vec<Option<Value>>>>> = Arc::new(Mutex::new(Vec::new()));
    let log = combined.clone();
    let sub = observer.subscribe(move |results| {
        log.lock()
            .push(results.into_iter().map(|r| r.data).collect());
    });

    assert!(wait_for(300, || {
        combined
            .lock()
            .last()
            .map_or(false, |row| {
                row == &vec![Some(json!({"name": "a"})), Some(json!({"name": "b"}))]
            })
    })
    .await);

    // Reorder and replace one slot: "b" is reused, "c" is created.
    observer.set_queries(vec![slot("b"), slot("c")]);
    assert!(wait_for(300, || {
        combined
            .lock()
            .last()
            .map_or(false, |row| {
                row == &vec![Some(json!({"name": "b"})), Some(json!({"name": "c"}))]
            })
    })
    .await);

    observer.unsubscribe(sub);
}
