//! Query lifecycle: fetching, deduplication, staleness, retention, retry
//! and cancellation.

#[path = "../utils/mod.rs"]
mod utils;

use std::time::Duration;

use async_query_rs::{
    QueryClient, QueryError, QueryFilters, QueryOptions, QueryStatus, RetryDelay, RetryPolicy,
};
use serde_json::{json, Value};
use utils::{sleep_ms, Calls};

#[tokio::test]
async fn test_single_flight_shares_one_fetch() {
    let client = QueryClient::new();
    let calls = Calls::new();

    let fetcher = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move {
                calls.record();
                sleep_ms(20).await;
                Ok(json!("payload"))
            }
        }
    };

    let first = client.prefetch_query("k", fetcher.clone(), QueryOptions::default());
    let second = client.prefetch_query("k", fetcher, QueryOptions::default());
    tokio::join!(first, second);

    assert_eq!(calls.get(), 1);
    assert_eq!(client.get_query_data::<Value>("k"), Some(json!("payload")));
}

#[tokio::test]
async fn test_concurrent_fetch_query_data_resolves_to_same_value() {
    let client = QueryClient::new();
    let calls = Calls::new();

    let fetcher = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move {
                calls.record();
                sleep_ms(15).await;
                Ok(json!({"n": 7}))
            }
        }
    };

    let (a, b) = tokio::join!(
        client.fetch_query_data::<Value, _, _>("shared", fetcher.clone(), QueryOptions::default()),
        client.fetch_query_data::<Value, _, _>("shared", fetcher, QueryOptions::default()),
    );

    assert_eq!(calls.get(), 1);
    assert_eq!(a.unwrap(), b.unwrap());
}

#[tokio::test]
async fn test_stale_window_serves_cached_until_expiry() {
    let client = QueryClient::new();
    let calls = Calls::new();
    let options = QueryOptions::default().with_stale_time(Duration::from_millis(200));

    let fetcher = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move {
                calls.record();
                Ok(json!("cached"))
            }
        }
    };

    client
        .prefetch_query("k", fetcher.clone(), options.clone())
        .await;
    let value: Value = client
        .fetch_query_data("k", fetcher.clone(), options.clone())
        .await
        .unwrap();
    assert_eq!(value, json!("cached"));
    assert_eq!(calls.get(), 1);

    sleep_ms(250).await;
    let _: Value = client.fetch_query_data("k", fetcher, options).await.unwrap();
    assert_eq!(calls.get(), 2);
}

#[tokio::test]
async fn test_unobserved_query_is_collected_after_cache_time() {
    let client = QueryClient::new();
    client
        .prefetch_query(
            "gc",
            || async { Ok(json!(1)) },
            QueryOptions::default().with_cache_time(Duration::from_millis(50)),
        )
        .await;

    sleep_ms(30).await;
    assert!(client.get_query_state("gc").is_some());

    sleep_ms(60).await;
    assert!(client.get_query_state("gc").is_none());
}

#[tokio::test]
async fn test_retry_respects_count_and_reports_failures() {
    let client = QueryClient::new();
    let calls = Calls::new();

    let result = client
        .fetch_query_data::<Value, _, _>(
            "flaky",
            {
                let calls = calls.clone();
                move || {
                    let calls = calls.clone();
                    async move {
                        calls.record();
                        Err(QueryError::fetch("boom"))
                    }
                }
            },
            QueryOptions::default()
                .with_retry(RetryPolicy::Count(2))
                .with_retry_delay(RetryDelay::Fixed(Duration::from_millis(1))),
        )
        .await;

    assert_eq!(result, Err(QueryError::fetch("boom")));
    assert_eq!(calls.get(), 3);

    let state = client.get_query_state("flaky").unwrap();
    assert_eq!(state.status, QueryStatus::Error);
    assert_eq!(state.fetch_failure_count, 3);
    assert!(state.error_updated_at > 0);
}

#[tokio::test]
async fn test_fetch_defaults_to_no_retries() {
    let client = QueryClient::new();
    let calls = Calls::new();

    let result = client
        .fetch_query_data::<Value, _, _>(
            "once",
            {
                let calls = calls.clone();
                move || {
                    let calls = calls.clone();
                    async move {
                        calls.record();
                        Err(QueryError::fetch("nope"))
                    }
                }
            },
            QueryOptions::default(),
        )
        .await;

    assert!(result.is_err());
    assert_eq!(calls.get(), 1);
}

#[tokio::test]
async fn test_refetch_after_error_recovers() {
    let client = QueryClient::new();
    let calls = Calls::new();

    let fetcher = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move {
                calls.record();
                if calls.get() == 1 {
                    Err(QueryError::fetch("first try fails"))
                } else {
                    Ok(json!("recovered"))
                }
            }
        }
    };

    let first = client
        .fetch_query_data::<Value, _, _>("recover", fetcher.clone(), QueryOptions::default())
        .await;
    assert!(first.is_err());

    let second = client
        .fetch_query_data::<Value, _, _>("recover", fetcher, QueryOptions::default())
        .await;
    assert_eq!(second.unwrap(), json!("recovered"));

    let state = client.get_query_state("recover").unwrap();
    assert_eq!(state.status, QueryStatus::Success);
    assert!(state.error.is_none());
    assert_eq!(state.fetch_failure_count, 0);
}

#[tokio::test]
async fn test_cancel_reverts_to_previous_data() {
    let client = QueryClient::new();
    client.set_query_data("doc", json!("v1")).unwrap();

    // Kick off a slow background refetch, then cancel it.
    let slow = client.fetch_query_data::<Value, _, _>(
        "doc",
        || async {
            sleep_ms(200).await;
            Ok(json!("v2"))
        },
        QueryOptions::default(),
    );
    let cancel = async {
        sleep_ms(20).await;
        client
            .cancel_queries(QueryFilters::new().with_key("doc").exact())
            .await;
    };
    let (fetched, _) = tokio::join!(slow, cancel);

    assert!(matches!(fetched, Err(QueryError::Cancelled { .. })));
    let state = client.get_query_state("doc").unwrap();
    assert_eq!(state.data, Some(json!("v1")));
    assert!(!state.is_fetching);
    assert_eq!(state.status, QueryStatus::Success);
}

#[tokio::test]
async fn test_loading_status_only_while_fetching_without_data() {
    let client = QueryClient::new();
    let fetch = client.fetch_query_data::<Value, _, _>(
        "slow",
        || async {
            sleep_ms(50).await;
            Ok(json!("done"))
        },
        QueryOptions::default(),
    );
    let observe = async {
        sleep_ms(10).await;
        client.get_query_state("slow").unwrap()
    };
    let (result, mid_state) = tokio::join!(fetch, observe);

    assert_eq!(mid_state.status, QueryStatus::Loading);
    assert!(mid_state.is_fetching);
    assert!(mid_state.data.is_none());

    result.unwrap();
    let state = client.get_query_state("slow").unwrap();
    assert_eq!(state.status, QueryStatus::Success);
    assert!(!state.is_fetching);
}

#[tokio::test]
async fn test_updated_at_is_monotonic_across_transitions() {
    let client = QueryClient::new();
    client.set_query_data("m", json!(1)).unwrap();
    let first = client.get_query_state("m").unwrap().updated_at();

    sleep_ms(5).await;
    client.set_query_data("m", json!(2)).unwrap();
    let second = client.get_query_state("m").unwrap().updated_at();
    assert!(second >= first);

    let _ = client
        .fetch_query_data::<Value, _, _>(
            "m",
            || async { Err(QueryError::fetch("late failure")) },
            QueryOptions::default(),
        )
        .await;
    let third = client.get_query_state("m").unwrap().updated_at();
    assert!(third >= second);
}
