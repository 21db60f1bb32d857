//! Mutation lifecycle: execution, hooks, retries, observers, and offline
//! pause/resume.

#[path = "../utils/mod.rs"]
mod utils;

use std::sync::Arc;
use std::time::Duration;

use async_query_rs::{
    mutation_fn, online_manager, MutationOptions, MutationStatus, QueryClient, QueryError,
    RetryDelay, RetryPolicy,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use utils::{sleep_ms, wait_for, Calls};

static BUS: Mutex<()> = Mutex::new(());

struct BusReset;

impl Drop for BusReset {
    fn drop(&mut self) {
        online_manager().set_online(true);
    }
}

#[tokio::test]
async fn test_mutate_returns_data_and_retains_state() {
    let client = QueryClient::new();
    let options = MutationOptions::new().with_mutation_fn(mutation_fn(
        |variables: Value| async move { Ok(json!({ "echo": variables })) },
    ));

    let result: Value = client.mutate(options, json!("hi")).await.unwrap();
    assert_eq!(result, json!({ "echo": "hi" }));

    let mutations = client.mutation_cache().get_all();
    assert_eq!(mutations.len(), 1);
    let state = mutations[0].state();
    assert_eq!(state.status, MutationStatus::Success);
    assert_eq!(state.variables, Some(json!("hi")));
    assert_eq!(state.data, Some(json!({ "echo": "hi" })));
}

#[tokio::test]
async fn test_lifecycle_hooks_fire_in_order_with_context() {
    let client = QueryClient::new();
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let options = MutationOptions::new()
        .with_mutation_fn(mutation_fn(|v: i32| async move { Ok(v * 2) }))
        .on_mutate({
            let log = log.clone();
            move |variables| {
                log.lock().push(format!("mutate:{variables}"));
                Some(json!("ctx"))
            }
        })
        .on_success({
            let log = log.clone();
            move |data, _variables, context| {
                log.lock()
                    .push(format!("success:{data}:{}", context.unwrap()));
            }
        })
        .on_settled({
            let log = log.clone();
            move |data, error, _variables, _context| {
                log.lock()
                    .push(format!("settled:{}:{}", data.is_some(), error.is_some()));
            }
        });

    let doubled: i32 = client.mutate(options, 21).await.unwrap();
    assert_eq!(doubled, 42);
    assert_eq!(
        log.lock().clone(),
        vec![
            "mutate:21".to_string(),
            "success:42:\"ctx\"".to_string(),
            "settled:true:false".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_error_path_fires_on_error_and_on_settled() {
    let client = QueryClient::new();
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let options = MutationOptions::new()
        .with_mutation_fn(mutation_fn(|_: Value| async move {
            Err::<Value, _>(QueryError::fetch("write refused"))
        }))
        .on_error({
            let log = log.clone();
            move |error, _variables, _context| {
                log.lock().push(format!("error:{error}"));
            }
        })
        .on_settled({
            let log = log.clone();
            move |data, error, _variables, _context| {
                log.lock()
                    .push(format!("settled:{}:{}", data.is_some(), error.is_some()));
            }
        });

    let result: Result<Value, _> = client.mutate(options, json!(null)).await;
    assert_eq!(result, Err(QueryError::fetch("write refused")));
    assert_eq!(
        log.lock().clone(),
        vec![
            "error:query function failed: write refused".to_string(),
            "settled:false:true".to_string(),
        ]
    );

    let state = client.mutation_cache().get_all()[0].state();
    assert_eq!(state.status, MutationStatus::Error);
}

#[tokio::test]
async fn test_mutation_retries_when_asked() {
    let client = QueryClient::new();
    let calls = Calls::new();

    let options = MutationOptions::new()
        .with_retry(RetryPolicy::Count(2))
        .with_retry_delay(RetryDelay::Fixed(Duration::from_millis(1)))
        .with_mutation_fn(mutation_fn({
            let calls = calls.clone();
            move |_: Value| {
                let calls = calls.clone();
                async move {
                    calls.record();
                    if calls.get() < 3 {
                        Err(QueryError::fetch("flaky write"))
                    } else {
                        Ok(json!("finally"))
                    }
                }
            }
        }));

    let result: Value = client.mutate(options, json!(1)).await.unwrap();
    assert_eq!(result, json!("finally"));
    assert_eq!(calls.get(), 3);

    let state = client.mutation_cache().get_all()[0].state();
    assert_eq!(state.failure_count, 2);
}

#[tokio::test]
async fn test_identical_mutations_coexist() {
    let client = QueryClient::new();
    let options = || {
        MutationOptions::new()
            .with_mutation_key("add-todo")
            .with_mutation_fn(mutation_fn(|v: Value| async move {
                sleep_ms(20).await;
                Ok(v)
            }))
    };

    let (a, b) = tokio::join!(
        client.mutate::<Value, _>(options(), json!(1)),
        client.mutate::<Value, _>(options(), json!(2)),
    );
    assert_eq!(a.unwrap(), json!(1));
    assert_eq!(b.unwrap(), json!(2));
    assert_eq!(client.mutation_cache().len(), 2);
}

#[tokio::test]
async fn test_observer_sees_loading_then_success() {
    let client = QueryClient::new();
    let observer = client.watch_mutation(MutationOptions::new().with_mutation_fn(mutation_fn(
        |v: Value| async move {
            sleep_ms(15).await;
            Ok(v)
        },
    )));

    let statuses: Arc<Mutex<Vec<MutationStatus>>> = Arc::new(Mutex::new(Vec::new()));
    let log = statuses.clone();
    let sub = observer.subscribe(move |result| {
        log.lock().push(result.status);
    });

    let result = observer.mutate(json!("payload")).await.unwrap();
    assert_eq!(result, json!("payload"));

    assert!(wait_for(200, || {
        statuses.lock().last() == Some(&MutationStatus::Success)
    })
    .await);
    let seen = statuses.lock().clone();
    assert!(seen.contains(&MutationStatus::Loading));

    let current = observer.get_current_result();
    assert!(current.is_success);
    assert_eq!(current.variables, Some(json!("payload")));

    observer.unsubscribe(sub);
    observer.reset();
    assert!(observer.get_current_result().is_idle);
}

#[tokio::test]
async fn test_mutation_defaults_apply_by_key() {
    let client = QueryClient::new();
    let calls = Calls::new();
    client.set_mutation_defaults(
        "add-todo",
        MutationOptions::new().with_mutation_fn(mutation_fn({
            let calls = calls.clone();
            move |v: Value| {
                let calls = calls.clone();
                async move {
                    calls.record();
                    Ok(v)
                }
            }
        })),
    );

    let result: Value = client
        .mutate(
            MutationOptions::new().with_mutation_key("add-todo"),
            json!("from defaults"),
        )
        .await
        .unwrap();
    assert_eq!(result, json!("from defaults"));
    assert_eq!(calls.get(), 1);
}

#[tokio::test]
async fn test_offline_mutations_pause_and_resume_in_fifo_order() {
    let _guard = BUS.lock();
    let _reset = BusReset;

    online_manager().set_online(false);

    let client = QueryClient::new();
    let order: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));

    let spawn_mutation = |tag: i32| {
        let client = client.clone();
        let order = order.clone();
        tokio::spawn(async move {
            let options = MutationOptions::new()
                .with_mutation_fn(mutation_fn(move |v: i32| async move { Ok(v) }))
                .on_success(move |data, _v, _c| {
                    order.lock().push(data.as_i64().unwrap() as i32);
                });
            let _: i32 = client.mutate(options, tag).await.unwrap();
        })
    };

    let first = spawn_mutation(1);
    // The id counter is process-wide and monotonic, so spacing the spawns
    // fixes the enqueue order.
    sleep_ms(10).await;
    let second = spawn_mutation(2);

    assert!(wait_for(300, || {
        let mutations = client.mutation_cache().get_all();
        mutations.len() == 2 && mutations.iter().all(|m| m.is_paused())
    })
    .await);
    assert!(order.lock().is_empty());

    client.resume_paused_mutations().await;

    first.await.unwrap();
    second.await.unwrap();
    assert_eq!(order.lock().clone(), vec![1, 2]);
    assert!(client
        .mutation_cache()
        .get_all()
        .iter()
        .all(|m| m.state().status == MutationStatus::Success));
}
