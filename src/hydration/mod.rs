//! Dehydrate / Hydrate
//!
//! Transports cache state across a serialization boundary: `dehydrate`
//! snapshots a subset of the query cache into a plain JSON tree, `hydrate`
//! merges such a tree into a cache, resolving collisions by freshness.
//! The payload round-trips through serializers limited to strings, numbers,
//! booleans, nulls, arrays and objects.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::QueryClient;
use crate::query::{Query, QueryOptions, QueryState, NEVER};
use crate::retry::QueryError;
use crate::types::{QueryKey, QueryStatus};

/// Wire form of one query's state. `is_fetching` is deliberately absent:
/// an in-flight fetch does not survive the boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DehydratedQueryState {
    data: Option<Value>,
    data_updated_at: i64,
    error: Option<QueryError>,
    error_updated_at: i64,
    status: QueryStatus,
    is_invalidated: bool,
    fetch_failure_count: u32,
    updated_at: i64,
}

impl From<QueryState> for DehydratedQueryState {
    fn from(state: QueryState) -> Self {
        Self {
            updated_at: state.updated_at(),
            data: state.data,
            data_updated_at: state.data_updated_at,
            error: state.error,
            error_updated_at: state.error_updated_at,
            status: state.status,
            is_invalidated: state.is_invalidated,
            fetch_failure_count: state.fetch_failure_count,
        }
    }
}

impl From<DehydratedQueryState> for QueryState {
    fn from(state: DehydratedQueryState) -> Self {
        Self {
            data: state.data,
            data_updated_at: state.data_updated_at,
            error: state.error,
            error_updated_at: state.error_updated_at,
            fetch_failure_count: state.fetch_failure_count,
            is_fetching: false,
            is_invalidated: state.is_invalidated,
            status: state.status,
        }
    }
}

/// Per-query config that survives the boundary. `cache_time` is encoded in
/// milliseconds with `-1` standing in for infinity, since the target
/// serializer may not represent it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DehydratedConfig {
    cache_time: i64,
}

fn encode_cache_time(cache_time: Duration) -> i64 {
    if cache_time == NEVER {
        -1
    } else {
        cache_time.as_millis() as i64
    }
}

fn decode_cache_time(encoded: i64) -> Duration {
    if encoded < 0 {
        NEVER
    } else {
        Duration::from_millis(encoded as u64)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DehydratedQuery {
    query_key: QueryKey,
    query_hash: String,
    state: DehydratedQueryState,
    config: DehydratedConfig,
}

/// A serializable snapshot of part of a query cache.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DehydratedState {
    queries: Vec<DehydratedQuery>,
}

impl DehydratedState {
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// The hashes of the dehydrated queries, in snapshot order.
    pub fn query_hashes(&self) -> Vec<String> {
        self.queries.iter().map(|q| q.query_hash.clone()).collect()
    }
}

/// Controls which queries are snapshotted.
#[derive(Clone, Default)]
pub struct DehydrateOptions {
    /// Defaults to dehydrating successful queries only.
    pub should_dehydrate_query: Option<Arc<dyn Fn(&Query) -> bool + Send + Sync>>,
}

impl DehydrateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_should_dehydrate_query(
        mut self,
        predicate: impl Fn(&Query) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_dehydrate_query = Some(Arc::new(predicate));
        self
    }
}

/// Options applied to queries restored by [`hydrate`].
#[derive(Clone, Default)]
pub struct HydrateOptions {
    /// Merged into every restored query's options.
    pub default_query_options: Option<QueryOptions>,
}

/// Snapshot the client's query cache.
pub fn dehydrate(client: &QueryClient, options: DehydrateOptions) -> DehydratedState {
    let mut queries = Vec::new();
    for query in client.cache().get_all() {
        let include = match &options.should_dehydrate_query {
            Some(predicate) => predicate(&query),
            None => query.state().status == QueryStatus::Success,
        };
        if !include {
            continue;
        }
        queries.push(DehydratedQuery {
            query_key: query.key().clone(),
            query_hash: query.hash().to_owned(),
            state: query.state().into(),
            config: DehydratedConfig {
                cache_time: encode_cache_time(query.options().cache_time()),
            },
        });
    }
    DehydratedState { queries }
}

/// Merge a serialized snapshot into the client's query cache.
///
/// Robust at the trust boundary: a payload that is not an object, or
/// entries that do not parse, are skipped with a warning rather than
/// failing the whole merge. Existing entries are overwritten only when the
/// snapshot is strictly newer; retention for restored entries starts now.
pub fn hydrate(client: &QueryClient, payload: &Value, options: HydrateOptions) {
    let entries = match payload.get("queries").and_then(Value::as_array) {
        Some(entries) => entries,
        None => {
            tracing::warn!("hydration payload has no queries array, skipping");
            return;
        }
    };

    for entry in entries {
        let dehydrated: DehydratedQuery = match serde_json::from_value(entry.clone()) {
            Ok(dehydrated) => dehydrated,
            Err(error) => {
                tracing::warn!(%error, "skipping unparseable dehydrated query");
                continue;
            }
        };
        let state: QueryState = dehydrated.state.into();

        if let Some(existing) = client.cache().get(&dehydrated.query_hash) {
            existing.set_state(state);
            continue;
        }

        let mut query_options =
            QueryOptions::default().with_cache_time(decode_cache_time(dehydrated.config.cache_time));
        if let Some(defaults) = &options.default_query_options {
            query_options.merge_defaults(defaults);
        }
        client
            .cache()
            .build(dehydrated.query_key, query_options, Some(state));
    }
}

/// Convenience: hydrate from an already-typed snapshot.
pub fn hydrate_state(client: &QueryClient, state: &DehydratedState, options: HydrateOptions) {
    match serde_json::to_value(state) {
        Ok(payload) => hydrate(client, &payload, options),
        Err(error) => tracing::warn!(%error, "dehydrated state did not serialize"),
    }
}
