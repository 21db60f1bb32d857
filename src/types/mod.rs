//! Core types and data structures for the query system

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Query status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// Query has never fetched and holds no initial data
    Idle,
    /// Query is fetching and holds no data yet
    Loading,
    /// Query completed successfully
    Success,
    /// Query failed with an error
    Error,
}

impl Default for QueryStatus {
    fn default() -> Self {
        Self::Idle
    }
}

/// Mutation status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    Idle,
    Loading,
    Success,
    Error,
}

impl Default for MutationStatus {
    fn default() -> Self {
        Self::Idle
    }
}

/// Structured key identifying a query in the cache.
///
/// A key is an ordered sequence of JSON values: strings, numbers, booleans,
/// nulls, arrays, or string-keyed maps. Two keys identify the same query
/// exactly when their canonical hashes are equal, which ignores map key
/// insertion order at every depth.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey {
    segments: Vec<Value>,
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hash())
    }
}

impl QueryKey {
    /// Create a new query key from segments
    pub fn new(segments: impl IntoIterator<Item = impl Into<Value>>) -> Self {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Add a segment to the key
    pub fn push(mut self, segment: impl Into<Value>) -> Self {
        self.segments.push(segment.into());
        self
    }

    /// Get the segments as a slice
    pub fn segments(&self) -> &[Value] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Canonical string hash of the key.
    ///
    /// The key is serialized as a JSON array with all map entries emitted in
    /// sorted-key order at every depth, so semantically equal keys built with
    /// different insertion orders collide.
    pub fn hash(&self) -> String {
        let canonical = Value::Array(self.segments.iter().map(sort_value).collect());
        canonical.to_string()
    }

    /// Partial match: `self` is a prefix of `other`.
    ///
    /// Each element of `self` must deep-equal the element of `other` at the
    /// same index, except map elements, which match when every entry of the
    /// filter map is present and (recursively) equal in the query map.
    pub fn partial_match(&self, other: &QueryKey) -> bool {
        self.segments.len() <= other.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(filter, actual)| partial_match_value(filter, actual))
    }
}

fn sort_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = serde_json::Map::with_capacity(entries.len());
            for (key, value) in entries {
                sorted.insert(key.clone(), sort_value(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_value).collect()),
        other => other.clone(),
    }
}

fn partial_match_value(filter: &Value, actual: &Value) -> bool {
    match (filter, actual) {
        (Value::Object(filter), Value::Object(actual)) => filter
            .iter()
            .all(|(key, value)| actual.get(key).map_or(false, |a| partial_match_value(value, a))),
        _ => filter == actual,
    }
}

impl From<&str> for QueryKey {
    fn from(segment: &str) -> Self {
        Self {
            segments: vec![Value::String(segment.to_owned())],
        }
    }
}

impl From<String> for QueryKey {
    fn from(segment: String) -> Self {
        Self {
            segments: vec![Value::String(segment)],
        }
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(segments: Vec<Value>) -> Self {
        Self { segments }
    }
}

impl<T: Into<Value> + Clone> From<&[T]> for QueryKey {
    fn from(segments: &[T]) -> Self {
        Self::new(segments.iter().cloned())
    }
}

/// Unique identifier for query observers
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct QueryObserverId(pub u64);

impl QueryObserverId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for QueryObserverId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique identifier for mutations.
///
/// Ids are a process-wide monotonic counter, so they double as the enqueue
/// order used when paused mutations resume.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct MutationId(pub u64);

impl MutationId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall-clock timestamp in milliseconds since the Unix epoch.
///
/// Wall clock rather than a monotonic instant: hydration compares these
/// across processes.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Spawn a background task when a tokio runtime is available.
///
/// Timer upkeep (retention, stale re-evaluation) is skipped outside a
/// runtime; synchronous callers still get correct state, just no timers.
pub(crate) fn try_spawn<F>(future: F) -> Option<tokio::task::JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::runtime::Handle::try_current()
        .ok()
        .map(|handle| handle.spawn(future))
}
