//! # async-query-rs
//!
//! An in-process asynchronous data cache: it memoizes the in-flight and
//! settled results of user-supplied fetch functions, keyed by structured
//! identifiers, and notifies observers when cached state changes.
//!
//! - Request deduplication: concurrent fetches for one key share a single
//!   in-flight operation
//! - Stale/fresh lifecycles with automatic revalidation on focus and
//!   reconnect
//! - Retry with backoff, offline pause, and cooperative cancellation
//! - Observers with change-diffed notifications, batched per logical step
//! - Mutations with lifecycle hooks and offline resume
//! - Dehydrate/hydrate to move cache state across a serialization boundary
//!
//! ## Quick start
//!
//! ```no_run
//! use async_query_rs::{QueryClient, QueryOptions, QueryError};
//!
//! # async fn example() -> Result<(), QueryError> {
//! let client = QueryClient::new();
//! client.mount();
//!
//! let user: serde_json::Value = client
//!     .fetch_query_data(
//!         ["users", "1"].as_slice(),
//!         || async {
//!             // Your fetch logic here
//!             Ok(serde_json::json!({ "id": 1, "name": "Ada" }))
//!         },
//!         QueryOptions::default(),
//!     )
//!     .await?;
//! # let _ = user;
//! # Ok(())
//! # }
//! ```

// Re-export core types
pub use cache::{QueryCache, QueryCacheEvent, QueryFilters};
pub use client::{
    mutation_fn, query_fn, InvalidateOptions, QueryClient, QueryClientConfig,
};
pub use focus::{focus_manager, is_visible_and_online, online_manager, FocusManager, OnlineManager};
pub use hydration::{
    dehydrate, hydrate, hydrate_state, DehydrateOptions, DehydratedState, HydrateOptions,
};
pub use mutation::{
    Mutation, MutationCache, MutationCacheEvent, MutationFilters, MutationFunction,
    MutationObserver, MutationObserverResult, MutationOptions, MutationState,
};
pub use notify::{notify_manager, NotifyManager};
pub use observer::{
    NotifyOnChangeProps, QueriesObserver, QueryObserver, QueryObserverOptions,
    QueryObserverResult, RefetchPolicy, ResultField, SelectFn, TrackedResult,
};
pub use query::{
    DataEqualFn, Query, QueryFunction, QueryOptions, QueryState, DEFAULT_CACHE_TIME,
    DEFAULT_STALE_TIME, NEVER,
};
pub use retry::{CancelOptions, QueryError, RetryDelay, RetryPolicy};
pub use types::{MutationId, MutationStatus, QueryKey, QueryObserverId, QueryStatus};

// Modules
pub mod cache;
pub mod client;
pub mod focus;
pub mod hydration;
pub mod mutation;
pub mod notify;
pub mod observer;
pub mod query;
pub mod retry;
pub mod types;
