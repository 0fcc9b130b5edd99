//! # cohort-query-executor
//!
//! Compiles cohort-identification trees into sub-query tasks, runs them
//! against relational backends with cancellation, and caches their results.
//!
//! ## Key Features
//!
//! - **SQL-keyed caching** - a cached result is reused only when the SQL
//!   about to run matches the SQL that produced it (whitespace and case
//!   insensitive)
//! - **Cancellable execution** - cancelling a task aborts the command on the
//!   backend, not just the local future; cancelling a container cancels its
//!   children
//! - **Server selection** - each task picks the one server that can run its
//!   SQL, or fails at compile time
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use cohort_query_executor::{CohortCompiler, ExecutorConfig, StaticServerResolver};
//!
//! let resolver = StaticServerResolver::new()
//!     .with_server(live_server)
//!     .with_server(cache_server.clone());
//!
//! let compiler = CohortCompiler::new(Arc::new(resolver))
//!     .with_config(ExecutorConfig::builder().with_cumulative_totals(true).build())
//!     .with_cache_server(cache_server);
//!
//! let compiled = compiler.compile(&cohort_root).await?;
//! for (name, outcome) in compiled.execute_all().await {
//!     println!("{name}: {outcome:?}");
//! }
//! compiler.commit_to_cache(&compiled).await?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   cohort-query-executor                      │
//! │                                                              │
//! │  CohortCompiler                                              │
//! │  ├── resolve data access points (ServerResolver)            │
//! │  ├── look up cached results (CachedResultsManager)          │
//! │  ├── combine children with set operations                   │
//! │  └── emit one CohortQueryTask per node                      │
//! │                                                              │
//! │  CohortQueryTask                                             │
//! │  ├── select execution server                                │
//! │  ├── identifier query, then cumulative query                │
//! │  └── cancel forwards to ServerConnection::cancel_command    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod cache;
mod compiler;
mod config;
mod error;
mod memory;
mod notify;
mod result;
mod selection;
mod task;
mod traits;

// Public re-exports
pub use cache::{
    normalize_sql, CacheCommitArguments, CacheEntry, CacheIndexStore, CachedResultsManager, CachedTable,
    MemoryCacheIndex, SqlCacheIndexStore,
};
pub use compiler::{CohortCompiler, CompiledCohort};
pub use config::{CacheConfig, ExecutorConfig, ExecutorConfigBuilder};
pub use error::{BackendError, BackendResult, CohortExecutionError, CohortResult};
pub use memory::{MemoryServer, StoredTable};
pub use notify::{
    CollectingProgressSink, LogProgressSink, NoOpProgressSink, ProgressEvent, ProgressLevel, ProgressSink,
};
pub use result::{ColumnType, DataTable, Value};
pub use selection::select_execution_server;
pub use task::{CohortQueryTask, TaskDefinition, TaskState};
pub use traits::{DiscoveredServer, ServerConnection, ServerResolver, StaticServerResolver};

// Re-export the cancellation token so callers need not depend on tokio-util.
pub use tokio_util::sync::CancellationToken;
