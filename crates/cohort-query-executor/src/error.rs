//! Error types for cohort query execution.

use cohort_query::QueryError;
use thiserror::Error;

use crate::task::TaskState;

/// Failures reported by a backend server or connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// A connection could not be opened.
    #[error("could not connect to {server}: {message}")]
    Connection {
        /// Server name.
        server: String,
        /// Driver message.
        message: String,
    },

    /// A command failed.
    #[error("command failed: {0}")]
    Command(String),

    /// The command was cancelled by the backend.
    #[error("command was cancelled")]
    Cancelled,

    /// The reader being closed was already closed.
    #[error("reader is already closed")]
    ReaderAlreadyClosed,

    /// A database does not exist.
    #[error("database {0} does not exist")]
    DatabaseNotFound(String),

    /// A table does not exist.
    #[error("table {0} does not exist")]
    TableNotFound(String),

    /// A table already exists.
    #[error("table {0} already exists")]
    TableExists(String),
}

/// Result type for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Errors that can occur while compiling, caching or executing cohort
/// sub-queries.
#[derive(Error, Debug)]
pub enum CohortExecutionError {
    /// The cohort configuration cannot be executed as given.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Query text could not be assembled.
    #[error("query assembly error: {0}")]
    Query(#[from] QueryError),

    /// Cache metadata and the physical cache database have diverged.
    #[error("cache integrity fault: {0}")]
    CacheIntegrity(String),

    /// A backend operation failed.
    #[error("execution failed on {server}: {source}")]
    Execution {
        /// Server the operation ran against.
        server: String,
        /// Underlying backend failure.
        #[source]
        source: BackendError,
    },

    /// A task was executed after it left the `Created` state.
    #[error("task '{name}' cannot be executed from state {state}; create a new task to run it again")]
    TaskNotRunnable {
        /// Task name.
        name: String,
        /// State the task was in.
        state: TaskState,
    },

    /// A spawned task stopped without reporting a result.
    #[error("task '{0}' did not run to completion")]
    TaskAborted(String),

    /// No server is registered for a data access point.
    #[error("no server registered for {0}")]
    UnknownServer(String),
}

impl CohortExecutionError {
    /// Wraps a backend failure with the server it happened on.
    pub fn execution(server: impl Into<String>, source: BackendError) -> Self {
        Self::Execution {
            server: server.into(),
            source,
        }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

/// Result type for cohort execution operations.
pub type CohortResult<T> = std::result::Result<T, CohortExecutionError>;
