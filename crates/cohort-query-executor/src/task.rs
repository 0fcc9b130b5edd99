//! Cancellable execution of one compiled sub-query.
//!
//! A [`CohortQueryTask`] runs a sub-query's identifier query and, optionally,
//! its cumulative query on a single connection. Each query races the task's
//! [`CancellationToken`]; when the token fires the in-flight command is
//! cancelled on the backend and the open reader closed, so a cancelled task
//! never leaves a connection or reader behind.
//!
//! A task runs at most once. Its state moves `Created -> Executing` and then
//! to exactly one of `Completed`, `Cancelled` or `Faulted`.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{BackendError, CohortExecutionError, CohortResult};
use crate::notify::{NoOpProgressSink, ProgressEvent, ProgressLevel, ProgressSink};
use crate::result::DataTable;
use crate::selection::select_execution_server;
use crate::traits::{DiscoveredServer, ServerConnection};

/// Lifecycle state of a [`CohortQueryTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Not yet executed.
    Created,
    /// Running.
    Executing,
    /// Both queries finished.
    Completed,
    /// Stopped by its cancellation token.
    Cancelled,
    /// A query failed.
    Faulted,
}

impl TaskState {
    /// Whether the state is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Cancelled | TaskState::Faulted)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Created => write!(f, "Created"),
            TaskState::Executing => write!(f, "Executing"),
            TaskState::Completed => write!(f, "Completed"),
            TaskState::Cancelled => write!(f, "Cancelled"),
            TaskState::Faulted => write!(f, "Faulted"),
        }
    }
}

/// Everything needed to run one compiled sub-query.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    /// Display name, usually the aggregate or container name.
    pub name: String,
    /// Identifier query.
    pub count_sql: String,
    /// Cumulative query, run after the identifier query.
    pub cumulative_sql: Option<String>,
    /// Servers holding the live (uncached) data the SQL reads.
    pub live_servers: Vec<Arc<dyn DiscoveredServer>>,
    /// Cache server, when any sub-query beneath this node is cached.
    pub cache_server: Option<Arc<dyn DiscoveredServer>>,
    /// Number of aggregate sub-queries beneath this node.
    pub total_subqueries: usize,
    /// How many of those are served from cache.
    pub cached_subqueries: usize,
    /// Whether this is the root of the cohort tree.
    pub is_root: bool,
}

impl TaskDefinition {
    /// A definition for a single uncached sub-query on `server`.
    pub fn new(name: impl Into<String>, count_sql: impl Into<String>, server: Arc<dyn DiscoveredServer>) -> Self {
        Self {
            name: name.into(),
            count_sql: count_sql.into(),
            cumulative_sql: None,
            live_servers: vec![server],
            cache_server: None,
            total_subqueries: 1,
            cached_subqueries: 0,
            is_root: false,
        }
    }

    /// Sets the cumulative query.
    pub fn with_cumulative_sql(mut self, sql: impl Into<String>) -> Self {
        self.cumulative_sql = Some(sql.into());
        self
    }
}

#[derive(Debug)]
struct TaskProgress {
    state: TaskState,
    identifiers: Option<DataTable>,
    cumulative_identifiers: Option<DataTable>,
    error_message: Option<String>,
}

enum RunOutcome {
    Completed {
        identifiers: DataTable,
        cumulative: Option<DataTable>,
    },
    Cancelled,
}

/// One executable sub-query.
///
/// # Example
///
/// ```ignore
/// let token = CancellationToken::new();
/// let task = Arc::new(CohortQueryTask::new(definition, token.child_token())?);
///
/// let running = tokio::spawn({
///     let task = Arc::clone(&task);
///     async move { task.execute().await }
/// });
/// token.cancel(); // cancels the command on the backend
/// assert_eq!(running.await??, TaskState::Cancelled);
/// ```
pub struct CohortQueryTask {
    definition: TaskDefinition,
    server: Arc<dyn DiscoveredServer>,
    token: CancellationToken,
    progress_sink: Arc<dyn ProgressSink>,
    progress: Mutex<TaskProgress>,
}

impl fmt::Debug for CohortQueryTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CohortQueryTask")
            .field("name", &self.definition.name)
            .field("server", &self.server.name())
            .field("state", &self.state())
            .finish()
    }
}

impl CohortQueryTask {
    /// Creates a task, choosing the server it will run on.
    ///
    /// Fails with a configuration error when no single server can run the
    /// SQL.
    pub fn new(definition: TaskDefinition, token: CancellationToken) -> CohortResult<Self> {
        let server = select_execution_server(
            definition.cache_server.as_ref(),
            &definition.live_servers,
            definition.total_subqueries,
            definition.cached_subqueries,
        )?;
        debug!("Task '{}' will run on {}", definition.name, server.name());

        Ok(Self {
            definition,
            server,
            token,
            progress_sink: Arc::new(NoOpProgressSink),
            progress: Mutex::new(TaskProgress {
                state: TaskState::Created,
                identifiers: None,
                cumulative_identifiers: None,
                error_message: None,
            }),
        })
    }

    /// Reports progress to `sink`.
    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress_sink = sink;
        self
    }

    /// Runs the task.
    ///
    /// Returns the terminal state reached: `Completed` or `Cancelled`. A
    /// failing query faults the task and returns the error with its cause.
    /// Calling this on a task that has already left `Created` is an error.
    pub async fn execute(&self) -> CohortResult<TaskState> {
        {
            let mut progress = self.progress.lock();
            if progress.state != TaskState::Created {
                return Err(CohortExecutionError::TaskNotRunnable {
                    name: self.definition.name.clone(),
                    state: progress.state,
                });
            }
            progress.state = TaskState::Executing;
        }

        let started = Instant::now();
        match self.run().await {
            Ok(RunOutcome::Completed {
                identifiers,
                cumulative,
            }) => {
                let message = format!(
                    "'{}' returned {} identifiers in {:?}",
                    self.definition.name,
                    identifiers.identifiers().len(),
                    started.elapsed()
                );
                info!("{message}");
                self.notify(ProgressLevel::Information, message);

                let mut progress = self.progress.lock();
                progress.identifiers = Some(identifiers);
                progress.cumulative_identifiers = cumulative;
                progress.state = TaskState::Completed;
                Ok(TaskState::Completed)
            }
            Ok(RunOutcome::Cancelled) => {
                info!("'{}' was cancelled", self.definition.name);
                self.progress.lock().state = TaskState::Cancelled;
                Ok(TaskState::Cancelled)
            }
            Err(err) => {
                let message = format!("'{}' failed: {err}", self.definition.name);
                warn!("{message}");
                self.notify(ProgressLevel::Error, message);

                let mut progress = self.progress.lock();
                progress.error_message = Some(err.to_string());
                progress.state = TaskState::Faulted;
                Err(err)
            }
        }
    }

    async fn run(&self) -> CohortResult<RunOutcome> {
        let server_name = self.server.name();

        let connection = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Ok(RunOutcome::Cancelled),
            opened = self.server.open_connection() => {
                opened.map_err(|e| CohortExecutionError::execution(server_name, e))?
            }
        };

        let Some(identifiers) = self.run_query(connection.as_ref(), &self.definition.count_sql).await? else {
            return Ok(RunOutcome::Cancelled);
        };

        let cumulative = match &self.definition.cumulative_sql {
            Some(sql) => match self.run_query(connection.as_ref(), sql).await? {
                Some(table) => Some(table),
                None => return Ok(RunOutcome::Cancelled),
            },
            None => None,
        };

        Ok(RunOutcome::Completed {
            identifiers,
            cumulative,
        })
    }

    /// Runs one query, returning `None` when the token fired first.
    async fn run_query(&self, connection: &dyn ServerConnection, sql: &str) -> CohortResult<Option<DataTable>> {
        let server_name = self.server.name();
        debug!("'{}' executing on {server_name}: {sql}", self.definition.name);

        tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                self.abort(connection).await?;
                Ok(None)
            }
            result = connection.execute_reader(sql) => result
                .map(Some)
                .map_err(|e| CohortExecutionError::execution(server_name, e)),
        }
    }

    /// Forwards cancellation to the backend.
    async fn abort(&self, connection: &dyn ServerConnection) -> CohortResult<()> {
        let server_name = self.server.name();

        if let Err(e) = connection.cancel_command().await {
            warn!("'{}' could not cancel command on {server_name}: {e}", self.definition.name);
        }

        match connection.close_reader().await {
            Ok(()) | Err(BackendError::ReaderAlreadyClosed) => Ok(()),
            Err(e) => Err(CohortExecutionError::execution(server_name, e)),
        }
    }

    /// Cancels the task.
    ///
    /// Signals the token, which aborts a running execution (and every task
    /// holding a child token). A task that never started becomes
    /// `Cancelled`; a finished task is left as it is.
    pub fn cancel(&self) {
        self.token.cancel();
        let mut progress = self.progress.lock();
        if progress.state == TaskState::Created {
            progress.state = TaskState::Cancelled;
        }
    }

    fn notify(&self, level: ProgressLevel, message: String) {
        self.progress_sink
            .notify(ProgressEvent::new(level, self.definition.name.clone(), message));
    }

    /// Task name.
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        self.progress.lock().state
    }

    /// Rows returned by the identifier query, once completed.
    pub fn identifiers(&self) -> Option<DataTable> {
        self.progress.lock().identifiers.clone()
    }

    /// Number of distinct identifiers returned, once completed.
    pub fn identifier_count(&self) -> Option<usize> {
        self.progress
            .lock()
            .identifiers
            .as_ref()
            .map(|t| t.identifiers().len())
    }

    /// Rows returned by the cumulative query, once completed.
    pub fn cumulative_identifiers(&self) -> Option<DataTable> {
        self.progress.lock().cumulative_identifiers.clone()
    }

    /// Failure text, once faulted.
    pub fn error_message(&self) -> Option<String> {
        self.progress.lock().error_message.clone()
    }

    /// Identifier query.
    pub fn count_sql(&self) -> &str {
        &self.definition.count_sql
    }

    /// Cumulative query.
    pub fn cumulative_sql(&self) -> Option<&str> {
        self.definition.cumulative_sql.as_deref()
    }

    /// The server the task runs on.
    pub fn server(&self) -> &Arc<dyn DiscoveredServer> {
        &self.server
    }

    /// Whether this is the root of the cohort tree.
    pub fn is_root(&self) -> bool {
        self.definition.is_root
    }

    /// Number of aggregate sub-queries beneath this node.
    pub fn total_subqueries(&self) -> usize {
        self.definition.total_subqueries
    }

    /// How many of those are served from cache.
    pub fn cached_subqueries(&self) -> usize {
        self.definition.cached_subqueries
    }

    /// The task's cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }
}
