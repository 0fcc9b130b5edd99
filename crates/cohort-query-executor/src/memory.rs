//! An in-process backend.
//!
//! [`MemoryServer`] keeps databases and tables in memory and answers queries
//! from scripted responses, so the cache manager, task execution unit and
//! extraction sources can be driven without a live database. It also counts
//! open connections, cancelled commands and closed readers so tests can
//! assert that nothing is left open.
//!
//! Queries are never parsed. A reader query is answered, in order, by:
//! 1. a response registered for exactly that SQL (whitespace/case-normalized);
//! 2. the first response whose fragment the SQL contains;
//! 3. a stored table, when the SQL is exactly `SELECT * FROM <fully qualified table>`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cohort_query::DatabaseType;
use parking_lot::Mutex;

use crate::cache::normalize_sql;
use crate::error::{BackendError, BackendResult};
use crate::result::{ColumnType, DataTable};
use crate::traits::{DiscoveredServer, ServerConnection};

/// A table held by a [`MemoryServer`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTable {
    /// The loaded rows.
    pub data: DataTable,
    /// Column types supplied when the table was created.
    pub column_types: Vec<ColumnType>,
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact(String),
    Containing(String),
}

#[derive(Debug, Clone)]
enum Outcome {
    Rows(DataTable),
    Affected(u64),
    Fail(String),
}

#[derive(Debug, Default)]
struct MemoryState {
    databases: BTreeMap<String, BTreeMap<String, StoredTable>>,
    responses: Vec<(Matcher, Outcome)>,
    executed: Vec<String>,
    latency: Option<Duration>,
    delays: Vec<(String, Duration)>,
    refuse_connections: bool,
    cancelled_commands: usize,
    closed_readers: usize,
}

impl MemoryState {
    fn find_latency(&self, sql: &str) -> Option<Duration> {
        let normalized = normalize_sql(sql);
        self.delays
            .iter()
            .find(|(fragment, _)| normalized.contains(fragment.as_str()))
            .map(|(_, latency)| *latency)
            .or(self.latency)
    }

    fn find_outcome(&self, sql: &str, syntax_type: DatabaseType) -> Option<Outcome> {
        let normalized = normalize_sql(sql);

        let exact = self.responses.iter().find_map(|(matcher, outcome)| match matcher {
            Matcher::Exact(expected) if *expected == normalized => Some(outcome.clone()),
            _ => None,
        });
        if exact.is_some() {
            return exact;
        }

        let containing = self.responses.iter().find_map(|(matcher, outcome)| match matcher {
            Matcher::Containing(fragment) if normalized.contains(fragment.as_str()) => {
                Some(outcome.clone())
            }
            _ => None,
        });
        if containing.is_some() {
            return containing;
        }

        let syntax = syntax_type.syntax();
        self.databases.iter().find_map(|(database, tables)| {
            tables.iter().find_map(|(table, stored)| {
                let select = format!("SELECT * FROM {}", syntax.ensure_fully_qualified(database, table));
                (normalize_sql(&select) == normalized).then(|| Outcome::Rows(stored.data.clone()))
            })
        })
    }
}

#[derive(Debug)]
struct Inner {
    name: String,
    database_type: DatabaseType,
    state: Mutex<MemoryState>,
    open_connections: AtomicUsize,
}

/// An in-memory [`DiscoveredServer`].
///
/// Clones share state, so a test can keep one handle for inspection while
/// the engine uses another.
///
/// # Example
///
/// ```rust
/// use cohort_query::DatabaseType;
/// use cohort_query_executor::{DataTable, MemoryServer};
///
/// let server = MemoryServer::new("live01", DatabaseType::MicrosoftSqlServer)
///     .with_database("biochemistry");
/// server.respond_containing("FROM [biochemistry]", DataTable::single_column("chi", ["0101"]));
/// ```
#[derive(Debug, Clone)]
pub struct MemoryServer {
    inner: Arc<Inner>,
}

impl MemoryServer {
    /// Creates a server with no databases.
    pub fn new(name: impl Into<String>, database_type: DatabaseType) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                database_type,
                state: Mutex::new(MemoryState::default()),
                open_connections: AtomicUsize::new(0),
            }),
        }
    }

    /// Returns this server as a shared trait object.
    pub fn shared(&self) -> Arc<dyn DiscoveredServer> {
        Arc::new(self.clone())
    }

    /// Adds an empty database.
    pub fn with_database(self, database: &str) -> Self {
        self.inner
            .state
            .lock()
            .databases
            .entry(key(database))
            .or_default();
        self
    }

    /// Adds a table, creating its database if needed.
    pub fn with_table(self, database: &str, table: &str, data: DataTable) -> Self {
        self.inner
            .state
            .lock()
            .databases
            .entry(key(database))
            .or_default()
            .insert(
                key(table),
                StoredTable {
                    data,
                    column_types: Vec::new(),
                },
            );
        self
    }

    /// Delays every reader by `latency` before it returns.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.inner.state.lock().latency = Some(latency);
        self
    }

    /// Delays readers whose SQL contains `fragment` by `latency`, in place of
    /// the server-wide latency.
    pub fn with_latency_containing(self, fragment: &str, latency: Duration) -> Self {
        self.inner
            .state
            .lock()
            .delays
            .push((normalize_sql(fragment), latency));
        self
    }

    /// Makes every connection attempt fail.
    pub fn refusing_connections(self) -> Self {
        self.inner.state.lock().refuse_connections = true;
        self
    }

    /// Answers exactly `sql` with `rows`.
    pub fn respond_to(&self, sql: &str, rows: DataTable) {
        self.script(Matcher::Exact(normalize_sql(sql)), Outcome::Rows(rows));
    }

    /// Answers any SQL containing `fragment` with `rows`.
    pub fn respond_containing(&self, fragment: &str, rows: DataTable) {
        self.script(Matcher::Containing(normalize_sql(fragment)), Outcome::Rows(rows));
    }

    /// Answers any statement containing `fragment` with an affected-row count.
    pub fn respond_non_query(&self, fragment: &str, affected: u64) {
        self.script(Matcher::Containing(normalize_sql(fragment)), Outcome::Affected(affected));
    }

    /// Fails any SQL containing `fragment`.
    pub fn fail_containing(&self, fragment: &str, message: &str) {
        self.script(
            Matcher::Containing(normalize_sql(fragment)),
            Outcome::Fail(message.to_string()),
        );
    }

    fn script(&self, matcher: Matcher, outcome: Outcome) {
        self.inner.state.lock().responses.push((matcher, outcome));
    }

    /// Every SQL statement executed so far, in order.
    pub fn executed_sql(&self) -> Vec<String> {
        self.inner.state.lock().executed.clone()
    }

    /// Number of connections currently open.
    pub fn open_connections(&self) -> usize {
        self.inner.open_connections.load(Ordering::SeqCst)
    }

    /// Number of commands cancelled.
    pub fn cancelled_commands(&self) -> usize {
        self.inner.state.lock().cancelled_commands
    }

    /// Number of readers closed by cancellation.
    pub fn closed_readers(&self) -> usize {
        self.inner.state.lock().closed_readers
    }

    /// Whether a database exists.
    pub fn has_database(&self, database: &str) -> bool {
        self.inner.state.lock().databases.contains_key(&key(database))
    }

    /// A stored table.
    pub fn table(&self, database: &str, table: &str) -> Option<StoredTable> {
        self.inner
            .state
            .lock()
            .databases
            .get(&key(database))
            .and_then(|tables| tables.get(&key(table)))
            .cloned()
    }

    /// Names (lower-cased) of the tables in a database.
    pub fn table_names(&self, database: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .databases
            .get(&key(database))
            .map(|tables| tables.keys().cloned().collect())
            .unwrap_or_default()
    }
}

fn key(name: &str) -> String {
    name.trim().to_lowercase()
}

#[async_trait]
impl DiscoveredServer for MemoryServer {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn database_type(&self) -> DatabaseType {
        self.inner.database_type
    }

    async fn open_connection(&self) -> BackendResult<Box<dyn ServerConnection>> {
        if self.inner.state.lock().refuse_connections {
            return Err(BackendError::Connection {
                server: self.inner.name.clone(),
                message: "connection refused".to_string(),
            });
        }
        self.inner.open_connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            server: Arc::clone(&self.inner),
            reader_open: AtomicBool::new(false),
        }))
    }

    async fn database_exists(&self, database: &str) -> BackendResult<bool> {
        Ok(self.has_database(database))
    }

    async fn create_database(&self, database: &str) -> BackendResult<()> {
        self.inner
            .state
            .lock()
            .databases
            .entry(key(database))
            .or_default();
        Ok(())
    }

    async fn drop_database(&self, database: &str) -> BackendResult<()> {
        self.inner
            .state
            .lock()
            .databases
            .remove(&key(database))
            .map(|_| ())
            .ok_or_else(|| BackendError::DatabaseNotFound(database.to_string()))
    }

    async fn table_exists(&self, database: &str, table: &str) -> BackendResult<bool> {
        Ok(self.table(database, table).is_some())
    }

    async fn drop_table(&self, database: &str, table: &str) -> BackendResult<()> {
        let mut state = self.inner.state.lock();
        let tables = state
            .databases
            .get_mut(&key(database))
            .ok_or_else(|| BackendError::DatabaseNotFound(database.to_string()))?;
        tables
            .remove(&key(table))
            .map(|_| ())
            .ok_or_else(|| BackendError::TableNotFound(table.to_string()))
    }

    async fn create_table(
        &self,
        database: &str,
        table: &str,
        data: &DataTable,
        explicit_types: &[ColumnType],
    ) -> BackendResult<()> {
        let mut state = self.inner.state.lock();
        let tables = state
            .databases
            .get_mut(&key(database))
            .ok_or_else(|| BackendError::DatabaseNotFound(database.to_string()))?;
        if tables.contains_key(&key(table)) {
            return Err(BackendError::TableExists(table.to_string()));
        }
        tables.insert(
            key(table),
            StoredTable {
                data: data.clone(),
                column_types: explicit_types.to_vec(),
            },
        );
        Ok(())
    }
}

struct MemoryConnection {
    server: Arc<Inner>,
    reader_open: AtomicBool,
}

impl MemoryConnection {
    fn record(&self, sql: &str) -> (Option<Outcome>, Option<Duration>) {
        let mut state = self.server.state.lock();
        state.executed.push(sql.to_string());
        (state.find_outcome(sql, self.server.database_type), state.find_latency(sql))
    }
}

#[async_trait]
impl ServerConnection for MemoryConnection {
    async fn execute_reader(&self, sql: &str) -> BackendResult<DataTable> {
        let (outcome, latency) = self.record(sql);

        self.reader_open.store(true, Ordering::SeqCst);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.reader_open.store(false, Ordering::SeqCst);

        match outcome {
            Some(Outcome::Rows(rows)) => Ok(rows),
            Some(Outcome::Affected(_)) => Ok(DataTable::default()),
            Some(Outcome::Fail(message)) => Err(BackendError::Command(message)),
            None => Err(BackendError::Command(format!("no result scripted for: {sql}"))),
        }
    }

    async fn execute_non_query(&self, sql: &str) -> BackendResult<u64> {
        let (outcome, _) = self.record(sql);
        match outcome {
            Some(Outcome::Affected(count)) => Ok(count),
            Some(Outcome::Rows(rows)) => Ok(rows.row_count() as u64),
            Some(Outcome::Fail(message)) => Err(BackendError::Command(message)),
            None => Ok(0),
        }
    }

    async fn cancel_command(&self) -> BackendResult<()> {
        self.server.state.lock().cancelled_commands += 1;
        Ok(())
    }

    async fn close_reader(&self) -> BackendResult<()> {
        if self.reader_open.swap(false, Ordering::SeqCst) {
            self.server.state.lock().closed_readers += 1;
            Ok(())
        } else {
            Err(BackendError::ReaderAlreadyClosed)
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.server.open_connections.fetch_sub(1, Ordering::SeqCst);
    }
}
