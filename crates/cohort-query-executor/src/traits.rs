//! Backend abstraction consumed by the cache manager, the task execution
//! unit and the extraction crate.
//!
//! A [`DiscoveredServer`] is one physical database server; it opens
//! [`ServerConnection`]s and performs the handful of administrative
//! operations the engine needs (database/table existence, creation, bulk
//! load, drop). Drivers for real backends implement these traits in the
//! consuming application; [`crate::MemoryServer`] is an in-process
//! implementation.
//!
//! # Example: resolving data access points
//!
//! ```ignore
//! use cohort_query_executor::{MemoryServer, StaticServerResolver, ServerResolver};
//!
//! let live = MemoryServer::new("live01", DatabaseType::MicrosoftSqlServer);
//! let resolver = StaticServerResolver::new().with_server(live.shared());
//! let server = resolver.resolve(&aggregate.data_access_point)?;
//! ```

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use cohort_query::{DataAccessPoint, DatabaseType, QuerySyntaxHelper};

use crate::error::{BackendResult, CohortExecutionError, CohortResult};
use crate::result::{ColumnType, DataTable};

/// A physical database server.
#[async_trait]
pub trait DiscoveredServer: Send + Sync + Debug {
    /// The server's name. Two servers with the same name (case-insensitive)
    /// and backend type are the same physical server.
    fn name(&self) -> &str;

    /// The backend kind.
    fn database_type(&self) -> DatabaseType;

    /// The syntax helper for this server's backend.
    fn syntax(&self) -> QuerySyntaxHelper {
        self.database_type().syntax()
    }

    /// Whether `other` is the same physical server.
    fn is_same_server(&self, other: &dyn DiscoveredServer) -> bool {
        self.database_type() == other.database_type() && self.name().eq_ignore_ascii_case(other.name())
    }

    /// Opens a new connection.
    async fn open_connection(&self) -> BackendResult<Box<dyn ServerConnection>>;

    /// Whether a database exists.
    async fn database_exists(&self, database: &str) -> BackendResult<bool>;

    /// Creates a database.
    async fn create_database(&self, database: &str) -> BackendResult<()>;

    /// Drops a database and every table in it.
    async fn drop_database(&self, database: &str) -> BackendResult<()>;

    /// Whether a table exists.
    async fn table_exists(&self, database: &str, table: &str) -> BackendResult<bool>;

    /// Drops a table.
    async fn drop_table(&self, database: &str, table: &str) -> BackendResult<()>;

    /// Creates `table` and bulk loads `data` into it.
    ///
    /// Column types listed in `explicit_types` are used as given; columns not
    /// listed take the backend's default type. Implementations must not
    /// re-infer types for explicitly typed columns.
    async fn create_table(
        &self,
        database: &str,
        table: &str,
        data: &DataTable,
        explicit_types: &[ColumnType],
    ) -> BackendResult<()>;
}

/// An open connection to a [`DiscoveredServer`].
///
/// Methods take `&self` so that a command in flight can be cancelled from
/// the same connection handle.
#[async_trait]
pub trait ServerConnection: Send + Sync {
    /// Runs a query and fully materializes its result.
    async fn execute_reader(&self, sql: &str) -> BackendResult<DataTable>;

    /// Runs a statement and returns the number of affected rows.
    async fn execute_non_query(&self, sql: &str) -> BackendResult<u64>;

    /// Asks the backend to abort the command currently in flight.
    async fn cancel_command(&self) -> BackendResult<()>;

    /// Closes the open reader, if any.
    ///
    /// Returns [`crate::BackendError::ReaderAlreadyClosed`] when there is
    /// nothing to close.
    async fn close_reader(&self) -> BackendResult<()>;
}

/// Resolves configuration data access points to servers.
pub trait ServerResolver: Send + Sync {
    /// Returns the server holding `point`'s database.
    fn resolve(&self, point: &DataAccessPoint) -> CohortResult<Arc<dyn DiscoveredServer>>;
}

/// A [`ServerResolver`] over a fixed list of servers.
#[derive(Debug, Default, Clone)]
pub struct StaticServerResolver {
    servers: Vec<Arc<dyn DiscoveredServer>>,
}

impl StaticServerResolver {
    /// Creates an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a server.
    pub fn with_server(mut self, server: Arc<dyn DiscoveredServer>) -> Self {
        self.servers.push(server);
        self
    }
}

impl ServerResolver for StaticServerResolver {
    fn resolve(&self, point: &DataAccessPoint) -> CohortResult<Arc<dyn DiscoveredServer>> {
        self.servers
            .iter()
            .find(|s| s.database_type() == point.database_type && s.name().eq_ignore_ascii_case(&point.server))
            .cloned()
            .ok_or_else(|| {
                CohortExecutionError::UnknownServer(format!(
                    "{} ({}) database {}",
                    point.server, point.database_type, point.database
                ))
            })
    }
}
