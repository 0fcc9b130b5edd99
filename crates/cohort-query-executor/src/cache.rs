//! Sub-query result caching.
//!
//! Results of expensive sub-queries are materialized into backing tables on a
//! cache server. An index table records, for each (configuration id,
//! operation) pair, which backing table holds the result and the exact SQL
//! that produced it. A cached result is only reused when the SQL about to be
//! run matches the recorded SQL after whitespace/case normalization; any
//! other difference makes the entry stale.
//!
//! Writers follow the order drop index row, drop old table, create new table,
//! insert new index row, so a reader never resolves an index row whose table
//! is gone.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cohort_query::{AggregateOperation, QuerySyntaxHelper};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::config::CacheConfig;
use crate::error::{BackendError, CohortExecutionError, CohortResult};
use crate::result::{ColumnType, DataTable, Value};
use crate::traits::DiscoveredServer;

const COLUMN_CONFIGURATION_ID: &str = "AggregateConfiguration_ID";
const COLUMN_OPERATION: &str = "Operation";
const COLUMN_TABLE_NAME: &str = "TableName";
const COLUMN_SQL_EXECUTED: &str = "SqlExecuted";
const COLUMN_COMMITTER: &str = "Committer";

/// One row of the cache index.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CacheEntry {
    /// The aggregate configuration whose result is cached.
    pub configuration_id: i32,
    /// What kind of result is cached.
    pub operation: AggregateOperation,
    /// Backing table name (unqualified).
    pub table_name: String,
    /// The exact SQL that produced the cached rows.
    pub sql_executed: String,
    /// Column types the backing table was created with.
    pub explicit_column_types: Vec<ColumnType>,
    /// Who committed the entry.
    pub committer: String,
    /// When the entry was committed, if known.
    pub committed_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// Whether `sql` is the SQL this entry was produced from.
    pub fn is_current_for(&self, sql: &str) -> bool {
        normalize_sql(&self.sql_executed) == normalize_sql(sql)
    }
}

/// A cache hit: the backing table holding a cached result.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedTable {
    /// Database on the cache server.
    pub database: String,
    /// The index row.
    pub entry: CacheEntry,
}

impl CachedTable {
    /// Unqualified backing table name.
    pub fn table_name(&self) -> &str {
        &self.entry.table_name
    }

    /// Fully qualified backing table name.
    pub fn fully_qualified(&self, syntax: &QuerySyntaxHelper) -> String {
        syntax.ensure_fully_qualified(&self.database, &self.entry.table_name)
    }
}

/// Arguments to [`CachedResultsManager::commit_results`].
#[derive(Debug, Clone)]
pub struct CacheCommitArguments {
    /// The aggregate configuration whose result is cached.
    pub configuration_id: i32,
    /// What kind of result is cached.
    pub operation: AggregateOperation,
    /// The exact SQL that produced `results`.
    pub sql: String,
    /// Rows to store.
    pub results: DataTable,
    /// Column types to create the backing table with. Columns not listed get
    /// the backend's default type.
    pub explicit_column_types: Vec<ColumnType>,
}

impl CacheCommitArguments {
    /// Creates arguments with no explicit column types.
    pub fn new(
        configuration_id: i32,
        operation: AggregateOperation,
        sql: impl Into<String>,
        results: DataTable,
    ) -> Self {
        Self {
            configuration_id,
            operation,
            sql: sql.into(),
            results,
            explicit_column_types: Vec::new(),
        }
    }

    /// Sets the explicit column types.
    pub fn with_column_types(mut self, types: Vec<ColumnType>) -> Self {
        self.explicit_column_types = types;
        self
    }
}

/// Storage for cache index rows.
///
/// Stores do not enforce uniqueness of (configuration id, operation); the
/// [`CachedResultsManager`] does.
#[async_trait]
pub trait CacheIndexStore: Send + Sync + Debug {
    /// Every row for the pair.
    async fn find(&self, configuration_id: i32, operation: AggregateOperation) -> CohortResult<Vec<CacheEntry>>;

    /// Deletes every row for the pair, returning how many were deleted.
    async fn delete(&self, configuration_id: i32, operation: AggregateOperation) -> CohortResult<u64>;

    /// Inserts a row.
    async fn insert(&self, entry: &CacheEntry) -> CohortResult<()>;
}

/// An in-process cache index.
#[derive(Debug, Default)]
pub struct MemoryCacheIndex {
    entries: Mutex<Vec<CacheEntry>>,
}

impl MemoryCacheIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl CacheIndexStore for MemoryCacheIndex {
    async fn find(&self, configuration_id: i32, operation: AggregateOperation) -> CohortResult<Vec<CacheEntry>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|e| e.configuration_id == configuration_id && e.operation == operation)
            .cloned()
            .collect())
    }

    async fn delete(&self, configuration_id: i32, operation: AggregateOperation) -> CohortResult<u64> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| !(e.configuration_id == configuration_id && e.operation == operation));
        Ok((before - entries.len()) as u64)
    }

    async fn insert(&self, entry: &CacheEntry) -> CohortResult<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}

/// A cache index kept in a table on the cache server.
///
/// The table is created on first use when it does not exist.
#[derive(Debug)]
pub struct SqlCacheIndexStore {
    server: Arc<dyn DiscoveredServer>,
    database: String,
    table: String,
    ready: OnceCell<()>,
}

impl SqlCacheIndexStore {
    /// Creates a store for `database`.`table` on `server`.
    pub fn new(server: Arc<dyn DiscoveredServer>, database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            server,
            database: database.into(),
            table: table.into(),
            ready: OnceCell::new(),
        }
    }

    fn syntax(&self) -> QuerySyntaxHelper {
        self.server.syntax()
    }

    fn fully_qualified(&self) -> String {
        self.syntax().ensure_fully_qualified(&self.database, &self.table)
    }

    fn column(&self, name: &str) -> String {
        self.syntax().ensure_wrapped(name)
    }

    fn key_predicate(&self, configuration_id: i32, operation: AggregateOperation) -> String {
        let syntax = self.syntax();
        format!(
            "{}={} AND {}={}",
            self.column(COLUMN_CONFIGURATION_ID),
            configuration_id,
            self.column(COLUMN_OPERATION),
            syntax.escape_literal(&operation.to_string())
        )
    }

    /// Column types of the index table for this server's backend.
    pub fn index_column_types(&self) -> Vec<ColumnType> {
        let long_text = match self.server.database_type() {
            cohort_query::DatabaseType::MicrosoftSqlServer => "varchar(max)",
            cohort_query::DatabaseType::MySql => "longtext",
            cohort_query::DatabaseType::Oracle => "CLOB",
        };
        vec![
            ColumnType::new(COLUMN_CONFIGURATION_ID, "int"),
            ColumnType::new(COLUMN_OPERATION, "varchar(50)"),
            ColumnType::new(COLUMN_TABLE_NAME, "varchar(500)"),
            ColumnType::new(COLUMN_SQL_EXECUTED, long_text),
            ColumnType::new(COLUMN_COMMITTER, "varchar(500)"),
        ]
    }

    async fn ensure_index_table(&self) -> CohortResult<()> {
        self.ready
            .get_or_try_init(|| async {
                let exists = self
                    .server
                    .table_exists(&self.database, &self.table)
                    .await
                    .map_err(|e| CohortExecutionError::execution(self.server.name(), e))?;
                if !exists {
                    info!("Creating cache index table {}", self.fully_qualified());
                    let types = self.index_column_types();
                    let empty = DataTable::new(types.iter().map(|t| t.name.clone()).collect());
                    self.server
                        .create_table(&self.database, &self.table, &empty, &types)
                        .await
                        .map_err(|e| CohortExecutionError::execution(self.server.name(), e))?;
                }
                Ok::<(), CohortExecutionError>(())
            })
            .await?;
        Ok(())
    }

    fn parse_row(&self, table: &DataTable, row: &[Value]) -> CohortResult<CacheEntry> {
        let cell = |name: &str| -> CohortResult<Option<String>> {
            let index = table.column_index(name).ok_or_else(|| {
                CohortExecutionError::CacheIntegrity(format!(
                    "cache index {} has no column {name}",
                    self.fully_qualified()
                ))
            })?;
            Ok(row.get(index).and_then(Value::as_identifier))
        };
        let required = |name: &str| -> CohortResult<String> {
            cell(name)?.ok_or_else(|| {
                CohortExecutionError::CacheIntegrity(format!("cache index row has NULL {name}"))
            })
        };

        let raw_id = required(COLUMN_CONFIGURATION_ID)?;
        let configuration_id = raw_id.trim().parse::<i32>().map_err(|_| {
            CohortExecutionError::CacheIntegrity(format!("cache index row has non-integer id '{raw_id}'"))
        })?;
        let raw_operation = required(COLUMN_OPERATION)?;
        let operation = AggregateOperation::from_name(&raw_operation).ok_or_else(|| {
            CohortExecutionError::CacheIntegrity(format!("cache index row has unknown operation '{raw_operation}'"))
        })?;

        Ok(CacheEntry {
            configuration_id,
            operation,
            table_name: required(COLUMN_TABLE_NAME)?,
            sql_executed: required(COLUMN_SQL_EXECUTED)?,
            explicit_column_types: Vec::new(),
            committer: cell(COLUMN_COMMITTER)?.unwrap_or_default(),
            committed_at: None,
        })
    }
}

#[async_trait]
impl CacheIndexStore for SqlCacheIndexStore {
    async fn find(&self, configuration_id: i32, operation: AggregateOperation) -> CohortResult<Vec<CacheEntry>> {
        self.ensure_index_table().await?;
        let sql = format!(
            "SELECT {}, {}, {}, {}, {} FROM {} WHERE {}",
            self.column(COLUMN_CONFIGURATION_ID),
            self.column(COLUMN_OPERATION),
            self.column(COLUMN_TABLE_NAME),
            self.column(COLUMN_SQL_EXECUTED),
            self.column(COLUMN_COMMITTER),
            self.fully_qualified(),
            self.key_predicate(configuration_id, operation)
        );
        let server = self.server.name();
        let connection = self
            .server
            .open_connection()
            .await
            .map_err(|e| CohortExecutionError::execution(server, e))?;
        let table = connection
            .execute_reader(&sql)
            .await
            .map_err(|e| CohortExecutionError::execution(server, e))?;

        table.rows().iter().map(|row| self.parse_row(&table, row)).collect()
    }

    async fn delete(&self, configuration_id: i32, operation: AggregateOperation) -> CohortResult<u64> {
        self.ensure_index_table().await?;
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            self.fully_qualified(),
            self.key_predicate(configuration_id, operation)
        );
        let server = self.server.name();
        let connection = self
            .server
            .open_connection()
            .await
            .map_err(|e| CohortExecutionError::execution(server, e))?;
        connection
            .execute_non_query(&sql)
            .await
            .map_err(|e| CohortExecutionError::execution(server, e))
    }

    async fn insert(&self, entry: &CacheEntry) -> CohortResult<()> {
        self.ensure_index_table().await?;
        let syntax = self.syntax();
        let sql = format!(
            "INSERT INTO {} ({}, {}, {}, {}, {}) VALUES ({}, {}, {}, {}, {})",
            self.fully_qualified(),
            self.column(COLUMN_CONFIGURATION_ID),
            self.column(COLUMN_OPERATION),
            self.column(COLUMN_TABLE_NAME),
            self.column(COLUMN_SQL_EXECUTED),
            self.column(COLUMN_COMMITTER),
            entry.configuration_id,
            syntax.escape_literal(&entry.operation.to_string()),
            syntax.escape_literal(&entry.table_name),
            syntax.escape_literal(&entry.sql_executed),
            syntax.escape_literal(&entry.committer),
        );
        let server = self.server.name();
        let connection = self
            .server
            .open_connection()
            .await
            .map_err(|e| CohortExecutionError::execution(server, e))?;
        connection
            .execute_non_query(&sql)
            .await
            .map_err(|e| CohortExecutionError::execution(server, e))?;
        Ok(())
    }
}

/// Reads and writes cached sub-query results on one cache server.
///
/// # Example
///
/// ```ignore
/// let manager = CachedResultsManager::with_sql_index(cache_server, &CacheConfig::default());
///
/// manager
///     .commit_results(CacheCommitArguments::new(7, op, sql, rows))
///     .await?;
/// let hit = manager.get_latest_results_table(7, op, "SELECT  chi FROM t").await?;
/// ```
#[derive(Debug)]
pub struct CachedResultsManager {
    server: Arc<dyn DiscoveredServer>,
    database: String,
    committer: String,
    index: Arc<dyn CacheIndexStore>,
    commit_lock: tokio::sync::Mutex<()>,
}

impl CachedResultsManager {
    /// Creates a manager over an existing index store.
    pub fn new(server: Arc<dyn DiscoveredServer>, config: &CacheConfig, index: Arc<dyn CacheIndexStore>) -> Self {
        Self {
            server,
            database: config.database.clone(),
            committer: config.committer.clone(),
            index,
            commit_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Creates a manager whose index lives in `config.index_table` on the
    /// cache server itself.
    pub fn with_sql_index(server: Arc<dyn DiscoveredServer>, config: &CacheConfig) -> Self {
        let index = Arc::new(SqlCacheIndexStore::new(
            Arc::clone(&server),
            config.database.clone(),
            config.index_table.clone(),
        ));
        Self::new(server, config, index)
    }

    /// The cache server.
    pub fn server(&self) -> &Arc<dyn DiscoveredServer> {
        &self.server
    }

    /// The cache database.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// The SQL that reads a cached result back.
    pub fn cached_table_sql(&self, table: &CachedTable) -> String {
        format!("SELECT * FROM {}", table.fully_qualified(&self.server.syntax()))
    }

    /// Returns the cached result for the pair when it was produced by
    /// `current_sql`.
    ///
    /// Returns `None` when nothing is cached or when the cached entry is
    /// stale. Never modifies the cache; refreshing is the caller's job.
    pub async fn get_latest_results_table(
        &self,
        configuration_id: i32,
        operation: AggregateOperation,
        current_sql: &str,
    ) -> CohortResult<Option<CachedTable>> {
        let mut entries = self.index.find(configuration_id, operation).await?;
        if entries.len() > 1 {
            return Err(CohortExecutionError::CacheIntegrity(format!(
                "{} cache index rows found for configuration {configuration_id} operation {operation}",
                entries.len()
            )));
        }

        let Some(entry) = entries.pop() else {
            return Ok(None);
        };

        if !entry.is_current_for(current_sql) {
            debug!(
                "Cached {operation} for configuration {configuration_id} is stale ({} was built from different SQL)",
                entry.table_name
            );
            return Ok(None);
        }

        Ok(Some(CachedTable {
            database: self.database.clone(),
            entry,
        }))
    }

    /// Replaces the cached result for the pair with `args.results`.
    pub async fn commit_results(&self, args: CacheCommitArguments) -> CohortResult<CachedTable> {
        let _guard = self.commit_lock.lock().await;
        let server = self.server.name();
        let backend = |e: BackendError| CohortExecutionError::execution(server, e);

        if !self.server.database_exists(&self.database).await.map_err(backend)? {
            return Err(CohortExecutionError::configuration(format!(
                "cache database {} does not exist on {server}",
                self.database
            )));
        }

        self.delete_entry(args.configuration_id, args.operation).await?;

        let table_name = args.operation.table_name(args.configuration_id);
        if self.server.table_exists(&self.database, &table_name).await.map_err(backend)? {
            warn!(
                "Dropping orphaned cache table {table_name} in {} (no index row referenced it)",
                self.database
            );
            self.server
                .drop_table(&self.database, &table_name)
                .await
                .map_err(backend)?;
        }

        self.server
            .create_table(&self.database, &table_name, &args.results, &args.explicit_column_types)
            .await
            .map_err(backend)?;

        if !self.server.table_exists(&self.database, &table_name).await.map_err(backend)? {
            return Err(CohortExecutionError::CacheIntegrity(format!(
                "cache table {table_name} does not exist in {} after it was created",
                self.database
            )));
        }

        let entry = CacheEntry {
            configuration_id: args.configuration_id,
            operation: args.operation,
            table_name,
            sql_executed: args.sql,
            explicit_column_types: args.explicit_column_types,
            committer: self.committer.clone(),
            committed_at: Some(Utc::now()),
        };
        self.index.insert(&entry).await?;

        info!(
            "Cached {} rows for configuration {} ({}) in {}",
            args.results.row_count(),
            entry.configuration_id,
            entry.operation,
            entry.table_name
        );

        Ok(CachedTable {
            database: self.database.clone(),
            entry,
        })
    }

    /// Removes the cached result for the pair, returning whether there was one.
    pub async fn delete_cache_entry_if_any(
        &self,
        configuration_id: i32,
        operation: AggregateOperation,
    ) -> CohortResult<bool> {
        let _guard = self.commit_lock.lock().await;
        self.delete_entry(configuration_id, operation).await
    }

    async fn delete_entry(&self, configuration_id: i32, operation: AggregateOperation) -> CohortResult<bool> {
        let existing = self.index.find(configuration_id, operation).await?;
        if existing.is_empty() {
            return Ok(false);
        }

        let deleted = self.index.delete(configuration_id, operation).await?;
        if deleted != 1 {
            return Err(CohortExecutionError::CacheIntegrity(format!(
                "expected to delete 1 cache index row for configuration {configuration_id} operation {operation} but deleted {deleted}"
            )));
        }

        let server = self.server.name();
        for entry in existing {
            let exists = self
                .server
                .table_exists(&self.database, &entry.table_name)
                .await
                .map_err(|e| CohortExecutionError::execution(server, e))?;
            if exists {
                self.server
                    .drop_table(&self.database, &entry.table_name)
                    .await
                    .map_err(|e| CohortExecutionError::execution(server, e))?;
            } else {
                warn!(
                    "Cache index row for configuration {configuration_id} referenced missing table {}",
                    entry.table_name
                );
            }
        }

        Ok(true)
    }
}

/// Normalizes SQL for staleness comparison.
///
/// Collapses runs of whitespace to a single space, trims, and lowercases.
///
/// ```rust
/// use cohort_query_executor::normalize_sql;
///
/// assert_eq!(normalize_sql("SELECT  chi\n FROM t "), "select chi from t");
/// ```
pub fn normalize_sql(sql: &str) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut prev_was_space = true; // Start true to trim leading spaces

    for ch in sql.chars() {
        if ch.is_whitespace() {
            if !prev_was_space {
                result.push(' ');
                prev_was_space = true;
            }
        } else {
            result.extend(ch.to_lowercase());
            prev_was_space = false;
        }
    }

    if result.ends_with(' ') {
        result.pop();
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryServer;
    use cohort_query::DatabaseType;

    const OP: AggregateOperation = AggregateOperation::IndexedExtractionIdentifierList;
    const SQL: &str = "SELECT DISTINCT chi FROM [biochem]..[tests] WHERE code='HBA1C'";

    fn setup() -> (MemoryServer, Arc<MemoryCacheIndex>, CachedResultsManager) {
        let server = MemoryServer::new("cache01", DatabaseType::MicrosoftSqlServer).with_database("CohortCache");
        let index = Arc::new(MemoryCacheIndex::new());
        let manager = CachedResultsManager::new(server.shared(), &CacheConfig::default(), index.clone());
        (server, index, manager)
    }

    fn rows(ids: &[&str]) -> DataTable {
        DataTable::single_column("chi", ids.iter().copied())
    }

    #[test]
    fn test_normalize_sql() {
        assert_eq!(normalize_sql("SELECT  chi"), "select chi");
        assert_eq!(normalize_sql("  SELECT chi  "), "select chi");
        assert_eq!(normalize_sql("SELECT\tchi\nFROM t"), "select chi from t");
        assert_eq!(normalize_sql(""), "");
        assert_eq!(normalize_sql("   "), "");
    }

    #[tokio::test]
    async fn test_missing_entry_is_none() {
        let (_, _, manager) = setup();
        assert!(manager.get_latest_results_table(1, OP, SQL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_then_lookup_round_trip() {
        let (server, _, manager) = setup();
        let committed = manager
            .commit_results(CacheCommitArguments::new(5, OP, SQL, rows(&["a", "b"])))
            .await
            .unwrap();

        assert_eq!(committed.table_name(), "IndexedExtractionIdentifierList_AggregateConfiguration5");
        assert_eq!(server.table("CohortCache", committed.table_name()).unwrap().data.row_count(), 2);

        let hit = manager.get_latest_results_table(5, OP, SQL).await.unwrap().unwrap();
        assert_eq!(hit, committed);
        assert_eq!(
            manager.cached_table_sql(&hit),
            "SELECT * FROM [CohortCache]..[IndexedExtractionIdentifierList_AggregateConfiguration5]"
        );
    }

    #[tokio::test]
    async fn test_lookup_ignores_whitespace_and_case() {
        let (_, _, manager) = setup();
        manager
            .commit_results(CacheCommitArguments::new(5, OP, SQL, rows(&["a"])))
            .await
            .unwrap();

        let reformatted = "select distinct chi\n  from [BIOCHEM]..[tests]\twhere code='hba1c'";
        assert!(manager.get_latest_results_table(5, OP, reformatted).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_different_sql_is_stale_and_not_removed() {
        let (server, index, manager) = setup();
        manager
            .commit_results(CacheCommitArguments::new(5, OP, SQL, rows(&["a"])))
            .await
            .unwrap();

        let changed = "SELECT DISTINCT chi FROM [biochem]..[tests] WHERE code='LDL'";
        assert!(manager.get_latest_results_table(5, OP, changed).await.unwrap().is_none());

        assert_eq!(index.entries().len(), 1);
        assert_eq!(server.table_names("CohortCache").len(), 1);
    }

    #[tokio::test]
    async fn test_operations_are_cached_separately() {
        let (_, _, manager) = setup();
        manager
            .commit_results(CacheCommitArguments::new(5, OP, SQL, rows(&["a"])))
            .await
            .unwrap();

        let other = AggregateOperation::JoinableInceptionQuery;
        assert!(manager.get_latest_results_table(5, other, SQL).await.unwrap().is_none());
        assert!(manager.get_latest_results_table(6, OP, SQL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_twice_leaves_one_entry_and_one_table() {
        let (server, index, manager) = setup();
        manager
            .commit_results(CacheCommitArguments::new(5, OP, SQL, rows(&["a"])))
            .await
            .unwrap();
        let second_sql = "SELECT chi FROM [biochem]..[tests]";
        manager
            .commit_results(CacheCommitArguments::new(5, OP, second_sql, rows(&["x", "y", "z"])))
            .await
            .unwrap();

        let entries = index.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sql_executed, second_sql);

        let tables = server.table_names("CohortCache");
        assert_eq!(tables.len(), 1);
        assert_eq!(server.table("CohortCache", &tables[0]).unwrap().data.row_count(), 3);

        assert!(manager.get_latest_results_table(5, OP, SQL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_passes_explicit_types_through() {
        let (server, index, manager) = setup();
        let types = vec![ColumnType::new("chi", "varchar(10)")];
        let committed = manager
            .commit_results(CacheCommitArguments::new(5, OP, SQL, rows(&["a"])).with_column_types(types.clone()))
            .await
            .unwrap();

        assert_eq!(server.table("CohortCache", committed.table_name()).unwrap().column_types, types);
        assert_eq!(index.entries()[0].explicit_column_types, types);
        assert!(index.entries()[0].committed_at.is_some());
    }

    #[tokio::test]
    async fn test_commit_drops_orphaned_table() {
        let server = MemoryServer::new("cache01", DatabaseType::MicrosoftSqlServer).with_table(
            "CohortCache",
            "IndexedExtractionIdentifierList_AggregateConfiguration5",
            rows(&["stale"]),
        );
        let index = Arc::new(MemoryCacheIndex::new());
        let manager = CachedResultsManager::new(server.shared(), &CacheConfig::default(), index.clone());

        let committed = manager
            .commit_results(CacheCommitArguments::new(5, OP, SQL, rows(&["a", "b"])))
            .await
            .unwrap();
        assert_eq!(server.table("CohortCache", committed.table_name()).unwrap().data.row_count(), 2);
    }

    #[tokio::test]
    async fn test_commit_requires_cache_database() {
        let server = MemoryServer::new("cache01", DatabaseType::MicrosoftSqlServer);
        let manager = CachedResultsManager::new(server.shared(), &CacheConfig::default(), Arc::new(MemoryCacheIndex::new()));

        let err = manager
            .commit_results(CacheCommitArguments::new(5, OP, SQL, rows(&["a"])))
            .await
            .unwrap_err();
        assert!(matches!(err, CohortExecutionError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_delete_entry() {
        let (server, index, manager) = setup();
        assert!(!manager.delete_cache_entry_if_any(5, OP).await.unwrap());

        manager
            .commit_results(CacheCommitArguments::new(5, OP, SQL, rows(&["a"])))
            .await
            .unwrap();
        assert!(manager.delete_cache_entry_if_any(5, OP).await.unwrap());

        assert!(index.entries().is_empty());
        assert!(server.table_names("CohortCache").is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_index_rows_are_an_integrity_fault() {
        let (_, index, manager) = setup();
        let entry = CacheEntry {
            configuration_id: 5,
            operation: OP,
            table_name: OP.table_name(5),
            sql_executed: SQL.to_string(),
            explicit_column_types: Vec::new(),
            committer: "test".to_string(),
            committed_at: None,
        };
        index.insert(&entry).await.unwrap();
        index.insert(&entry).await.unwrap();

        let err = manager.get_latest_results_table(5, OP, SQL).await.unwrap_err();
        assert!(matches!(err, CohortExecutionError::CacheIntegrity(_)));

        let err = manager.delete_cache_entry_if_any(5, OP).await.unwrap_err();
        assert!(matches!(err, CohortExecutionError::CacheIntegrity(_)));
    }

    #[tokio::test]
    async fn test_sql_index_store_creates_table_and_parses_rows() {
        let server = MemoryServer::new("cache01", DatabaseType::MicrosoftSqlServer).with_database("CohortCache");
        let store = SqlCacheIndexStore::new(server.shared(), "CohortCache", "CachedAggregateConfigurationResults");

        server.respond_containing(
            "FROM [CohortCache]..[CachedAggregateConfigurationResults]",
            DataTable::with_rows(
                vec![
                    "AggregateConfiguration_ID".into(),
                    "Operation".into(),
                    "TableName".into(),
                    "SqlExecuted".into(),
                    "Committer".into(),
                ],
                vec![vec![
                    Value::Integer(5),
                    Value::from("IndexedExtractionIdentifierList"),
                    Value::from("IndexedExtractionIdentifierList_AggregateConfiguration5"),
                    Value::from(SQL),
                    Value::Null,
                ]],
            ),
        );

        let entries = store.find(5, OP).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].configuration_id, 5);
        assert_eq!(entries[0].operation, OP);
        assert_eq!(entries[0].committer, "");

        let created = server.table("CohortCache", "CachedAggregateConfigurationResults").unwrap();
        assert_eq!(created.column_types.len(), 5);
        assert_eq!(created.column_types[3].sql_type, "varchar(max)");

        let executed = server.executed_sql();
        assert!(executed[0].contains("WHERE [AggregateConfiguration_ID]=5 AND [Operation]='IndexedExtractionIdentifierList'"));
    }

    #[tokio::test]
    async fn test_sql_index_store_escapes_inserted_sql() {
        let server = MemoryServer::new("cache01", DatabaseType::MySql).with_database("cache");
        let store = SqlCacheIndexStore::new(server.shared(), "cache", "idx");

        let entry = CacheEntry {
            configuration_id: 9,
            operation: OP,
            table_name: OP.table_name(9),
            sql_executed: "SELECT chi FROM t WHERE code='X'".to_string(),
            explicit_column_types: Vec::new(),
            committer: "me".to_string(),
            committed_at: None,
        };
        store.insert(&entry).await.unwrap();

        let executed = server.executed_sql();
        assert_eq!(
            executed[0],
            "INSERT INTO `cache`.`idx` (`AggregateConfiguration_ID`, `Operation`, `TableName`, `SqlExecuted`, `Committer`) \
             VALUES (9, 'IndexedExtractionIdentifierList', 'IndexedExtractionIdentifierList_AggregateConfiguration9', \
             'SELECT chi FROM t WHERE code=''X''', 'me')"
        );
    }

    #[tokio::test]
    async fn test_sql_index_store_rejects_unknown_operation() {
        let server = MemoryServer::new("cache01", DatabaseType::MicrosoftSqlServer).with_database("CohortCache");
        let store = SqlCacheIndexStore::new(server.shared(), "CohortCache", "idx");
        server.respond_containing(
            "FROM [CohortCache]..[idx]",
            DataTable::with_rows(
                vec![
                    "AggregateConfiguration_ID".into(),
                    "Operation".into(),
                    "TableName".into(),
                    "SqlExecuted".into(),
                    "Committer".into(),
                ],
                vec![vec![
                    Value::Integer(5),
                    Value::from("Graph"),
                    Value::from("t"),
                    Value::from("s"),
                    Value::Null,
                ]],
            ),
        );

        let err = store.find(5, OP).await.unwrap_err();
        assert!(matches!(err, CohortExecutionError::CacheIntegrity(_)));
    }
}
