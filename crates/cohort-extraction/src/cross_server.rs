//! Extraction when the cohort and the dataset live on different servers.
//!
//! The dataset's server cannot join a table it cannot see, so on the first
//! chunk the cohort is copied into a temporary database on the dataset's
//! server and the extraction SQL is rewritten to join the copy. Every copy
//! lands in the same temporary database under the cohort table's name, so
//! copies are serialized through a [`CrossServerGate`] shared by every
//! source in the process.
//!
//! ```ignore
//! let gate = CrossServerGate::new();
//!
//! let mut source = CrossServerExtractionSource::new(request, resolver, gate.clone())
//!     .with_config(CrossServerConfig::default());
//! while let Some(chunk) = source.get_chunk().await? {
//!     write(chunk.data)?;
//! }
//! source.dispose().await?;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use cohort_query::QuerySyntaxHelper;
use cohort_query_executor::{
    DataTable, DiscoveredServer, NoOpProgressSink, ProgressEvent, ProgressLevel, ProgressSink, ServerResolver,
};
use log::{debug, info, warn};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::builder::{ExtractionQuery, ExtractionQueryBuilder};
use crate::config::CrossServerConfig;
use crate::error::{ExtractionError, ExtractionResult};
use crate::model::{ExtractableCohort, ExtractionRequest};
use crate::source::{read_all, DatasetExtractionSource, ExtractionChunk, ExtractionSource};

const SENDER: &str = "CrossServerExtractionSource";

/// Admits one cross-server cohort copy at a time.
///
/// Construct one per process and hand clones to every source.
#[derive(Debug, Clone)]
pub struct CrossServerGate {
    permits: Arc<Semaphore>,
}

impl CrossServerGate {
    /// Creates a gate with a single permit.
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
        }
    }

    /// Waits for the permit.
    pub async fn acquire(&self) -> ExtractionResult<OwnedSemaphorePermit> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ExtractionError::GateClosed)
    }

    /// Whether a copy currently holds the permit.
    pub fn is_held(&self) -> bool {
        self.permits.available_permits() == 0
    }
}

impl Default for CrossServerGate {
    fn default() -> Self {
        Self::new()
    }
}

/// What a cross-server copy created on the dataset's server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossServerCopyState {
    /// Database the cohort was copied into.
    pub temporary_database: String,
    /// Whether the database was created by the copy.
    pub created_database: bool,
    /// Tables created by the copy.
    pub tables_created: Vec<String>,
}

impl CrossServerCopyState {
    fn new(temporary_database: &str) -> Self {
        Self {
            temporary_database: temporary_database.to_string(),
            created_database: false,
            tables_created: Vec::new(),
        }
    }
}

/// Extracts a dataset after copying its cohort onto the dataset's server.
///
/// Call [`ExtractionSource::dispose`] when the pipeline finishes, whether it
/// succeeded or not: it removes the copy and releases the gate. Dropping the
/// source without disposing releases the gate but leaves the copy behind.
pub struct CrossServerExtractionSource {
    request: ExtractionRequest,
    resolver: Arc<dyn ServerResolver>,
    gate: CrossServerGate,
    config: CrossServerConfig,
    progress: Arc<dyn ProgressSink>,
    permit: Option<OwnedSemaphorePermit>,
    dataset_server: Option<Arc<dyn DiscoveredServer>>,
    state: Option<CrossServerCopyState>,
    exhausted: bool,
    disposed: bool,
}

impl CrossServerExtractionSource {
    /// Creates a source that copies through `gate`.
    pub fn new(request: ExtractionRequest, resolver: Arc<dyn ServerResolver>, gate: CrossServerGate) -> Self {
        Self {
            request,
            resolver,
            gate,
            config: CrossServerConfig::default(),
            progress: Arc::new(NoOpProgressSink),
            permit: None,
            dataset_server: None,
            state: None,
            exhausted: false,
            disposed: false,
        }
    }

    /// Sets the temporary database policy.
    pub fn with_config(mut self, config: CrossServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Reports progress to `sink`.
    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    /// What the copy has created so far.
    pub fn copy_state(&self) -> Option<&CrossServerCopyState> {
        self.state.as_ref()
    }

    fn report(&self, level: ProgressLevel, message: String) {
        match level {
            ProgressLevel::Information => info!("{message}"),
            _ => warn!("{message}"),
        }
        self.progress.notify(ProgressEvent::new(level, SENDER, message));
    }

    /// Copies the cohort and returns the temporary database it landed in.
    async fn copy_cohort(
        &mut self,
        cohort: &ExtractableCohort,
        cohort_server: &dyn DiscoveredServer,
        dataset_server: &dyn DiscoveredServer,
    ) -> ExtractionResult<String> {
        let rows = read_all(cohort_server, &cohort_fetch_sql(cohort)).await?;
        self.report(
            ProgressLevel::Information,
            format!(
                "fetched {} cohort rows from {} for cohort definition {}",
                rows.row_count(),
                cohort_server.name(),
                cohort.cohort_definition_id
            ),
        );

        let database = self.config.temporary_database.clone();
        let server = dataset_server.name().to_string();
        let state = self
            .state
            .get_or_insert_with(|| CrossServerCopyState::new(&database));

        let exists = dataset_server
            .database_exists(&database)
            .await
            .map_err(|e| ExtractionError::backend(format!("checking for database {database}"), &server, e))?;
        if !exists {
            if !self.config.create_database_if_not_exists {
                return Err(ExtractionError::TemporaryDatabaseMissing { database, server });
            }
            dataset_server
                .create_database(&database)
                .await
                .map_err(|e| ExtractionError::backend(format!("creating database {database}"), &server, e))?;
            state.created_database = true;
            info!("created temporary database {database} on {server}");
        }

        let table = cohort.table.clone();
        let table_exists = dataset_server
            .table_exists(&database, &table)
            .await
            .map_err(|e| ExtractionError::backend(format!("checking for table {table}"), &server, e))?;
        if table_exists {
            if !self.config.drop_existing_cohort_table {
                return Err(ExtractionError::CohortTableExists { database, table });
            }
            dataset_server
                .drop_table(&database, &table)
                .await
                .map_err(|e| ExtractionError::backend(format!("dropping table {table}"), &server, e))?;
            warn!("dropped pre-existing table {table} in {database} on {server}");
        }

        dataset_server
            .create_table(&database, &table, &rows, &[])
            .await
            .map_err(|e| ExtractionError::backend(format!("creating table {table}"), &server, e))?;
        state.tables_created.push(table.clone());

        self.report(
            ProgressLevel::Information,
            format!("copied {} cohort rows into {database}.{table} on {server}", rows.row_count()),
        );
        Ok(database)
    }

    async fn tear_down(&mut self) -> ExtractionResult<()> {
        let (Some(state), Some(server)) = (self.state.take(), self.dataset_server.take()) else {
            return Ok(());
        };
        let database = &state.temporary_database;

        if state.created_database {
            server
                .drop_database(database)
                .await
                .map_err(|e| ExtractionError::backend(format!("dropping database {database}"), server.name(), e))?;
            info!("dropped temporary database {database} on {}", server.name());
            return Ok(());
        }

        let mut first_failure = None;
        for table in &state.tables_created {
            match server.drop_table(database, table).await {
                Ok(()) => debug!("dropped {database}.{table} on {}", server.name()),
                Err(e) => {
                    warn!("could not drop {database}.{table} on {}: {e}", server.name());
                    if first_failure.is_none() {
                        first_failure = Some(ExtractionError::backend(
                            format!("dropping table {table}"),
                            server.name(),
                            e,
                        ));
                    }
                }
            }
        }
        first_failure.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl ExtractionSource for CrossServerExtractionSource {
    async fn get_chunk(&mut self) -> ExtractionResult<Option<ExtractionChunk>> {
        if self.exhausted || self.disposed {
            return Ok(None);
        }

        let cohort = self
            .request
            .configuration
            .cohort
            .clone()
            .ok_or(ExtractionError::MissingCohort {
                configuration_id: self.request.configuration.id,
            })?;
        let query = ExtractionQueryBuilder::new().build(&self.request)?;
        let dataset_server = self.resolver.resolve(&self.request.dataset.data_access_point)?;
        let cohort_server = self.resolver.resolve(&cohort.data_access_point)?;

        if self.permit.is_none() {
            debug!("waiting for the cross-server gate");
            self.permit = Some(self.gate.acquire().await?);
        }
        self.dataset_server = Some(Arc::clone(&dataset_server));

        let database = self
            .copy_cohort(&cohort, cohort_server.as_ref(), dataset_server.as_ref())
            .await?;

        let (sql, warnings) =
            rewrite_cohort_references(&query.sql, &cohort, &dataset_server.syntax(), &database);
        for warning in &warnings {
            self.report(ProgressLevel::Warning, warning.clone());
        }

        let data = read_all(dataset_server.as_ref(), &sql).await?;
        self.exhausted = true;
        self.report(
            ProgressLevel::Information,
            format!(
                "extracted {} rows of '{}' from {}",
                data.row_count(),
                self.request.dataset.name,
                dataset_server.name()
            ),
        );

        Ok(Some(ExtractionChunk { data, sql, warnings }))
    }

    async fn preview(&mut self, _rows: usize) -> ExtractionResult<DataTable> {
        Err(ExtractionError::UnsupportedInCrossServerMode("preview"))
    }

    fn check(&self) -> ExtractionResult<ExtractionQuery> {
        Err(ExtractionError::UnsupportedInCrossServerMode("check"))
    }

    async fn dispose(&mut self) -> ExtractionResult<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;

        let result = self.tear_down().await;
        if self.permit.take().is_some() {
            debug!("released the cross-server gate");
        }
        result
    }
}

impl Drop for CrossServerExtractionSource {
    fn drop(&mut self) {
        if !self.disposed && self.state.is_some() {
            warn!(
                "cross-server extraction of '{}' was not disposed; its cohort copy was left in {}",
                self.request.dataset.name, self.config.temporary_database
            );
        }
    }
}

/// Returns a source able to extract `request`: a [`DatasetExtractionSource`]
/// when the cohort and the dataset share a server, otherwise a
/// [`CrossServerExtractionSource`] copying through `gate`.
pub fn select_extraction_source(
    request: ExtractionRequest,
    resolver: Arc<dyn ServerResolver>,
    gate: &CrossServerGate,
    config: CrossServerConfig,
) -> ExtractionResult<Box<dyn ExtractionSource>> {
    let cohort = request
        .configuration
        .cohort
        .as_ref()
        .ok_or(ExtractionError::MissingCohort {
            configuration_id: request.configuration.id,
        })?;
    let cohort_server = resolver.resolve(&cohort.data_access_point)?;
    let dataset_server = resolver.resolve(&request.dataset.data_access_point)?;

    if cohort_server.is_same_server(dataset_server.as_ref()) {
        return Ok(Box::new(DatasetExtractionSource::new(request, resolver)));
    }
    debug!(
        "cohort on {} and dataset '{}' on {}; extracting cross-server",
        cohort_server.name(),
        request.dataset.name,
        dataset_server.name()
    );
    Ok(Box::new(
        CrossServerExtractionSource::new(request, resolver, gate.clone()).with_config(config),
    ))
}

fn cohort_fetch_sql(cohort: &ExtractableCohort) -> String {
    let definition = cohort.definition_sql();
    format!(
        "SELECT {}, {}, {definition} FROM {} WHERE {definition}={}",
        cohort.private_identifier_sql(),
        cohort.release_identifier_sql(),
        cohort.fully_qualified_table(),
        cohort.cohort_definition_id
    )
}

/// Points every fully qualified cohort reference in `sql` at the copy of the
/// cohort table in `database`, written in `destination`'s dialect.
///
/// Replacement is textual. Each reference not found verbatim yields a
/// warning and the SQL is left as it was for that reference.
pub fn rewrite_cohort_references(
    sql: &str,
    cohort: &ExtractableCohort,
    destination: &QuerySyntaxHelper,
    database: &str,
) -> (String, Vec<String>) {
    let source = cohort.syntax();
    let database_source = &cohort.data_access_point.database;

    // columns first: a qualified column starts with its qualified table
    let mut replacements: Vec<(String, String)> = cohort
        .columns()
        .iter()
        .map(|column| {
            (
                source.ensure_fully_qualified_column(database_source, &cohort.table, column),
                destination.ensure_fully_qualified_column(database, &cohort.table, column),
            )
        })
        .collect();
    replacements.push((
        source.ensure_fully_qualified(database_source, &cohort.table),
        destination.ensure_fully_qualified(database, &cohort.table),
    ));

    let mut sql = sql.to_string();
    let mut warnings = Vec::new();
    for (from, to) in replacements {
        if sql.contains(&from) {
            sql = sql.replace(&from, &to);
        } else {
            warnings.push(format!(
                "expected to find {from} in the extraction SQL but it was not there; it was not redirected to {to}"
            ));
        }
    }
    (sql, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_query::{DataAccessPoint, DatabaseType};

    fn cohort() -> ExtractableCohort {
        ExtractableCohort::new(
            5,
            DataAccessPoint::new("cohort01", "cohorts", DatabaseType::MicrosoftSqlServer),
            "Cohort",
        )
    }

    #[test]
    fn test_rewrite_across_dialects() {
        let sql = "SELECT [cohorts]..[Cohort].[ReleaseID] AS chi FROM [biochem]..[tests] \
                   INNER JOIN [cohorts]..[Cohort] ON [biochem]..[tests].[chi]=[cohorts]..[Cohort].[PrivateID] \
                   WHERE [cohorts]..[Cohort].[cohortDefinition_id]=5";
        let (rewritten, warnings) =
            rewrite_cohort_references(sql, &cohort(), &DatabaseType::MySql.syntax(), "tempdb");

        assert!(warnings.is_empty());
        assert_eq!(
            rewritten,
            "SELECT `tempdb`.`Cohort`.`ReleaseID` AS chi FROM [biochem]..[tests] \
             INNER JOIN `tempdb`.`Cohort` ON [biochem]..[tests].[chi]=`tempdb`.`Cohort`.`PrivateID` \
             WHERE `tempdb`.`Cohort`.`cohortDefinition_id`=5"
        );
    }

    #[test]
    fn test_missing_reference_is_warning() {
        let sql = "SELECT x FROM [cohorts]..[Cohort] WHERE [cohorts]..[Cohort].[PrivateID] IS NOT NULL";
        let (rewritten, warnings) =
            rewrite_cohort_references(sql, &cohort(), &DatabaseType::MicrosoftSqlServer.syntax(), "tempdb");

        assert_eq!(
            rewritten,
            "SELECT x FROM [tempdb]..[Cohort] WHERE [tempdb]..[Cohort].[PrivateID] IS NOT NULL"
        );
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("[cohorts]..[Cohort].[ReleaseID]"));
        assert!(warnings[1].contains("[cohorts]..[Cohort].[cohortDefinition_id]"));
    }

    #[test]
    fn test_fetch_sql() {
        assert_eq!(
            cohort_fetch_sql(&cohort()),
            "SELECT [cohorts]..[Cohort].[PrivateID], [cohorts]..[Cohort].[ReleaseID], \
             [cohorts]..[Cohort].[cohortDefinition_id] FROM [cohorts]..[Cohort] \
             WHERE [cohorts]..[Cohort].[cohortDefinition_id]=5"
        );
    }

    #[tokio::test]
    async fn test_gate_has_one_permit() {
        let gate = CrossServerGate::new();
        assert!(!gate.is_held());
        let permit = gate.acquire().await.unwrap();
        assert!(gate.is_held());
        assert!(gate.permits.try_acquire().is_err());
        drop(permit);
        assert!(!gate.is_held());
    }
}
