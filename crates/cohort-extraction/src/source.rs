//! Extraction sources: pipelines' first stage, yielding the extracted rows.

use std::sync::Arc;

use async_trait::async_trait;
use cohort_query_executor::{
    CohortExecutionError, DataTable, DiscoveredServer, NoOpProgressSink, ProgressEvent, ProgressLevel,
    ProgressSink, ServerResolver,
};
use log::info;

use crate::builder::{ExtractionQuery, ExtractionQueryBuilder};
use crate::error::{ExtractionError, ExtractionResult};
use crate::model::ExtractionRequest;

/// A batch of extracted rows.
#[derive(Debug, Clone)]
pub struct ExtractionChunk {
    /// The rows.
    pub data: DataTable,
    /// SQL that produced them.
    pub sql: String,
    /// Problems found while preparing the query that did not stop it.
    pub warnings: Vec<String>,
}

/// Produces the rows of one extraction request.
#[async_trait]
pub trait ExtractionSource: Send {
    /// Returns the next chunk, or `None` once the source is exhausted.
    async fn get_chunk(&mut self) -> ExtractionResult<Option<ExtractionChunk>>;

    /// Returns up to `rows` rows without consuming the source.
    async fn preview(&mut self, rows: usize) -> ExtractionResult<DataTable>;

    /// Verifies the query can be built and run where the data lives.
    fn check(&self) -> ExtractionResult<ExtractionQuery>;

    /// Releases anything the source holds. Safe to call more than once.
    async fn dispose(&mut self) -> ExtractionResult<()>;
}

/// Extracts a dataset whose cohort lives on the same server.
pub struct DatasetExtractionSource {
    request: ExtractionRequest,
    resolver: Arc<dyn ServerResolver>,
    progress: Arc<dyn ProgressSink>,
    exhausted: bool,
}

impl DatasetExtractionSource {
    /// Creates a source for `request`.
    pub fn new(request: ExtractionRequest, resolver: Arc<dyn ServerResolver>) -> Self {
        Self {
            request,
            resolver,
            progress: Arc::new(NoOpProgressSink),
            exhausted: false,
        }
    }

    /// Reports progress to `sink`.
    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    fn dataset_server(&self) -> ExtractionResult<Arc<dyn DiscoveredServer>> {
        let dataset_server = self.resolver.resolve(&self.request.dataset.data_access_point)?;
        if let Some(cohort) = &self.request.configuration.cohort {
            let cohort_server = self.resolver.resolve(&cohort.data_access_point)?;
            if !cohort_server.is_same_server(dataset_server.as_ref()) {
                return Err(ExtractionError::DifferentServers {
                    cohort_server: cohort_server.name().to_string(),
                    dataset_server: dataset_server.name().to_string(),
                });
            }
        }
        Ok(dataset_server)
    }
}

#[async_trait]
impl ExtractionSource for DatasetExtractionSource {
    async fn get_chunk(&mut self) -> ExtractionResult<Option<ExtractionChunk>> {
        if self.exhausted {
            return Ok(None);
        }

        let server = self.dataset_server()?;
        let query = ExtractionQueryBuilder::new().build(&self.request)?;
        let data = read_all(server.as_ref(), &query.sql).await?;
        self.exhausted = true;

        let message = format!(
            "extracted {} rows of '{}' from {}",
            data.row_count(),
            self.request.dataset.name,
            server.name()
        );
        info!("{message}");
        self.progress
            .notify(ProgressEvent::new(ProgressLevel::Information, "DatasetExtractionSource", message));

        Ok(Some(ExtractionChunk {
            data,
            sql: query.sql,
            warnings: Vec::new(),
        }))
    }

    async fn preview(&mut self, rows: usize) -> ExtractionResult<DataTable> {
        let server = self.dataset_server()?;
        let query = ExtractionQueryBuilder::new()
            .with_row_limit(rows)
            .build(&self.request)?;
        Ok(read_all(server.as_ref(), &query.sql).await?.truncated(rows))
    }

    fn check(&self) -> ExtractionResult<ExtractionQuery> {
        self.dataset_server()?;
        ExtractionQueryBuilder::new().build(&self.request)
    }

    async fn dispose(&mut self) -> ExtractionResult<()> {
        Ok(())
    }
}

/// Runs `sql` on a fresh connection and returns every row.
pub(crate) async fn read_all(server: &dyn DiscoveredServer, sql: &str) -> ExtractionResult<DataTable> {
    let connection = server
        .open_connection()
        .await
        .map_err(|e| CohortExecutionError::execution(server.name(), e))?;
    let data = connection
        .execute_reader(sql)
        .await
        .map_err(|e| CohortExecutionError::execution(server.name(), e))?;
    Ok(data)
}
