//! Error types for extraction.

use cohort_query_executor::{BackendError, CohortExecutionError};
use thiserror::Error;

/// Errors that can occur while building or running an extraction.
#[derive(Error, Debug)]
pub enum ExtractionError {
    /// Error bubbled up from server resolution or query execution.
    #[error("execution error: {0}")]
    Execution(#[from] CohortExecutionError),

    /// The dataset has no column flagged as the extraction identifier.
    #[error("dataset '{dataset}' has no column marked as identifier")]
    NoIdentifierColumn {
        /// Dataset name.
        dataset: String,
    },

    /// The extraction configuration has no cohort selected.
    #[error("extraction configuration {configuration_id} has no cohort selected")]
    MissingCohort {
        /// Extraction configuration id.
        configuration_id: i32,
    },

    /// A column must be hashed but no salt is configured.
    #[error("column '{column}' is hashed on release but no hashing salt is configured")]
    MissingSalt {
        /// Column runtime name.
        column: String,
    },

    /// Cohort and dataset live on different servers and the source in use
    /// cannot copy between them.
    #[error("cohort is on {cohort_server} but dataset is on {dataset_server}; use a cross-server extraction source")]
    DifferentServers {
        /// Server holding the cohort.
        cohort_server: String,
        /// Server holding the dataset.
        dataset_server: String,
    },

    /// The operation would trigger a cross-server copy.
    #[error("{0} is not supported for cross-server extractions")]
    UnsupportedInCrossServerMode(&'static str),

    /// The cross-server gate was closed while waiting for it.
    #[error("cross-server gate is closed")]
    GateClosed,

    /// The temporary database is absent and may not be created.
    #[error("temporary database {database} does not exist on {server} and creating it is disabled")]
    TemporaryDatabaseMissing {
        /// Temporary database name.
        database: String,
        /// Dataset server.
        server: String,
    },

    /// A table named like the cohort already exists in the temporary
    /// database and may not be dropped.
    #[error("table {table} already exists in {database} and dropping it is disabled")]
    CohortTableExists {
        /// Temporary database name.
        database: String,
        /// Cohort table name.
        table: String,
    },

    /// A backend administrative operation failed.
    #[error("{operation} failed on {server}: {source}")]
    Backend {
        /// What was being done.
        operation: String,
        /// Server the operation ran against.
        server: String,
        /// Underlying failure.
        #[source]
        source: BackendError,
    },

    /// Extraction configuration could not be read.
    #[error("invalid extraction configuration: {0}")]
    InvalidConfig(#[from] serde_json::Error),
}

impl ExtractionError {
    /// Wraps a backend failure with what was being done and where.
    pub fn backend(operation: impl Into<String>, server: impl Into<String>, source: BackendError) -> Self {
        Self::Backend {
            operation: operation.into(),
            server: server.into(),
            source,
        }
    }
}

/// Result type for extraction operations.
pub type ExtractionResult<T> = std::result::Result<T, ExtractionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_display_no_identifier() {
        let err = ExtractionError::NoIdentifierColumn {
            dataset: "biochemistry".into(),
        };
        assert_eq!(err.to_string(), "dataset 'biochemistry' has no column marked as identifier");
    }

    #[test]
    fn test_error_backend_keeps_cause() {
        let err = ExtractionError::backend(
            "creating table Cohort",
            "live01",
            BackendError::TableExists("Cohort".into()),
        );
        assert!(err.to_string().starts_with("creating table Cohort failed on live01"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_error_from_execution_error() {
        let err: ExtractionError = CohortExecutionError::UnknownServer("live09".into()).into();
        assert!(matches!(err, ExtractionError::Execution(_)));
    }
}
