//! Value types describing what is being extracted and for whom.

use cohort_query::{DataAccessPoint, DeclaredParameter, QuerySyntaxHelper};

use crate::config::HashingConfig;

/// One column released from a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractableColumn {
    /// Select expression, normally a fully qualified column.
    pub select_sql: String,
    /// Output name; defaults to the runtime name of `select_sql`.
    pub alias: Option<String>,
    /// Holds the private identifier that links rows to the cohort.
    pub is_extraction_identifier: bool,
    /// Released as a salted hash rather than in clear.
    pub hash_on_release: bool,
}

impl ExtractableColumn {
    /// A plain column.
    pub fn new(select_sql: impl Into<String>) -> Self {
        Self {
            select_sql: select_sql.into(),
            alias: None,
            is_extraction_identifier: false,
            hash_on_release: false,
        }
    }

    /// Marks the column as an extraction identifier.
    pub fn identifier(mut self) -> Self {
        self.is_extraction_identifier = true;
        self
    }

    /// Marks the column for hashing.
    pub fn hashed(mut self) -> Self {
        self.hash_on_release = true;
        self
    }

    /// Sets the output name.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// The name the column has in the extracted result.
    pub fn runtime_name(&self, syntax: &QuerySyntaxHelper) -> String {
        match &self.alias {
            Some(alias) => alias.clone(),
            None => syntax.get_runtime_name(&self.select_sql),
        }
    }
}

/// A WHERE predicate applied to one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetFilter {
    /// Display name, emitted as a comment.
    pub name: String,
    /// Predicate SQL.
    pub where_sql: String,
    /// Parameters the predicate refers to.
    pub parameters: Vec<DeclaredParameter>,
}

impl DatasetFilter {
    /// Creates a filter without parameters.
    pub fn new(name: impl Into<String>, where_sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            where_sql: where_sql.into(),
            parameters: Vec::new(),
        }
    }

    /// Adds a parameter.
    pub fn with_parameter(mut self, parameter: DeclaredParameter) -> Self {
        self.parameters.push(parameter);
        self
    }
}

/// A dataset and the columns released from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractableDataset {
    /// Dataset name.
    pub name: String,
    /// Where the dataset table lives.
    pub data_access_point: DataAccessPoint,
    /// Unqualified table name.
    pub table: String,
    /// Released columns, in output order.
    pub columns: Vec<ExtractableColumn>,
    /// Predicates restricting the released rows.
    pub filters: Vec<DatasetFilter>,
}

impl ExtractableDataset {
    /// Creates a dataset with no columns.
    pub fn new(name: impl Into<String>, data_access_point: DataAccessPoint, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_access_point,
            table: table.into(),
            columns: Vec::new(),
            filters: Vec::new(),
        }
    }

    /// Adds a column.
    pub fn with_column(mut self, column: ExtractableColumn) -> Self {
        self.columns.push(column);
        self
    }

    /// Adds a filter.
    pub fn with_filter(mut self, filter: DatasetFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Fully qualified dataset table.
    pub fn fully_qualified_table(&self) -> String {
        self.data_access_point
            .syntax()
            .ensure_fully_qualified(&self.data_access_point.database, &self.table)
    }

    /// Columns flagged as extraction identifiers.
    pub fn identifier_columns(&self) -> Vec<&ExtractableColumn> {
        self.columns.iter().filter(|c| c.is_extraction_identifier).collect()
    }
}

/// A committed cohort: private-to-release identifier pairs stored under a
/// cohort definition id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractableCohort {
    /// Cohort definition (version) id.
    pub cohort_definition_id: i32,
    /// Where the cohort table lives.
    pub data_access_point: DataAccessPoint,
    /// Unqualified cohort table name.
    pub table: String,
    /// Column holding private identifiers.
    pub private_identifier_column: String,
    /// Column holding release identifiers.
    pub release_identifier_column: String,
    /// Column holding the cohort definition id.
    pub definition_column: String,
}

impl ExtractableCohort {
    /// Creates a cohort using the conventional column names.
    pub fn new(cohort_definition_id: i32, data_access_point: DataAccessPoint, table: impl Into<String>) -> Self {
        Self {
            cohort_definition_id,
            data_access_point,
            table: table.into(),
            private_identifier_column: "PrivateID".to_string(),
            release_identifier_column: "ReleaseID".to_string(),
            definition_column: "cohortDefinition_id".to_string(),
        }
    }

    /// Overrides the identifier column names.
    pub fn with_identifier_columns(mut self, private: impl Into<String>, release: impl Into<String>) -> Self {
        self.private_identifier_column = private.into();
        self.release_identifier_column = release.into();
        self
    }

    /// The cohort's dialect.
    pub fn syntax(&self) -> QuerySyntaxHelper {
        self.data_access_point.syntax()
    }

    /// Fully qualified cohort table.
    pub fn fully_qualified_table(&self) -> String {
        self.syntax()
            .ensure_fully_qualified(&self.data_access_point.database, &self.table)
    }

    /// Fully qualified private identifier column.
    pub fn private_identifier_sql(&self) -> String {
        self.column_sql(&self.private_identifier_column)
    }

    /// Fully qualified release identifier column.
    pub fn release_identifier_sql(&self) -> String {
        self.column_sql(&self.release_identifier_column)
    }

    /// Fully qualified definition id column.
    pub fn definition_sql(&self) -> String {
        self.column_sql(&self.definition_column)
    }

    /// Every column of the cohort table the extraction reads.
    pub fn columns(&self) -> [&str; 3] {
        [
            &self.private_identifier_column,
            &self.release_identifier_column,
            &self.definition_column,
        ]
    }

    fn column_sql(&self, column: &str) -> String {
        self.syntax()
            .ensure_fully_qualified_column(&self.data_access_point.database, &self.table, column)
    }
}

/// Per-project extraction settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionConfiguration {
    /// Configuration id.
    pub id: i32,
    /// Project the extraction is released to.
    pub project_number: i32,
    /// Selected cohort.
    pub cohort: Option<ExtractableCohort>,
    /// Parameters declared for every dataset in the configuration.
    pub global_parameters: Vec<DeclaredParameter>,
    /// Salt for hashed columns.
    pub hashing: Option<HashingConfig>,
}

impl ExtractionConfiguration {
    /// Creates a configuration with no cohort selected.
    pub fn new(id: i32, project_number: i32) -> Self {
        Self {
            id,
            project_number,
            cohort: None,
            global_parameters: Vec::new(),
            hashing: None,
        }
    }

    /// Selects a cohort.
    pub fn with_cohort(mut self, cohort: ExtractableCohort) -> Self {
        self.cohort = Some(cohort);
        self
    }

    /// Adds a global parameter.
    pub fn with_global_parameter(mut self, parameter: DeclaredParameter) -> Self {
        self.global_parameters.push(parameter);
        self
    }

    /// Sets the hashing salt.
    pub fn with_hashing(mut self, hashing: HashingConfig) -> Self {
        self.hashing = Some(hashing);
        self
    }
}

/// One dataset of one configuration, ready to extract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionRequest {
    /// The extraction configuration.
    pub configuration: ExtractionConfiguration,
    /// The dataset being extracted.
    pub dataset: ExtractableDataset,
}

impl ExtractionRequest {
    /// Creates a request.
    pub fn new(configuration: ExtractionConfiguration, dataset: ExtractableDataset) -> Self {
        Self {
            configuration,
            dataset,
        }
    }
}
