//! Plain value types describing a cohort definition tree.
//!
//! These are supplied by the caller (typically hydrated from a metadata
//! repository) and are never mutated by the compiler or executor.

use crate::dialect::{DatabaseType, QuerySyntaxHelper};
use crate::parameters::DeclaredParameter;

/// Where a sub-query's data lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DataAccessPoint {
    /// Server name (host, instance or connection alias).
    pub server: String,
    /// Database holding the queried tables.
    pub database: String,
    /// Backend kind.
    pub database_type: DatabaseType,
}

impl DataAccessPoint {
    /// Creates a data access point.
    pub fn new(server: impl Into<String>, database: impl Into<String>, database_type: DatabaseType) -> Self {
        Self {
            server: server.into(),
            database: database.into(),
            database_type,
        }
    }

    /// Whether both access points resolve to the same physical server.
    ///
    /// Server names compare case-insensitively; the database is ignored.
    pub fn is_same_server(&self, other: &DataAccessPoint) -> bool {
        self.database_type == other.database_type && self.server.eq_ignore_ascii_case(&other.server)
    }

    /// The syntax helper for this access point's backend.
    pub fn syntax(&self) -> QuerySyntaxHelper {
        self.database_type.syntax()
    }
}

/// How sibling sub-queries in a container are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SetOperation {
    /// Identifiers in any child.
    Union,
    /// Identifiers in every child.
    Intersect,
    /// Identifiers in the first child and none of the others.
    Except,
}

impl std::fmt::Display for SetOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetOperation::Union => write!(f, "UNION"),
            SetOperation::Intersect => write!(f, "INTERSECT"),
            SetOperation::Except => write!(f, "EXCEPT"),
        }
    }
}

/// The kind of result cached for an aggregate configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AggregateOperation {
    /// The distinct patient identifiers a cohort sub-query returns.
    IndexedExtractionIdentifierList,
    /// A patient index table used by sibling sub-queries.
    JoinableInceptionQuery,
    /// A graph/summary result.
    ExtractableAggregateResults,
}

impl AggregateOperation {
    /// The deterministic name of the table backing a cached result.
    ///
    /// ```rust
    /// use cohort_query::AggregateOperation;
    ///
    /// assert_eq!(
    ///     AggregateOperation::IndexedExtractionIdentifierList.table_name(42),
    ///     "IndexedExtractionIdentifierList_AggregateConfiguration42"
    /// );
    /// ```
    pub fn table_name(&self, configuration_id: i32) -> String {
        format!("{self}_AggregateConfiguration{configuration_id}")
    }

    /// Parses the stored operation name.
    pub fn from_name(name: &str) -> Option<Self> {
        [
            AggregateOperation::IndexedExtractionIdentifierList,
            AggregateOperation::JoinableInceptionQuery,
            AggregateOperation::ExtractableAggregateResults,
        ]
        .into_iter()
        .find(|op| op.to_string().eq_ignore_ascii_case(name.trim()))
    }
}

impl std::fmt::Display for AggregateOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregateOperation::IndexedExtractionIdentifierList => {
                write!(f, "IndexedExtractionIdentifierList")
            }
            AggregateOperation::JoinableInceptionQuery => write!(f, "JoinableInceptionQuery"),
            AggregateOperation::ExtractableAggregateResults => {
                write!(f, "ExtractableAggregateResults")
            }
        }
    }
}

/// One cohort sub-query: SQL that returns a single column of patient
/// identifiers.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateConfiguration {
    /// Repository identifier, used for cache keys.
    pub id: i32,
    /// Display name.
    pub name: String,
    /// `SELECT DISTINCT <identifier> FROM ...` text, without parameter
    /// declarations.
    pub identifier_sql: String,
    /// Parameters declared by the sub-query and its filters.
    pub parameters: Vec<DeclaredParameter>,
    /// The server and database the sub-query reads.
    pub data_access_point: DataAccessPoint,
}

impl AggregateConfiguration {
    /// Creates a sub-query without parameters.
    pub fn new(
        id: i32,
        name: impl Into<String>,
        identifier_sql: impl Into<String>,
        data_access_point: DataAccessPoint,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            identifier_sql: identifier_sql.into(),
            parameters: Vec::new(),
            data_access_point,
        }
    }

    /// Adds a parameter.
    pub fn with_parameter(mut self, parameter: DeclaredParameter) -> Self {
        self.parameters.push(parameter);
        self
    }
}

/// A child of a [`CohortContainer`].
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerChild {
    /// A leaf sub-query.
    Aggregate(AggregateConfiguration),
    /// A nested container.
    Container(CohortContainer),
}

/// A set operation over an ordered list of children.
#[derive(Debug, Clone, PartialEq)]
pub struct CohortContainer {
    /// Repository identifier.
    pub id: i32,
    /// Display name.
    pub name: String,
    /// How the children are combined.
    pub operation: SetOperation,
    /// Children in evaluation order. For [`SetOperation::Except`] the first
    /// child is the one the others are subtracted from.
    pub children: Vec<ContainerChild>,
}

impl CohortContainer {
    /// Creates an empty container.
    pub fn new(id: i32, name: impl Into<String>, operation: SetOperation) -> Self {
        Self {
            id,
            name: name.into(),
            operation,
            children: Vec::new(),
        }
    }

    /// Appends a sub-query.
    pub fn with_aggregate(mut self, aggregate: AggregateConfiguration) -> Self {
        self.children.push(ContainerChild::Aggregate(aggregate));
        self
    }

    /// Appends a nested container.
    pub fn with_container(mut self, container: CohortContainer) -> Self {
        self.children.push(ContainerChild::Container(container));
        self
    }

    /// Every sub-query beneath this container, depth first.
    pub fn aggregates(&self) -> Vec<&AggregateConfiguration> {
        let mut found = Vec::new();
        self.collect_aggregates(&mut found);
        found
    }

    fn collect_aggregates<'a>(&'a self, found: &mut Vec<&'a AggregateConfiguration>) {
        for child in &self.children {
            match child {
                ContainerChild::Aggregate(aggregate) => found.push(aggregate),
                ContainerChild::Container(container) => container.collect_aggregates(found),
            }
        }
    }

    /// Whether the container has no sub-queries anywhere beneath it.
    pub fn is_empty(&self) -> bool {
        self.aggregates().is_empty()
    }
}
