//! Private-to-release identifier substitution.
//!
//! A dataset with a single identifier column joins the cohort on that column
//! and selects the cohort's release identifier in its place. A dataset with
//! several identifier columns (a mother and her baby in one row) cannot take
//! the release identifier from the joined row, since only one of the columns
//! matched it. Each identifier column is instead replaced by a correlated
//! sub-select against the cohort table, and the join matches any of them.

use crate::error::{ExtractionError, ExtractionResult};
use crate::model::{ExtractableCohort, ExtractableDataset};

/// Replacement of one identifier column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseIdentifierSubstitution {
    /// The dataset's private identifier expression.
    pub private_sql: String,
    /// Output name of the column.
    pub alias: String,
    /// Expression selected instead of `private_sql`.
    pub release_sql: String,
    /// Predicate joining this column to the cohort.
    pub join_predicate: String,
}

impl ReleaseIdentifierSubstitution {
    /// The select-list entry for this column.
    pub fn select_sql(&self) -> String {
        format!("{} AS {}", self.release_sql, self.alias)
    }
}

/// The substitutions linking a dataset to a cohort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionLinkage {
    substitutions: Vec<ReleaseIdentifierSubstitution>,
    cohort_table: String,
    dataset_table: String,
}

impl ExtractionLinkage {
    /// Links `dataset` to `cohort`.
    ///
    /// Fails when the dataset has no identifier column.
    pub fn new(dataset: &ExtractableDataset, cohort: &ExtractableCohort) -> ExtractionResult<Self> {
        let syntax = dataset.data_access_point.syntax();
        let identifiers = dataset.identifier_columns();
        if identifiers.is_empty() {
            return Err(ExtractionError::NoIdentifierColumn {
                dataset: dataset.name.clone(),
            });
        }

        let cohort_table = cohort.fully_qualified_table();
        let private = cohort.private_identifier_sql();
        let release = cohort.release_identifier_sql();

        let correlated = identifiers.len() > 1;
        let substitutions = identifiers
            .into_iter()
            .map(|column| {
                let release_sql = if correlated {
                    format!(
                        "(SELECT DISTINCT {release} FROM {cohort_table} WHERE {private}={} AND {}={})",
                        column.select_sql,
                        cohort.definition_sql(),
                        cohort.cohort_definition_id
                    )
                } else {
                    release.clone()
                };
                ReleaseIdentifierSubstitution {
                    private_sql: column.select_sql.clone(),
                    alias: column.runtime_name(&syntax),
                    release_sql,
                    join_predicate: format!("{}={private}", column.select_sql),
                }
            })
            .collect();

        Ok(Self {
            substitutions,
            cohort_table,
            dataset_table: dataset.fully_qualified_table(),
        })
    }

    /// One substitution per identifier column, in column order.
    pub fn substitutions(&self) -> &[ReleaseIdentifierSubstitution] {
        &self.substitutions
    }

    /// The substitution replacing `private_sql`, if it is an identifier.
    pub fn substitution_for(&self, private_sql: &str) -> Option<&ReleaseIdentifierSubstitution> {
        self.substitutions
            .iter()
            .find(|s| s.private_sql.eq_ignore_ascii_case(private_sql))
    }

    /// Fully qualified cohort table.
    pub fn cohort_table(&self) -> &str {
        &self.cohort_table
    }

    /// Fully qualified dataset table.
    pub fn dataset_table(&self) -> &str {
        &self.dataset_table
    }

    /// `INNER JOIN <cohort> ON <predicates>`, predicates OR-ed together.
    pub fn join_sql(&self) -> String {
        let predicates: Vec<&str> = self
            .substitutions
            .iter()
            .map(|s| s.join_predicate.as_str())
            .collect();
        format!("INNER JOIN {} ON {}", self.cohort_table, predicates.join(" OR "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExtractableColumn;
    use cohort_query::{DataAccessPoint, DatabaseType};

    fn cohort() -> ExtractableCohort {
        ExtractableCohort::new(
            12,
            DataAccessPoint::new("live01", "cohorts", DatabaseType::MicrosoftSqlServer),
            "Cohort",
        )
    }

    fn dataset() -> ExtractableDataset {
        ExtractableDataset::new(
            "births",
            DataAccessPoint::new("live01", "maternity", DatabaseType::MicrosoftSqlServer),
            "births",
        )
        .with_column(ExtractableColumn::new("[maternity]..[births].[weight]"))
    }

    #[test]
    fn test_no_identifier_is_error() {
        let err = ExtractionLinkage::new(&dataset(), &cohort()).unwrap_err();
        assert_eq!(err.to_string(), "dataset 'births' has no column marked as identifier");
    }

    #[test]
    fn test_single_identifier() {
        let dataset = dataset().with_column(ExtractableColumn::new("[maternity]..[births].[chi]").identifier());
        let linkage = ExtractionLinkage::new(&dataset, &cohort()).unwrap();

        assert_eq!(linkage.substitutions().len(), 1);
        assert_eq!(
            linkage.substitutions()[0].select_sql(),
            "[cohorts]..[Cohort].[ReleaseID] AS chi"
        );
        assert_eq!(
            linkage.join_sql(),
            "INNER JOIN [cohorts]..[Cohort] ON [maternity]..[births].[chi]=[cohorts]..[Cohort].[PrivateID]"
        );
        assert!(!linkage.join_sql().contains(" OR "));
    }

    #[test]
    fn test_multiple_identifiers_or_joined() {
        let dataset = dataset()
            .with_column(ExtractableColumn::new("[maternity]..[births].[chi_mother]").identifier())
            .with_column(ExtractableColumn::new("[maternity]..[births].[chi_baby]").identifier());
        let linkage = ExtractionLinkage::new(&dataset, &cohort()).unwrap();

        assert_eq!(linkage.substitutions().len(), 2);
        assert_eq!(linkage.join_sql().matches(" OR ").count(), 1);
        assert_eq!(
            linkage.substitutions()[1].release_sql,
            "(SELECT DISTINCT [cohorts]..[Cohort].[ReleaseID] FROM [cohorts]..[Cohort] \
             WHERE [cohorts]..[Cohort].[PrivateID]=[maternity]..[births].[chi_baby] \
             AND [cohorts]..[Cohort].[cohortDefinition_id]=12)"
        );
        assert_eq!(
            linkage
                .substitution_for("[maternity]..[births].[chi_mother]")
                .map(|s| s.alias.as_str()),
            Some("chi_mother")
        );
        assert!(linkage.substitution_for("[maternity]..[births].[weight]").is_none());
    }
}
