//! Extraction query assembly.
//!
//! The query selects every released column of a dataset, joined to the
//! selected cohort:
//!
//! ```text
//! <parameter declarations>
//! SELECT DISTINCT
//! <columns, identifiers replaced by release identifiers>
//! FROM
//! <dataset table>
//! INNER JOIN <cohort table> ON <dataset identifier>=<cohort private identifier>
//! WHERE
//! <dataset filters, AND-ed>
//! AND
//! <cohort table>.<definition column>=<cohort definition id>
//! ```
//!
//! Dataset references use the dataset's dialect and cohort references use
//! the cohort's, so a cross-server source can find and replace the latter.

use cohort_query::{DatabaseType, DeclaredParameter, ParameterManager, ParameterScope, QuerySyntaxHelper};
use log::debug;

use crate::error::{ExtractionError, ExtractionResult};
use crate::linkage::ExtractionLinkage;
use crate::model::{ExtractableColumn, ExtractionRequest};

/// A built extraction query.
#[derive(Debug, Clone)]
pub struct ExtractionQuery {
    /// SQL to run against the dataset's server.
    pub sql: String,
    /// How the dataset was linked to the cohort.
    pub linkage: ExtractionLinkage,
    /// Parameters declared ahead of the query.
    pub parameters: ParameterManager,
}

/// Builds extraction queries.
#[derive(Debug, Clone, Default)]
pub struct ExtractionQueryBuilder {
    row_limit: Option<usize>,
}

impl ExtractionQueryBuilder {
    /// Creates a builder returning every row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the number of rows returned.
    pub fn with_row_limit(mut self, rows: usize) -> Self {
        self.row_limit = Some(rows);
        self
    }

    /// Builds the query for one dataset of an extraction configuration.
    pub fn build(&self, request: &ExtractionRequest) -> ExtractionResult<ExtractionQuery> {
        let configuration = &request.configuration;
        let dataset = &request.dataset;
        let cohort = configuration
            .cohort
            .as_ref()
            .ok_or(ExtractionError::MissingCohort {
                configuration_id: configuration.id,
            })?;

        let syntax = dataset.data_access_point.syntax();
        let linkage = ExtractionLinkage::new(dataset, cohort)?;

        let mut parameters = ParameterManager::new();
        if syntax.supports_embedded_parameters() {
            parameters.add(DeclaredParameter::declare(
                &syntax,
                "CohortDefinitionID",
                "int",
                cohort.cohort_definition_id.to_string(),
                format!("The ID of the cohort in {}", cohort.fully_qualified_table()),
                ParameterScope::Global,
            ));
            parameters.add(DeclaredParameter::declare(
                &syntax,
                "ProjectNumber",
                "int",
                configuration.project_number.to_string(),
                "The project number of the project being extracted",
                ParameterScope::Global,
            ));
        }
        for parameter in &configuration.global_parameters {
            parameters.add(parameter.with_scope(ParameterScope::Global));
        }
        for filter in &dataset.filters {
            for parameter in &filter.parameters {
                parameters.add(parameter.with_scope(ParameterScope::QueryLevel));
            }
        }

        let salt = configuration.hashing.as_ref().and_then(|h| h.salt());
        let columns = dataset
            .columns
            .iter()
            .map(|column| select_sql(column, &linkage, &syntax, salt))
            .collect::<ExtractionResult<Vec<_>>>()?;

        let mut sql = parameters.declaration_block(&syntax);
        sql.push_str("SELECT DISTINCT ");
        if let (Some(rows), DatabaseType::MicrosoftSqlServer) = (self.row_limit, syntax.database_type()) {
            sql.push_str(&format!("TOP {rows} "));
        }
        sql.push('\n');
        sql.push_str(&columns.join(",\n"));
        sql.push_str(&format!("\nFROM \n{}\n{}\nWHERE\n", linkage.dataset_table(), linkage.join_sql()));
        for filter in &dataset.filters {
            sql.push_str(&format!("/*{}*/\n({})\nAND\n", filter.name, filter.where_sql));
        }
        sql.push_str(&format!("{}={}", cohort.definition_sql(), cohort.cohort_definition_id));
        match (self.row_limit, syntax.database_type()) {
            (Some(rows), DatabaseType::MySql) => sql.push_str(&format!("\nLIMIT {rows}")),
            (Some(rows), DatabaseType::Oracle) => sql.push_str(&format!("\nFETCH FIRST {rows} ROWS ONLY")),
            _ => {}
        }

        debug!(
            "built extraction query for dataset '{}' with {} identifier substitution(s)",
            dataset.name,
            linkage.substitutions().len()
        );

        Ok(ExtractionQuery {
            sql,
            linkage,
            parameters,
        })
    }
}

fn select_sql(
    column: &ExtractableColumn,
    linkage: &ExtractionLinkage,
    syntax: &QuerySyntaxHelper,
    salt: Option<&str>,
) -> ExtractionResult<String> {
    if let Some(substitution) = linkage.substitution_for(&column.select_sql) {
        return Ok(substitution.select_sql());
    }

    if column.hash_on_release {
        let name = column.runtime_name(syntax);
        let salt = salt.ok_or_else(|| ExtractionError::MissingSalt { column: name.clone() })?;
        return Ok(format!("{} AS {name}", syntax.hash_expression(&column.select_sql, salt)));
    }

    Ok(match &column.alias {
        Some(alias) => format!("{} AS {alias}", column.select_sql),
        None => column.select_sql.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HashingConfig;
    use crate::model::{DatasetFilter, ExtractableCohort, ExtractableDataset, ExtractionConfiguration};
    use cohort_query::DataAccessPoint;

    fn request(database_type: DatabaseType) -> ExtractionRequest {
        let point = DataAccessPoint::new("live01", "biochem", database_type);
        let syntax = point.syntax();
        let dataset = ExtractableDataset::new("biochemistry", point.clone(), "tests")
            .with_column(ExtractableColumn::new(syntax.ensure_fully_qualified_column("biochem", "tests", "chi")).identifier())
            .with_column(ExtractableColumn::new(syntax.ensure_fully_qualified_column("biochem", "tests", "result")));
        let cohort = ExtractableCohort::new(12, DataAccessPoint::new("live01", "cohorts", database_type), "Cohort");
        ExtractionRequest::new(ExtractionConfiguration::new(1, 4021).with_cohort(cohort), dataset)
    }

    #[test]
    fn test_sql_server_query() {
        let query = ExtractionQueryBuilder::new().build(&request(DatabaseType::MicrosoftSqlServer)).unwrap();
        assert_eq!(
            query.sql,
            "/*The ID of the cohort in [cohorts]..[Cohort]*/\n\
             DECLARE @CohortDefinitionID AS int;\n\
             SET @CohortDefinitionID=12;\n\
             /*The project number of the project being extracted*/\n\
             DECLARE @ProjectNumber AS int;\n\
             SET @ProjectNumber=4021;\n\
             SELECT DISTINCT \n\
             [cohorts]..[Cohort].[ReleaseID] AS chi,\n\
             [biochem]..[tests].[result]\n\
             FROM \n\
             [biochem]..[tests]\n\
             INNER JOIN [cohorts]..[Cohort] ON [biochem]..[tests].[chi]=[cohorts]..[Cohort].[PrivateID]\n\
             WHERE\n\
             [cohorts]..[Cohort].[cohortDefinition_id]=12"
        );
        assert_eq!(query.parameters.len(), 2);
    }

    #[test]
    fn test_oracle_query_has_no_declarations() {
        let query = ExtractionQueryBuilder::new().build(&request(DatabaseType::Oracle)).unwrap();
        assert!(query.sql.starts_with("SELECT DISTINCT"));
        assert!(!query.sql.contains("CohortDefinitionID"));
        assert!(query.sql.ends_with("\"COHORTS\".\"COHORT\".\"COHORTDEFINITION_ID\"=12"));
        assert!(query.parameters.is_empty());
    }

    #[test]
    fn test_filters_and_parameters() {
        let mut request = request(DatabaseType::MicrosoftSqlServer);
        let syntax = request.dataset.data_access_point.syntax();
        request.dataset = request.dataset.with_filter(
            DatasetFilter::new("recent only", "[biochem]..[tests].[year] >= @since").with_parameter(
                DeclaredParameter::declare(&syntax, "since", "int", "2015", "first year", ParameterScope::TableInfo),
            ),
        );
        request.configuration = request.configuration.with_global_parameter(DeclaredParameter::declare(
            &syntax,
            "since",
            "int",
            "2019",
            "project-wide start",
            ParameterScope::TableInfo,
        ));

        let query = ExtractionQueryBuilder::new().build(&request).unwrap();
        assert!(query
            .sql
            .contains("WHERE\n/*recent only*/\n([biochem]..[tests].[year] >= @since)\nAND\n[cohorts]..[Cohort].[cohortDefinition_id]=12"));
        assert!(query.sql.contains("SET @since=2019;"));
        assert!(!query.sql.contains("SET @since=2015;"));
        assert_eq!(query.parameters.get_final_resolved_parameters_list().len(), 3);
    }

    #[test]
    fn test_engine_constants_win_over_configuration_globals() {
        let mut request = request(DatabaseType::MicrosoftSqlServer);
        let syntax = request.dataset.data_access_point.syntax();
        request.configuration = request.configuration.with_global_parameter(DeclaredParameter::declare(
            &syntax,
            "ProjectNumber",
            "int",
            "1",
            "stale",
            ParameterScope::Global,
        ));
        let query = ExtractionQueryBuilder::new().build(&request).unwrap();
        assert!(query.sql.contains("SET @ProjectNumber=4021;"));
        assert!(!query.sql.contains("SET @ProjectNumber=1;"));
    }

    #[test]
    fn test_hashed_column_requires_salt() {
        let mut request = request(DatabaseType::MySql);
        request.dataset = request
            .dataset
            .with_column(ExtractableColumn::new("`biochem`.`tests`.`lab_number`").hashed());

        let err = ExtractionQueryBuilder::new().build(&request).unwrap_err();
        assert!(matches!(err, ExtractionError::MissingSalt { ref column } if column == "lab_number"));

        request.configuration = request.configuration.with_hashing(HashingConfig::new("pepper"));
        let query = ExtractionQueryBuilder::new().build(&request).unwrap();
        assert!(query
            .sql
            .contains("SHA2(CONCAT(`biochem`.`tests`.`lab_number`, 'pepper'), 256) AS lab_number"));
    }

    #[test]
    fn test_missing_cohort() {
        let mut request = request(DatabaseType::MicrosoftSqlServer);
        request.configuration.cohort = None;
        let err = ExtractionQueryBuilder::new().build(&request).unwrap_err();
        assert!(matches!(err, ExtractionError::MissingCohort { configuration_id: 1 }));
    }

    #[test]
    fn test_row_limit_per_dialect() {
        let builder = ExtractionQueryBuilder::new().with_row_limit(10);
        assert!(builder
            .build(&request(DatabaseType::MicrosoftSqlServer))
            .unwrap()
            .sql
            .contains("SELECT DISTINCT TOP 10 \n"));
        assert!(builder.build(&request(DatabaseType::MySql)).unwrap().sql.ends_with("\nLIMIT 10"));
        assert!(builder
            .build(&request(DatabaseType::Oracle))
            .unwrap()
            .sql
            .ends_with("\nFETCH FIRST 10 ROWS ONLY"));
    }
}
