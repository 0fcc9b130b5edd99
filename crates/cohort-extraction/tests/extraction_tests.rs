//! Integration tests for extraction sources.
//!
//! The cohort lives on a SQL Server and, for cross-server tests, the dataset
//! on a MySQL server. Both are in-process [`MemoryServer`]s.

#![cfg(feature = "cross-server")]

use std::sync::Arc;
use std::time::Duration;

use cohort_extraction::{
    select_extraction_source, CrossServerConfig, CrossServerExtractionSource, CrossServerGate,
    DatasetExtractionSource, ExtractableCohort, ExtractableColumn, ExtractableDataset, ExtractionConfiguration,
    ExtractionError, ExtractionRequest, ExtractionSource,
};
use cohort_query::{DataAccessPoint, DatabaseType};
use cohort_query_executor::{
    CollectingProgressSink, DataTable, DiscoveredServer, MemoryServer, ProgressLevel, StaticServerResolver, Value,
};
use test_log::test;

fn cohort_server() -> MemoryServer {
    let server = MemoryServer::new("cohort01", DatabaseType::MicrosoftSqlServer);
    server.respond_containing(
        "FROM [cohorts]..[Cohort] WHERE",
        DataTable::with_rows(
            vec!["PrivateID".into(), "ReleaseID".into(), "cohortDefinition_id".into()],
            vec![
                vec![Value::from("0101"), Value::from("R01"), Value::from(5)],
                vec![Value::from("0202"), Value::from("R02"), Value::from(5)],
            ],
        ),
    );
    server
}

fn dataset_server() -> MemoryServer {
    let server = MemoryServer::new("live01", DatabaseType::MySql);
    server.respond_containing(
        "INNER JOIN `tempdb`.`Cohort`",
        DataTable::with_rows(
            vec!["chi".into(), "result".into()],
            vec![vec![Value::from("R01"), Value::from(42)]],
        ),
    );
    server
}

fn cohort() -> ExtractableCohort {
    ExtractableCohort::new(
        5,
        DataAccessPoint::new("cohort01", "cohorts", DatabaseType::MicrosoftSqlServer),
        "Cohort",
    )
}

fn mysql_dataset() -> ExtractableDataset {
    ExtractableDataset::new(
        "biochemistry",
        DataAccessPoint::new("live01", "biochem", DatabaseType::MySql),
        "tests",
    )
    .with_column(ExtractableColumn::new("`biochem`.`tests`.`chi`").identifier())
    .with_column(ExtractableColumn::new("`biochem`.`tests`.`result`"))
}

fn request() -> ExtractionRequest {
    ExtractionRequest::new(ExtractionConfiguration::new(1, 77).with_cohort(cohort()), mysql_dataset())
}

fn resolver(servers: &[&MemoryServer]) -> Arc<StaticServerResolver> {
    Arc::new(
        servers
            .iter()
            .fold(StaticServerResolver::new(), |r, s| r.with_server(s.shared())),
    )
}

#[test(tokio::test)]
async fn test_cross_server_copy_and_teardown_of_created_database() {
    let cohorts = cohort_server();
    let live = dataset_server();
    let gate = CrossServerGate::new();
    let sink = Arc::new(CollectingProgressSink::new());

    let mut source = CrossServerExtractionSource::new(request(), resolver(&[&cohorts, &live]), gate.clone())
        .with_progress_sink(sink.clone());

    let chunk = source.get_chunk().await.unwrap().unwrap();
    assert_eq!(chunk.data.row_count(), 1);
    assert!(chunk.warnings.is_empty());
    assert!(chunk.sql.contains("`tempdb`.`Cohort`.`ReleaseID` AS chi"));
    assert!(!chunk.sql.contains("[cohorts]"));

    let copied = live.table("tempdb", "Cohort").unwrap();
    assert_eq!(copied.data.row_count(), 2);
    let state = source.copy_state().unwrap();
    assert!(state.created_database);
    assert_eq!(state.tables_created, vec!["Cohort".to_string()]);
    assert!(gate.is_held());

    assert!(source.get_chunk().await.unwrap().is_none());

    source.dispose().await.unwrap();
    assert!(!live.has_database("tempdb"));
    assert!(!gate.is_held());
    assert!(sink.at_least(ProgressLevel::Warning).is_empty());
}

#[test(tokio::test)]
async fn test_teardown_of_existing_database_drops_only_created_tables() {
    let cohorts = cohort_server();
    let live = dataset_server()
        .with_table("tempdb", "keep_me", DataTable::single_column("x", ["1"]));

    let mut source =
        CrossServerExtractionSource::new(request(), resolver(&[&cohorts, &live]), CrossServerGate::new());
    source.get_chunk().await.unwrap();
    assert!(!source.copy_state().unwrap().created_database);

    source.dispose().await.unwrap();
    assert!(live.has_database("tempdb"));
    assert!(live.table("tempdb", "keep_me").is_some());
    assert!(live.table("tempdb", "Cohort").is_none());
}

#[test(tokio::test)]
async fn test_missing_temporary_database_when_creation_disabled() {
    let cohorts = cohort_server();
    let live = dataset_server();
    let gate = CrossServerGate::new();

    let mut source = CrossServerExtractionSource::new(request(), resolver(&[&cohorts, &live]), gate.clone())
        .with_config(CrossServerConfig::builder().with_create_database(false).build());

    let err = source.get_chunk().await.unwrap_err();
    assert!(matches!(err, ExtractionError::TemporaryDatabaseMissing { ref database, .. } if database == "tempdb"));
    assert!(!live.has_database("tempdb"));

    source.dispose().await.unwrap();
    assert!(!gate.is_held());
}

#[test(tokio::test)]
async fn test_existing_cohort_table_policy() {
    let cohorts = cohort_server();
    let live = dataset_server().with_table("tempdb", "Cohort", DataTable::single_column("stale", ["x"]));

    let mut refusing =
        CrossServerExtractionSource::new(request(), resolver(&[&cohorts, &live]), CrossServerGate::new());
    let err = refusing.get_chunk().await.unwrap_err();
    assert!(matches!(err, ExtractionError::CohortTableExists { .. }));
    refusing.dispose().await.unwrap();
    // nothing was created, so the stale table is left alone
    assert!(live.table("tempdb", "Cohort").is_some());

    let mut replacing =
        CrossServerExtractionSource::new(request(), resolver(&[&cohorts, &live]), CrossServerGate::new())
            .with_config(CrossServerConfig::builder().with_drop_existing_table(true).build());
    replacing.get_chunk().await.unwrap();
    let copied = live.table("tempdb", "Cohort").unwrap();
    assert_eq!(copied.data.columns()[0], "PrivateID");
    replacing.dispose().await.unwrap();
}

#[test(tokio::test)]
async fn test_dispose_runs_once() {
    let cohorts = cohort_server();
    let live = dataset_server();

    let mut source =
        CrossServerExtractionSource::new(request(), resolver(&[&cohorts, &live]), CrossServerGate::new());
    source.get_chunk().await.unwrap();
    source.dispose().await.unwrap();

    // a second teardown would drop the recreated database
    live.create_database("tempdb").await.unwrap();
    source.dispose().await.unwrap();
    assert!(live.has_database("tempdb"));
    assert!(source.get_chunk().await.unwrap().is_none());
}

#[test(tokio::test)]
async fn test_preview_and_check_unsupported() {
    let cohorts = cohort_server();
    let live = dataset_server();
    let mut source =
        CrossServerExtractionSource::new(request(), resolver(&[&cohorts, &live]), CrossServerGate::new());

    assert!(matches!(
        source.preview(10).await.unwrap_err(),
        ExtractionError::UnsupportedInCrossServerMode("preview")
    ));
    assert!(matches!(
        source.check().unwrap_err(),
        ExtractionError::UnsupportedInCrossServerMode("check")
    ));
    assert!(live.executed_sql().is_empty());
    assert!(cohorts.executed_sql().is_empty());
}

#[test(tokio::test)]
async fn test_gate_serializes_copies() {
    let cohorts = cohort_server();
    let live = dataset_server();
    let gate = CrossServerGate::new();

    let mut first = CrossServerExtractionSource::new(request(), resolver(&[&cohorts, &live]), gate.clone());
    first.get_chunk().await.unwrap();

    let mut second = CrossServerExtractionSource::new(request(), resolver(&[&cohorts, &live]), gate.clone());
    let waiting = tokio::spawn(async move {
        let chunk = second.get_chunk().await;
        (second, chunk)
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiting.is_finished());
    assert_eq!(live.table_names("tempdb"), vec!["cohort".to_string()]);

    first.dispose().await.unwrap();
    let (mut second, chunk) = waiting.await.unwrap();
    assert_eq!(chunk.unwrap().unwrap().data.row_count(), 1);
    assert!(gate.is_held());

    second.dispose().await.unwrap();
    assert!(!gate.is_held());
    assert!(!live.has_database("tempdb"));
}

#[test(tokio::test)]
async fn test_linkage_dataset_across_servers() {
    let cohorts = cohort_server();
    let live = dataset_server();
    let dataset = ExtractableDataset::new(
        "births",
        DataAccessPoint::new("live01", "maternity", DatabaseType::MySql),
        "births",
    )
    .with_column(ExtractableColumn::new("`maternity`.`births`.`chi_mother`").identifier())
    .with_column(ExtractableColumn::new("`maternity`.`births`.`chi_baby`").identifier());
    let request = ExtractionRequest::new(ExtractionConfiguration::new(1, 77).with_cohort(cohort()), dataset);

    let mut source = CrossServerExtractionSource::new(request, resolver(&[&cohorts, &live]), CrossServerGate::new());
    let chunk = source.get_chunk().await.unwrap().unwrap();
    assert!(chunk.sql.contains(
        "ON `maternity`.`births`.`chi_mother`=`tempdb`.`Cohort`.`PrivateID` \
         OR `maternity`.`births`.`chi_baby`=`tempdb`.`Cohort`.`PrivateID`"
    ));
    source.dispose().await.unwrap();
}

#[test(tokio::test)]
async fn test_same_server_source_refuses_cross_server_request() {
    let cohorts = cohort_server();
    let live = dataset_server();
    let mut source = DatasetExtractionSource::new(request(), resolver(&[&cohorts, &live]));

    let err = source.get_chunk().await.unwrap_err();
    assert!(matches!(err, ExtractionError::DifferentServers { .. }));
    assert!(live.executed_sql().is_empty());
}

#[test(tokio::test)]
async fn test_source_selection_by_server() {
    let cohorts = cohort_server();
    let live = dataset_server();
    let gate = CrossServerGate::new();

    let cross = select_extraction_source(
        request(),
        resolver(&[&cohorts, &live]),
        &gate,
        CrossServerConfig::default(),
    )
    .unwrap();
    assert!(matches!(cross.check(), Err(ExtractionError::UnsupportedInCrossServerMode(_))));

    let mut same_server = request();
    same_server.configuration.cohort = Some(ExtractableCohort::new(
        5,
        DataAccessPoint::new("LIVE01", "cohorts", DatabaseType::MySql),
        "Cohort",
    ));
    let plain = select_extraction_source(same_server, resolver(&[&live]), &gate, CrossServerConfig::default())
        .unwrap();
    let query = plain.check().unwrap();
    assert!(query.sql.contains("INNER JOIN `cohorts`.`Cohort`"));
}
