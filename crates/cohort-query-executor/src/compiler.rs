//! Compiling a cohort tree into executable sub-query tasks.
//!
//! Every aggregate configuration becomes one task running its identifier SQL
//! (or a read of its cached result). Every non-empty container becomes one
//! task running its children's SQL combined with the container's set
//! operation. Cancellation tokens mirror the tree: cancelling a container's
//! task cancels every task beneath it.

use std::collections::HashMap;
use std::sync::Arc;

use cohort_query::{
    AggregateConfiguration, AggregateOperation, CohortContainer, ContainerChild, DeclaredParameter,
    ParameterManager, ParameterScope, QuerySyntaxHelper,
};
use log::{debug, error, info};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheCommitArguments, CachedResultsManager, CachedTable};
use crate::config::ExecutorConfig;
use crate::error::{CohortExecutionError, CohortResult};
use crate::notify::{NoOpProgressSink, ProgressSink};
use crate::selection::select_execution_server;
use crate::task::{CohortQueryTask, TaskDefinition, TaskState};
use crate::traits::{DiscoveredServer, ServerResolver};

/// Builds [`CompiledCohort`]s from cohort container trees.
///
/// # Example
///
/// ```ignore
/// let compiler = CohortCompiler::new(resolver)
///     .with_config(ExecutorConfig::builder().with_cumulative_totals(true).build())
///     .with_cache_server(cache_server);
///
/// let compiled = compiler.compile(&root).await?;
/// compiled.execute_all().await;
/// compiler.commit_to_cache(&compiled).await?;
/// ```
pub struct CohortCompiler {
    resolver: Arc<dyn ServerResolver>,
    config: ExecutorConfig,
    cache: Option<Arc<CachedResultsManager>>,
    global_parameters: Vec<DeclaredParameter>,
    progress_sink: Arc<dyn ProgressSink>,
}

/// Per-aggregate results of the asynchronous lookup pass.
struct PreparedAggregate {
    server: Arc<dyn DiscoveredServer>,
    parameters: ParameterManager,
    cached: Option<CachedTable>,
}

/// A compiled node whose task has not been created yet.
struct CompiledNode {
    name: String,
    sql: String,
    parameters: ParameterManager,
    syntax: QuerySyntaxHelper,
    live_servers: Vec<Arc<dyn DiscoveredServer>>,
    total: usize,
    cached: usize,
    token: CancellationToken,
    cache_candidate: Option<i32>,
}

impl CompiledNode {
    fn count_sql(&self) -> String {
        format!("{}{}", self.parameters.declaration_block(&self.syntax), self.sql)
    }
}

/// Servers and counts a cumulative query spans.
struct Span {
    live_servers: Vec<Arc<dyn DiscoveredServer>>,
    total: usize,
    cached: usize,
}

#[derive(Default)]
struct TaskCollector {
    tasks: Vec<Arc<CohortQueryTask>>,
    cache_candidates: Vec<(i32, Arc<CohortQueryTask>)>,
}

impl CohortCompiler {
    /// Creates a compiler with caching disabled.
    pub fn new(resolver: Arc<dyn ServerResolver>) -> Self {
        Self {
            resolver,
            config: ExecutorConfig::default(),
            cache: None,
            global_parameters: Vec::new(),
            progress_sink: Arc::new(NoOpProgressSink),
        }
    }

    /// Sets the configuration. Call before [`Self::with_cache_server`], which
    /// reads the cache settings from it.
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Enables caching on `server`, with the index kept on that server.
    pub fn with_cache_server(mut self, server: Arc<dyn DiscoveredServer>) -> Self {
        self.cache = Some(Arc::new(CachedResultsManager::with_sql_index(server, &self.config.cache)));
        self
    }

    /// Enables caching through an existing manager.
    pub fn with_cache_manager(mut self, manager: Arc<CachedResultsManager>) -> Self {
        self.cache = Some(manager);
        self
    }

    /// Adds a parameter declared for every sub-query.
    pub fn with_global_parameter(mut self, parameter: DeclaredParameter) -> Self {
        self.global_parameters.push(parameter.with_scope(ParameterScope::Global));
        self
    }

    /// Reports task progress to `sink`.
    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress_sink = sink;
        self
    }

    /// The cache manager, when caching is enabled.
    pub fn cache(&self) -> Option<&Arc<CachedResultsManager>> {
        self.cache.as_ref()
    }

    fn cache_server(&self) -> Option<&Arc<dyn DiscoveredServer>> {
        self.cache.as_ref().map(|c| c.server())
    }

    fn global_manager(&self) -> ParameterManager {
        let mut manager = ParameterManager::new();
        manager.add_all(self.global_parameters.iter().cloned());
        manager
    }

    /// Compiles `root` into tasks.
    ///
    /// Fails when the tree holds no sub-queries, when a data access point
    /// cannot be resolved, or when a node's SQL cannot run on one server.
    pub async fn compile(&self, root: &CohortContainer) -> CohortResult<CompiledCohort> {
        let aggregates = root.aggregates();
        if aggregates.is_empty() {
            return Err(CohortExecutionError::configuration(format!(
                "cohort container '{}' has no sub-queries",
                root.name
            )));
        }

        let mut prepared = HashMap::with_capacity(aggregates.len());
        for aggregate in aggregates {
            let entry = self.prepare(aggregate).await?;
            prepared.insert(aggregate.id, entry);
        }

        let root_token = CancellationToken::new();
        let mut collector = TaskCollector::default();
        let node = self
            .compile_container(root, root_token.clone(), &prepared, &mut collector)?
            .ok_or_else(|| {
                CohortExecutionError::configuration(format!(
                    "cohort container '{}' has no sub-queries",
                    root.name
                ))
            })?;

        let root_task = self.make_task(node, None, true, &mut collector)?;
        info!(
            "Compiled cohort '{}' into {} tasks ({} cached sub-queries)",
            root.name,
            collector.tasks.len(),
            root_task.cached_subqueries()
        );

        Ok(CompiledCohort {
            root: root_task,
            tasks: collector.tasks,
            root_token,
            cache_candidates: collector.cache_candidates,
        })
    }

    async fn prepare(&self, aggregate: &AggregateConfiguration) -> CohortResult<PreparedAggregate> {
        let server = self.resolver.resolve(&aggregate.data_access_point)?;
        let syntax = server.syntax();

        let mut parameters = self.global_manager();
        parameters.add_all(aggregate.parameters.iter().cloned());

        let cached = match &self.cache {
            Some(cache) => {
                let sql = format!("{}{}", parameters.declaration_block(&syntax), aggregate.identifier_sql);
                cache
                    .get_latest_results_table(aggregate.id, AggregateOperation::IndexedExtractionIdentifierList, &sql)
                    .await?
            }
            None => None,
        };
        if cached.is_some() {
            debug!("'{}' will be read from cache", aggregate.name);
        }

        Ok(PreparedAggregate {
            server,
            parameters,
            cached,
        })
    }

    fn compile_aggregate(
        &self,
        aggregate: &AggregateConfiguration,
        token: CancellationToken,
        prepared: &HashMap<i32, PreparedAggregate>,
    ) -> CohortResult<CompiledNode> {
        let entry = prepared.get(&aggregate.id).ok_or_else(|| {
            CohortExecutionError::configuration(format!(
                "aggregate configuration {} was not prepared",
                aggregate.id
            ))
        })?;

        match (&entry.cached, &self.cache) {
            (Some(table), Some(cache)) => Ok(CompiledNode {
                name: aggregate.name.clone(),
                sql: cache.cached_table_sql(table),
                parameters: ParameterManager::new(),
                syntax: cache.server().syntax(),
                live_servers: Vec::new(),
                total: 1,
                cached: 1,
                token,
                cache_candidate: None,
            }),
            _ => Ok(CompiledNode {
                name: aggregate.name.clone(),
                sql: aggregate.identifier_sql.clone(),
                parameters: entry.parameters.clone(),
                syntax: entry.server.syntax(),
                live_servers: vec![Arc::clone(&entry.server)],
                total: 1,
                cached: 0,
                token,
                cache_candidate: Some(aggregate.id),
            }),
        }
    }

    fn compile_container(
        &self,
        container: &CohortContainer,
        token: CancellationToken,
        prepared: &HashMap<i32, PreparedAggregate>,
        collector: &mut TaskCollector,
    ) -> CohortResult<Option<CompiledNode>> {
        let mut children = Vec::with_capacity(container.children.len());
        for child in &container.children {
            let node = match child {
                ContainerChild::Aggregate(aggregate) => {
                    Some(self.compile_aggregate(aggregate, token.child_token(), prepared)?)
                }
                ContainerChild::Container(sub) => {
                    self.compile_container(sub, token.child_token(), prepared, collector)?
                }
            };
            children.extend(node);
        }

        if children.is_empty() {
            debug!("Skipping empty container '{}'", container.name);
            return Ok(None);
        }

        let mut parameters = self.global_manager();
        let parts: Vec<String> = children
            .iter()
            .map(|child| parameters.import_and_elevate(&child.parameters, &child.sql))
            .collect();

        let live_servers: Vec<Arc<dyn DiscoveredServer>> = children
            .iter()
            .flat_map(|c| c.live_servers.iter().cloned())
            .collect();
        let total = children.iter().map(|c| c.total).sum();
        let cached = children.iter().map(|c| c.cached).sum();
        let server = select_execution_server(self.cache_server(), &live_servers, total, cached)?;
        let syntax = server.syntax();
        let keyword = syntax.set_operation_keyword(container.operation);

        let combine = |parts: &[String]| -> String {
            parts
                .iter()
                .map(|part| format!("(\n{part}\n)"))
                .collect::<Vec<_>>()
                .join(&format!("\n{keyword}\n"))
        };

        // the cumulative query of child i reads children 0..=i
        let mut spans = Vec::with_capacity(children.len());
        let mut running = Span {
            live_servers: Vec::new(),
            total: 0,
            cached: 0,
        };
        for child in &children {
            running.live_servers.extend(child.live_servers.iter().cloned());
            running.total += child.total;
            running.cached += child.cached;
            spans.push(Span {
                live_servers: running.live_servers.clone(),
                total: running.total,
                cached: running.cached,
            });
        }

        for (i, (child, span)) in children.into_iter().zip(spans).enumerate() {
            let cumulative = (self.config.include_cumulative_totals && i > 0).then(|| {
                let sql = format!(
                    "{}{}",
                    parameters.declaration_block(&syntax),
                    combine(&parts[..=i])
                );
                (sql, span)
            });
            self.make_task(child, cumulative, false, collector)?;
        }

        Ok(Some(CompiledNode {
            name: container.name.clone(),
            sql: combine(&parts),
            parameters,
            syntax,
            live_servers,
            total,
            cached,
            token,
            cache_candidate: None,
        }))
    }

    fn make_task(
        &self,
        node: CompiledNode,
        cumulative: Option<(String, Span)>,
        is_root: bool,
        collector: &mut TaskCollector,
    ) -> CohortResult<Arc<CohortQueryTask>> {
        let count_sql = node.count_sql();
        let (cumulative_sql, span) = match cumulative {
            Some((sql, span)) => (Some(sql), span),
            None => (
                None,
                Span {
                    live_servers: node.live_servers,
                    total: node.total,
                    cached: node.cached,
                },
            ),
        };

        let definition = TaskDefinition {
            name: node.name,
            count_sql,
            cumulative_sql,
            live_servers: span.live_servers,
            cache_server: self.cache_server().cloned(),
            total_subqueries: span.total,
            cached_subqueries: span.cached,
            is_root,
        };
        let task = Arc::new(
            CohortQueryTask::new(definition, node.token)?.with_progress_sink(Arc::clone(&self.progress_sink)),
        );

        if let Some(configuration_id) = node.cache_candidate {
            collector.cache_candidates.push((configuration_id, Arc::clone(&task)));
        }
        collector.tasks.push(Arc::clone(&task));
        Ok(task)
    }

    /// Stores the identifiers of every completed, uncached aggregate task.
    ///
    /// Returns how many results were committed.
    pub async fn commit_to_cache(&self, compiled: &CompiledCohort) -> CohortResult<usize> {
        let cache = self.cache.as_ref().ok_or_else(|| {
            CohortExecutionError::configuration("caching is not enabled on this compiler")
        })?;

        let mut committed = 0;
        for (configuration_id, task) in &compiled.cache_candidates {
            if task.state() != TaskState::Completed {
                continue;
            }
            let Some(identifiers) = task.identifiers() else {
                continue;
            };
            cache
                .commit_results(CacheCommitArguments::new(
                    *configuration_id,
                    AggregateOperation::IndexedExtractionIdentifierList,
                    task.count_sql(),
                    identifiers,
                ))
                .await?;
            committed += 1;
        }
        Ok(committed)
    }
}

/// The tasks compiled from one cohort tree.
#[derive(Debug)]
pub struct CompiledCohort {
    root: Arc<CohortQueryTask>,
    tasks: Vec<Arc<CohortQueryTask>>,
    root_token: CancellationToken,
    cache_candidates: Vec<(i32, Arc<CohortQueryTask>)>,
}

impl CompiledCohort {
    /// The task for the root container.
    pub fn root(&self) -> &Arc<CohortQueryTask> {
        &self.root
    }

    /// Every task, children before their container, the root last.
    pub fn tasks(&self) -> &[Arc<CohortQueryTask>] {
        &self.tasks
    }

    /// The task named `name`.
    pub fn task(&self, name: &str) -> Option<&Arc<CohortQueryTask>> {
        self.tasks.iter().find(|t| t.name() == name)
    }

    /// Number of aggregate tasks served from cache.
    pub fn cached_subqueries(&self) -> usize {
        self.root.cached_subqueries()
    }

    /// The token every task's token descends from.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.root_token
    }

    /// Cancels every task.
    ///
    /// Running tasks abort their backend command; tasks not yet started end
    /// `Cancelled` when executed.
    pub fn cancel(&self) {
        self.root.cancel();
    }

    /// Runs every task concurrently, returning each task's outcome in
    /// [`Self::tasks`] order.
    pub async fn execute_all(&self) -> Vec<(String, CohortResult<TaskState>)> {
        let mut set = JoinSet::new();
        for (index, task) in self.tasks.iter().enumerate() {
            let task = Arc::clone(task);
            set.spawn(async move { (index, task.execute().await) });
        }

        let mut outcomes: Vec<Option<CohortResult<TaskState>>> = self.tasks.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => error!("Cohort task stopped without a result: {e}"),
            }
        }

        self.tasks
            .iter()
            .zip(outcomes)
            .map(|(task, outcome)| {
                let name = task.name().to_string();
                let outcome = outcome.unwrap_or_else(|| Err(CohortExecutionError::TaskAborted(name.clone())));
                (name, outcome)
            })
            .collect()
    }
}
