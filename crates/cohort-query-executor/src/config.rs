//! Configuration types for the cohort executor.

/// Configuration for compiling and executing a cohort tree.
///
/// # Example
///
/// ```rust
/// use cohort_query_executor::{CacheConfig, ExecutorConfig};
///
/// let config = ExecutorConfig::builder()
///     .with_cache(CacheConfig::default())
///     .with_cumulative_totals(true)
///     .build();
/// ```
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    /// Where cached results live. Only used when a cache server is supplied.
    pub cache: CacheConfig,
    /// Whether each sub-query also runs a cumulative query combining it with
    /// the siblings before it.
    pub include_cumulative_totals: bool,
}

impl ExecutorConfig {
    /// Creates a new builder for ExecutorConfig.
    pub fn builder() -> ExecutorConfigBuilder {
        ExecutorConfigBuilder::default()
    }
}

/// Builder for ExecutorConfig.
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfigBuilder {
    cache: CacheConfig,
    include_cumulative_totals: bool,
}

impl ExecutorConfigBuilder {
    /// Sets the cache configuration.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Enables or disables cumulative totals.
    pub fn with_cumulative_totals(mut self, include: bool) -> Self {
        self.include_cumulative_totals = include;
        self
    }

    /// Builds the ExecutorConfig.
    pub fn build(self) -> ExecutorConfig {
        ExecutorConfig {
            cache: self.cache,
            include_cumulative_totals: self.include_cumulative_totals,
        }
    }
}

/// Where cached sub-query results are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Database on the cache server holding result tables and the index.
    pub database: String,
    /// Name of the index table.
    pub index_table: String,
    /// Recorded against each committed entry for auditing.
    pub committer: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            database: "CohortCache".to_string(),
            index_table: "CachedAggregateConfigurationResults".to_string(),
            committer: "cohort-query-executor".to_string(),
        }
    }
}
