//! Choosing the server a compiled sub-query runs against.

use std::sync::Arc;

use crate::error::{CohortExecutionError, CohortResult};
use crate::traits::DiscoveredServer;

/// Picks the server to run a (possibly composite) sub-query on.
///
/// * every sub-query beneath the node served from cache: the cache server;
/// * some cached: a server reaching both the cache server and every live
///   access point, which in practice means they are all the same physical
///   server, otherwise fail;
/// * nothing cached and one live server: that server;
/// * otherwise every live server must be the same physical server.
pub fn select_execution_server(
    cache_server: Option<&Arc<dyn DiscoveredServer>>,
    live_servers: &[Arc<dyn DiscoveredServer>],
    total_subqueries: usize,
    cached_subqueries: usize,
) -> CohortResult<Arc<dyn DiscoveredServer>> {
    if cached_subqueries > total_subqueries {
        return Err(CohortExecutionError::configuration(format!(
            "{cached_subqueries} cached sub-queries reported out of {total_subqueries}"
        )));
    }

    if cached_subqueries > 0 {
        let cache = cache_server.ok_or_else(|| {
            CohortExecutionError::configuration("sub-queries were served from cache but no cache server is configured")
        })?;

        if cached_subqueries == total_subqueries {
            return Ok(Arc::clone(cache));
        }

        let unreachable: Vec<&str> = live_servers
            .iter()
            .filter(|live| !cache.is_same_server(live.as_ref()))
            .map(|live| live.name())
            .collect();
        if !unreachable.is_empty() {
            return Err(CohortExecutionError::configuration(format!(
                "{cached_subqueries} of {total_subqueries} sub-queries are cached on {} but live data is on {}; \
                 no single server can reach both",
                cache.name(),
                unreachable.join(", ")
            )));
        }
        return Ok(Arc::clone(cache));
    }

    match live_servers {
        [] => Err(CohortExecutionError::configuration(
            "sub-query has no data access points",
        )),
        [only] => Ok(Arc::clone(only)),
        [first, rest @ ..] => {
            let mut distinct: Vec<&Arc<dyn DiscoveredServer>> = vec![first];
            for server in rest {
                if !distinct.iter().any(|d| d.is_same_server(server.as_ref())) {
                    distinct.push(server);
                }
            }
            if distinct.len() > 1 {
                let names: Vec<String> = distinct
                    .iter()
                    .map(|s| format!("{} ({})", s.name(), s.database_type()))
                    .collect();
                return Err(CohortExecutionError::configuration(format!(
                    "sub-query data access points are on {} different servers ({}); \
                     enable caching or move the datasets onto one server",
                    distinct.len(),
                    names.join(", ")
                )));
            }
            Ok(Arc::clone(first))
        }
    }
}
