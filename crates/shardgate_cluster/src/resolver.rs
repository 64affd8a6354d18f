//! Resolver: turns a keyspace-level request into per-shard requests, runs
//! them, and re-resolves once when the failure looks like a topology change.
//!
//! Retry policy:
//! - at most one retry per call, never inside a transaction
//! - only when the failure is retryable (every failing shard retry-class or
//!   not-served, or a topology fetch failure)
//! - never once the call context is done or the retry budget has elapsed
//! - before retrying, the requested and the redirected keyspace are invalidated
//!
//! Streaming calls never retry: rows may already have reached the caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use shardgate_common::bind::{BoundQuery, QueryResult};
use shardgate_common::config::{GatewayConfig, ResolverConfig};
use shardgate_common::error::{GatewayError, GatewayResult, ResolutionError};
use shardgate_common::request_context::CallContext;
use shardgate_common::types::{KeyRange, KeyspaceId, ShardTarget, TabletRole};
use shardgate_observability::record_resolver_attempt;

use crate::backend::HealthCheck;
use crate::distributed_exec::{PerShardRequest, ScatterBatchRequest, ScatterConn, StreamSink};
use crate::entity::{build_entity_ids, EntityId};
use crate::routing::{Selector, ShardMapper, SrvTopoCache, TopologyServer};
use crate::sql_rewrite::is_dml;

/// A batch entry addressed by keyspace ids.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundKeyspaceIdQuery {
    pub query: BoundQuery,
    pub keyspace: String,
    pub keyspace_ids: Vec<KeyspaceId>,
}

/// A batch entry addressed by explicit shards.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundShardQuery {
    pub query: BoundQuery,
    pub keyspace: String,
    pub shards: Vec<String>,
}

/// A failed attempt and the keyspaces whose cached graphs it relied on.
struct AttemptFailure {
    error: GatewayError,
    keyspaces: Vec<String>,
}

impl AttemptFailure {
    fn new(error: impl Into<GatewayError>, keyspaces: Vec<String>) -> Self {
        Self {
            error: error.into(),
            keyspaces,
        }
    }
}

fn touched_keyspaces(requested: &str, effective: &str) -> Vec<String> {
    if requested == effective {
        vec![requested.to_string()]
    } else {
        vec![requested.to_string(), effective.to_string()]
    }
}

pub struct Resolver {
    mapper: ShardMapper,
    scatter: ScatterConn,
    config: ResolverConfig,
}

impl Resolver {
    pub fn new(
        topo_server: Arc<dyn TopologyServer>,
        health: Arc<dyn HealthCheck>,
        config: &GatewayConfig,
    ) -> Self {
        let topo = Arc::new(SrvTopoCache::new(topo_server, config.cell.clone()));
        Self {
            mapper: ShardMapper::new(topo, config.topology.max_redirect_depth),
            scatter: ScatterConn::new(health, &config.scatter),
            config: config.resolver.clone(),
        }
    }

    pub fn topology(&self) -> &Arc<SrvTopoCache> {
        self.mapper.topology()
    }

    pub fn mapper(&self) -> &ShardMapper {
        &self.mapper
    }

    // ── Single-query execution ──

    /// Resolve `selector`, run `query` on every resulting shard and merge
    /// the results.
    pub async fn execute(
        &self,
        ctx: &CallContext,
        query: &BoundQuery,
        keyspace: &str,
        role: TabletRole,
        selector: &Selector,
        as_transaction: bool,
    ) -> GatewayResult<QueryResult> {
        self.with_retry(ctx, "execute", as_transaction, move || {
            self.execute_attempt(ctx, query, keyspace, role, selector, as_transaction)
        })
        .await
    }

    pub async fn execute_shards(
        &self,
        ctx: &CallContext,
        query: &BoundQuery,
        keyspace: &str,
        shards: &[String],
        role: TabletRole,
        as_transaction: bool,
    ) -> GatewayResult<QueryResult> {
        let selector = Selector::Shards(shards.to_vec());
        self.execute(ctx, query, keyspace, role, &selector, as_transaction)
            .await
    }

    pub async fn execute_keyspace_ids(
        &self,
        ctx: &CallContext,
        query: &BoundQuery,
        keyspace: &str,
        keyspace_ids: &[KeyspaceId],
        role: TabletRole,
        as_transaction: bool,
    ) -> GatewayResult<QueryResult> {
        let selector = Selector::KeyspaceIds(keyspace_ids.to_vec());
        self.execute(ctx, query, keyspace, role, &selector, as_transaction)
            .await
    }

    pub async fn execute_key_ranges(
        &self,
        ctx: &CallContext,
        query: &BoundQuery,
        keyspace: &str,
        key_ranges: &[KeyRange],
        role: TabletRole,
        as_transaction: bool,
    ) -> GatewayResult<QueryResult> {
        let selector = Selector::KeyRanges(key_ranges.to_vec());
        self.execute(ctx, query, keyspace, role, &selector, as_transaction)
            .await
    }

    /// Each shard receives `query` restricted to its own entity values.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_entity_ids(
        &self,
        ctx: &CallContext,
        query: &BoundQuery,
        keyspace: &str,
        entity_column: &str,
        entity_ids: &[EntityId],
        role: TabletRole,
        as_transaction: bool,
    ) -> GatewayResult<QueryResult> {
        let selector = Selector::EntityIds {
            column: entity_column.to_string(),
            ids: entity_ids.to_vec(),
        };
        self.execute(ctx, query, keyspace, role, &selector, as_transaction)
            .await
    }

    // ── Batch execution ──

    /// Run a batch built by `build`. The builder is called once per attempt,
    /// so a retry sees the refreshed topology.
    pub async fn execute_batch<F, Fut>(
        &self,
        ctx: &CallContext,
        as_transaction: bool,
        mut build: F,
    ) -> GatewayResult<Vec<QueryResult>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<ScatterBatchRequest>>,
    {
        self.with_retry(ctx, "execute_batch", as_transaction, move || {
            let request = build();
            async move {
                let request = request
                    .await
                    .map_err(|e| AttemptFailure::new(e, Vec::new()))?;
                self.scatter
                    .execute_batch(ctx, &request, as_transaction)
                    .await
                    .map_err(|e| AttemptFailure::new(e, request.keyspaces()))
            }
        })
        .await
    }

    pub async fn execute_batch_keyspace_ids(
        &self,
        ctx: &CallContext,
        queries: &[BoundKeyspaceIdQuery],
        role: TabletRole,
        as_transaction: bool,
    ) -> GatewayResult<Vec<QueryResult>> {
        let mapper = &self.mapper;
        self.execute_batch(ctx, as_transaction, move || {
            bound_keyspace_id_queries_to_batch_request(mapper, queries, role)
        })
        .await
    }

    pub async fn execute_batch_shards(
        &self,
        ctx: &CallContext,
        queries: &[BoundShardQuery],
        role: TabletRole,
        as_transaction: bool,
    ) -> GatewayResult<Vec<QueryResult>> {
        self.execute_batch(ctx, as_transaction, move || {
            std::future::ready(bound_shard_queries_to_batch_request(queries, role))
        })
        .await
    }

    // ── Streaming ──

    /// Stream `query` from every resolved shard into `sink`. Never retried.
    pub async fn stream_execute(
        &self,
        ctx: &CallContext,
        query: &BoundQuery,
        keyspace: &str,
        role: TabletRole,
        selector: &Selector,
        sink: &mut StreamSink<'_>,
    ) -> GatewayResult<()> {
        const OP: &str = "stream_execute";
        let (effective, requests) = self
            .build_requests(query, keyspace, role, selector)
            .await
            .map_err(|e| {
                self.give_up(ctx, OP, AttemptFailure::new(e, vec![keyspace.to_string()]))
            })?;
        match self.scatter.stream_execute(ctx, &requests, sink).await {
            Ok(()) => {
                record_resolver_attempt(OP, "ok");
                Ok(())
            }
            Err(e) => Err(self.give_up(
                ctx,
                OP,
                AttemptFailure::new(e, touched_keyspaces(keyspace, &effective)),
            )),
        }
    }

    pub async fn stream_execute_keyspace_ids(
        &self,
        ctx: &CallContext,
        query: &BoundQuery,
        keyspace: &str,
        keyspace_ids: &[KeyspaceId],
        role: TabletRole,
        sink: &mut StreamSink<'_>,
    ) -> GatewayResult<()> {
        let selector = Selector::KeyspaceIds(keyspace_ids.to_vec());
        self.stream_execute(ctx, query, keyspace, role, &selector, sink)
            .await
    }

    pub async fn stream_execute_key_ranges(
        &self,
        ctx: &CallContext,
        query: &BoundQuery,
        keyspace: &str,
        key_ranges: &[KeyRange],
        role: TabletRole,
        sink: &mut StreamSink<'_>,
    ) -> GatewayResult<()> {
        let selector = Selector::KeyRanges(key_ranges.to_vec());
        self.stream_execute(ctx, query, keyspace, role, &selector, sink)
            .await
    }

    pub async fn stream_execute_shards(
        &self,
        ctx: &CallContext,
        query: &BoundQuery,
        keyspace: &str,
        shards: &[String],
        role: TabletRole,
        sink: &mut StreamSink<'_>,
    ) -> GatewayResult<()> {
        let selector = Selector::Shards(shards.to_vec());
        self.stream_execute(ctx, query, keyspace, role, &selector, sink)
            .await
    }

    // ── Internals ──

    /// Per-shard requests for `selector`, plus the keyspace that serves them.
    async fn build_requests(
        &self,
        query: &BoundQuery,
        keyspace: &str,
        role: TabletRole,
        selector: &Selector,
    ) -> Result<(String, Vec<PerShardRequest>), ResolutionError> {
        if let Selector::EntityIds { column, ids } = selector {
            let (effective, grouped) = self.mapper.map_entity_ids(keyspace, role, ids).await?;
            let requests = build_entity_ids(&grouped, &query.sql, column, &query.bind_vars)
                .into_iter()
                .map(|sq| PerShardRequest::new(ShardTarget::new(&effective, sq.shard, role), sq.query))
                .collect();
            return Ok((effective, requests));
        }

        let resolved = self.mapper.resolve(keyspace, role, selector).await?;
        let requests = resolved
            .shards
            .iter()
            .map(|shard| {
                PerShardRequest::new(
                    ShardTarget::new(&resolved.keyspace, shard, role),
                    query.clone(),
                )
            })
            .collect();
        Ok((resolved.keyspace, requests))
    }

    async fn execute_attempt(
        &self,
        ctx: &CallContext,
        query: &BoundQuery,
        keyspace: &str,
        role: TabletRole,
        selector: &Selector,
        as_transaction: bool,
    ) -> Result<QueryResult, AttemptFailure> {
        let (effective, requests) = self
            .build_requests(query, keyspace, role, selector)
            .await
            .map_err(|e| AttemptFailure::new(e, vec![keyspace.to_string()]))?;
        let keyspaces = touched_keyspaces(keyspace, &effective);

        if selector.is_row_level() && requests.len() > 1 && is_dml(&query.sql) {
            return Err(AttemptFailure::new(
                GatewayError::CrossShardDml {
                    keyspace: effective,
                    shards: requests.into_iter().map(|r| r.target.shard).collect(),
                },
                keyspaces,
            ));
        }

        self.scatter
            .execute(ctx, &requests, as_transaction)
            .await
            .map_err(|e| AttemptFailure::new(e, keyspaces))
    }

    async fn with_retry<T, F, Fut>(
        &self,
        ctx: &CallContext,
        op: &'static str,
        as_transaction: bool,
        mut attempt: F,
    ) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AttemptFailure>>,
    {
        let started = Instant::now();
        let failure = match attempt().await {
            Ok(value) => {
                record_resolver_attempt(op, "ok");
                return Ok(value);
            }
            Err(failure) => failure,
        };

        if !self.should_retry(ctx, started, as_transaction, &failure.error) {
            return Err(self.give_up(ctx, op, failure));
        }

        tracing::info!(
            request_id = ctx.request_id,
            op,
            keyspaces = ?failure.keyspaces,
            "retryable failure, re-resolving: {}",
            failure.error
        );
        for keyspace in &failure.keyspaces {
            self.topology().invalidate(keyspace);
        }
        record_resolver_attempt(op, "retry");

        match attempt().await {
            Ok(value) => {
                record_resolver_attempt(op, "ok");
                Ok(value)
            }
            Err(failure) => Err(self.give_up(ctx, op, failure)),
        }
    }

    fn should_retry(
        &self,
        ctx: &CallContext,
        started: Instant,
        as_transaction: bool,
        error: &GatewayError,
    ) -> bool {
        if as_transaction || !self.config.retry_on_reshard || !error.is_retryable() {
            return false;
        }
        if let Some(reason) = ctx.done_reason() {
            tracing::debug!(request_id = ctx.request_id, ?reason, "not retrying: call context done");
            return false;
        }
        if let Some(budget) = self.config.retry_budget() {
            if started.elapsed() >= budget {
                tracing::debug!(
                    request_id = ctx.request_id,
                    budget_ms = self.config.retry_budget_ms,
                    "not retrying: retry budget spent"
                );
                return false;
            }
        }
        true
    }

    /// Final error for a call: invalidate stale graphs, log, record.
    fn give_up(&self, ctx: &CallContext, op: &'static str, failure: AttemptFailure) -> GatewayError {
        if failure.error.invalidates_topology() {
            for keyspace in &failure.keyspaces {
                self.topology().invalidate(keyspace);
            }
        }
        record_resolver_attempt(op, "error");
        let err = failure.error.with_request_context(ctx);
        err.log_if_fatal();
        err
    }
}

/// Group keyspace-id batch entries per shard, resolving each entry's ids.
pub async fn bound_keyspace_id_queries_to_batch_request(
    mapper: &ShardMapper,
    queries: &[BoundKeyspaceIdQuery],
    role: TabletRole,
) -> GatewayResult<ScatterBatchRequest> {
    let mut request = ScatterBatchRequest::new(queries.len());
    for (index, entry) in queries.iter().enumerate() {
        request.note_requested_keyspace(&entry.keyspace);
        let resolved = mapper
            .map_keyspace_ids(&entry.keyspace, role, &entry.keyspace_ids)
            .await?;
        for shard in resolved.shards {
            request.add(
                ShardTarget::new(&resolved.keyspace, shard, role),
                entry.query.clone(),
                index,
            );
        }
    }
    Ok(request)
}

/// Group explicit-shard batch entries per shard.
pub fn bound_shard_queries_to_batch_request(
    queries: &[BoundShardQuery],
    role: TabletRole,
) -> GatewayResult<ScatterBatchRequest> {
    let mut request = ScatterBatchRequest::new(queries.len());
    for (index, entry) in queries.iter().enumerate() {
        if entry.keyspace.is_empty() {
            return Err(GatewayError::InvalidRequest(format!(
                "batch entry {index} names no keyspace"
            )));
        }
        request.note_requested_keyspace(&entry.keyspace);
        let mut seen: Vec<&str> = Vec::with_capacity(entry.shards.len());
        for shard in &entry.shards {
            if seen.contains(&shard.as_str()) {
                continue;
            }
            seen.push(shard);
            request.add(
                ShardTarget::new(&entry.keyspace, shard, role),
                entry.query.clone(),
                index,
            );
        }
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_queries_to_batch_request() {
        let queries = vec![
            BoundShardQuery {
                query: BoundQuery::new("q0"),
                keyspace: "ks".into(),
                shards: vec!["-20".into(), "20-40".into(), "-20".into()],
            },
            BoundShardQuery {
                query: BoundQuery::new("q1"),
                keyspace: "ks".into(),
                shards: vec!["20-40".into()],
            },
        ];
        let req = bound_shard_queries_to_batch_request(&queries, TabletRole::Primary).unwrap();
        assert_eq!(req.result_count, 2);
        assert_eq!(req.batches.len(), 2);
        assert_eq!(req.batches[0].result_indexes, vec![0]);
        assert_eq!(req.batches[1].target.shard, "20-40");
        assert_eq!(req.batches[1].result_indexes, vec![0, 1]);

        let bad = vec![BoundShardQuery {
            query: BoundQuery::new("q"),
            keyspace: String::new(),
            shards: vec!["0".into()],
        }];
        assert!(bound_shard_queries_to_batch_request(&bad, TabletRole::Primary)
            .unwrap_err()
            .is_user_error());
    }

    #[test]
    fn test_touched_keyspaces() {
        assert_eq!(touched_keyspaces("ks", "ks"), vec!["ks"]);
        assert_eq!(touched_keyspaces("ks", "other"), vec!["ks", "other"]);
    }
}
