//! Seams to the tablet servers that actually execute queries.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use shardgate_common::bind::{BoundQuery, QueryResult};
use shardgate_common::error::BackendError;
use shardgate_common::request_context::CallContext;
use shardgate_common::types::{ShardTarget, TabletEndpoint};

/// Stream of result chunks from one shard.
pub type ResultStream = BoxStream<'static, Result<QueryResult, BackendError>>;

/// A connection to the tablet serving one shard.
///
/// Implementations classify their failures when building a `BackendError`;
/// the gateway never inspects error text.
#[async_trait]
pub trait TabletBackend: Send + Sync {
    async fn execute(
        &self,
        ctx: &CallContext,
        target: &ShardTarget,
        query: &BoundQuery,
        as_transaction: bool,
    ) -> Result<QueryResult, BackendError>;

    /// Run `queries` in order; one result per query.
    async fn execute_batch(
        &self,
        ctx: &CallContext,
        target: &ShardTarget,
        queries: &[BoundQuery],
        as_transaction: bool,
    ) -> Result<Vec<QueryResult>, BackendError>;

    async fn stream_execute(
        &self,
        ctx: &CallContext,
        target: &ShardTarget,
        query: &BoundQuery,
    ) -> Result<ResultStream, BackendError>;

    async fn close(&self) {}
}

/// A healthy tablet for a target: where it is and how to talk to it.
#[derive(Clone)]
pub struct TabletConn {
    pub endpoint: TabletEndpoint,
    pub backend: Arc<dyn TabletBackend>,
}

impl std::fmt::Debug for TabletConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabletConn")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Picks a healthy tablet for a target, or none.
pub trait HealthCheck: Send + Sync {
    fn healthy_endpoint(&self, target: &ShardTarget) -> Option<TabletConn>;
}
