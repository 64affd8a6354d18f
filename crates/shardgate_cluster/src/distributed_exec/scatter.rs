//! Scatter phase: dispatch per-shard requests concurrently and collect every
//! outcome. A failing shard never stops the others.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::StreamExt;
use tokio::sync::mpsc;

use shardgate_common::bind::QueryResult;
use shardgate_common::config::ScatterConfig;
use shardgate_common::error::{
    BackendError, ErrorCode, GatewayError, GatewayResult, ScatterConnError, ShardError,
};
use shardgate_common::request_context::CallContext;
use shardgate_common::types::ShardTarget;

use crate::backend::{HealthCheck, TabletConn};

use super::gather::{merge_results, reassemble_batch};
use super::{PerShardRequest, ScatterBatchRequest, ShardBatch, StreamChunk};

/// Receives streamed chunks in arrival order. Returning an error stops
/// every shard stream of the call.
pub type StreamSink<'a> = dyn FnMut(StreamChunk) -> GatewayResult<()> + Send + 'a;

pub struct ScatterConn {
    health: Arc<dyn HealthCheck>,
    shard_timeout: Option<Duration>,
    stream_buffer: usize,
}

impl ScatterConn {
    pub fn new(health: Arc<dyn HealthCheck>, config: &ScatterConfig) -> Self {
        Self {
            health,
            shard_timeout: config.shard_timeout(),
            stream_buffer: config.stream_buffer_chunks.max(1),
        }
    }

    /// Run each request on its shard and merge the results in request order.
    /// On failure the rows of the shards that did answer travel on the error.
    pub async fn execute(
        &self,
        ctx: &CallContext,
        requests: &[PerShardRequest],
        as_transaction: bool,
    ) -> GatewayResult<QueryResult> {
        let started = Instant::now();
        let outcomes = join_all(
            requests
                .iter()
                .map(|req| self.execute_one(ctx, req, as_transaction)),
        )
        .await;
        let targets = requests.iter().map(|req| &req.target);
        let (results, failure) = self.collect("execute", targets, outcomes, started);
        let merged = merge_results(results);
        match failure {
            None => Ok(merged),
            Some(err) => Err(err.with_partial(merged).into()),
        }
    }

    /// Run each shard's sub-batch and return results in the caller's order.
    pub async fn execute_batch(
        &self,
        ctx: &CallContext,
        request: &ScatterBatchRequest,
        as_transaction: bool,
    ) -> GatewayResult<Vec<QueryResult>> {
        let started = Instant::now();
        let outcomes = join_all(
            request
                .batches
                .iter()
                .map(|batch| self.execute_batch_one(ctx, batch, as_transaction)),
        )
        .await;
        let targets = request.batches.iter().map(|batch| &batch.target);
        let (results, failure) = self.collect("execute_batch", targets, outcomes, started);
        if let Some(err) = failure {
            return Err(err.into());
        }
        reassemble_batch(request, results)
    }

    /// Stream every shard's result chunks into `sink`.
    ///
    /// Chunks from one shard arrive in order; chunks from different shards
    /// interleave. If `sink` fails, the remaining streams are cancelled and
    /// the sink's error is returned together with every shard that had
    /// already failed on its own.
    pub async fn stream_execute(
        &self,
        ctx: &CallContext,
        requests: &[PerShardRequest],
        sink: &mut StreamSink<'_>,
    ) -> GatewayResult<()> {
        let started = Instant::now();
        let stream_ctx = ctx.child();
        let (tx, mut rx) = mpsc::channel::<StreamChunk>(self.stream_buffer);

        let workers = join_all(
            requests
                .iter()
                .enumerate()
                .map(|(idx, req)| self.stream_one(&stream_ctx, idx, req, tx.clone())),
        );
        drop(tx);

        let mut sink_error: Option<GatewayError> = None;
        let consume = async {
            while let Some(chunk) = rx.recv().await {
                if sink_error.is_some() {
                    continue;
                }
                if let Err(e) = sink(chunk) {
                    stream_ctx.cancel();
                    sink_error = Some(e);
                }
            }
        };
        let (outcomes, ()) = tokio::join!(workers, consume);

        // Streams we cut short after a sink failure are not shard failures.
        let torn_down = sink_error.is_some() && !ctx.is_cancelled();
        let (targets, outcomes): (Vec<&ShardTarget>, Vec<_>) = requests
            .iter()
            .map(|req| &req.target)
            .zip(outcomes)
            .filter(|(_, outcome)| {
                !(torn_down && matches!(outcome, Err(e) if e.code == ErrorCode::Cancelled))
            })
            .unzip();
        let (_, failure) = self.collect("stream_execute", targets, outcomes, started);

        if let Some(e) = sink_error {
            tracing::debug!(request_id = ctx.request_id, "stream sink failed: {}", e);
            let cause = match e {
                GatewayError::Sink { cause, .. } => cause,
                other => other.to_string(),
            };
            return Err(GatewayError::Sink {
                cause,
                shard_errors: failure.map(|f| f.errors).unwrap_or_default(),
            });
        }
        match failure {
            None => Ok(()),
            Some(err) => Err(err.into()),
        }
    }

    fn connect(&self, target: &ShardTarget) -> Result<TabletConn, ShardError> {
        self.health.healthy_endpoint(target).ok_or_else(|| {
            ShardError::new(
                target.clone(),
                None,
                BackendError::fatal("no healthy endpoint"),
            )
        })
    }

    /// Race a backend call against the call context and the per-shard timeout.
    async fn guard<T>(
        &self,
        ctx: &CallContext,
        call: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        if let Some(reason) = ctx.done_reason() {
            return Err(reason.to_backend_error());
        }
        let timed = async {
            match self.shard_timeout {
                Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                    Err(BackendError::fatal_with_code(
                        ErrorCode::DeadlineExceeded,
                        format!("shard call exceeded {}ms", limit.as_millis()),
                    ))
                }),
                None => call.await,
            }
        };
        tokio::select! {
            result = timed => result,
            reason = ctx.done() => Err(reason.to_backend_error()),
        }
    }

    async fn execute_one(
        &self,
        ctx: &CallContext,
        req: &PerShardRequest,
        as_transaction: bool,
    ) -> Result<QueryResult, ShardError> {
        let conn = self.connect(&req.target)?;
        self.guard(
            ctx,
            conn.backend
                .execute(ctx, &req.target, &req.query, as_transaction),
        )
        .await
        .map_err(|e| ShardError::new(req.target.clone(), Some(conn.endpoint.clone()), e))
    }

    async fn execute_batch_one(
        &self,
        ctx: &CallContext,
        batch: &ShardBatch,
        as_transaction: bool,
    ) -> Result<Vec<QueryResult>, ShardError> {
        let conn = self.connect(&batch.target)?;
        self.guard(
            ctx,
            conn.backend
                .execute_batch(ctx, &batch.target, &batch.queries, as_transaction),
        )
        .await
        .map_err(|e| ShardError::new(batch.target.clone(), Some(conn.endpoint.clone()), e))
    }

    async fn stream_one(
        &self,
        ctx: &CallContext,
        shard_index: usize,
        req: &PerShardRequest,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<(), ShardError> {
        let conn = self.connect(&req.target)?;
        let to_shard_err =
            |e: BackendError| ShardError::new(req.target.clone(), Some(conn.endpoint.clone()), e);

        let mut stream = self
            .guard(
                ctx,
                conn.backend.stream_execute(ctx, &req.target, &req.query),
            )
            .await
            .map_err(&to_shard_err)?;

        loop {
            let next = tokio::select! {
                item = stream.next() => item,
                reason = ctx.done() => return Err(to_shard_err(reason.to_backend_error())),
            };
            match next {
                Some(Ok(result)) => {
                    let chunk = StreamChunk {
                        shard_index,
                        target: req.target.clone(),
                        result,
                    };
                    // receiver gone: the call is being torn down
                    if tx.send(chunk).await.is_err() {
                        return Ok(());
                    }
                }
                Some(Err(e)) => return Err(to_shard_err(e)),
                None => return Ok(()),
            }
        }
    }

    /// Split outcomes into the results of the shards that answered and an
    /// aggregated error for the rest, logging each failure. `targets` lines
    /// up with `outcomes`.
    fn collect<'t, T>(
        &self,
        op: &'static str,
        targets: impl IntoIterator<Item = &'t ShardTarget>,
        outcomes: Vec<Result<T, ShardError>>,
        started: Instant,
    ) -> (Vec<T>, Option<ScatterConnError>) {
        let shards = outcomes.len();
        let mut results = Vec::with_capacity(shards);
        let mut succeeded = Vec::with_capacity(shards);
        let mut errors = Vec::new();
        for (target, outcome) in targets.into_iter().zip(outcomes) {
            match outcome {
                Ok(r) => {
                    succeeded.push(target.clone());
                    results.push(r);
                }
                Err(e) => {
                    tracing::warn!(
                        keyspace = %e.target.keyspace,
                        shard = %e.target.shard,
                        kind = %e.kind,
                        "shard failed during {}: {}",
                        op,
                        e.message
                    );
                    errors.push(e);
                }
            }
        }
        shardgate_observability::record_scatter_metrics(
            op,
            shards,
            errors.len(),
            started.elapsed().as_micros() as u64,
        );
        if errors.is_empty() {
            (results, None)
        } else {
            (
                results,
                Some(ScatterConnError::new(errors).with_succeeded(succeeded)),
            )
        }
    }
}
