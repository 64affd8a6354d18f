//! Fault-injecting test doubles for the gateway's collaborators.
//!
//! - `SandboxTopo`: scripted serving graphs per keyspace, with fetch counting
//!   and injectable topology outages
//! - `SandboxBackend`: a tablet that fails a configured number of times per
//!   failure class, can be slowed down, and counts what it was asked to run
//! - `FakeHealthCheck`: a static map from shard target to tablet
//!
//! Counters are atomics so tests can read them while calls are in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;

use shardgate_common::bind::{BindValue, BoundQuery, Field, QueryResult};
use shardgate_common::error::{BackendError, ErrorCode, ResolutionError, TopoError};
use shardgate_common::request_context::CallContext;
use shardgate_common::types::{ShardTarget, TabletEndpoint, TabletRole};

use crate::backend::{HealthCheck, ResultStream, TabletBackend, TabletConn};
use crate::routing::{ServingGraph, TopologyServer};

/// Decrement `counter` if it is non-zero. Returns true if it was.
fn take_one(counter: &AtomicU64) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ── Topology ──

#[derive(Default)]
struct SandboxKeyspace {
    graphs: Vec<ServingGraph>,
    fetches: u64,
    served: usize,
    fail_next: u64,
}

/// Topology server whose answers are scripted per keyspace.
///
/// Each keyspace holds a sequence of graphs. The n-th successful fetch
/// returns the n-th graph; once the sequence is exhausted the last graph
/// keeps being served.
#[derive(Default)]
pub struct SandboxTopo {
    keyspaces: Mutex<HashMap<String, SandboxKeyspace>>,
}

impl SandboxTopo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `keyspace` with the shards of `spec`, e.g. `-20-40-`.
    pub fn create_keyspace(&self, keyspace: &str, spec: &str) -> Result<(), ResolutionError> {
        let graph = ServingGraph::from_shard_spec(spec)?;
        self.set_graph_sequence(keyspace, vec![graph]);
        Ok(())
    }

    pub fn set_graph_sequence(&self, keyspace: &str, graphs: Vec<ServingGraph>) {
        let mut keyspaces = self.keyspaces.lock();
        keyspaces.entry(keyspace.to_string()).or_default().graphs = graphs;
    }

    /// Append a graph that later fetches will see.
    pub fn push_graph(&self, keyspace: &str, graph: ServingGraph) {
        let mut keyspaces = self.keyspaces.lock();
        keyspaces
            .entry(keyspace.to_string())
            .or_default()
            .graphs
            .push(graph);
    }

    /// Edit the most recent graph of `keyspace` in place.
    pub fn graph_mut(&self, keyspace: &str, f: impl FnOnce(&mut ServingGraph)) {
        let mut keyspaces = self.keyspaces.lock();
        if let Some(graph) = keyspaces
            .get_mut(keyspace)
            .and_then(|ks| ks.graphs.last_mut())
        {
            f(graph);
        }
    }

    /// Make the next `n` fetches of `keyspace` fail as unavailable.
    pub fn fail_next_fetches(&self, keyspace: &str, n: u64) {
        let mut keyspaces = self.keyspaces.lock();
        keyspaces.entry(keyspace.to_string()).or_default().fail_next = n;
    }

    /// Fetches of `keyspace` so far, failed ones included.
    pub fn fetch_count(&self, keyspace: &str) -> u64 {
        self.keyspaces
            .lock()
            .get(keyspace)
            .map(|ks| ks.fetches)
            .unwrap_or(0)
    }
}

#[async_trait]
impl TopologyServer for SandboxTopo {
    async fn get_serving_graph(
        &self,
        _cell: &str,
        keyspace: &str,
        _role: TabletRole,
    ) -> Result<ServingGraph, TopoError> {
        let mut keyspaces = self.keyspaces.lock();
        let ks = keyspaces
            .get_mut(keyspace)
            .ok_or_else(|| TopoError::KeyspaceNotFound(keyspace.to_string()))?;
        ks.fetches += 1;
        if ks.fail_next > 0 {
            ks.fail_next -= 1;
            return Err(TopoError::Unavailable("injected topology outage".into()));
        }
        if ks.graphs.is_empty() {
            return Err(TopoError::KeyspaceNotFound(keyspace.to_string()));
        }
        let idx = ks.served.min(ks.graphs.len() - 1);
        ks.served += 1;
        Ok(ks.graphs[idx].clone())
    }
}

// ── Tablet backend ──

/// The result every sandbox tablet returns unless told otherwise.
pub fn single_row_result() -> QueryResult {
    QueryResult {
        fields: vec![Field::new("id", "INT32"), Field::new("value", "VARCHAR")],
        rows: vec![vec![BindValue::Int64(1), BindValue::Text("foo".into())]],
        rows_affected: 1,
        insert_id: 0,
    }
}

/// A tablet that can be told to fail. Failure counters are consumed one per
/// call, checked in the order server, retry, not-served, fatal. Every
/// injected error carries the message `err`.
pub struct SandboxBackend {
    must_fail_server: AtomicU64,
    must_fail_retry: AtomicU64,
    must_fail_not_served: AtomicU64,
    must_fail_fatal: AtomicU64,
    exec_count: AtomicU64,
    as_transaction_count: AtomicU64,
    faults_fired: AtomicU64,
    delay_ms: AtomicU64,
    stream_chunks: AtomicU64,
    result: Mutex<QueryResult>,
    queries: Mutex<Vec<BoundQuery>>,
}

impl Default for SandboxBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxBackend {
    pub fn new() -> Self {
        Self {
            must_fail_server: AtomicU64::new(0),
            must_fail_retry: AtomicU64::new(0),
            must_fail_not_served: AtomicU64::new(0),
            must_fail_fatal: AtomicU64::new(0),
            exec_count: AtomicU64::new(0),
            as_transaction_count: AtomicU64::new(0),
            faults_fired: AtomicU64::new(0),
            delay_ms: AtomicU64::new(0),
            stream_chunks: AtomicU64::new(1),
            result: Mutex::new(single_row_result()),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn must_fail_server(&self, n: u64) {
        self.must_fail_server.store(n, Ordering::SeqCst);
    }

    pub fn must_fail_retry(&self, n: u64) {
        self.must_fail_retry.store(n, Ordering::SeqCst);
    }

    pub fn must_fail_not_served(&self, n: u64) {
        self.must_fail_not_served.store(n, Ordering::SeqCst);
    }

    pub fn must_fail_fatal(&self, n: u64) {
        self.must_fail_fatal.store(n, Ordering::SeqCst);
    }

    /// Sleep this long before answering each call.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_result(&self, result: QueryResult) {
        *self.result.lock() = result;
    }

    /// Number of chunks each stream yields, each a copy of the result.
    pub fn set_stream_chunks(&self, n: u64) {
        self.stream_chunks.store(n, Ordering::Relaxed);
    }

    /// Calls received, including ones that failed.
    pub fn exec_count(&self) -> u64 {
        self.exec_count.load(Ordering::SeqCst)
    }

    pub fn as_transaction_count(&self) -> u64 {
        self.as_transaction_count.load(Ordering::SeqCst)
    }

    pub fn faults_fired(&self) -> u64 {
        self.faults_fired.load(Ordering::Relaxed)
    }

    /// Every query received, in arrival order.
    pub fn queries(&self) -> Vec<BoundQuery> {
        self.queries.lock().clone()
    }

    fn take_failure(&self) -> Option<BackendError> {
        let err = if take_one(&self.must_fail_server) {
            BackendError::server(ErrorCode::BadInput, "err")
        } else if take_one(&self.must_fail_retry) {
            BackendError::retry("err")
        } else if take_one(&self.must_fail_not_served) {
            BackendError::server(ErrorCode::QueryNotServed, "err")
        } else if take_one(&self.must_fail_fatal) {
            BackendError::fatal("err")
        } else {
            return None;
        };
        self.faults_fired.fetch_add(1, Ordering::Relaxed);
        Some(err)
    }

    async fn begin_call(&self, queries: &[BoundQuery], as_transaction: bool) -> Result<(), BackendError> {
        self.exec_count.fetch_add(1, Ordering::SeqCst);
        if as_transaction {
            self.as_transaction_count.fetch_add(1, Ordering::SeqCst);
        }
        self.queries.lock().extend_from_slice(queries);

        let delay = self.delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        match self.take_failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TabletBackend for SandboxBackend {
    async fn execute(
        &self,
        _ctx: &CallContext,
        _target: &ShardTarget,
        query: &BoundQuery,
        as_transaction: bool,
    ) -> Result<QueryResult, BackendError> {
        self.begin_call(std::slice::from_ref(query), as_transaction)
            .await?;
        Ok(self.result.lock().clone())
    }

    async fn execute_batch(
        &self,
        _ctx: &CallContext,
        _target: &ShardTarget,
        queries: &[BoundQuery],
        as_transaction: bool,
    ) -> Result<Vec<QueryResult>, BackendError> {
        self.begin_call(queries, as_transaction).await?;
        let result = self.result.lock().clone();
        Ok(vec![result; queries.len()])
    }

    async fn stream_execute(
        &self,
        _ctx: &CallContext,
        _target: &ShardTarget,
        query: &BoundQuery,
    ) -> Result<ResultStream, BackendError> {
        self.begin_call(std::slice::from_ref(query), false).await?;
        let result = self.result.lock().clone();
        let chunks = self.stream_chunks.load(Ordering::Relaxed) as usize;
        Ok(futures::stream::iter(vec![Ok(result); chunks]).boxed())
    }
}

impl std::fmt::Debug for SandboxBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxBackend")
            .field("exec_count", &self.exec_count())
            .field("as_transaction_count", &self.as_transaction_count())
            .field("faults_fired", &self.faults_fired())
            .finish()
    }
}

// ── Health check ──

/// Health check backed by a fixed target-to-tablet map.
#[derive(Default)]
pub struct FakeHealthCheck {
    conns: DashMap<ShardTarget, TabletConn>,
}

impl FakeHealthCheck {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `backend` as the healthy tablet for `keyspace/shard@role`,
    /// reachable at `host` with port `vt` = `port`.
    pub fn add_test_endpoint(
        &self,
        host: impl Into<String>,
        port: u32,
        keyspace: &str,
        shard: &str,
        role: TabletRole,
        backend: Arc<SandboxBackend>,
    ) {
        let conn = TabletConn {
            endpoint: TabletEndpoint::new(host).with_port("vt", port),
            backend,
        };
        self.conns
            .insert(ShardTarget::new(keyspace, shard, role), conn);
    }

    pub fn remove_endpoint(&self, target: &ShardTarget) {
        self.conns.remove(target);
    }

    pub fn reset(&self) {
        self.conns.clear();
    }
}

impl HealthCheck for FakeHealthCheck {
    fn healthy_endpoint(&self, target: &ShardTarget) -> Option<TabletConn> {
        self.conns.get(target).map(|c| c.clone())
    }
}
