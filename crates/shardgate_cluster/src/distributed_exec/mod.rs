//! Scatter/gather over tablet backends.
//!
//! `scatter` dispatches one request per shard concurrently and collects
//! every outcome; `gather` merges shard results and reassembles batches.

pub mod gather;
pub mod scatter;

pub use gather::{merge_results, reassemble_batch};
pub use scatter::{ScatterConn, StreamSink};

use shardgate_common::bind::{BoundQuery, QueryResult};
use shardgate_common::types::ShardTarget;

/// One query for one shard.
#[derive(Debug, Clone, PartialEq)]
pub struct PerShardRequest {
    pub target: ShardTarget,
    pub query: BoundQuery,
}

impl PerShardRequest {
    pub fn new(target: ShardTarget, query: BoundQuery) -> Self {
        Self { target, query }
    }
}

/// Queries bound for one shard within a batch. `result_indexes[i]` is the
/// position in the caller's batch that `queries[i]` contributes to.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardBatch {
    pub target: ShardTarget,
    pub queries: Vec<BoundQuery>,
    pub result_indexes: Vec<usize>,
}

/// A caller's batch regrouped per shard.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScatterBatchRequest {
    pub batches: Vec<ShardBatch>,
    /// Number of queries in the caller's batch.
    pub result_count: usize,
    /// Keyspaces the caller named, before served-from redirects.
    pub requested_keyspaces: Vec<String>,
}

impl ScatterBatchRequest {
    pub fn new(result_count: usize) -> Self {
        Self {
            batches: Vec::new(),
            result_count,
            requested_keyspaces: Vec::new(),
        }
    }

    /// Remember a keyspace the caller asked for.
    pub fn note_requested_keyspace(&mut self, keyspace: &str) {
        if !self.requested_keyspaces.iter().any(|k| k == keyspace) {
            self.requested_keyspaces.push(keyspace.to_string());
        }
    }

    /// Append `query` for `target`, contributing to caller result `index`.
    /// Shards keep the order in which they were first added.
    pub fn add(&mut self, target: ShardTarget, query: BoundQuery, index: usize) {
        match self.batches.iter_mut().find(|b| b.target == target) {
            Some(batch) => {
                batch.queries.push(query);
                batch.result_indexes.push(index);
            }
            None => self.batches.push(ShardBatch {
                target,
                queries: vec![query],
                result_indexes: vec![index],
            }),
        }
    }

    /// Keyspaces touched by this batch, requested ones first, deduplicated.
    pub fn keyspaces(&self) -> Vec<String> {
        let mut out: Vec<String> = self.requested_keyspaces.clone();
        for batch in &self.batches {
            if !out.contains(&batch.target.keyspace) {
                out.push(batch.target.keyspace.clone());
            }
        }
        out
    }
}

/// A result chunk from one shard's stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    /// Position of the shard in the dispatch list.
    pub shard_index: usize,
    pub target: ShardTarget,
    pub result: QueryResult,
}
