//! Query resolution for a sharded-database gateway: map keyspace-level
//! requests to shards using cached serving graphs, scatter them to tablet
//! backends, gather the results, and re-resolve once when a failure looks
//! like a resharding in progress.

pub mod backend;
pub mod distributed_exec;
pub mod entity;
pub mod fault_injection;
pub mod resolver;
pub mod routing;
pub mod sql_rewrite;


pub use backend::{HealthCheck, ResultStream, TabletBackend, TabletConn};
pub use distributed_exec::{
    PerShardRequest, ScatterBatchRequest, ScatterConn, ShardBatch, StreamChunk, StreamSink,
};
pub use entity::{build_entity_ids, map_entity_ids_to_shards, EntityId, ShardQuery, ShardValues};
pub use resolver::{
    bound_keyspace_id_queries_to_batch_request, bound_shard_queries_to_batch_request,
    BoundKeyspaceIdQuery, BoundShardQuery, Resolver,
};
pub use routing::{
    parse_shard_spec, ResolvedShards, Selector, ServingGraph, ShardMapper, ShardReference,
    SrvTopoCache, TopologyServer,
};
pub use sql_rewrite::insert_sql_clause;
