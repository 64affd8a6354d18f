//! Key-space routing: serving graphs, the topology cache in front of the
//! topology server, and selector-to-shard mapping.

pub mod serving_graph;
pub mod shard_map;
pub mod topology;

pub use serving_graph::{parse_shard_spec, ServingGraph, ShardReference};
pub use shard_map::{
    key_ranges_to_shards, keyspace_ids_to_shards, ResolvedShards, Selector, ShardMapper,
};
pub use topology::{SrvTopoCache, TopologyServer};
