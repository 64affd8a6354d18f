use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use shardgate_common::error::TopoError;
use shardgate_common::types::TabletRole;

use super::serving_graph::ServingGraph;

/// Source of serving graphs, usually a remote topology service.
#[async_trait]
pub trait TopologyServer: Send + Sync {
    async fn get_serving_graph(
        &self,
        cell: &str,
        keyspace: &str,
        role: TabletRole,
    ) -> Result<ServingGraph, TopoError>;
}

#[derive(Clone)]
struct CachedGraph {
    generation: u64,
    graph: Arc<ServingGraph>,
}

/// Per-keyspace cache of serving graphs in front of a `TopologyServer`.
///
/// Each keyspace has a generation counter. `invalidate` bumps it, and a
/// cached snapshot is only served while its generation is current, so a
/// fetch that races with an invalidation is refetched on the next lookup.
/// No map guard is held across a fetch.
pub struct SrvTopoCache {
    server: Arc<dyn TopologyServer>,
    cell: String,
    generations: DashMap<String, u64>,
    snapshots: DashMap<(String, TabletRole), CachedGraph>,
}

impl SrvTopoCache {
    pub fn new(server: Arc<dyn TopologyServer>, cell: impl Into<String>) -> Self {
        Self {
            server,
            cell: cell.into(),
            generations: DashMap::new(),
            snapshots: DashMap::new(),
        }
    }

    pub fn cell(&self) -> &str {
        &self.cell
    }

    pub fn generation(&self, keyspace: &str) -> u64 {
        self.generations.get(keyspace).map(|g| *g).unwrap_or(0)
    }

    /// Serving graph for `keyspace` at `role`, fetched if not cached or stale.
    pub async fn get(
        &self,
        keyspace: &str,
        role: TabletRole,
    ) -> Result<Arc<ServingGraph>, TopoError> {
        let generation = self.generation(keyspace);
        let key = (keyspace.to_string(), role);
        let cached = self
            .snapshots
            .get(&key)
            .filter(|c| c.generation == generation)
            .map(|c| Arc::clone(&c.graph));
        if let Some(graph) = cached {
            return Ok(graph);
        }

        let fetched = self
            .server
            .get_serving_graph(&self.cell, keyspace, role)
            .await;
        shardgate_observability::record_topology_fetch(keyspace, fetched.is_ok());
        let graph = Arc::new(fetched?);

        tracing::debug!(
            keyspace,
            role = %role,
            generation,
            shards = graph.shards.len(),
            served_from = ?graph.served_from,
            "fetched serving graph"
        );
        self.snapshots.insert(
            key,
            CachedGraph {
                generation,
                graph: Arc::clone(&graph),
            },
        );
        Ok(graph)
    }

    /// Drop every cached snapshot of `keyspace`. Returns the new generation.
    pub fn invalidate(&self, keyspace: &str) -> u64 {
        let mut entry = self.generations.entry(keyspace.to_string()).or_insert(0);
        *entry += 1;
        let generation = *entry;
        drop(entry);

        shardgate_observability::record_topology_invalidation(keyspace);
        tracing::debug!(keyspace, generation, "invalidated serving graph cache");
        generation
    }
}
