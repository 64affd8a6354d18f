use std::sync::Arc;

use shardgate_common::error::ResolutionError;
use shardgate_common::types::{KeyRange, KeyspaceId, TabletRole};

use super::serving_graph::ServingGraph;
use super::topology::SrvTopoCache;
use crate::entity::{map_entity_ids_to_shards, EntityId, ShardValues};

/// How a caller names the shards a query should reach.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    /// Explicit shard names. No topology lookup.
    Shards(Vec<String>),
    KeyspaceIds(Vec<KeyspaceId>),
    KeyRanges(Vec<KeyRange>),
    /// Entity column values, each with its keyspace id.
    EntityIds { column: String, ids: Vec<EntityId> },
}

impl Selector {
    pub fn is_empty(&self) -> bool {
        match self {
            Selector::Shards(s) => s.is_empty(),
            Selector::KeyspaceIds(ids) => ids.is_empty(),
            Selector::KeyRanges(ranges) => ranges.is_empty(),
            Selector::EntityIds { ids, .. } => ids.is_empty(),
        }
    }

    /// Selectors that name individual rows. DML through these must stay on one shard.
    pub fn is_row_level(&self) -> bool {
        matches!(self, Selector::KeyspaceIds(_) | Selector::EntityIds { .. })
    }
}

/// Shards a selector resolved to, in the keyspace that actually serves them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedShards {
    pub keyspace: String,
    pub shards: Vec<String>,
}

fn push_unique(shards: &mut Vec<String>, name: &str) {
    if !shards.iter().any(|s| s == name) {
        shards.push(name.to_string());
    }
}

/// Owning shard of each keyspace id, deduplicated in discovery order.
pub fn keyspace_ids_to_shards(graph: &ServingGraph, ids: &[KeyspaceId]) -> Vec<String> {
    let mut shards = Vec::new();
    for id in ids {
        if let Some(shard) = graph.shard_for_keyspace_id(id.as_bytes()) {
            push_unique(&mut shards, &shard.name);
        }
    }
    shards
}

/// Every shard intersecting any of the ranges, deduplicated in discovery order.
pub fn key_ranges_to_shards(graph: &ServingGraph, ranges: &[KeyRange]) -> Vec<String> {
    let mut shards = Vec::new();
    for range in ranges {
        for shard in graph.shards_intersecting(range) {
            push_unique(&mut shards, &shard.name);
        }
    }
    shards
}

/// Translates selectors into shard names using the cached serving graphs.
pub struct ShardMapper {
    topo: Arc<SrvTopoCache>,
    max_redirect_depth: u32,
}

/// Served-from redirects are never chained.
const MAX_REDIRECT_DEPTH: u32 = 1;

impl ShardMapper {
    /// Depths above one are clamped to one.
    pub fn new(topo: Arc<SrvTopoCache>, max_redirect_depth: u32) -> Self {
        if max_redirect_depth > MAX_REDIRECT_DEPTH {
            tracing::warn!(
                requested = max_redirect_depth,
                "served-from redirects are limited to {} hop",
                MAX_REDIRECT_DEPTH
            );
        }
        Self {
            topo,
            max_redirect_depth: max_redirect_depth.min(MAX_REDIRECT_DEPTH),
        }
    }

    pub fn topology(&self) -> &Arc<SrvTopoCache> {
        &self.topo
    }

    /// The serving graph for `keyspace`, after following served-from
    /// redirects. Returns the keyspace that actually serves it.
    pub async fn serving_graph(
        &self,
        keyspace: &str,
        role: TabletRole,
    ) -> Result<(String, Arc<ServingGraph>), ResolutionError> {
        let mut current = keyspace.to_string();
        let mut hops = 0;
        loop {
            let graph = self.topo.get(&current, role).await.map_err(|source| {
                ResolutionError::TopoUnavailable {
                    keyspace: current.clone(),
                    source,
                }
            })?;
            match &graph.served_from {
                Some(target) if hops < self.max_redirect_depth => {
                    tracing::debug!(from = %current, to = %target, "following served-from redirect");
                    current = target.clone();
                    hops += 1;
                }
                _ => return Ok((current, graph)),
            }
        }
    }

    /// Explicit shards pass through deduplicated.
    pub fn map_shards(&self, keyspace: &str, shards: &[String]) -> ResolvedShards {
        let mut out = Vec::with_capacity(shards.len());
        for shard in shards {
            push_unique(&mut out, shard);
        }
        ResolvedShards {
            keyspace: keyspace.to_string(),
            shards: out,
        }
    }

    pub async fn map_keyspace_ids(
        &self,
        keyspace: &str,
        role: TabletRole,
        ids: &[KeyspaceId],
    ) -> Result<ResolvedShards, ResolutionError> {
        let (effective, graph) = self.serving_graph(keyspace, role).await?;
        let shards = keyspace_ids_to_shards(&graph, ids);
        if shards.is_empty() && !ids.is_empty() {
            return Err(ResolutionError::NoShardCovers {
                keyspace: effective,
                what: format!(
                    "keyspace ids [{}]",
                    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", ")
                ),
            });
        }
        Ok(ResolvedShards {
            keyspace: effective,
            shards,
        })
    }

    pub async fn map_key_ranges(
        &self,
        keyspace: &str,
        role: TabletRole,
        ranges: &[KeyRange],
    ) -> Result<ResolvedShards, ResolutionError> {
        let (effective, graph) = self.serving_graph(keyspace, role).await?;
        let shards = key_ranges_to_shards(&graph, ranges);
        if shards.is_empty() && !ranges.is_empty() {
            return Err(ResolutionError::NoShardCovers {
                keyspace: effective,
                what: format!(
                    "key ranges [{}]",
                    ranges.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(", ")
                ),
            });
        }
        Ok(ResolvedShards {
            keyspace: effective,
            shards,
        })
    }

    /// Entity values grouped per owning shard, in the serving keyspace.
    pub async fn map_entity_ids(
        &self,
        keyspace: &str,
        role: TabletRole,
        ids: &[EntityId],
    ) -> Result<(String, Vec<ShardValues>), ResolutionError> {
        let (effective, graph) = self.serving_graph(keyspace, role).await?;
        let grouped = map_entity_ids_to_shards(&graph, ids);
        if grouped.is_empty() && !ids.is_empty() {
            return Err(ResolutionError::NoShardCovers {
                keyspace: effective,
                what: format!("{} entity ids", ids.len()),
            });
        }
        Ok((effective, grouped))
    }

    pub async fn resolve(
        &self,
        keyspace: &str,
        role: TabletRole,
        selector: &Selector,
    ) -> Result<ResolvedShards, ResolutionError> {
        match selector {
            Selector::Shards(shards) => Ok(self.map_shards(keyspace, shards)),
            Selector::KeyspaceIds(ids) => self.map_keyspace_ids(keyspace, role, ids).await,
            Selector::KeyRanges(ranges) => self.map_key_ranges(keyspace, role, ranges).await,
            Selector::EntityIds { ids, .. } => {
                let (keyspace, grouped) = self.map_entity_ids(keyspace, role, ids).await?;
                Ok(ResolvedShards {
                    keyspace,
                    shards: grouped.into_iter().map(|g| g.shard).collect(),
                })
            }
        }
    }
}
