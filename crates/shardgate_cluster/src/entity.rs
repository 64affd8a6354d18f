//! Entity-id routing: each value is sent only to the shard owning its
//! keyspace id, with an `IN` filter on the entity column.

use shardgate_common::bind::{BindValue, BindVars, BoundQuery};
use shardgate_common::types::KeyspaceId;

use crate::routing::ServingGraph;
use crate::sql_rewrite::insert_sql_clause;

/// An entity column value and the keyspace id it lives under.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityId {
    pub value: BindValue,
    pub keyspace_id: KeyspaceId,
}

impl EntityId {
    pub fn new(value: impl Into<BindValue>, keyspace_id: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
            keyspace_id: KeyspaceId::new(keyspace_id),
        }
    }
}

/// Entity values grouped under the shard that owns them.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardValues {
    pub shard: String,
    pub values: Vec<BindValue>,
}

/// The query to send to one shard.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardQuery {
    pub shard: String,
    pub query: BoundQuery,
}

/// Group entity values by owning shard. Shards appear in the order their
/// first value was seen; values keep input order within a shard. Values
/// whose keyspace id falls in a gap of the graph are dropped.
pub fn map_entity_ids_to_shards(graph: &ServingGraph, ids: &[EntityId]) -> Vec<ShardValues> {
    let mut grouped: Vec<ShardValues> = Vec::new();
    for id in ids {
        let Some(shard) = graph.shard_for_keyspace_id(id.keyspace_id.as_bytes()) else {
            tracing::debug!(keyspace_id = %id.keyspace_id, "entity id not covered by any shard");
            continue;
        };
        match grouped.iter_mut().find(|g| g.shard == shard.name) {
            Some(group) => group.values.push(id.value.clone()),
            None => grouped.push(ShardValues {
                shard: shard.name.clone(),
                values: vec![id.value.clone()],
            }),
        }
    }
    grouped
}

/// Build one query per shard restricting `column` to that shard's values.
///
/// Values bind as `column0`, `column1`, ... in shard-local order; every
/// shard also receives a copy of `bind_vars`.
pub fn build_entity_ids(
    shard_map: &[ShardValues],
    sql: &str,
    column: &str,
    bind_vars: &BindVars,
) -> Vec<ShardQuery> {
    shard_map
        .iter()
        .map(|group| {
            let mut vars = bind_vars.clone();
            let mut placeholders = Vec::with_capacity(group.values.len());
            for (i, value) in group.values.iter().enumerate() {
                let name = format!("{column}{i}");
                placeholders.push(format!(":{name}"));
                vars.insert(name, value.clone());
            }
            let clause = format!("{column} in ({})", placeholders.join(", "));
            ShardQuery {
                shard: group.shard.clone(),
                query: BoundQuery::with_bind_vars(insert_sql_clause(sql, &clause), vars),
            }
        })
        .collect()
}
