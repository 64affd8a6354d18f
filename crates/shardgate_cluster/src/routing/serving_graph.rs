use shardgate_common::error::ResolutionError;
use shardgate_common::types::KeyRange;

/// A shard of a keyspace and the key range it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardReference {
    pub name: String,
    pub key_range: KeyRange,
}

impl ShardReference {
    pub fn new(name: impl Into<String>, key_range: KeyRange) -> Self {
        Self {
            name: name.into(),
            key_range,
        }
    }

    /// Build a reference whose name is the canonical name of its range.
    pub fn for_range(key_range: KeyRange) -> Self {
        Self {
            name: key_range.shard_name(),
            key_range,
        }
    }
}

/// The serving graph of one keyspace as seen from one cell: its shards in
/// key order, or a redirect to the keyspace that actually serves it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServingGraph {
    pub shards: Vec<ShardReference>,
    pub served_from: Option<String>,
}

impl ServingGraph {
    pub fn new(shards: Vec<ShardReference>) -> Self {
        Self {
            shards,
            served_from: None,
        }
    }

    /// A graph that redirects every query to `keyspace`.
    pub fn served_from(keyspace: impl Into<String>) -> Self {
        Self {
            shards: Vec::new(),
            served_from: Some(keyspace.into()),
        }
    }

    pub fn from_shard_spec(spec: &str) -> Result<Self, ResolutionError> {
        Ok(Self::new(parse_shard_spec(spec)?))
    }

    pub fn shard_names(&self) -> Vec<&str> {
        self.shards.iter().map(|s| s.name.as_str()).collect()
    }

    /// The shard whose range contains `id`, if any.
    pub fn shard_for_keyspace_id(&self, id: &[u8]) -> Option<&ShardReference> {
        self.shards.iter().find(|s| s.key_range.contains(id))
    }

    /// Every shard whose range overlaps `range`, in graph order.
    pub fn shards_intersecting<'a>(
        &'a self,
        range: &'a KeyRange,
    ) -> impl Iterator<Item = &'a ShardReference> + 'a {
        self.shards
            .iter()
            .filter(move |s| s.key_range.intersects(range))
    }

    /// Split `name` at `at`. The shard is replaced in place by its lower and
    /// upper halves. Returns the two new shard names, or None if the shard
    /// does not exist or `at` is not strictly inside its range.
    pub fn split_shard(&mut self, name: &str, at: &[u8]) -> Option<(String, String)> {
        let idx = self.shards.iter().position(|s| s.name == name)?;
        let old = &self.shards[idx].key_range;
        if at.is_empty() || !old.contains(at) || old.start.as_slice() == at {
            return None;
        }
        let lower = ShardReference::for_range(KeyRange::new(old.start.clone(), at.to_vec()));
        let upper = ShardReference::for_range(KeyRange::new(at.to_vec(), old.end.clone()));
        let names = (lower.name.clone(), upper.name.clone());

        self.shards.splice(idx..=idx, [lower, upper]);

        tracing::info!(
            "ServingGraph: split shard {} at {} -> {}, {}",
            name,
            hex::encode(at),
            names.0,
            names.1
        );
        Some(names)
    }

    /// Merge two adjacent shards into one covering both ranges. Returns the
    /// merged shard name, or None if either is missing or they do not touch.
    pub fn merge_shards(&mut self, shard_a: &str, shard_b: &str) -> Option<String> {
        let idx_a = self.shards.iter().position(|s| s.name == shard_a)?;
        let idx_b = self.shards.iter().position(|s| s.name == shard_b)?;

        let a_first = {
            let (a, b) = (&self.shards[idx_a].key_range, &self.shards[idx_b].key_range);
            a.start.is_empty() || (!b.start.is_empty() && a.start <= b.start)
        };
        let (lo_idx, hi_idx) = if a_first { (idx_a, idx_b) } else { (idx_b, idx_a) };

        if self.shards[lo_idx].key_range.end.is_empty()
            || self.shards[lo_idx].key_range.end != self.shards[hi_idx].key_range.start
        {
            tracing::warn!(
                "ServingGraph: cannot merge non-adjacent shards {} and {}",
                shard_a,
                shard_b
            );
            return None;
        }

        let merged = ShardReference::for_range(KeyRange::new(
            self.shards[lo_idx].key_range.start.clone(),
            self.shards[hi_idx].key_range.end.clone(),
        ));
        let merged_name = merged.name.clone();
        self.shards[lo_idx] = merged;
        self.shards.remove(hi_idx);

        tracing::info!(
            "ServingGraph: merged shards {} and {} -> {}",
            shard_a,
            shard_b,
            merged_name
        );
        Some(merged_name)
    }
}

/// Parse a boundary list such as `-20-40-` into contiguous shards
/// `-20`, `20-40`, `40-`. A bare `-` yields one shard covering everything.
pub fn parse_shard_spec(spec: &str) -> Result<Vec<ShardReference>, ResolutionError> {
    let invalid = |reason: String| ResolutionError::InvalidShardSpec {
        spec: spec.to_string(),
        reason,
    };
    let bounds: Vec<&str> = spec.split('-').collect();
    if bounds.len() < 2 {
        return Err(invalid("expected at least one '-'".into()));
    }
    if !bounds[0].is_empty() || !bounds[bounds.len() - 1].is_empty() {
        return Err(invalid("must start and end with '-'".into()));
    }
    if bounds[1..bounds.len() - 1].iter().any(|b| b.is_empty()) {
        return Err(invalid("empty interior boundary".into()));
    }

    let mut shards = Vec::with_capacity(bounds.len() - 1);
    for pair in bounds.windows(2) {
        let name = format!("{}-{}", pair[0], pair[1]);
        let key_range = KeyRange::from_shard_name(&name).map_err(invalid)?;
        shards.push(ShardReference::new(name, key_range));
    }
    Ok(shards)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shard_spec() {
        let graph = ServingGraph::from_shard_spec("-20-40-").unwrap();
        assert_eq!(graph.shard_names(), vec!["-20", "20-40", "40-"]);
        assert_eq!(graph.shards[1].key_range, KeyRange::new(vec![0x20], vec![0x40]));

        let whole = parse_shard_spec("-").unwrap();
        assert_eq!(whole.len(), 1);
        assert_eq!(whole[0].key_range, KeyRange::full());

        let horizontal = parse_shard_spec("-20-30-40-60-80-a0-c0-e0-").unwrap();
        assert_eq!(horizontal.len(), 8);
        assert_eq!(horizontal[7].name, "e0-");
    }

    #[test]
    fn test_parse_shard_spec_rejects_garbage() {
        assert!(parse_shard_spec("").is_err());
        assert!(parse_shard_spec("20-40").is_err());
        assert!(parse_shard_spec("-40-20-").is_err());
        assert!(parse_shard_spec("-2g-").is_err());
        assert!(parse_shard_spec("-20--40-").is_err());
    }

    #[test]
    fn test_lookup() {
        let graph = ServingGraph::from_shard_spec("-20-40-").unwrap();
        assert_eq!(graph.shard_for_keyspace_id(&[0x10]).unwrap().name, "-20");
        assert_eq!(graph.shard_for_keyspace_id(&[0x25]).unwrap().name, "20-40");
        assert_eq!(graph.shard_for_keyspace_id(&[0xff]).unwrap().name, "40-");

        let kr = KeyRange::new(vec![0x10], vec![0x25]);
        let hit: Vec<&str> = graph
            .shards_intersecting(&kr)
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(hit, vec!["-20", "20-40"]);
    }

    #[test]
    fn test_gap_has_no_owner() {
        let graph = ServingGraph::new(vec![ShardReference::for_range(KeyRange::new(
            vec![],
            vec![0x20],
        ))]);
        assert!(graph.shard_for_keyspace_id(&[0x30]).is_none());
    }

    #[test]
    fn test_split_then_merge() {
        let mut graph = ServingGraph::from_shard_spec("-40-").unwrap();
        let (lo, hi) = graph.split_shard("-40", &[0x20]).unwrap();
        assert_eq!((lo.as_str(), hi.as_str()), ("-20", "20-40"));
        assert_eq!(graph.shard_names(), vec!["-20", "20-40", "40-"]);

        assert!(graph.split_shard("-20", &[0x30]).is_none());
        assert!(graph.split_shard("missing", &[0x10]).is_none());

        assert!(graph.merge_shards("-20", "40-").is_none());
        let merged = graph.merge_shards("20-40", "-20").unwrap();
        assert_eq!(merged, "-40");
        assert_eq!(graph.shard_names(), vec!["-40", "40-"]);
    }
}
