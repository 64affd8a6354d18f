use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Opaque sharding key. Ordered byte-wise; the shard owning a keyspace id is
/// the one whose key range contains it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyspaceId(pub Vec<u8>);

impl KeyspaceId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for KeyspaceId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Display for KeyspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Half-open byte interval `[start, end)`. An empty `start` means unbounded
/// below, an empty `end` means unbounded above.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// The whole keyspace.
    pub fn full() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &[u8]) -> bool {
        (self.start.is_empty() || id >= self.start.as_slice())
            && (self.end.is_empty() || id < self.end.as_slice())
    }

    /// True when the two intervals share at least one key.
    pub fn intersects(&self, other: &KeyRange) -> bool {
        (self.end.is_empty() || other.start.as_slice() < self.end.as_slice())
            && (other.end.is_empty() || self.start.as_slice() < other.end.as_slice())
    }

    /// Parse a shard name of the form `<hex>-<hex>`, e.g. `20-40`, `-80`, `80-`.
    /// A bare `-` or `0` names the whole keyspace.
    pub fn from_shard_name(name: &str) -> Result<Self, String> {
        if name == "0" || name == "-" {
            return Ok(Self::full());
        }
        let (start, end) = name
            .split_once('-')
            .ok_or_else(|| format!("shard name {name:?} has no '-' separator"))?;
        let start = hex::decode(start).map_err(|e| format!("bad start in {name:?}: {e}"))?;
        let end = hex::decode(end).map_err(|e| format!("bad end in {name:?}: {e}"))?;
        if !start.is_empty() && !end.is_empty() && start >= end {
            return Err(format!("shard name {name:?} has start >= end"));
        }
        Ok(Self { start, end })
    }

    /// Canonical shard name for this range.
    pub fn shard_name(&self) -> String {
        format!("{}-{}", hex::encode(&self.start), hex::encode(&self.end))
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{})", self.shard_name())
    }
}

/// Which class of replica a query is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TabletRole {
    Primary,
    Replica,
    Rdonly,
}

impl TabletRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Replica => "replica",
            Self::Rdonly => "rdonly",
        }
    }
}

impl Default for TabletRole {
    fn default() -> Self {
        Self::Primary
    }
}

impl fmt::Display for TabletRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TabletRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "primary" | "master" => Ok(Self::Primary),
            "replica" => Ok(Self::Replica),
            "rdonly" | "batch" => Ok(Self::Rdonly),
            other => Err(format!("unknown tablet role: {other}")),
        }
    }
}

/// A single dispatch destination: one shard of one keyspace at one role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardTarget {
    pub keyspace: String,
    pub shard: String,
    pub role: TabletRole,
}

impl ShardTarget {
    pub fn new(keyspace: impl Into<String>, shard: impl Into<String>, role: TabletRole) -> Self {
        Self {
            keyspace: keyspace.into(),
            shard: shard.into(),
            role,
        }
    }
}

impl fmt::Display for ShardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.keyspace, self.shard, self.role)
    }
}

/// Address of a tablet serving a shard: host plus named ports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TabletEndpoint {
    pub host: String,
    pub port_map: BTreeMap<String, u32>,
}

impl TabletEndpoint {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port_map: BTreeMap::new(),
        }
    }

    pub fn with_port(mut self, name: impl Into<String>, port: u32) -> Self {
        self.port_map.insert(name.into(), port);
        self
    }
}

/// Rendered in protobuf text style, e.g. `host:"-20" port_map:<key:"vt" value:1 >`.
impl fmt::Display for TabletEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host:{:?}", self.host)?;
        for (name, port) in &self.port_map {
            write!(f, " port_map:<key:{name:?} value:{port} >")?;
        }
        Ok(())
    }
}
