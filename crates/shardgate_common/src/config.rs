use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level gateway configuration, loaded from `shardgate.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Cell whose serving graphs this gateway reads.
    pub cell: String,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub scatter: ScatterConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cell: "local".to_string(),
            resolver: ResolverConfig::default(),
            scatter: ScatterConfig::default(),
            topology: TopologyConfig::default(),
        }
    }
}

/// Re-resolution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Re-resolve and send once more on a retryable failure (default: true).
    pub retry_on_reshard: bool,
    /// Never start the retry once this much wall time has passed since the
    /// call started, in milliseconds (0 = no limit).
    pub retry_budget_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            retry_on_reshard: true,
            retry_budget_ms: 0,
        }
    }
}

impl ResolverConfig {
    pub fn retry_budget(&self) -> Option<Duration> {
        (self.retry_budget_ms > 0).then(|| Duration::from_millis(self.retry_budget_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScatterConfig {
    /// Chunks buffered between shard streams and the caller's sink (default: 16).
    pub stream_buffer_chunks: usize,
    /// Per-shard call timeout in milliseconds (0 = bounded only by the call context).
    pub shard_timeout_ms: u64,
}

impl Default for ScatterConfig {
    fn default() -> Self {
        Self {
            stream_buffer_chunks: 16,
            shard_timeout_ms: 0,
        }
    }
}

impl ScatterConfig {
    pub fn shard_timeout(&self) -> Option<Duration> {
        (self.shard_timeout_ms > 0).then(|| Duration::from_millis(self.shard_timeout_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Served-from redirects followed per resolution. Only 1 is supported.
    pub max_redirect_depth: u32,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            max_redirect_depth: 1,
        }
    }
}

impl GatewayConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, String> {
        let config: GatewayConfig =
            toml::from_str(s).map_err(|e| format!("invalid gateway config: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.cell.trim().is_empty() {
            return Err("cell must not be empty".into());
        }
        if self.scatter.stream_buffer_chunks == 0 {
            return Err("scatter.stream_buffer_chunks must be > 0".into());
        }
        if self.topology.max_redirect_depth != 1 {
            return Err(format!(
                "topology.max_redirect_depth must be 1, got {}",
                self.topology.max_redirect_depth
            ));
        }
        Ok(())
    }
}
