//! Observability setup: structured logging and metrics facade helpers.

use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,shardgate=debug"))
}

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer)
        .init();

    tracing::info!("shardgate tracing initialized");
}

/// Like `init_tracing`, but returns `false` instead of panicking when a
/// subscriber is already installed. Tests call this from many places.
pub fn try_init_tracing() -> bool {
    let installed = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_test_writer())
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!("test tracing subscriber installed");
    }
    installed
}

/// Record one scatter call.
pub fn record_scatter_metrics(op: &'static str, shards: usize, failed: usize, duration_us: u64) {
    metrics::counter!("shardgate_scatter_total", "op" => op, "success" => (failed == 0).to_string())
        .increment(1);
    metrics::histogram!("shardgate_scatter_shards", "op" => op).record(shards as f64);
    metrics::histogram!("shardgate_scatter_duration_us", "op" => op).record(duration_us as f64);
    if failed > 0 {
        metrics::counter!("shardgate_shard_failures_total", "op" => op).increment(failed as u64);
    }
}

/// Record the outcome of a resolver attempt: `ok`, `error` or `retry`.
pub fn record_resolver_attempt(op: &'static str, outcome: &'static str) {
    metrics::counter!("shardgate_resolver_attempts_total", "op" => op, "outcome" => outcome)
        .increment(1);
}

/// Record a serving-graph fetch from the topology server.
pub fn record_topology_fetch(keyspace: &str, success: bool) {
    metrics::counter!(
        "shardgate_topology_fetch_total",
        "keyspace" => keyspace.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
}

/// Record a topology cache invalidation.
pub fn record_topology_invalidation(keyspace: &str) {
    metrics::counter!("shardgate_topology_invalidations_total", "keyspace" => keyspace.to_string())
        .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_init_tracing_installs_once() {
        let _ = try_init_tracing();
        assert!(!try_init_tracing());
        assert!(tracing::dispatcher::has_been_set());
    }
}
