//! Metrics initialization for Prometheus exporter.

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::MetricsConfig;
use crate::error::Result;

/// Initialize the metrics system based on configuration.
///
/// When metrics are enabled, this starts an HTTP server that exposes
/// a `/metrics` endpoint for Prometheus to scrape. When disabled, counters
/// recorded by the lookup service are no-ops.
pub fn init(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .install()
        .map_err(|err| crate::error::Error::Metrics(err.to_string()))?;

    metrics::describe_counter!(
        "autohost_lookups_total",
        "Override lookups by outcome (trusted_dns, host_table, blocked, miss, malformed)"
    );

    Ok(())
}
