//! Prometheus metrics
//!
//! Recording goes through the `metrics` facade, so a [`GatewayMetrics`]
//! without an installed exporter is a cheap no-op. The binary installs the
//! Prometheus recorder once and serves [`GatewayMetrics::render`] on
//! `/metrics`.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;

/// Gateway metrics collector
#[derive(Clone, Default)]
pub struct GatewayMetrics {
    handle: Option<Arc<PrometheusHandle>>,
}

impl std::fmt::Debug for GatewayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayMetrics")
            .field("installed", &self.handle.is_some())
            .finish()
    }
}

impl GatewayMetrics {
    /// Install the global Prometheus recorder.
    ///
    /// Fails if a recorder is already installed in this process.
    pub fn install() -> Result<Self, BuildError> {
        let handle = PrometheusBuilder::new().install_recorder()?;

        Self::register_metrics();

        Ok(Self {
            handle: Some(Arc::new(handle)),
        })
    }

    /// Metrics that record into whatever recorder is installed, if any
    pub fn detached() -> Self {
        Self::default()
    }

    fn register_metrics() {
        describe_counter!(
            "gateway_events_received_total",
            Unit::Count,
            "Total dispatch events received from the gateway"
        );
        describe_counter!(
            "gateway_reconnects_total",
            Unit::Count,
            "Transport reconnects per shard"
        );
        describe_counter!(
            "gateway_errors_total",
            Unit::Count,
            "Total gateway errors"
        );

        describe_histogram!(
            "gateway_heartbeat_latency_seconds",
            Unit::Seconds,
            "Heartbeat round trip time"
        );

        describe_gauge!(
            "gateway_shards_ready",
            Unit::Count,
            "Number of shards in ready state"
        );
        describe_gauge!(
            "gateway_shards_total",
            Unit::Count,
            "Number of shards run by this process"
        );
    }

    /// Record a dispatch received
    pub fn record_event(&self, shard_id: u32, event_name: &str) {
        counter!(
            "gateway_events_received_total",
            "shard_id" => shard_id.to_string(),
            "event_type" => event_name.to_ascii_lowercase()
        )
        .increment(1);
    }

    pub fn record_reconnect(&self, shard_id: u32) {
        counter!(
            "gateway_reconnects_total",
            "shard_id" => shard_id.to_string()
        )
        .increment(1);
    }

    /// Record gateway error, labelled by `GatewayError::error_type_label`
    pub fn record_error(&self, shard_id: u32, error_type: &'static str) {
        counter!(
            "gateway_errors_total",
            "shard_id" => shard_id.to_string(),
            "error_type" => error_type
        )
        .increment(1);
    }

    /// Record a heartbeat round trip
    pub fn record_heartbeat(&self, shard_id: u32, latency: Duration) {
        histogram!(
            "gateway_heartbeat_latency_seconds",
            "shard_id" => shard_id.to_string()
        )
        .record(latency.as_secs_f64());
    }

    pub fn set_shards(&self, ready: usize, total: usize) {
        gauge!("gateway_shards_ready").set(ready as f64);
        gauge!("gateway_shards_total").set(total as f64);
    }

    /// Render metrics in Prometheus format; empty when not installed
    pub fn render(&self) -> String {
        self.handle
            .as_ref()
            .map(|handle| handle.render())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_metrics_record_without_recorder() {
        let metrics = GatewayMetrics::detached();
        metrics.record_event(0, "MESSAGE_CREATE");
        metrics.record_reconnect(0);
        metrics.record_error(0, "transport");
        metrics.record_heartbeat(0, Duration::from_millis(42));
        metrics.set_shards(1, 2);
        assert!(metrics.render().is_empty());
    }
}
