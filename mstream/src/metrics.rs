//! Metrics module for Prometheus integration

use prometheus::{CounterVec, Encoder, Opts, Registry, TextEncoder};
use std::sync::Arc;

const NAMESPACE: &str = "mstream";
const SUBSYSTEM: &str = "change_stream";
const LABELS: &[&str] = &["database", "collection"];

/// Change stream counters, labelled by database and collection.
///
/// Cloning is cheap; clones share the same registry and counters.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    received: Arc<CounterVec>,
    received_bytes: Arc<CounterVec>,
    handle_success: Arc<CounterVec>,
    handle_failed: Arc<CounterVec>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(name: &str, help: &str) -> Arc<CounterVec> {
    let opts = Opts::new(name, help)
        .namespace(NAMESPACE)
        .subsystem(SUBSYSTEM);
    Arc::new(CounterVec::new(opts, LABELS).expect("Failed to create change stream counter"))
}

impl Metrics {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let received = counter(
            "received_total",
            "Total number of change stream events received",
        );
        let received_bytes = counter(
            "received_bytes_total",
            "Total number of change stream bytes received",
        );
        let handle_success = counter(
            "handle_event_success_total",
            "Total number of change stream events handled successfully",
        );
        let handle_failed = counter(
            "handle_event_failed_total",
            "Total number of change stream events that failed to be handled",
        );

        for metric in [&received, &received_bytes, &handle_success, &handle_failed] {
            registry
                .register(Box::new((**metric).clone()))
                .expect("Failed to register change stream counter");
        }

        Self {
            registry,
            received,
            received_bytes,
            handle_success,
            handle_failed,
        }
    }

    /// Record a received change stream event
    pub fn record_received(&self, database: &str, collection: &str) {
        self.received.with_label_values(&[database, collection]).inc();
    }

    /// Record the encoded size of a received event
    pub fn record_received_bytes(&self, database: &str, collection: &str, size: usize) {
        self.received_bytes
            .with_label_values(&[database, collection])
            .inc_by(size as f64);
    }

    /// Record an event published and acknowledged downstream
    pub fn record_handle_success(&self, database: &str, collection: &str) {
        self.handle_success
            .with_label_values(&[database, collection])
            .inc();
    }

    /// Record an event that could not be decoded or published
    pub fn record_handle_failed(&self, database: &str, collection: &str) {
        self.handle_failed
            .with_label_values(&[database, collection])
            .inc();
    }

    pub fn received(&self, database: &str, collection: &str) -> u64 {
        self.received.with_label_values(&[database, collection]).get() as u64
    }

    pub fn received_bytes(&self, database: &str, collection: &str) -> u64 {
        self.received_bytes
            .with_label_values(&[database, collection])
            .get() as u64
    }

    pub fn handle_success(&self, database: &str, collection: &str) -> u64 {
        self.handle_success
            .with_label_values(&[database, collection])
            .get() as u64
    }

    pub fn handle_failed(&self, database: &str, collection: &str) -> u64 {
        self.handle_failed
            .with_label_values(&[database, collection])
            .get() as u64
    }

    /// Export metrics in Prometheus format
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        assert_eq!(metrics.received("app", "users"), 0);
        assert_eq!(metrics.handle_failed("app", "users"), 0);
    }

    #[test]
    fn test_counters_are_per_collection() {
        let metrics = Metrics::new();

        metrics.record_received("app", "users");
        metrics.record_received("app", "users");
        metrics.record_received("app", "orders");
        metrics.record_received_bytes("app", "users", 120);
        metrics.record_handle_success("app", "users");
        metrics.record_handle_failed("app", "orders");

        assert_eq!(metrics.received("app", "users"), 2);
        assert_eq!(metrics.received("app", "orders"), 1);
        assert_eq!(metrics.received_bytes("app", "users"), 120);
        assert_eq!(metrics.handle_success("app", "users"), 1);
        assert_eq!(metrics.handle_failed("app", "users"), 0);
        assert_eq!(metrics.handle_failed("app", "orders"), 1);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = Metrics::new();
        metrics.clone().record_handle_success("app", "users");
        assert_eq!(metrics.handle_success("app", "users"), 1);
    }

    #[test]
    fn test_export() {
        let metrics = Metrics::new();
        metrics.record_received("app", "users");
        metrics.record_received_bytes("app", "users", 10);
        metrics.record_handle_success("app", "users");
        metrics.record_handle_failed("app", "users");

        let export = metrics.export().unwrap();
        assert!(export.contains("mstream_change_stream_received_total"));
        assert!(export.contains("mstream_change_stream_received_bytes_total"));
        assert!(export.contains("mstream_change_stream_handle_event_success_total"));
        assert!(export.contains("mstream_change_stream_handle_event_failed_total"));
        assert!(export.contains(r#"collection="users",database="app""#));
    }
}
