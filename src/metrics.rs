//! Prometheus Metrics for the Chat Relay
//!
//! Connection, presence and delivery counters served on `/metrics`.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

use crate::delivery::DeliveryOutcome;
use crate::presence::AnnounceReport;

/// Relay server metrics.
#[derive(Clone)]
pub struct RelayMetrics {
    pub registry: Arc<Registry>,

    // Connections
    /// WebSocket connections accepted.
    pub connections_total: IntCounter,
    /// Connections currently open.
    pub connections_active: IntGauge,
    /// Connections opened without an identity.
    pub connections_anonymous: IntCounter,
    /// Sockets dropped at the connection cap or failing the upgrade.
    pub connections_rejected: IntCounter,
    /// Identities currently in the registry.
    pub online_identities: IntGauge,

    // Presence
    pub presence_broadcasts: IntCounter,
    pub presence_push_failures: IntCounter,
    /// Registry entries removed after a failed push.
    pub stale_handles_evicted: IntCounter,

    // Messages
    pub messages_persisted: IntCounter,
    pub messages_delivered: IntCounter,
    pub recipients_offline: IntCounter,
    pub delivery_failures: IntCounter,
    /// Sends refused (validation, image, storage).
    pub sends_rejected: IntCounter,
    pub rate_limited: IntCounter,
    /// Send handling duration, upload through delivery.
    pub send_duration: Histogram,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::with_opts(Opts::new(name, help)).unwrap();
    registry.register(Box::new(metric.clone())).unwrap();
    metric
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let metric = IntGauge::with_opts(Opts::new(name, help)).unwrap();
    registry.register(Box::new(metric.clone())).unwrap();
    metric
}

impl RelayMetrics {
    /// Creates a new metrics instance with all metrics registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let send_duration = Histogram::with_opts(HistogramOpts::new(
            "chat_send_duration_seconds",
            "Message send handling duration in seconds",
        ))
        .unwrap();
        registry.register(Box::new(send_duration.clone())).unwrap();

        RelayMetrics {
            connections_total: counter(
                &registry,
                "chat_connections_total",
                "Total WebSocket connections accepted",
            ),
            connections_active: gauge(
                &registry,
                "chat_connections_active",
                "Current open WebSocket connections",
            ),
            connections_anonymous: counter(
                &registry,
                "chat_connections_anonymous_total",
                "Connections opened without an identity",
            ),
            connections_rejected: counter(
                &registry,
                "chat_connections_rejected_total",
                "Connections rejected at the cap or during upgrade",
            ),
            online_identities: gauge(
                &registry,
                "chat_online_identities",
                "Identities currently online",
            ),
            presence_broadcasts: counter(
                &registry,
                "chat_presence_broadcasts_total",
                "Presence announcements",
            ),
            presence_push_failures: counter(
                &registry,
                "chat_presence_push_failures_total",
                "Presence pushes that failed",
            ),
            stale_handles_evicted: counter(
                &registry,
                "chat_stale_handles_evicted_total",
                "Registry entries evicted after a failed push",
            ),
            messages_persisted: counter(
                &registry,
                "chat_messages_persisted_total",
                "Messages durably stored",
            ),
            messages_delivered: counter(
                &registry,
                "chat_messages_delivered_total",
                "Messages pushed live to their recipient",
            ),
            recipients_offline: counter(
                &registry,
                "chat_recipients_offline_total",
                "Messages stored for an offline recipient",
            ),
            delivery_failures: counter(
                &registry,
                "chat_delivery_failures_total",
                "Live pushes that failed",
            ),
            sends_rejected: counter(
                &registry,
                "chat_sends_rejected_total",
                "Send requests refused",
            ),
            rate_limited: counter(
                &registry,
                "chat_rate_limited_total",
                "Send requests rate limited",
            ),
            send_duration,
            registry: Arc::new(registry),
        }
    }

    pub fn record_announce(&self, report: &AnnounceReport) {
        self.presence_broadcasts.inc();
        self.presence_push_failures
            .inc_by((report.attempted - report.delivered) as u64);
        self.stale_handles_evicted.inc_by(report.evicted as u64);
    }

    pub fn record_delivery(&self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered => self.messages_delivered.inc(),
            DeliveryOutcome::Offline => self.recipients_offline.inc(),
            DeliveryOutcome::Failed => self.delivery_failures.inc(),
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
