//! Prometheus metrics for mqmx
//!
//! Counters shared by the supervisor, the invoker, the dispatcher and the
//! relays of one connector. Each `Metrics` owns its own registry so several
//! connectors can live in one process; `encode()` renders the text format.

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// All mqmx metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Connection metrics
    pub connection_attempts: IntCounter,
    pub connections_established: IntCounter,
    pub connection_failures: IntCounter,

    // Client-side requests
    pub requests_sent: IntCounter,
    pub requests_failed: IntCounter,
    pub requests_timed_out: IntCounter,

    // Server-side requests
    pub requests_dispatched: IntCounter,
    pub requests_dropped: IntCounter,

    // Notifications
    pub notifications_forwarded: IntCounter,
    pub notifications_dropped: IntCounter,
    pub notifications_delivered: IntCounter,
    pub relay_listeners: IntGauge,
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help)).unwrap()
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        // Connection metrics
        let connection_attempts = counter(
            "mqmx_connection_attempts_total",
            "Attempts to open the shared transport connection",
        );
        let connections_established = counter(
            "mqmx_connections_established_total",
            "Shared transport connections successfully opened",
        );
        let connection_failures = counter(
            "mqmx_connection_failures_total",
            "Transport failures reported on established connections",
        );

        // Client-side requests
        let requests_sent = counter("mqmx_requests_sent_total", "Requests sent to a remote registry");
        let requests_failed = counter(
            "mqmx_requests_failed_total",
            "Requests that failed before a reply was decoded",
        );
        let requests_timed_out = counter(
            "mqmx_requests_timed_out_total",
            "Requests that got no reply within the receive timeout",
        );

        // Server-side requests
        let requests_dispatched = counter(
            "mqmx_requests_dispatched_total",
            "Requests executed and answered by the dispatcher",
        );
        let requests_dropped = counter(
            "mqmx_requests_dropped_total",
            "Requests dropped by the dispatcher before a reply could be sent",
        );

        // Notifications
        let notifications_forwarded = counter(
            "mqmx_notifications_forwarded_total",
            "Notifications sent to remote subscribers",
        );
        let notifications_dropped = counter(
            "mqmx_notifications_dropped_total",
            "Notifications that could not be serialized or sent",
        );
        let notifications_delivered = counter(
            "mqmx_notifications_delivered_total",
            "Notifications handed to local listeners by the client relay",
        );
        let relay_listeners = IntGauge::with_opts(Opts::new(
            "mqmx_relay_listeners_current",
            "Remote subscriptions currently served by the server relay",
        ))
        .unwrap();

        // Register all metrics
        registry
            .register(Box::new(connection_attempts.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_established.clone()))
            .unwrap();
        registry
            .register(Box::new(connection_failures.clone()))
            .unwrap();
        registry.register(Box::new(requests_sent.clone())).unwrap();
        registry.register(Box::new(requests_failed.clone())).unwrap();
        registry
            .register(Box::new(requests_timed_out.clone()))
            .unwrap();
        registry
            .register(Box::new(requests_dispatched.clone()))
            .unwrap();
        registry
            .register(Box::new(requests_dropped.clone()))
            .unwrap();
        registry
            .register(Box::new(notifications_forwarded.clone()))
            .unwrap();
        registry
            .register(Box::new(notifications_dropped.clone()))
            .unwrap();
        registry
            .register(Box::new(notifications_delivered.clone()))
            .unwrap();
        registry
            .register(Box::new(relay_listeners.clone()))
            .unwrap();

        Self {
            registry,
            connection_attempts,
            connections_established,
            connection_failures,
            requests_sent,
            requests_failed,
            requests_timed_out,
            requests_dispatched,
            requests_dropped,
            notifications_forwarded,
            notifications_dropped,
            notifications_delivered,
            relay_listeners,
        }
    }

    /// Render every metric in the Prometheus text format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_registered_metrics() {
        let metrics = Metrics::new();
        metrics.requests_sent.inc();
        metrics.relay_listeners.set(3);

        let text = metrics.encode();
        assert!(text.contains("mqmx_requests_sent_total 1"));
        assert!(text.contains("mqmx_relay_listeners_current 3"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = Metrics::new();
        let b = Metrics::new();
        a.requests_sent.inc();
        assert_eq!(a.requests_sent.get(), 1);
        assert_eq!(b.requests_sent.get(), 0);
    }
}
