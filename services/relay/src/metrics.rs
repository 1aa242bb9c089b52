// Prometheus registry and the counters/gauges/histograms named in
// spec.md §6. Grounded on `kofj-nostr-rs-relay`'s `NostrMetrics` struct and
// `create_metrics()` pattern, adapted to this relay's own label set; exposed
// through `http::metrics::get_metrics` in the text exposition format
// instead of that example's per-connection JSON aggregate.

use prometheus::{Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub struct Metrics {
    pub registry: Registry,
    pub messages_received: IntCounter,
    pub messages_sent: IntCounter,
    pub commands_received: IntCounterVec,
    pub events_processed: IntCounterVec,
    pub duplicate_events: IntCounter,
    pub http_requests: IntCounter,
    pub errors: IntCounterVec,
    pub db_operations: IntCounterVec,
    pub db_errors: IntCounterVec,
    pub active_connections: IntGauge,
    pub active_subscriptions: IntGauge,
    pub events_stored: IntGauge,
    pub message_size_in: Histogram,
    pub message_size_out: Histogram,
    pub command_processing_duration: HistogramVec,
    pub http_request_duration: Histogram,
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_received = IntCounter::new("relay_messages_received_total", "inbound frames received").unwrap();
        let messages_sent = IntCounter::new("relay_messages_sent_total", "outbound frames sent").unwrap();
        let commands_received = IntCounterVec::new(
            Opts::new("relay_commands_received_total", "client commands received by type"),
            &["command"],
        )
        .unwrap();
        let events_processed = IntCounterVec::new(
            Opts::new("relay_events_processed_total", "events processed by class"),
            &["class"],
        )
        .unwrap();
        let duplicate_events = IntCounter::new("relay_duplicate_events_total", "events short-circuited as duplicates").unwrap();
        let http_requests = IntCounter::new("relay_http_requests_total", "HTTP requests served").unwrap();
        let errors = IntCounterVec::new(
            Opts::new("relay_errors_total", "errors by class"),
            &["class"],
        )
        .unwrap();
        let db_operations = IntCounterVec::new(
            Opts::new("relay_db_operations_total", "database operations by label"),
            &["operation"],
        )
        .unwrap();
        let db_errors = IntCounterVec::new(
            Opts::new("relay_db_errors_total", "database errors by label"),
            &["operation"],
        )
        .unwrap();
        let active_connections = IntGauge::new("relay_active_connections", "currently open sessions").unwrap();
        let active_subscriptions = IntGauge::new("relay_active_subscriptions", "currently registered subscriptions").unwrap();
        let events_stored = IntGauge::new("relay_events_stored", "rows in the event table").unwrap();
        let message_size_in = Histogram::with_opts(HistogramOpts::new("relay_message_size_in_bytes", "inbound frame size")).unwrap();
        let message_size_out = Histogram::with_opts(HistogramOpts::new("relay_message_size_out_bytes", "outbound frame size")).unwrap();
        let command_processing_duration = HistogramVec::new(
            HistogramOpts::new("relay_command_processing_duration_seconds", "command handling latency by type"),
            &["command"],
        )
        .unwrap();
        let http_request_duration = Histogram::with_opts(HistogramOpts::new("relay_http_request_duration_seconds", "HTTP request latency")).unwrap();

        for c in [
            Box::new(messages_received.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(messages_sent.clone()),
            Box::new(commands_received.clone()),
            Box::new(events_processed.clone()),
            Box::new(duplicate_events.clone()),
            Box::new(http_requests.clone()),
            Box::new(errors.clone()),
            Box::new(db_operations.clone()),
            Box::new(db_errors.clone()),
            Box::new(active_connections.clone()),
            Box::new(active_subscriptions.clone()),
            Box::new(events_stored.clone()),
            Box::new(message_size_in.clone()),
            Box::new(message_size_out.clone()),
            Box::new(command_processing_duration.clone()),
            Box::new(http_request_duration.clone()),
        ] {
            registry.register(c).expect("metric names are unique");
        }

        Self {
            registry,
            messages_received,
            messages_sent,
            commands_received,
            events_processed,
            duplicate_events,
            http_requests,
            errors,
            db_operations,
            db_errors,
            active_connections,
            active_subscriptions,
            events_stored,
            message_size_in,
            message_size_out,
            command_processing_duration,
            http_request_duration,
        }
    }

    #[must_use]
    pub fn encode(&self) -> String {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if TextEncoder::new().encode(&families, &mut buffer).is_err() {
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
