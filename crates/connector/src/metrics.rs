//! Prometheus metrics for the book sync client.
//!
//! Each client owns its own `Registry` so several clients (and tests) can
//! coexist in one process. The daemon serves it from `/metrics`.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::types::ConnectionState;

pub struct SyncMetrics {
    registry: Registry,
    pub frames_received: IntCounter,
    pub events: IntCounterVec,
    pub decode_errors: IntCounter,
    pub deltas_skipped: IntCounterVec,
    pub desyncs: IntCounter,
    pub resubscribes: IntCounter,
    pub rejections: IntCounter,
    pub reconnect_attempts: IntCounter,
    pub disconnects: IntCounter,
    pub events_dropped: IntCounter,
    pub connection_state: IntGauge,
    pub assets_registered: IntGauge,
    pub assets_confirmed: IntGauge,
    pub books_stale: IntGauge,
}

impl SyncMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let frames_received =
            IntCounter::new("polybook_frames_received_total", "Text frames received")?;
        let events = IntCounterVec::new(
            Opts::new("polybook_events_total", "Decoded domain events"),
            &["kind"],
        )?;
        let decode_errors = IntCounter::new(
            "polybook_decode_errors_total",
            "Frames discarded because they could not be decoded",
        )?;
        let deltas_skipped = IntCounterVec::new(
            Opts::new(
                "polybook_deltas_skipped_total",
                "Deltas not applied to any book",
            ),
            &["reason"],
        )?;
        let desyncs = IntCounter::new(
            "polybook_desyncs_total",
            "Fingerprint mismatches detected after applying a delta",
        )?;
        let resubscribes = IntCounter::new(
            "polybook_resubscribes_total",
            "Targeted single-asset resubscribes sent",
        )?;
        let rejections = IntCounter::new(
            "polybook_rejections_total",
            "Assets dropped because the feed will not serve them",
        )?;
        let reconnect_attempts = IntCounter::new(
            "polybook_reconnect_attempts_total",
            "Failed connection attempts followed by a backoff delay",
        )?;
        let disconnects =
            IntCounter::new("polybook_disconnects_total", "Established sessions lost")?;
        let events_dropped = IntCounter::new(
            "polybook_events_dropped_total",
            "Observer events dropped because the event channel was full",
        )?;
        let connection_state = IntGauge::new(
            "polybook_connection_state",
            "0=disconnected 1=connecting 2=resubscribing 3=connected",
        )?;
        let assets_registered =
            IntGauge::new("polybook_assets_registered", "Assets in the subscription registry")?;
        let assets_confirmed = IntGauge::new(
            "polybook_assets_confirmed",
            "Assets with a snapshot on the current connection",
        )?;
        let books_stale = IntGauge::new("polybook_books_stale", "Books currently considered stale")?;

        registry.register(Box::new(frames_received.clone()))?;
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(deltas_skipped.clone()))?;
        registry.register(Box::new(desyncs.clone()))?;
        registry.register(Box::new(resubscribes.clone()))?;
        registry.register(Box::new(rejections.clone()))?;
        registry.register(Box::new(reconnect_attempts.clone()))?;
        registry.register(Box::new(disconnects.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(connection_state.clone()))?;
        registry.register(Box::new(assets_registered.clone()))?;
        registry.register(Box::new(assets_confirmed.clone()))?;
        registry.register(Box::new(books_stale.clone()))?;

        Ok(Self {
            registry,
            frames_received,
            events,
            decode_errors,
            deltas_skipped,
            desyncs,
            resubscribes,
            rejections,
            reconnect_attempts,
            disconnects,
            events_dropped,
            connection_state,
            assets_registered,
            assets_confirmed,
            books_stale,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        self.connection_state.set(state.as_gauge());
    }

    /// Text exposition format for the `/metrics` endpoint.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_registries() {
        let a = SyncMetrics::new().unwrap();
        let b = SyncMetrics::new().unwrap();
        a.frames_received.inc();
        assert_eq!(a.frames_received.get(), 1);
        assert_eq!(b.frames_received.get(), 0);
    }

    #[test]
    fn test_encode_contains_metrics() {
        let metrics = SyncMetrics::new().unwrap();
        metrics.events.with_label_values(&["snapshot"]).inc();
        metrics.set_connection_state(ConnectionState::Connected);

        let text = metrics.encode().unwrap();
        assert!(text.contains("polybook_events_total{kind=\"snapshot\"} 1"));
        assert!(text.contains("polybook_connection_state 3"));
    }
}
