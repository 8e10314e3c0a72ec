// Copyright (c) 2024 Botho Foundation

//! Prometheus metrics for the topology manager.
//!
//! ## Metrics Exported
//!
//! - `<ns>_events_received_total{kind,action}` - Events offered to the filter (counter)
//! - `<ns>_events_admitted_total{kind}` - Events admitted (counter)
//! - `<ns>_events_rejected_total{reason}` - Events rejected (counter)
//! - `<ns>_batches_processed_total` - Batches applied (counter)
//! - `<ns>_batch_size` - Events per batch (histogram)
//! - `<ns>_postponed_events{kind}` - Size of the postponement caches (gauge)
//! - `<ns>_graph_elements{kind}` - Elements in the graph (gauge)
//! - `<ns>_known_masters` - Switches with a recorded master (gauge)
//!
//! `<ns>` defaults to `ntc_topology`.

use crate::{
    error::TopologyResult,
    event::{EventAction, ElementKind},
};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

const BATCH_SIZE_BUCKETS: &[f64] = &[1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0];

/// Prometheus metrics owned by one topology manager.
#[derive(Clone)]
pub struct TopologyMetrics {
    registry: Registry,
    /// Events offered to the admission filter
    pub events_received: IntCounterVec,
    /// Events admitted by the filter
    pub events_admitted: IntCounterVec,
    /// Events rejected by the filter
    pub events_rejected: IntCounterVec,
    /// Batches applied
    pub batches_processed: IntCounter,
    /// Events per batch
    pub batch_size: Histogram,
    /// Postponement cache sizes
    pub postponed_events: IntGaugeVec,
    /// Element counts in the published graph
    pub graph_elements: IntGaugeVec,
    /// Switches with a recorded master
    pub known_masters: IntGauge,
}

impl TopologyMetrics {
    /// Create and register all metrics under `namespace`.
    pub fn new(namespace: &str) -> TopologyResult<Self> {
        let registry = Registry::new();

        let events_received = IntCounterVec::new(
            Opts::new("events_received_total", "Events offered to the admission filter")
                .namespace(namespace),
            &["kind", "action"],
        )?;
        let events_admitted = IntCounterVec::new(
            Opts::new("events_admitted_total", "Events admitted").namespace(namespace),
            &["kind"],
        )?;
        let events_rejected = IntCounterVec::new(
            Opts::new("events_rejected_total", "Events rejected").namespace(namespace),
            &["reason"],
        )?;
        let batches_processed = IntCounter::with_opts(
            Opts::new("batches_processed_total", "Batches applied").namespace(namespace),
        )?;
        let batch_size = Histogram::with_opts(
            HistogramOpts::new("batch_size", "Events per batch")
                .namespace(namespace)
                .buckets(BATCH_SIZE_BUCKETS.to_vec()),
        )?;
        let postponed_events = IntGaugeVec::new(
            Opts::new("postponed_events", "Events waiting for a missing parent")
                .namespace(namespace),
            &["kind"],
        )?;
        let graph_elements = IntGaugeVec::new(
            Opts::new("graph_elements", "Elements in the topology graph").namespace(namespace),
            &["kind"],
        )?;
        let known_masters = IntGauge::with_opts(
            Opts::new("known_masters", "Switches with a recorded master").namespace(namespace),
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_admitted.clone()))?;
        registry.register(Box::new(events_rejected.clone()))?;
        registry.register(Box::new(batches_processed.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(postponed_events.clone()))?;
        registry.register(Box::new(graph_elements.clone()))?;
        registry.register(Box::new(known_masters.clone()))?;

        Ok(Self {
            registry,
            events_received,
            events_admitted,
            events_rejected,
            batches_processed,
            batch_size,
            postponed_events,
            graph_elements,
            known_masters,
        })
    }

    /// Record an event offered to the filter.
    pub fn record_received(&self, kind: ElementKind, action: EventAction) {
        let action = match action {
            EventAction::Add => "add",
            EventAction::Remove => "remove",
        };
        self.events_received
            .with_label_values(&[kind.as_str(), action])
            .inc();
    }

    /// Record an admitted event.
    pub fn record_admitted(&self, kind: ElementKind) {
        self.events_admitted.with_label_values(&[kind.as_str()]).inc();
    }

    /// Record a rejected event.
    pub fn record_rejected(&self, reason: &str) {
        self.events_rejected.with_label_values(&[reason]).inc();
    }

    /// Record a processed batch of `size` events.
    pub fn record_batch(&self, size: usize) {
        self.batches_processed.inc();
        self.batch_size.observe(size as f64);
    }

    /// Set the size of one postponement cache.
    pub fn set_postponed(&self, kind: ElementKind, count: usize) {
        self.postponed_events
            .with_label_values(&[kind.as_str()])
            .set(count as i64);
    }

    /// Set the element count of one kind.
    pub fn set_graph_elements(&self, kind: ElementKind, count: usize) {
        self.graph_elements
            .with_label_values(&[kind.as_str()])
            .set(count as i64);
    }

    /// Borrow the underlying registry, e.g. to serve it over HTTP.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode metrics in Prometheus text format.
    pub fn gather_text(&self) -> TopologyResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_with_namespace() {
        let metrics = TopologyMetrics::new("ntc_topology").unwrap();
        metrics.record_received(ElementKind::Port, EventAction::Add);
        metrics.record_batch(3);
        metrics.set_postponed(ElementKind::Link, 2);

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("ntc_topology_events_received_total{action=\"add\",kind=\"port\"} 1"));
        assert!(text.contains("ntc_topology_batches_processed_total 1"));
        assert!(text.contains("ntc_topology_postponed_events{kind=\"link\"} 2"));
    }

    #[test]
    fn test_independent_registries() {
        let a = TopologyMetrics::new("a").unwrap();
        let b = TopologyMetrics::new("a").unwrap();
        a.known_masters.set(4);
        assert_eq!(b.known_masters.get(), 0);
    }

    #[test]
    fn test_invalid_namespace_is_an_error() {
        assert!(TopologyMetrics::new("bad namespace").is_err());
    }
}
