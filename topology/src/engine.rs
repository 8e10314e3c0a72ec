// Copyright (c) 2024 Botho Foundation

//! The single-threaded event pipeline.
//!
//! ```text
//! entries -> validate -> admit -> classify -> schedule/apply -> snapshot
//!                          |                        ^
//!                          +-- pending (new master) +
//! ```
//!
//! The engine owns the graph, the admission state and the postponement
//! caches. It is driven by exactly one thread; see [`crate::manager`].

use crate::{
    applier::GraphApplier,
    classifier::classify,
    config::TopologyConfig,
    event::{ElementKind, EventEntry},
    graph::{SnapshotReader, TopologyGraph, TopologySnapshot},
    listener::TopologyEvents,
    metrics::TopologyMetrics,
    preprocessor::{Admission, Preprocessor},
    registry::MastershipRegistry,
    scheduler::{Scheduler, POSTPONABLE_KINDS},
};
use std::sync::Arc;
use tracing::{debug, error};

/// Admission, ordering and application of event batches.
pub struct TopologyEngine {
    preprocessor: Preprocessor,
    scheduler: Scheduler,
    applier: GraphApplier,
    metrics: TopologyMetrics,
    reader: SnapshotReader,
    version: u64,
}

impl TopologyEngine {
    /// Create an engine over an empty graph.
    pub fn new(
        config: &TopologyConfig,
        registry: Arc<dyn MastershipRegistry>,
        metrics: TopologyMetrics,
    ) -> Self {
        Self {
            preprocessor: Preprocessor::new(registry, config.registry_timeout()),
            scheduler: Scheduler::new(config.postponed_warn_threshold),
            applier: GraphApplier::new(),
            metrics,
            reader: SnapshotReader::new(),
            version: 0,
        }
    }

    /// Run one batch through the whole pipeline and return what changed.
    ///
    /// Invalid events are logged and skipped; the rest of the batch still
    /// applies.
    pub fn process_batch(&mut self, entries: Vec<EventEntry>) -> TopologyEvents {
        let received = entries.len();
        let mut admitted = Vec::with_capacity(received);

        for entry in entries {
            self.metrics
                .record_received(entry.event.kind(), entry.action);
            if let Err(err) = entry.event.validate() {
                error!(error = %err, "Dropping invalid topology event");
                self.metrics.record_rejected("invalid");
                continue;
            }

            let mut pending = Vec::new();
            match self.preprocessor.admit(&entry, &mut pending) {
                Admission::Admitted => {
                    self.metrics.record_admitted(entry.event.kind());
                    admitted.push(entry);
                }
                Admission::Rejected(reason) => {
                    debug!(entry = %entry, reason = %reason, "Topology event not admitted");
                    self.metrics.record_rejected(reason.as_str());
                }
            }
            admitted.extend(pending);
        }

        let batch = classify(admitted);
        let mut changes = TopologyEvents::default();
        let preprocessor = &self.preprocessor;
        let report = self.scheduler.schedule(
            &batch,
            &mut self.applier,
            |event, owner| preprocessor.is_admissible_for(event, owner),
            &mut changes,
        );
        debug!(
            received,
            net = batch.len(),
            applied = report.applied,
            postponed = report.postponed,
            ignored = report.ignored,
            replayed = report.replayed,
            "Processed topology batch"
        );

        if !changes.is_empty() {
            self.version += 1;
            self.reader.publish(TopologySnapshot::new(
                self.version,
                self.applier.graph().clone(),
            ));
        }
        self.update_gauges();
        self.metrics.record_batch(received);
        changes
    }

    fn update_gauges(&self) {
        for kind in POSTPONABLE_KINDS {
            self.metrics
                .set_postponed(kind, self.scheduler.postponed_len(kind));
        }
        for kind in ElementKind::ADD_ORDER {
            self.metrics
                .set_graph_elements(kind, self.applier.graph().count(kind));
        }
        self.metrics
            .known_masters
            .set(self.preprocessor.known_masters() as i64);
    }

    /// Reader over the snapshots this engine publishes.
    pub fn reader(&self) -> SnapshotReader {
        self.reader.clone()
    }

    /// The live graph. Only the owning thread can see it.
    pub fn graph(&self) -> &TopologyGraph {
        self.applier.graph()
    }

    /// Admission state, for diagnostics.
    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    /// Postponement state, for diagnostics.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Metrics updated by this engine.
    pub fn metrics(&self) -> &TopologyMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::{Attributes, LinkData, PortData, SwitchData, SwitchState, TopologyData, TopologyEvent},
        ids::{Dpid, InstanceId, LinkId, SwitchPort},
        registry::StaticRegistry,
    };

    fn configured(data: TopologyData) -> TopologyEvent {
        TopologyEvent::configured(data, InstanceId::from("node-1"))
    }

    fn switch(dpid: u64) -> TopologyEvent {
        configured(TopologyData::Switch(SwitchData {
            dpid: Dpid(dpid),
            state: SwitchState::Active,
            attributes: Attributes::new(),
        }))
    }

    fn port(dpid: u64, number: u32) -> TopologyEvent {
        configured(TopologyData::Port(PortData {
            port: SwitchPort::new(dpid, number),
            attributes: Attributes::new(),
        }))
    }

    fn make_test_engine() -> TopologyEngine {
        let config = TopologyConfig::default();
        let metrics = TopologyMetrics::new(&config.metrics_namespace).unwrap();
        TopologyEngine::new(&config, Arc::new(StaticRegistry::new()), metrics)
    }

    #[test]
    fn test_batch_publishes_snapshot() {
        let mut engine = make_test_engine();
        let reader = engine.reader();

        let changes = engine.process_batch(vec![
            EventEntry::add(port(1, 1)),
            EventEntry::add(switch(1)),
        ]);
        assert_eq!(changes.added_switches.len(), 1);
        assert_eq!(changes.added_ports.len(), 1);

        let snapshot = reader.current();
        assert_eq!(snapshot.version(), 1);
        assert!(snapshot.graph().port(&SwitchPort::new(1u64, 1u32)).is_some());
    }

    #[test]
    fn test_invalid_event_does_not_stop_batch() {
        let mut engine = make_test_engine();
        let looped = configured(TopologyData::Link(LinkData {
            id: LinkId::new(SwitchPort::new(1u64, 1u32), SwitchPort::new(1u64, 1u32)),
            attributes: Attributes::new(),
        }));

        let changes = engine.process_batch(vec![EventEntry::add(looped), EventEntry::add(switch(1))]);
        assert_eq!(changes.len(), 1);
        assert!(engine.metrics().gather_text().unwrap().contains("reason=\"invalid\""));
    }

    #[test]
    fn test_no_change_keeps_snapshot_version() {
        let mut engine = make_test_engine();
        let changes = engine.process_batch(vec![EventEntry::add(port(1, 1))]);
        assert!(changes.is_empty());
        assert_eq!(engine.reader().current().version(), 0);
        assert_eq!(engine.scheduler().postponed_len(ElementKind::Port), 1);
        assert_eq!(
            engine
                .metrics()
                .postponed_events
                .with_label_values(&["port"])
                .get(),
            1
        );
    }

    #[test]
    fn test_snapshots_share_untouched_tables() {
        let mut engine = make_test_engine();
        let reader = engine.reader();
        engine.process_batch(vec![EventEntry::add(switch(1)), EventEntry::add(port(1, 1))]);
        let first = reader.current();
        assert!(Arc::ptr_eq(&first.graph().ports, &engine.graph().ports));

        engine.process_batch(vec![EventEntry::add(switch(2))]);
        let second = reader.current();
        assert_eq!(second.version(), 2);
        assert!(Arc::ptr_eq(&first.graph().ports, &second.graph().ports));
        assert!(Arc::ptr_eq(&first.graph().links, &second.graph().links));
        assert!(!Arc::ptr_eq(&first.graph().switches, &second.graph().switches));
        assert_eq!(first.graph().switches().count(), 1);
    }
}
