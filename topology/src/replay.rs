// Copyright (c) 2024 Botho Foundation

//! Cold-start replay from the durable graph store.

use crate::{
    engine::TopologyEngine,
    error::{TopologyError, TopologyResult},
    event::{EventEntry, TopologyEvent},
    listener::TopologyEvents,
};
use parking_lot::RwLock;
use tracing::info;

/// Source of the events that were live when the previous run stopped.
pub trait TopologyStore: Send + Sync {
    /// Every live event, in any order.
    fn live_events(&self) -> TopologyResult<Vec<TopologyEvent>>;
}

/// A store holding events in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    events: RwLock<Vec<TopologyEvent>>,
}

impl MemoryStore {
    /// Store pre-filled with `events`.
    pub fn new(events: Vec<TopologyEvent>) -> Self {
        Self {
            events: RwLock::new(events),
        }
    }

    /// Add an event.
    pub fn push(&self, event: TopologyEvent) {
        self.events.write().push(event);
    }
}

impl TopologyStore for MemoryStore {
    fn live_events(&self) -> TopologyResult<Vec<TopologyEvent>> {
        Ok(self.events.read().clone())
    }
}

/// Replay `store` into `engine` as one ADD-only batch.
pub fn cold_start(
    engine: &mut TopologyEngine,
    store: &dyn TopologyStore,
) -> TopologyResult<TopologyEvents> {
    let events = store
        .live_events()
        .map_err(|err| TopologyError::ColdStart(err.to_string()))?;
    info!(events = events.len(), "Replaying stored topology");
    let changes = engine.process_batch(events.into_iter().map(EventEntry::add).collect());
    info!(
        switches = engine.graph().switches().count(),
        ports = engine.graph().ports().count(),
        links = engine.graph().links().count(),
        hosts = engine.graph().hosts().count(),
        "Stored topology replayed"
    );
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::TopologyConfig,
        event::{Attributes, MastershipData, MastershipRole, PortData, SwitchData, SwitchState, TopologyData},
        ids::{Dpid, InstanceId, SwitchPort},
        metrics::TopologyMetrics,
        registry::StaticRegistry,
    };
    use std::sync::Arc;

    struct BrokenStore;

    impl TopologyStore for BrokenStore {
        fn live_events(&self) -> TopologyResult<Vec<TopologyEvent>> {
            Err(TopologyError::InvalidEvent("corrupt record".to_string()))
        }
    }

    fn make_test_engine(registry: StaticRegistry) -> TopologyEngine {
        let config = TopologyConfig::default();
        let metrics = TopologyMetrics::new(&config.metrics_namespace).unwrap();
        TopologyEngine::new(&config, Arc::new(registry), metrics)
    }

    #[test]
    fn test_cold_start_applies_mastered_elements() {
        let node = InstanceId::from("node-1");
        let registry = StaticRegistry::new();
        registry.set_controller(Dpid(1), node.clone());
        let mut engine = make_test_engine(registry);

        // Children before parents, as a store scan might return them.
        let store = MemoryStore::new(vec![
            TopologyEvent::new(
                TopologyData::Port(PortData {
                    port: SwitchPort::new(1u64, 1u32),
                    attributes: Attributes::new(),
                }),
                node.clone(),
            ),
            TopologyEvent::new(
                TopologyData::Switch(SwitchData {
                    dpid: Dpid(1),
                    state: SwitchState::Active,
                    attributes: Attributes::new(),
                }),
                node.clone(),
            ),
        ]);
        store.push(TopologyEvent::new(
            TopologyData::Mastership(MastershipData {
                dpid: Dpid(1),
                role: MastershipRole::Master,
            }),
            node,
        ));

        let changes = cold_start(&mut engine, &store).unwrap();
        assert_eq!(changes.added_masterships.len(), 1);
        assert_eq!(changes.added_switches.len(), 1);
        assert_eq!(changes.added_ports.len(), 1);
    }

    #[test]
    fn test_cold_start_failure_is_reported() {
        let mut engine = make_test_engine(StaticRegistry::new());
        assert!(matches!(
            cold_start(&mut engine, &BrokenStore),
            Err(TopologyError::ColdStart(_))
        ));
    }
}
