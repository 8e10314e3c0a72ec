// Copyright (c) 2024 Botho Foundation

//! Change notifications delivered to topology listeners.

use crate::{
    event::{ElementKind, HostData, LinkData, PortData, SwitchData},
    graph::MastershipRecord,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Everything one batch changed, per element kind.
///
/// Within each list elements appear in the order they were applied.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TopologyEvents {
    /// Masters recorded
    pub added_masterships: Vec<MastershipRecord>,
    /// Masters cleared
    pub removed_masterships: Vec<MastershipRecord>,
    /// Switches added or refreshed
    pub added_switches: Vec<SwitchData>,
    /// Switches removed
    pub removed_switches: Vec<SwitchData>,
    /// Ports added or refreshed
    pub added_ports: Vec<PortData>,
    /// Ports removed
    pub removed_ports: Vec<PortData>,
    /// Links added or refreshed
    pub added_links: Vec<LinkData>,
    /// Links removed
    pub removed_links: Vec<LinkData>,
    /// Hosts added or updated, with the attachment points that were applied
    pub added_hosts: Vec<HostData>,
    /// Host detachments; the host is gone once its last point is detached
    pub removed_hosts: Vec<HostData>,
}

impl TopologyEvents {
    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of notifications.
    pub fn len(&self) -> usize {
        ElementKind::ADD_ORDER
            .iter()
            .map(|kind| self.added_count(*kind) + self.removed_count(*kind))
            .sum()
    }

    /// Number of additions of `kind`.
    pub fn added_count(&self, kind: ElementKind) -> usize {
        match kind {
            ElementKind::Mastership => self.added_masterships.len(),
            ElementKind::Switch => self.added_switches.len(),
            ElementKind::Port => self.added_ports.len(),
            ElementKind::Link => self.added_links.len(),
            ElementKind::Host => self.added_hosts.len(),
        }
    }

    /// Number of removals of `kind`.
    pub fn removed_count(&self, kind: ElementKind) -> usize {
        match kind {
            ElementKind::Mastership => self.removed_masterships.len(),
            ElementKind::Switch => self.removed_switches.len(),
            ElementKind::Port => self.removed_ports.len(),
            ElementKind::Link => self.removed_links.len(),
            ElementKind::Host => self.removed_hosts.len(),
        }
    }
}

/// Receives one [`TopologyEvents`] per processed batch that changed anything.
///
/// Called on the worker thread; implementations should return quickly.
pub trait TopologyListener: Send + Sync {
    /// Handle the changes of one batch.
    fn topology_events(&self, events: &TopologyEvents);
}

/// The set of registered listeners.
#[derive(Default)]
pub struct Listeners {
    inner: RwLock<Vec<Arc<dyn TopologyListener>>>,
}

impl Listeners {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    pub fn add(&self, listener: Arc<dyn TopologyListener>) {
        self.inner.write().push(listener);
    }

    /// Deregister a listener. Returns `false` if it was not registered.
    pub fn remove(&self, listener: &Arc<dyn TopologyListener>) -> bool {
        let mut inner = self.inner.write();
        let before = inner.len();
        inner.retain(|l| !Arc::ptr_eq(l, listener));
        inner.len() != before
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Deliver `events` to every listener. Empty batches are not delivered.
    pub fn dispatch(&self, events: &TopologyEvents) {
        if events.is_empty() {
            return;
        }
        // Snapshot the list so listeners may (de)register from the callback.
        let listeners: Vec<_> = self.inner.read().iter().cloned().collect();
        debug!(
            listeners = listeners.len(),
            notifications = events.len(),
            "Dispatching topology events"
        );
        for listener in listeners {
            listener.topology_events(events);
        }
    }
}
