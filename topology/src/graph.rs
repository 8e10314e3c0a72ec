// Copyright (c) 2024 Botho Foundation

//! Arena storage for the topology graph and its published snapshots.
//!
//! Each element kind lives in its own `BTreeMap` table keyed by identity;
//! relations between elements are stored as identities, never references.
//! Only the applier mutates a [`TopologyGraph`]. Everyone else reads an
//! immutable [`TopologySnapshot`] through a [`SnapshotReader`].

use crate::{
    event::{Attributes, ElementKind, MastershipRole, SwitchState},
    ids::{Dpid, HostId, InstanceId, LinkId, MacAddress, PortNumber, SwitchPort},
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
    sync::Arc,
};

/// A switch in the graph.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SwitchEntry {
    /// Identity
    pub dpid: Dpid,
    /// Liveness
    pub state: SwitchState,
    /// Attributes from the last ADD
    pub attributes: Attributes,
    /// Numbers of the ports owned by this switch
    pub ports: BTreeSet<PortNumber>,
}

/// A port in the graph.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PortEntry {
    /// Identity, including the parent switch
    pub id: SwitchPort,
    /// Attributes from the last ADD
    pub attributes: Attributes,
    /// Link leaving this port
    pub outgoing: Option<LinkId>,
    /// Link entering this port
    pub incoming: Option<LinkId>,
    /// Hosts attached to this port
    pub hosts: BTreeSet<HostId>,
}

impl PortEntry {
    /// Whether either link slot is occupied.
    pub fn has_link(&self) -> bool {
        self.outgoing.is_some() || self.incoming.is_some()
    }
}

/// A link in the graph.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LinkEntry {
    /// Identity, including both endpoints
    pub id: LinkId,
    /// Attributes from the last ADD
    pub attributes: Attributes,
}

/// A host in the graph.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HostEntry {
    /// Identity
    pub id: HostId,
    /// Ports the host is attached to
    pub attachment_points: BTreeSet<SwitchPort>,
    /// Addresses the host was seen with
    pub ip_addresses: BTreeSet<IpAddr>,
    /// Attributes from the last ADD
    pub attributes: Attributes,
}

/// Which instance masters a switch.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MastershipRecord {
    /// Switch
    pub dpid: Dpid,
    /// Controlling instance
    pub instance: InstanceId,
    /// Role reported by that instance
    pub role: MastershipRole,
}

/// The topology graph: one table per element kind.
///
/// Tables are shared copy-on-write. Cloning the graph for a snapshot copies
/// five pointers; the next write copies only the table it touches.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TopologyGraph {
    pub(crate) switches: Arc<BTreeMap<Dpid, SwitchEntry>>,
    pub(crate) ports: Arc<BTreeMap<SwitchPort, PortEntry>>,
    pub(crate) links: Arc<BTreeMap<LinkId, LinkEntry>>,
    pub(crate) hosts: Arc<BTreeMap<HostId, HostEntry>>,
    pub(crate) masterships: Arc<BTreeMap<Dpid, MastershipRecord>>,
}

impl TopologyGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a switch.
    pub fn switch(&self, dpid: Dpid) -> Option<&SwitchEntry> {
        self.switches.get(&dpid)
    }

    /// All switches, ordered by dpid.
    pub fn switches(&self) -> impl Iterator<Item = &SwitchEntry> {
        self.switches.values()
    }

    /// Look up a port.
    pub fn port(&self, id: &SwitchPort) -> Option<&PortEntry> {
        self.ports.get(id)
    }

    /// All ports, ordered by switch then number.
    pub fn ports(&self) -> impl Iterator<Item = &PortEntry> {
        self.ports.values()
    }

    /// Ports owned by `dpid`.
    pub fn ports_of(&self, dpid: Dpid) -> impl Iterator<Item = &PortEntry> {
        self.ports
            .range(SwitchPort::new(dpid, 0u32)..=SwitchPort::new(dpid, u32::MAX))
            .map(|(_, port)| port)
    }

    /// Look up a link.
    pub fn link(&self, id: &LinkId) -> Option<&LinkEntry> {
        self.links.get(id)
    }

    /// All links.
    pub fn links(&self) -> impl Iterator<Item = &LinkEntry> {
        self.links.values()
    }

    /// Link leaving `port`, if any.
    pub fn outgoing_link(&self, port: &SwitchPort) -> Option<&LinkEntry> {
        self.ports
            .get(port)
            .and_then(|p| p.outgoing.as_ref())
            .and_then(|id| self.links.get(id))
    }

    /// Link entering `port`, if any.
    pub fn incoming_link(&self, port: &SwitchPort) -> Option<&LinkEntry> {
        self.ports
            .get(port)
            .and_then(|p| p.incoming.as_ref())
            .and_then(|id| self.links.get(id))
    }

    /// Look up a host.
    pub fn host(&self, id: &HostId) -> Option<&HostEntry> {
        self.hosts.get(id)
    }

    /// All hosts.
    pub fn hosts(&self) -> impl Iterator<Item = &HostEntry> {
        self.hosts.values()
    }

    /// Hosts with the given MAC, on any VLAN.
    pub fn hosts_by_mac(&self, mac: MacAddress) -> impl Iterator<Item = &HostEntry> {
        self.hosts.values().filter(move |h| h.id.mac == mac)
    }

    /// Hosts attached to `port`.
    pub fn hosts_on_port<'a>(&'a self, port: &SwitchPort) -> impl Iterator<Item = &'a HostEntry> {
        self.ports
            .get(port)
            .into_iter()
            .flat_map(|p| p.hosts.iter())
            .filter_map(|id| self.hosts.get(id))
    }

    /// Mastership record of a switch.
    pub fn mastership(&self, dpid: Dpid) -> Option<&MastershipRecord> {
        self.masterships.get(&dpid)
    }

    /// All mastership records.
    pub fn masterships(&self) -> impl Iterator<Item = &MastershipRecord> {
        self.masterships.values()
    }

    /// Number of elements of `kind`.
    pub fn count(&self, kind: ElementKind) -> usize {
        match kind {
            ElementKind::Mastership => self.masterships.len(),
            ElementKind::Switch => self.switches.len(),
            ElementKind::Port => self.ports.len(),
            ElementKind::Link => self.links.len(),
            ElementKind::Host => self.hosts.len(),
        }
    }

    /// Whether the graph holds no elements at all.
    pub fn is_empty(&self) -> bool {
        ElementKind::ADD_ORDER.iter().all(|kind| self.count(*kind) == 0)
    }

    /// Describe every broken structural invariant; empty when consistent.
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();

        for (dpid, switch) in self.switches.iter() {
            for number in &switch.ports {
                if !self.ports.contains_key(&SwitchPort::new(*dpid, *number)) {
                    violations.push(format!("switch {dpid} lists missing port {number}"));
                }
            }
        }

        for (id, port) in self.ports.iter() {
            match self.switches.get(&id.dpid) {
                Some(switch) if switch.ports.contains(&id.number) => {}
                Some(_) => violations.push(format!("port {id} not listed by its switch")),
                None => violations.push(format!("port {id} has no switch")),
            }
            if let Some(link) = &port.outgoing {
                if link.src != *id || !self.links.contains_key(link) {
                    violations.push(format!("port {id} has bad outgoing link {link}"));
                }
            }
            if let Some(link) = &port.incoming {
                if link.dst != *id || !self.links.contains_key(link) {
                    violations.push(format!("port {id} has bad incoming link {link}"));
                }
            }
            for host in &port.hosts {
                let attached = self
                    .hosts
                    .get(host)
                    .is_some_and(|h| h.attachment_points.contains(id));
                if !attached {
                    violations.push(format!("port {id} lists unattached host {host}"));
                }
            }
        }

        for id in self.links.keys() {
            let src_ok = self
                .ports
                .get(&id.src)
                .is_some_and(|p| p.outgoing == Some(*id));
            let dst_ok = self
                .ports
                .get(&id.dst)
                .is_some_and(|p| p.incoming == Some(*id));
            if !src_ok || !dst_ok {
                violations.push(format!("link {id} is not held by both endpoints"));
            }
        }

        for (id, host) in self.hosts.iter() {
            if host.attachment_points.is_empty() {
                violations.push(format!("host {id} has no attachment point"));
            }
            for point in &host.attachment_points {
                match self.ports.get(point) {
                    Some(port) if port.has_link() => {
                        violations.push(format!("host {id} attached to linked port {point}"))
                    }
                    Some(port) if !port.hosts.contains(id) => {
                        violations.push(format!("host {id} not listed by port {point}"))
                    }
                    Some(_) => {}
                    None => violations.push(format!("host {id} attached to missing port {point}")),
                }
            }
        }

        violations
    }
}

/// An immutable copy of the graph published after a batch.
#[derive(Clone, Debug, Default)]
pub struct TopologySnapshot {
    version: u64,
    graph: TopologyGraph,
}

impl TopologySnapshot {
    pub(crate) fn new(version: u64, graph: TopologyGraph) -> Self {
        Self { version, graph }
    }

    /// Number of batches applied before this snapshot was taken.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The graph as of this snapshot.
    pub fn graph(&self) -> &TopologyGraph {
        &self.graph
    }
}

/// Cloneable read access to the latest published snapshot.
#[derive(Clone, Debug, Default)]
pub struct SnapshotReader {
    current: Arc<RwLock<Arc<TopologySnapshot>>>,
}

impl SnapshotReader {
    /// Reader over an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// The latest snapshot. Later batches never mutate it.
    pub fn current(&self) -> Arc<TopologySnapshot> {
        Arc::clone(&self.current.read())
    }

    pub(crate) fn publish(&self, snapshot: TopologySnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }
}
