// Copyright (c) 2024 Botho Foundation

//! The graph applier: the only code that mutates the topology graph.
//!
//! Every operation is idempotent under redelivery. Applied changes are
//! appended to a [`TopologyEvents`] accumulator that the caller flushes to
//! listeners once per batch.
//!
//! Removals cascade from parents to children through an explicit work list,
//! so removing a switch detaches its hosts, then removes its links, then its
//! ports, and finally the switch itself.

use crate::{
    event::{
        Attributes, HostData, LinkData, MastershipData, MastershipRole, PortData, SwitchData,
        TopologyData, TopologyEvent,
    },
    graph::{HostEntry, LinkEntry, MastershipRecord, PortEntry, SwitchEntry, TopologyGraph},
    ids::{Dpid, HostId, InstanceId, LinkId, SwitchPort},
    listener::TopologyEvents,
};
use std::{collections::BTreeSet, sync::Arc};
use tracing::{debug, error, warn};

/// Result of applying one event to the graph.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ApplyOutcome {
    /// The graph changed (or was refreshed) and a notification was recorded
    Applied,
    /// A parent is missing; the carried event (or the unsatisfied part of
    /// it) should be retried later
    Postponed(TopologyEvent),
    /// Nothing to do
    Ignored,
}

impl ApplyOutcome {
    /// Whether the event changed the graph.
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

/// One step of a cascading removal.
#[derive(Clone, Debug)]
enum Removal {
    Switch(Dpid),
    Port(SwitchPort),
    Link(LinkId),
    Host(HostData),
}

/// Owns the graph and applies admitted, ordered events to it.
#[derive(Debug, Default)]
pub struct GraphApplier {
    graph: TopologyGraph,
}

impl GraphApplier {
    /// Applier over an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current graph.
    pub fn graph(&self) -> &TopologyGraph {
        &self.graph
    }

    /// Apply an ADD.
    pub fn apply_add(&mut self, event: &TopologyEvent, out: &mut TopologyEvents) -> ApplyOutcome {
        match &event.data {
            TopologyData::Mastership(data) => self.add_mastership(data, &event.origin, out),
            TopologyData::Switch(data) => self.add_switch(data, out),
            TopologyData::Port(data) => self.add_port(event, data, out),
            TopologyData::Link(data) => self.add_link(event, data, out),
            TopologyData::Host(data) => self.add_host(event, data, out),
        }
    }

    /// Apply a REMOVE.
    pub fn apply_remove(
        &mut self,
        event: &TopologyEvent,
        out: &mut TopologyEvents,
    ) -> ApplyOutcome {
        match &event.data {
            TopologyData::Mastership(data) => self.remove_mastership(data, &event.origin, out),
            TopologyData::Switch(data) => self.remove_switch(data.dpid, out),
            TopologyData::Port(data) => self.remove_port(data.port, out),
            TopologyData::Link(data) => self.remove_link(data.id, out),
            TopologyData::Host(data) => self.remove_host(data, out),
        }
    }

    fn add_mastership(
        &mut self,
        data: &MastershipData,
        origin: &InstanceId,
        out: &mut TopologyEvents,
    ) -> ApplyOutcome {
        if data.role != MastershipRole::Master {
            // A demotion only clears the record it owns.
            return self.clear_mastership(data.dpid, origin, out);
        }
        let record = MastershipRecord {
            dpid: data.dpid,
            instance: origin.clone(),
            role: data.role,
        };
        Arc::make_mut(&mut self.graph.masterships).insert(data.dpid, record.clone());
        out.added_masterships.push(record);
        ApplyOutcome::Applied
    }

    fn remove_mastership(
        &mut self,
        data: &MastershipData,
        origin: &InstanceId,
        out: &mut TopologyEvents,
    ) -> ApplyOutcome {
        self.clear_mastership(data.dpid, origin, out)
    }

    fn clear_mastership(
        &mut self,
        dpid: Dpid,
        origin: &InstanceId,
        out: &mut TopologyEvents,
    ) -> ApplyOutcome {
        match self.graph.masterships.get(&dpid) {
            Some(record) if record.instance == *origin => {
                if let Some(record) = Arc::make_mut(&mut self.graph.masterships).remove(&dpid) {
                    out.removed_masterships.push(record);
                }
                ApplyOutcome::Applied
            }
            _ => {
                debug!(dpid = %dpid, origin = %origin, "No mastership record to clear");
                ApplyOutcome::Ignored
            }
        }
    }

    fn add_switch(&mut self, data: &SwitchData, out: &mut TopologyEvents) -> ApplyOutcome {
        match Arc::make_mut(&mut self.graph.switches).get_mut(&data.dpid) {
            Some(switch) => {
                switch.state = data.state;
                switch.attributes = data.attributes.clone();
            }
            None => {
                Arc::make_mut(&mut self.graph.switches).insert(
                    data.dpid,
                    SwitchEntry {
                        dpid: data.dpid,
                        state: data.state,
                        attributes: data.attributes.clone(),
                        ports: BTreeSet::new(),
                    },
                );
            }
        }
        out.added_switches.push(data.clone());
        ApplyOutcome::Applied
    }

    fn remove_switch(&mut self, dpid: Dpid, out: &mut TopologyEvents) -> ApplyOutcome {
        if !self.graph.switches.contains_key(&dpid) {
            warn!(dpid = %dpid, "Switch already removed, ignoring");
            return ApplyOutcome::Ignored;
        }
        self.remove_cascading(Removal::Switch(dpid), out);
        ApplyOutcome::Applied
    }

    fn add_port(
        &mut self,
        event: &TopologyEvent,
        data: &PortData,
        out: &mut TopologyEvents,
    ) -> ApplyOutcome {
        let Some(switch) = Arc::make_mut(&mut self.graph.switches).get_mut(&data.port.dpid) else {
            debug!(port = %data.port, "Switch missing, postponing port");
            return ApplyOutcome::Postponed(event.clone());
        };
        switch.ports.insert(data.port.number);

        match Arc::make_mut(&mut self.graph.ports).get_mut(&data.port) {
            Some(port) => port.attributes = data.attributes.clone(),
            None => {
                Arc::make_mut(&mut self.graph.ports).insert(
                    data.port,
                    PortEntry {
                        id: data.port,
                        attributes: data.attributes.clone(),
                        outgoing: None,
                        incoming: None,
                        hosts: BTreeSet::new(),
                    },
                );
            }
        }
        out.added_ports.push(data.clone());
        ApplyOutcome::Applied
    }

    fn remove_port(&mut self, port: SwitchPort, out: &mut TopologyEvents) -> ApplyOutcome {
        if !self.graph.ports.contains_key(&port) {
            warn!(port = %port, "Port already removed, ignoring");
            return ApplyOutcome::Ignored;
        }
        self.remove_cascading(Removal::Port(port), out);
        ApplyOutcome::Applied
    }

    /// Re-adding the same link refreshes its attributes. A different link
    /// already holding either endpoint is removed first rather than
    /// refreshed, so a port never carries two links.
    fn add_link(
        &mut self,
        event: &TopologyEvent,
        data: &LinkData,
        out: &mut TopologyEvents,
    ) -> ApplyOutcome {
        let id = data.id;
        let (Some(src), Some(dst)) = (self.graph.ports.get(&id.src), self.graph.ports.get(&id.dst))
        else {
            debug!(link = %id, "Endpoint missing, postponing link");
            return ApplyOutcome::Postponed(event.clone());
        };

        if let Some(link) = Arc::make_mut(&mut self.graph.links).get_mut(&id) {
            link.attributes = data.attributes.clone();
            out.added_links.push(data.clone());
            return ApplyOutcome::Applied;
        }

        let mut stale: Vec<LinkId> = [src.outgoing, dst.incoming]
            .into_iter()
            .flatten()
            .filter(|other| *other != id)
            .collect();
        stale.dedup();
        let attached: Vec<(HostId, SwitchPort)> = [src, dst]
            .into_iter()
            .flat_map(|port| port.hosts.iter().map(move |host| (*host, port.id)))
            .collect();

        for other in stale {
            warn!(link = %id, stale = %other, "Port already holds a different link, removing it");
            self.remove_cascading(Removal::Link(other), out);
        }
        for (host, port) in attached {
            error!(
                host = %host,
                port = %port,
                link = %id,
                "Host should have been detached prior to adding link"
            );
            self.remove_cascading(Removal::Host(HostData::detach(host, port)), out);
        }

        Arc::make_mut(&mut self.graph.links).insert(
            id,
            LinkEntry {
                id,
                attributes: data.attributes.clone(),
            },
        );
        if let Some(src) = Arc::make_mut(&mut self.graph.ports).get_mut(&id.src) {
            src.outgoing = Some(id);
        }
        if let Some(dst) = Arc::make_mut(&mut self.graph.ports).get_mut(&id.dst) {
            dst.incoming = Some(id);
        }
        out.added_links.push(data.clone());
        ApplyOutcome::Applied
    }

    fn remove_link(&mut self, id: LinkId, out: &mut TopologyEvents) -> ApplyOutcome {
        if !self.graph.links.contains_key(&id) {
            warn!(link = %id, "Link already removed, ignoring");
            return ApplyOutcome::Ignored;
        }
        self.remove_cascading(Removal::Link(id), out);
        ApplyOutcome::Applied
    }

    fn add_host(
        &mut self,
        event: &TopologyEvent,
        data: &HostData,
        out: &mut TopologyEvents,
    ) -> ApplyOutcome {
        let mut usable = Vec::new();
        let mut missing = Vec::new();
        for point in &data.attachment_points {
            match self.graph.ports.get(point) {
                None => missing.push(*point),
                Some(port) if port.has_link() => {
                    warn!(
                        host = %data.id,
                        port = %point,
                        "Link exists on the attachment point, skipping it"
                    );
                }
                Some(_) => usable.push(*point),
            }
        }

        let exists = self.graph.hosts.contains_key(&data.id);
        let applies = !usable.is_empty() || (exists && !data.ip_addresses.is_empty());
        if applies {
            let host = Arc::make_mut(&mut self.graph.hosts).entry(data.id).or_insert_with(|| HostEntry {
                id: data.id,
                attachment_points: BTreeSet::new(),
                ip_addresses: BTreeSet::new(),
                attributes: Attributes::new(),
            });
            host.ip_addresses.extend(data.ip_addresses.iter().copied());
            host.attachment_points.extend(usable.iter().copied());
            if !data.attributes.is_empty() {
                host.attributes = data.attributes.clone();
            }
            for point in &usable {
                if let Some(port) = Arc::make_mut(&mut self.graph.ports).get_mut(point) {
                    port.hosts.insert(data.id);
                }
            }
            out.added_hosts.push(HostData {
                id: data.id,
                attachment_points: usable,
                ip_addresses: data.ip_addresses.clone(),
                attributes: data.attributes.clone(),
            });
        }

        if !missing.is_empty() {
            debug!(host = %data.id, missing = missing.len(), "Attachment port missing, postponing host");
            let mut rest = event.clone();
            if let TopologyData::Host(host) = &mut rest.data {
                host.attachment_points = missing;
            }
            return ApplyOutcome::Postponed(rest);
        }
        if applies {
            ApplyOutcome::Applied
        } else {
            debug!(host = %data.id, "No usable attachment point, ignoring host");
            ApplyOutcome::Ignored
        }
    }

    fn remove_host(&mut self, data: &HostData, out: &mut TopologyEvents) -> ApplyOutcome {
        if !self.graph.hosts.contains_key(&data.id) {
            warn!(host = %data.id, "Host already removed, ignoring");
            return ApplyOutcome::Ignored;
        }
        if self.detach_host(data, out) {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::Ignored
        }
    }

    /// Run a removal and everything that hangs off it, children first.
    fn remove_cascading(&mut self, root: Removal, out: &mut TopologyEvents) {
        let mut work = vec![(root, false)];
        while let Some((step, expanded)) = work.pop() {
            if expanded {
                self.execute(step, out);
                continue;
            }
            let children = self.children(&step);
            work.push((step, true));
            work.extend(children.into_iter().rev().map(|child| (child, false)));
        }
    }

    fn children(&self, step: &Removal) -> Vec<Removal> {
        match step {
            Removal::Switch(dpid) => self
                .graph
                .ports_of(*dpid)
                .map(|port| {
                    warn!(
                        port = %port.id,
                        dpid = %dpid,
                        "Port should be removed prior to removing switch, removing it now"
                    );
                    Removal::Port(port.id)
                })
                .collect(),
            Removal::Port(id) => {
                let Some(port) = self.graph.ports.get(id) else {
                    return Vec::new();
                };
                let hosts = port.hosts.iter().map(|host| {
                    debug!(host = %host, port = %id, "Detaching host from removed port");
                    Removal::Host(HostData::detach(*host, *id))
                });
                let links = [port.outgoing, port.incoming]
                    .into_iter()
                    .flatten()
                    .map(|link| {
                        debug!(link = %link, port = %id, "Removing link on removed port");
                        Removal::Link(link)
                    });
                hosts.chain(links).collect()
            }
            Removal::Link(_) | Removal::Host(_) => Vec::new(),
        }
    }

    fn execute(&mut self, step: Removal, out: &mut TopologyEvents) {
        match step {
            Removal::Switch(dpid) => {
                if let Some(switch) = Arc::make_mut(&mut self.graph.switches).remove(&dpid) {
                    out.removed_switches.push(SwitchData {
                        dpid,
                        state: switch.state,
                        attributes: switch.attributes,
                    });
                }
            }
            Removal::Port(id) => {
                let Some(port) = Arc::make_mut(&mut self.graph.ports).remove(&id) else {
                    return;
                };
                if let Some(switch) = Arc::make_mut(&mut self.graph.switches).get_mut(&id.dpid) {
                    switch.ports.remove(&id.number);
                }
                out.removed_ports.push(PortData {
                    port: id,
                    attributes: port.attributes,
                });
            }
            Removal::Link(id) => {
                let Some(link) = Arc::make_mut(&mut self.graph.links).remove(&id) else {
                    return;
                };
                match Arc::make_mut(&mut self.graph.ports).get_mut(&id.src) {
                    Some(src) if src.outgoing == Some(id) => src.outgoing = None,
                    _ => warn!(link = %id, "Link already removed on source port"),
                }
                match Arc::make_mut(&mut self.graph.ports).get_mut(&id.dst) {
                    Some(dst) if dst.incoming == Some(id) => dst.incoming = None,
                    _ => warn!(link = %id, "Link already removed on destination port"),
                }
                out.removed_links.push(LinkData {
                    id,
                    attributes: link.attributes,
                });
            }
            Removal::Host(data) => {
                self.detach_host(&data, out);
            }
        }
    }

    /// Detach the listed points (all of them if none are listed); remove the
    /// host once nothing is left. Returns whether anything changed.
    fn detach_host(&mut self, data: &HostData, out: &mut TopologyEvents) -> bool {
        let Some(host) = Arc::make_mut(&mut self.graph.hosts).get_mut(&data.id) else {
            return false;
        };
        let requested: Vec<SwitchPort> = if data.attachment_points.is_empty() {
            host.attachment_points.iter().copied().collect()
        } else {
            data.attachment_points.clone()
        };

        let mut detached = Vec::new();
        for point in requested {
            if host.attachment_points.remove(&point) {
                detached.push(point);
            } else {
                warn!(host = %data.id, port = %point, "Host not attached to port, skipping");
            }
        }
        let emptied = host.attachment_points.is_empty();
        if detached.is_empty() && !emptied {
            return false;
        }

        for point in &detached {
            if let Some(port) = Arc::make_mut(&mut self.graph.ports).get_mut(point) {
                port.hosts.remove(&data.id);
            }
        }
        let mut notice = HostData {
            id: data.id,
            attachment_points: detached,
            ip_addresses: BTreeSet::new(),
            attributes: Attributes::new(),
        };
        if emptied {
            if let Some(host) = Arc::make_mut(&mut self.graph.hosts).remove(&data.id) {
                debug!(host = %data.id, "Host has no attachment point left, removing it");
                notice.ip_addresses = host.ip_addresses;
                notice.attributes = host.attributes;
            }
        }
        out.removed_hosts.push(notice);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::SwitchState,
        ids::{InstanceId, MacAddress},
    };

    fn origin() -> InstanceId {
        InstanceId::from("node-1")
    }

    fn switch(dpid: u64) -> TopologyEvent {
        TopologyEvent::new(
            TopologyData::Switch(SwitchData {
                dpid: Dpid(dpid),
                state: SwitchState::Active,
                attributes: Attributes::new(),
            }),
            origin(),
        )
    }

    fn port(dpid: u64, number: u32) -> TopologyEvent {
        TopologyEvent::new(
            TopologyData::Port(PortData {
                port: SwitchPort::new(dpid, number),
                attributes: Attributes::new(),
            }),
            origin(),
        )
    }

    fn link(src: (u64, u32), dst: (u64, u32)) -> TopologyEvent {
        TopologyEvent::new(
            TopologyData::Link(LinkData {
                id: LinkId::new(SwitchPort::new(src.0, src.1), SwitchPort::new(dst.0, dst.1)),
                attributes: Attributes::new(),
            }),
            origin(),
        )
    }

    fn host(mac: u64, points: &[(u64, u32)]) -> TopologyEvent {
        TopologyEvent::new(
            TopologyData::Host(HostData {
                id: HostId::new(MacAddress::from_u64(mac)),
                attachment_points: points.iter().map(|(d, n)| SwitchPort::new(*d, *n)).collect(),
                ip_addresses: BTreeSet::new(),
                attributes: Attributes::new(),
            }),
            origin(),
        )
    }

    fn make_test_applier(events: &[TopologyEvent]) -> GraphApplier {
        let mut applier = GraphApplier::new();
        let mut out = TopologyEvents::default();
        for event in events {
            assert_eq!(applier.apply_add(event, &mut out), ApplyOutcome::Applied);
        }
        applier
    }

    #[test]
    fn test_port_without_switch_is_postponed() {
        let mut applier = GraphApplier::new();
        let mut out = TopologyEvents::default();
        let event = port(1, 1);
        assert_eq!(
            applier.apply_add(&event, &mut out),
            ApplyOutcome::Postponed(event)
        );
        assert!(out.is_empty());
        assert!(applier.graph().is_empty());
    }

    #[test]
    fn test_redelivered_add_is_idempotent() {
        let events = [switch(1), port(1, 1)];
        let mut applier = make_test_applier(&events);
        let before = applier.graph().clone();

        let mut out = TopologyEvents::default();
        for event in &events {
            applier.apply_add(event, &mut out);
        }
        assert_eq!(applier.graph(), &before);
    }

    #[test]
    fn test_remove_switch_cascades_children_first() {
        let mut applier = make_test_applier(&[
            switch(1),
            switch(2),
            port(1, 1),
            port(1, 2),
            port(2, 1),
            link((1, 1), (2, 1)),
            host(9, &[(1, 2)]),
        ]);

        let mut out = TopologyEvents::default();
        assert!(applier.apply_remove(&switch(1), &mut out).is_applied());

        assert_eq!(out.removed_hosts.len(), 1);
        assert_eq!(out.removed_links.len(), 1);
        assert_eq!(out.removed_ports.len(), 2);
        assert_eq!(out.removed_switches.len(), 1);

        let graph = applier.graph();
        assert!(graph.switch(Dpid(1)).is_none());
        assert!(graph.host(&HostId::new(MacAddress::from_u64(9))).is_none());
        assert!(graph.port(&SwitchPort::new(2u64, 1u32)).is_some_and(|p| !p.has_link()));
        assert!(graph.invariant_violations().is_empty());
    }

    #[test]
    fn test_add_link_detaches_hosts_and_replaces_stale_link() {
        let mut applier = make_test_applier(&[
            switch(1),
            switch(2),
            port(1, 1),
            port(2, 1),
            port(2, 2),
            link((1, 1), (2, 2)),
            host(7, &[(2, 1)]),
        ]);

        let mut out = TopologyEvents::default();
        assert!(applier
            .apply_add(&link((1, 1), (2, 1)), &mut out)
            .is_applied());

        assert_eq!(out.removed_links.len(), 1);
        assert_eq!(out.removed_hosts.len(), 1);
        let graph = applier.graph();
        assert_eq!(graph.links().count(), 1);
        assert!(graph.hosts().next().is_none());
        assert!(graph.invariant_violations().is_empty());
    }

    #[test]
    fn test_host_on_linked_port_is_dropped() {
        let mut applier = make_test_applier(&[
            switch(1),
            switch(2),
            port(1, 1),
            port(2, 1),
            link((1, 1), (2, 1)),
        ]);
        let mut out = TopologyEvents::default();
        assert_eq!(
            applier.apply_add(&host(3, &[(1, 1)]), &mut out),
            ApplyOutcome::Ignored
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_host_with_missing_port_is_partially_postponed() {
        let mut applier = make_test_applier(&[switch(1), port(1, 1)]);
        let mut out = TopologyEvents::default();

        let outcome = applier.apply_add(&host(3, &[(1, 1), (1, 2)]), &mut out);
        assert_eq!(outcome, ApplyOutcome::Postponed(host(3, &[(1, 2)])));
        assert_eq!(out.added_hosts.len(), 1);
        assert_eq!(out.added_hosts[0].attachment_points, vec![SwitchPort::new(1u64, 1u32)]);
    }

    #[test]
    fn test_remove_host_detaches_listed_point_only() {
        let mut applier = make_test_applier(&[
            switch(1),
            port(1, 1),
            port(1, 2),
            host(3, &[(1, 1), (1, 2)]),
        ]);
        let id = HostId::new(MacAddress::from_u64(3));

        let mut out = TopologyEvents::default();
        assert!(applier
            .apply_remove(&host(3, &[(1, 1)]), &mut out)
            .is_applied());
        assert_eq!(
            applier.graph().host(&id).map(|h| h.attachment_points.len()),
            Some(1)
        );

        assert!(applier.apply_remove(&host(3, &[]), &mut out).is_applied());
        assert!(applier.graph().host(&id).is_none());
        assert_eq!(out.removed_hosts.len(), 2);
    }

    #[test]
    fn test_remove_missing_elements_is_ignored() {
        let mut applier = GraphApplier::new();
        let mut out = TopologyEvents::default();
        for event in [switch(1), port(1, 1), link((1, 1), (2, 1)), host(1, &[])] {
            assert_eq!(applier.apply_remove(&event, &mut out), ApplyOutcome::Ignored);
        }
        assert!(out.is_empty());
    }

    #[test]
    fn test_mastership_record_follows_owner() {
        let mut applier = GraphApplier::new();
        let mut out = TopologyEvents::default();
        let master = TopologyEvent::new(
            TopologyData::Mastership(MastershipData {
                dpid: Dpid(1),
                role: MastershipRole::Master,
            }),
            origin(),
        );
        assert!(applier.apply_add(&master, &mut out).is_applied());
        assert_eq!(
            applier.graph().mastership(Dpid(1)).map(|r| r.instance.clone()),
            Some(origin())
        );

        let mut other = master.clone();
        other.origin = InstanceId::from("node-2");
        assert_eq!(applier.apply_remove(&other, &mut out), ApplyOutcome::Ignored);
        assert!(applier.apply_remove(&master, &mut out).is_applied());
        assert!(applier.graph().mastership(Dpid(1)).is_none());
    }
}
