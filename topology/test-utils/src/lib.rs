// Copyright (c) 2024 Botho Foundation

//! Test helpers for the topology crate: a scriptable mastership registry, a
//! listener that records every batch, and terse event builders.

use ntc_topology::{
    Attributes, Dpid, HostData, HostId, InstanceId, LinkData, LinkId, MacAddress,
    MastershipData, MastershipRegistry, MastershipRole, PortData, RegistryError, SwitchData,
    SwitchPort, SwitchState, TopologyData, TopologyEvent, TopologyEvents, TopologyListener,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeSet, HashMap},
    net::IpAddr,
    time::Duration,
};

/// A registry whose answers are scripted by the test.
#[derive(Debug, Default)]
pub struct MockRegistry {
    controllers: Mutex<HashMap<Dpid, InstanceId>>,
    failure: Mutex<Option<RegistryError>>,
    calls: Mutex<usize>,
}

impl MockRegistry {
    /// Registry with no controllers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry where `instance` controls every listed switch.
    pub fn with_controller(instance: &str, dpids: &[u64]) -> Self {
        let registry = Self::new();
        for dpid in dpids {
            registry.set_controller(*dpid, instance);
        }
        registry
    }

    /// Make `instance` the controller of `dpid`.
    pub fn set_controller(&self, dpid: u64, instance: &str) {
        self.controllers
            .lock()
            .insert(Dpid(dpid), InstanceId::from(instance));
    }

    /// Forget the controller of `dpid`.
    pub fn clear_controller(&self, dpid: u64) {
        self.controllers.lock().remove(&Dpid(dpid));
    }

    /// Fail every call with `error` until [`MockRegistry::recover`].
    pub fn fail_with(&self, error: RegistryError) {
        *self.failure.lock() = Some(error);
    }

    /// Stop failing.
    pub fn recover(&self) {
        *self.failure.lock() = None;
    }

    /// Number of lookups so far.
    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

impl MastershipRegistry for MockRegistry {
    fn controller_for_switch(
        &self,
        dpid: Dpid,
        _timeout: Duration,
    ) -> Result<Option<InstanceId>, RegistryError> {
        *self.calls.lock() += 1;
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        Ok(self.controllers.lock().get(&dpid).cloned())
    }
}

/// A listener that keeps every batch it receives.
#[derive(Debug, Default)]
pub struct RecordingListener {
    batches: Mutex<Vec<TopologyEvents>>,
}

impl RecordingListener {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All batches received so far.
    pub fn batches(&self) -> Vec<TopologyEvents> {
        self.batches.lock().clone()
    }

    /// Number of batches received.
    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }

    /// The most recent batch.
    pub fn last(&self) -> Option<TopologyEvents> {
        self.batches.lock().last().cloned()
    }

    /// Forget everything received so far.
    pub fn clear(&self) {
        self.batches.lock().clear();
    }
}

impl TopologyListener for RecordingListener {
    fn topology_events(&self, events: &TopologyEvents) {
        self.batches.lock().push(events.clone());
    }
}

/// Instance id from a string.
pub fn node(id: &str) -> InstanceId {
    InstanceId::from(id)
}

/// Port identity from raw values.
pub fn switch_port(dpid: u64, number: u32) -> SwitchPort {
    SwitchPort::new(dpid, number)
}

/// Link identity from raw `(dpid, port)` pairs.
pub fn link_id(src: (u64, u32), dst: (u64, u32)) -> LinkId {
    LinkId::new(switch_port(src.0, src.1), switch_port(dst.0, dst.1))
}

/// Untagged host identity from the low 48 bits of `mac`.
pub fn host_id(mac: u64) -> HostId {
    HostId::new(MacAddress::from_u64(mac))
}

/// Mastership event.
pub fn mastership(dpid: u64, role: MastershipRole, origin: &str) -> TopologyEvent {
    TopologyEvent::new(
        TopologyData::Mastership(MastershipData {
            dpid: Dpid(dpid),
            role,
        }),
        node(origin),
    )
}

/// MASTER claim for `dpid` by `origin`.
pub fn master(dpid: u64, origin: &str) -> TopologyEvent {
    mastership(dpid, MastershipRole::Master, origin)
}

/// Active switch.
pub fn switch(dpid: u64, origin: &str) -> TopologyEvent {
    TopologyEvent::new(
        TopologyData::Switch(SwitchData {
            dpid: Dpid(dpid),
            state: SwitchState::Active,
            attributes: Attributes::new(),
        }),
        node(origin),
    )
}

/// Port on `dpid`.
pub fn port(dpid: u64, number: u32, origin: &str) -> TopologyEvent {
    TopologyEvent::new(
        TopologyData::Port(PortData {
            port: switch_port(dpid, number),
            attributes: Attributes::new(),
        }),
        node(origin),
    )
}

/// Link from `src` to `dst`, each a `(dpid, port)` pair.
pub fn link(src: (u64, u32), dst: (u64, u32), origin: &str) -> TopologyEvent {
    TopologyEvent::new(
        TopologyData::Link(LinkData {
            id: link_id(src, dst),
            attributes: Attributes::new(),
        }),
        node(origin),
    )
}

/// Host attached to the listed `(dpid, port)` pairs.
pub fn host(mac: u64, points: &[(u64, u32)], origin: &str) -> TopologyEvent {
    host_with_ips(mac, points, &[], origin)
}

/// Host attached to the listed points and seen with `ips`.
pub fn host_with_ips(
    mac: u64,
    points: &[(u64, u32)],
    ips: &[IpAddr],
    origin: &str,
) -> TopologyEvent {
    TopologyEvent::new(
        TopologyData::Host(HostData {
            id: host_id(mac),
            attachment_points: points.iter().map(|(d, n)| switch_port(*d, *n)).collect(),
            ip_addresses: ips.iter().copied().collect::<BTreeSet<_>>(),
            attributes: Attributes::new(),
        }),
        node(origin),
    )
}

/// Mark an event as administratively configured.
pub fn configured(mut event: TopologyEvent) -> TopologyEvent {
    event.config_state = ntc_topology::ConfigState::Configured;
    event
}
