// Copyright (c) 2024 Botho Foundation

//! Topology event payloads.
//!
//! A [`TopologyEvent`] carries exactly one [`TopologyData`] variant, the id
//! of the instance that produced it and whether it was administratively
//! configured. An [`EventEntry`] pairs it with the channel action (ADD or
//! REMOVE) it arrived with.

use crate::{
    error::{TopologyError, TopologyResult},
    ids::{Dpid, ElementKey, HostId, InstanceId, LinkId, SwitchPort},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    net::IpAddr,
};

/// Free-form element attributes (description, hardware address, ...).
pub type Attributes = BTreeMap<String, String>;

/// Action carried by an event channel entry.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    /// Entry added or updated
    Add,
    /// Entry removed
    Remove,
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventAction::Add => write!(f, "add"),
            EventAction::Remove => write!(f, "remove"),
        }
    }
}

/// Whether an element was configured by an operator rather than discovered.
///
/// Configured events bypass the mastership check.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigState {
    /// Discovered from the network
    #[default]
    NotConfigured,
    /// Administratively configured
    Configured,
}

/// Role of an instance with respect to a switch.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MastershipRole {
    /// Authoritative for the switch
    Master,
    /// Connected with full access, not authoritative
    Equal,
    /// Connected read-only
    Slave,
}

/// Liveness of a switch.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchState {
    /// Connected and forwarding
    #[default]
    Active,
    /// Known but not connected
    Inactive,
}

/// Element kinds, in the order additions are applied.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    /// Switch mastership record
    Mastership,
    /// Switch
    Switch,
    /// Port
    Port,
    /// Link
    Link,
    /// Host
    Host,
}

impl ElementKind {
    /// Kinds in the order additions are applied: parents first.
    pub const ADD_ORDER: [ElementKind; 5] = [
        ElementKind::Mastership,
        ElementKind::Switch,
        ElementKind::Port,
        ElementKind::Link,
        ElementKind::Host,
    ];

    /// Kinds in the order removals are applied: children first.
    pub const REMOVE_ORDER: [ElementKind; 5] = [
        ElementKind::Host,
        ElementKind::Link,
        ElementKind::Port,
        ElementKind::Switch,
        ElementKind::Mastership,
    ];

    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Mastership => "mastership",
            ElementKind::Switch => "switch",
            ElementKind::Port => "port",
            ElementKind::Link => "link",
            ElementKind::Host => "host",
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mastership change for a switch.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MastershipData {
    /// Switch the role applies to
    pub dpid: Dpid,
    /// Role the origin instance holds
    pub role: MastershipRole,
}

/// Switch payload.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SwitchData {
    /// Switch identity
    pub dpid: Dpid,
    /// Liveness
    #[serde(default)]
    pub state: SwitchState,
    /// Attributes
    #[serde(default)]
    pub attributes: Attributes,
}

/// Port payload.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PortData {
    /// Port identity
    pub port: SwitchPort,
    /// Attributes
    #[serde(default)]
    pub attributes: Attributes,
}

/// Link payload.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LinkData {
    /// Link identity
    pub id: LinkId,
    /// Attributes
    #[serde(default)]
    pub attributes: Attributes,
}

/// Host payload.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HostData {
    /// Host identity
    pub id: HostId,
    /// Ports the host is attached to
    #[serde(default)]
    pub attachment_points: Vec<SwitchPort>,
    /// Addresses the host was seen with
    #[serde(default)]
    pub ip_addresses: BTreeSet<IpAddr>,
    /// Attributes
    #[serde(default)]
    pub attributes: Attributes,
}

impl HostData {
    /// Host event detaching `host` from a single port.
    pub fn detach(id: HostId, port: SwitchPort) -> Self {
        Self {
            id,
            attachment_points: vec![port],
            ip_addresses: BTreeSet::new(),
            attributes: Attributes::new(),
        }
    }
}

/// The payload of a topology event: exactly one element.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TopologyData {
    /// Mastership record
    Mastership(MastershipData),
    /// Switch
    Switch(SwitchData),
    /// Port
    Port(PortData),
    /// Link
    Link(LinkData),
    /// Host
    Host(HostData),
}

impl TopologyData {
    /// Element kind of the payload.
    pub fn kind(&self) -> ElementKind {
        match self {
            TopologyData::Mastership(_) => ElementKind::Mastership,
            TopologyData::Switch(_) => ElementKind::Switch,
            TopologyData::Port(_) => ElementKind::Port,
            TopologyData::Link(_) => ElementKind::Link,
            TopologyData::Host(_) => ElementKind::Host,
        }
    }

    /// Identity key of the element.
    pub fn key(&self) -> ElementKey {
        match self {
            TopologyData::Mastership(m) => ElementKey::mastership(m.dpid),
            TopologyData::Switch(s) => ElementKey::switch(s.dpid),
            TopologyData::Port(p) => ElementKey::port(&p.port),
            TopologyData::Link(l) => ElementKey::link(&l.id),
            TopologyData::Host(h) => ElementKey::host(&h.id),
        }
    }

    /// Switch whose master is authoritative for this element.
    ///
    /// Links are owned by the switch of their destination port, where they
    /// are discovered. Hosts are owned by the switch of their first
    /// attachment point and have no owner without one.
    pub fn owner_dpid(&self) -> Option<Dpid> {
        match self {
            TopologyData::Mastership(m) => Some(m.dpid),
            TopologyData::Switch(s) => Some(s.dpid),
            TopologyData::Port(p) => Some(p.port.dpid),
            TopologyData::Link(l) => Some(l.id.dst.dpid),
            TopologyData::Host(h) => h.attachment_points.first().map(|p| p.dpid),
        }
    }
}

impl fmt::Display for TopologyData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyData::Mastership(m) => write!(f, "[Mastership {} {:?}]", m.dpid, m.role),
            TopologyData::Switch(s) => write!(f, "[Switch {}]", s.dpid),
            TopologyData::Port(p) => write!(f, "[Port {}]", p.port),
            TopologyData::Link(l) => write!(f, "[Link {}]", l.id),
            TopologyData::Host(h) => write!(f, "[Host {}]", h.id),
        }
    }
}

/// A self-contained topology event.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TopologyEvent {
    /// The element
    pub data: TopologyData,
    /// Instance that produced the event
    pub origin: InstanceId,
    /// Whether the element was configured rather than discovered
    #[serde(default)]
    pub config_state: ConfigState,
}

impl TopologyEvent {
    /// Discovered event from `origin`.
    pub fn new(data: TopologyData, origin: InstanceId) -> Self {
        Self {
            data,
            origin,
            config_state: ConfigState::NotConfigured,
        }
    }

    /// Administratively configured event from `origin`.
    pub fn configured(data: TopologyData, origin: InstanceId) -> Self {
        Self {
            data,
            origin,
            config_state: ConfigState::Configured,
        }
    }

    /// Identity key of the carried element.
    pub fn key(&self) -> ElementKey {
        self.data.key()
    }

    /// Element kind of the carried element.
    pub fn kind(&self) -> ElementKind {
        self.data.kind()
    }

    /// Whether the mastership check is bypassed.
    pub fn is_configured(&self) -> bool {
        self.config_state == ConfigState::Configured
    }

    /// Reject events that cannot describe a real element.
    pub fn validate(&self) -> TopologyResult<()> {
        if self.origin.as_str().is_empty() {
            return Err(TopologyError::InvalidEvent(format!(
                "{} has no origin instance",
                self.data
            )));
        }
        match &self.data {
            TopologyData::Link(link) if link.id.src == link.id.dst => Err(
                TopologyError::InvalidEvent(format!("{} loops onto its own port", self.data)),
            ),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for TopologyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {}", self.data, self.origin)
    }
}

/// An event together with the channel action it arrived with.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EventEntry {
    /// ADD or REMOVE
    pub action: EventAction,
    /// The event
    pub event: TopologyEvent,
}

impl EventEntry {
    /// ADD entry.
    pub fn add(event: TopologyEvent) -> Self {
        Self {
            action: EventAction::Add,
            event,
        }
    }

    /// REMOVE entry.
    pub fn remove(event: TopologyEvent) -> Self {
        Self {
            action: EventAction::Remove,
            event,
        }
    }

    /// Whether this is an ADD.
    pub fn is_add(&self) -> bool {
        self.action == EventAction::Add
    }
}

impl fmt::Display for EventEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action, self.event)
    }
}
