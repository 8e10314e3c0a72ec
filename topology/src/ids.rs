// Copyright (c) 2024 Botho Foundation

//! Identity types for topology elements.
//!
//! Every element (switch, port, link, host, mastership record) has an
//! identity that encodes to an [`ElementKey`]: a kind tag followed by the
//! big-endian encoding of the identity fields. Keys compare byte-wise, so
//! maps keyed by them iterate in a stable order.

use displaydoc::Display;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Formatter},
    str::FromStr,
};

/// Errors produced while parsing identities from their textual form.
#[derive(Clone, Debug, Display, Eq, PartialEq, thiserror::Error)]
pub enum IdParseError {
    /// Invalid datapath id: {0}
    InvalidDpid(String),
    /// Invalid MAC address: {0}
    InvalidMac(String),
    /// Invalid instance id: {0}
    InvalidInstanceId(String),
}

/// Datapath identifier of a switch.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Dpid(pub u64);

impl Dpid {
    /// Raw 64-bit value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Dpid {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Dpid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_be_bytes();
        for (i, b) in bytes.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Dpid {
    type Err = IdParseError;

    fn from_str(src: &str) -> Result<Self, Self::Err> {
        let digits: String = src.chars().filter(|c| *c != ':').collect();
        if digits.is_empty() || digits.len() > 16 {
            return Err(IdParseError::InvalidDpid(src.to_string()));
        }
        u64::from_str_radix(&digits, 16)
            .map(Dpid)
            .map_err(|_| IdParseError::InvalidDpid(src.to_string()))
    }
}

/// Port number on a switch.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct PortNumber(pub u32);

impl From<u32> for PortNumber {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for PortNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A port identified by its switch and number.
///
/// Doubles as the attachment point of a host.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct SwitchPort {
    /// Owning switch
    pub dpid: Dpid,
    /// Port number on that switch
    pub number: PortNumber,
}

impl SwitchPort {
    /// Create a switch port from raw values.
    pub fn new(dpid: impl Into<Dpid>, number: impl Into<PortNumber>) -> Self {
        Self {
            dpid: dpid.into(),
            number: number.into(),
        }
    }
}

impl fmt::Display for SwitchPort {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dpid, self.number)
    }
}

/// Port identity.
pub type PortId = SwitchPort;

/// Directional link identity.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct LinkId {
    /// Source (egress) port
    pub src: SwitchPort,
    /// Destination (ingress) port
    pub dst: SwitchPort,
}

impl LinkId {
    /// Create a link identity.
    pub fn new(src: SwitchPort, dst: SwitchPort) -> Self {
        Self { src, dst }
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.src, self.dst)
    }
}

/// Ethernet MAC address.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Build a MAC from the low 48 bits of `value`.
    pub fn from_u64(value: u64) -> Self {
        let bytes = value.to_be_bytes();
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&bytes[2..]);
        Self(mac)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = IdParseError;

    fn from_str(src: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = src.split(':').collect();
        if parts.len() != 6 {
            return Err(IdParseError::InvalidMac(src.to_string()));
        }
        let mut mac = [0u8; 6];
        for (slot, part) in mac.iter_mut().zip(parts) {
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| IdParseError::InvalidMac(src.to_string()))?;
        }
        Ok(Self(mac))
    }
}

/// Host identity: MAC plus optional VLAN.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct HostId {
    /// Hardware address
    pub mac: MacAddress,
    /// VLAN tag, if any
    pub vlan: Option<u16>,
}

impl HostId {
    /// Untagged host.
    pub fn new(mac: MacAddress) -> Self {
        Self { mac, vlan: None }
    }

    /// Host on the given VLAN.
    pub fn with_vlan(mac: MacAddress, vlan: u16) -> Self {
        Self {
            mac,
            vlan: Some(vlan),
        }
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.vlan {
            Some(vlan) => write!(f, "{}@{}", self.mac, vlan),
            None => write!(f, "{}", self.mac),
        }
    }
}

/// Identity of a controller instance in the cluster.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    /// Borrow the textual id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for InstanceId {
    type Err = IdParseError;

    fn from_str(src: &str) -> Result<Self, Self::Err> {
        if src.trim().is_empty() {
            return Err(IdParseError::InvalidInstanceId(src.to_string()));
        }
        Ok(Self(src.to_string()))
    }
}

impl From<&str> for InstanceId {
    fn from(src: &str) -> Self {
        Self(src.to_string())
    }
}

/// Kind tags used as the first byte of an [`ElementKey`].
const MASTERSHIP_TAG: u8 = b'M';
const SWITCH_TAG: u8 = b'S';
const PORT_TAG: u8 = b'P';
const LINK_TAG: u8 = b'L';
const HOST_TAG: u8 = b'H';

/// Byte-comparable identity key of an element.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct ElementKey(Vec<u8>);

impl ElementKey {
    /// Key of the mastership record for `dpid`.
    pub fn mastership(dpid: Dpid) -> Self {
        let mut bytes = Vec::with_capacity(9);
        bytes.push(MASTERSHIP_TAG);
        bytes.extend_from_slice(&dpid.0.to_be_bytes());
        Self(bytes)
    }

    /// Key of a switch.
    pub fn switch(dpid: Dpid) -> Self {
        let mut bytes = Vec::with_capacity(9);
        bytes.push(SWITCH_TAG);
        bytes.extend_from_slice(&dpid.0.to_be_bytes());
        Self(bytes)
    }

    /// Key of a port.
    pub fn port(port: &SwitchPort) -> Self {
        let mut bytes = Vec::with_capacity(13);
        bytes.push(PORT_TAG);
        push_switch_port(&mut bytes, port);
        Self(bytes)
    }

    /// Key of a link.
    pub fn link(link: &LinkId) -> Self {
        let mut bytes = Vec::with_capacity(25);
        bytes.push(LINK_TAG);
        push_switch_port(&mut bytes, &link.src);
        push_switch_port(&mut bytes, &link.dst);
        Self(bytes)
    }

    /// Key of a host.
    pub fn host(host: &HostId) -> Self {
        let mut bytes = Vec::with_capacity(10);
        bytes.push(HOST_TAG);
        bytes.extend_from_slice(&host.mac.0);
        // 0xffff is not a valid 802.1Q id, so it can stand for "untagged"
        bytes.extend_from_slice(&host.vlan.unwrap_or(u16::MAX).to_be_bytes());
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ElementKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

fn push_switch_port(bytes: &mut Vec<u8>, port: &SwitchPort) {
    bytes.extend_from_slice(&port.dpid.0.to_be_bytes());
    bytes.extend_from_slice(&port.number.0.to_be_bytes());
}
