//! The in-process virtual BACnet network.
//!
//! Nodes share one broadcast domain behind the router. Delivery scans the
//! node list in insertion order and is serialized by `&mut self`, so at most
//! one node processes a given NPDU at a time and per-source ordering holds.

use std::fmt;
use std::time::Instant;

use super::device::{DeviceOutput, SensorDevice};
use super::npdu::NetworkAddress;

/// A VLAN MAC address: the 4-byte big-endian encoding of the node ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VlanAddr([u8; 4]);

/// Ordinal reserved for the router's own node.
pub const ROUTER_ORDINAL: u32 = 1;

impl VlanAddr {
    pub fn from_ordinal(ordinal: u32) -> Self {
        Self(ordinal.to_be_bytes())
    }

    pub fn ordinal(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn router() -> Self {
        Self::from_ordinal(ROUTER_ORDINAL)
    }
}

impl fmt::Display for VlanAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ordinal())
    }
}

/// Where a frame entering the fabric should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VlanDestination {
    Node(VlanAddr),
    Broadcast,
}

/// The virtual LAN: an ordered set of sensor nodes.
#[derive(Debug, Default)]
pub struct Vlan {
    nodes: Vec<SensorDevice>,
}

impl Vlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, device: SensorDevice) {
        self.nodes.push(device);
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[SensorDevice] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [SensorDevice] {
        &mut self.nodes
    }

    pub fn node_at(&self, index: usize) -> Option<&SensorDevice> {
        self.nodes.get(index)
    }

    pub fn node_at_mut(&mut self, index: usize) -> Option<&mut SensorDevice> {
        self.nodes.get_mut(index)
    }

    /// Deliver an APDU into the fabric.
    ///
    /// Responses are collected in node order, each tagged with the VLAN
    /// address of the node that produced it.
    pub fn deliver(
        &mut self,
        destination: &VlanDestination,
        source: Option<&NetworkAddress>,
        apdu: &[u8],
        now: Instant,
    ) -> Vec<(VlanAddr, DeviceOutput)> {
        let mut outputs = Vec::new();
        for node in &mut self.nodes {
            let matches = match destination {
                VlanDestination::Broadcast => true,
                VlanDestination::Node(addr) => node.address() == addr,
            };
            if matches {
                let address = *node.address();
                outputs.extend(
                    node.handle_apdu(source, apdu, now)
                        .into_iter()
                        .map(move |output| (address, output)),
                );
            }
        }
        outputs
    }
}
