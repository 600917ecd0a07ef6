//! Network-layer router between the real BACnet/IP network and the VLAN.
//!
//! The IP side is network 0; the VLAN is the configured virtual network
//! (default 1) with the router itself at VLAN address 1. Routed NPDUs get
//! their destination stripped and their source stamped so peers can address
//! replies through the router, per ASHRAE 135 clause 6 / Annex H.

use std::net::SocketAddrV4;

use thiserror::Error;
use tracing::{debug, trace};

use super::bvll;
use super::device::DeviceOutput;
use super::npdu::{
    GLOBAL_BROADCAST_NETWORK, NetworkAddress, NetworkMessage, NetworkMessageType, Npdu,
    NpduError, REJECT_REASON_NO_ROUTE,
};
use super::vlan::{VlanAddr, VlanDestination};

/// Network number of the BACnet/IP side.
pub const IP_NETWORK: u16 = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error(transparent)]
    Npdu(#[from] NpduError),
    #[error("VLAN address must be 4 octets, got {0}")]
    BadVlanAddress(usize),
}

/// What the engine should do with a routed frame.
#[derive(Debug, PartialEq, Eq)]
pub enum RouterAction {
    IpUnicast {
        destination: SocketAddrV4,
        npdu: Vec<u8>,
    },
    IpBroadcast {
        npdu: Vec<u8>,
    },
    VlanDeliver {
        destination: VlanDestination,
        source: NetworkAddress,
        apdu: Vec<u8>,
    },
}

#[derive(Debug)]
pub struct Router {
    vlan_network: u16,
}

impl Router {
    pub fn new(vlan_network: u16) -> Self {
        Self { vlan_network }
    }

    pub fn vlan_network(&self) -> u16 {
        self.vlan_network
    }

    /// The startup advertisement: I-Am-Router-To-Network(vlan) as an NPDU
    /// ready for local broadcast.
    pub fn advertisement(&self) -> Vec<u8> {
        let mut frame = Npdu::network_message().encode();
        frame.extend_from_slice(
            &NetworkMessage::i_am_router_to_network(self.vlan_network).encode(),
        );
        frame
    }

    /// Route one NPDU received on the IP side.
    pub fn route_from_ip(
        &self,
        data: &[u8],
        source: SocketAddrV4,
    ) -> Result<Vec<RouterAction>, RouterError> {
        let (npdu, consumed) = Npdu::decode(data)?;
        let payload = &data[consumed..];

        if npdu.is_network_message() {
            return Ok(self.handle_network_message(payload, source));
        }

        let Some(destination) = npdu.destination.clone() else {
            // Addressed to the router's own endpoint; it hosts no application.
            trace!("APDU for the router itself, dropping");
            return Ok(Vec::new());
        };

        // Originator as seen from inside the VLAN: either the routed source
        // already in the header, or the IP sender one hop away.
        let origin = npdu
            .source
            .clone()
            .unwrap_or_else(|| NetworkAddress::new(IP_NETWORK, bvll::mac_from_socket(source)));

        if destination.network == self.vlan_network
            || destination.network == GLOBAL_BROADCAST_NETWORK
        {
            if npdu.hop_count == Some(0) {
                debug!(network = destination.network, "hop count exhausted, dropping");
                return Ok(Vec::new());
            }
            let vlan_destination = if destination.is_network_broadcast()
                || destination.is_global_broadcast()
            {
                VlanDestination::Broadcast
            } else {
                let bytes = destination.address.as_slice();
                let bytes: [u8; 4] = bytes
                    .try_into()
                    .map_err(|_| RouterError::BadVlanAddress(destination.address.len()))?;
                VlanDestination::Node(VlanAddr::from_ordinal(u32::from_be_bytes(bytes)))
            };
            return Ok(vec![RouterAction::VlanDeliver {
                destination: vlan_destination,
                source: origin,
                apdu: payload.to_vec(),
            }]);
        }

        // No route: tell the sender, per clause 6.6.3.5.
        debug!(network = destination.network, "no route, rejecting");
        let mut reject = Npdu::network_message().encode();
        reject.extend_from_slice(
            &NetworkMessage::reject(REJECT_REASON_NO_ROUTE, destination.network).encode(),
        );
        Ok(vec![RouterAction::IpUnicast {
            destination: source,
            npdu: reject,
        }])
    }

    fn handle_network_message(
        &self,
        payload: &[u8],
        source: SocketAddrV4,
    ) -> Vec<RouterAction> {
        let message = match NetworkMessage::decode(payload) {
            Ok(message) => message,
            Err(error) => {
                debug!(%error, "undecodable network message, dropping");
                return Vec::new();
            }
        };
        match message.message_type {
            NetworkMessageType::WhoIsRouterToNetwork => {
                let queried = if message.data.len() >= 2 {
                    Some(u16::from_be_bytes([message.data[0], message.data[1]]))
                } else {
                    None
                };
                if queried.is_none() || queried == Some(self.vlan_network) {
                    vec![RouterAction::IpBroadcast {
                        npdu: self.advertisement(),
                    }]
                } else {
                    Vec::new()
                }
            }
            NetworkMessageType::WhatIsNetworkNumber => {
                let mut npdu = Npdu::network_message().encode();
                npdu.extend_from_slice(
                    &NetworkMessage::new(
                        NetworkMessageType::NetworkNumberIs,
                        IP_NETWORK.to_be_bytes().to_vec(),
                    )
                    .encode(),
                );
                vec![RouterAction::IpUnicast {
                    destination: source,
                    npdu,
                }]
            }
            other => {
                trace!(message = ?other, "network message ignored");
                Vec::new()
            }
        }
    }

    /// Route a device response out of the VLAN onto the IP side.
    pub fn route_from_vlan(
        &self,
        device_address: &VlanAddr,
        output: DeviceOutput,
    ) -> Option<RouterAction> {
        let source = NetworkAddress::new(self.vlan_network, device_address.as_bytes().to_vec());
        let apdu = output.apdu.encode();

        match output.destination.network {
            IP_NETWORK => {
                let npdu = Npdu::local(output.expecting_reply).with_source(source);
                let mut frame = npdu.encode();
                frame.extend_from_slice(&apdu);
                if output.destination.is_network_broadcast() {
                    Some(RouterAction::IpBroadcast { npdu: frame })
                } else {
                    let peer = bvll::socket_from_mac(&output.destination.address)?;
                    Some(RouterAction::IpUnicast {
                        destination: peer,
                        npdu: frame,
                    })
                }
            }
            GLOBAL_BROADCAST_NETWORK => {
                let npdu = Npdu::remote(
                    NetworkAddress::broadcast(GLOBAL_BROADCAST_NETWORK),
                    output.expecting_reply,
                )
                .with_source(source);
                let mut frame = npdu.encode();
                frame.extend_from_slice(&apdu);
                Some(RouterAction::IpBroadcast { npdu: frame })
            }
            other => {
                debug!(network = other, "device response to unknown network, dropping");
                None
            }
        }
    }
}
