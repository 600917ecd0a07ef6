//! Network-layer PDU codec (ASHRAE 135 clause 6).
//!
//! An NPDU header carries optional destination and source network addresses;
//! a header whose control octet sets the network-message bit carries a
//! network-layer message instead of an APDU.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NpduError>;

/// Destination network number meaning "every network".
pub const GLOBAL_BROADCAST_NETWORK: u16 = 0xFFFF;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NpduError {
    #[error("NPDU too short")]
    Truncated,
    #[error("unsupported NPDU version {0}")]
    BadVersion(u8),
    #[error("unknown network message type {0}")]
    UnknownMessageType(u8),
}

/// Control octet flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NpduControl {
    pub network_message: bool,
    pub destination_present: bool,
    pub source_present: bool,
    pub expecting_reply: bool,
    pub priority: u8,
}

impl NpduControl {
    pub fn to_byte(self) -> u8 {
        let mut byte = self.priority & 0x03;
        if self.network_message {
            byte |= 0x80;
        }
        if self.destination_present {
            byte |= 0x20;
        }
        if self.source_present {
            byte |= 0x08;
        }
        byte
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            network_message: byte & 0x80 != 0,
            destination_present: byte & 0x20 != 0,
            source_present: byte & 0x08 != 0,
            expecting_reply: byte & 0x04 != 0,
            priority: byte & 0x03,
        }
    }
}

/// A network number plus a MAC address on that network. An empty MAC in a
/// destination means broadcast on that network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    pub network: u16,
    pub address: Vec<u8>,
}

impl NetworkAddress {
    pub fn new(network: u16, address: Vec<u8>) -> Self {
        Self { network, address }
    }

    pub fn broadcast(network: u16) -> Self {
        Self {
            network,
            address: Vec::new(),
        }
    }

    pub fn is_global_broadcast(&self) -> bool {
        self.network == GLOBAL_BROADCAST_NETWORK
    }

    pub fn is_network_broadcast(&self) -> bool {
        self.address.is_empty()
    }
}

/// NPDU header. The payload (APDU or network message) is carried separately.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Npdu {
    pub control: NpduControl,
    pub destination: Option<NetworkAddress>,
    pub source: Option<NetworkAddress>,
    pub hop_count: Option<u8>,
}

impl Npdu {
    pub const VERSION: u8 = 1;

    /// Header for an APDU delivered on the local network.
    pub fn local(expecting_reply: bool) -> Self {
        Self {
            control: NpduControl {
                expecting_reply,
                ..NpduControl::default()
            },
            ..Self::default()
        }
    }

    /// Header for an APDU routed to a remote station.
    pub fn remote(destination: NetworkAddress, expecting_reply: bool) -> Self {
        Self {
            control: NpduControl {
                destination_present: true,
                expecting_reply,
                ..NpduControl::default()
            },
            destination: Some(destination),
            source: None,
            hop_count: Some(255),
        }
    }

    /// Header for a network-layer message.
    pub fn network_message() -> Self {
        Self {
            control: NpduControl {
                network_message: true,
                ..NpduControl::default()
            },
            ..Self::default()
        }
    }

    pub fn is_network_message(&self) -> bool {
        self.control.network_message
    }

    /// Stamp the originator, keeping the control octet consistent.
    pub fn with_source(mut self, source: NetworkAddress) -> Self {
        self.control.source_present = true;
        self.source = Some(source);
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut control = self.control;
        control.destination_present = self.destination.is_some();
        control.source_present = self.source.is_some();

        let mut buffer = vec![Self::VERSION, control.to_byte()];
        if let Some(destination) = &self.destination {
            buffer.extend_from_slice(&destination.network.to_be_bytes());
            buffer.push(destination.address.len() as u8);
            buffer.extend_from_slice(&destination.address);
        }
        if let Some(source) = &self.source {
            buffer.extend_from_slice(&source.network.to_be_bytes());
            buffer.push(source.address.len() as u8);
            buffer.extend_from_slice(&source.address);
        }
        if self.destination.is_some() {
            buffer.push(self.hop_count.unwrap_or(255));
        }
        buffer
    }

    /// Decode a header, returning it along with the number of octets consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 2 {
            return Err(NpduError::Truncated);
        }
        if data[0] != Self::VERSION {
            return Err(NpduError::BadVersion(data[0]));
        }
        let control = NpduControl::from_byte(data[1]);
        let mut pos = 2;

        let destination = if control.destination_present {
            let (address, consumed) = decode_address(&data[pos..])?;
            pos += consumed;
            Some(address)
        } else {
            None
        };
        let source = if control.source_present {
            let (address, consumed) = decode_address(&data[pos..])?;
            pos += consumed;
            Some(address)
        } else {
            None
        };
        let hop_count = if destination.is_some() {
            let hops = *data.get(pos).ok_or(NpduError::Truncated)?;
            pos += 1;
            Some(hops)
        } else {
            None
        };

        Ok((
            Self {
                control,
                destination,
                source,
                hop_count,
            },
            pos,
        ))
    }
}

fn decode_address(data: &[u8]) -> Result<(NetworkAddress, usize)> {
    if data.len() < 3 {
        return Err(NpduError::Truncated);
    }
    let network = u16::from_be_bytes([data[0], data[1]]);
    let len = data[2] as usize;
    if data.len() < 3 + len {
        return Err(NpduError::Truncated);
    }
    Ok((
        NetworkAddress::new(network, data[3..3 + len].to_vec()),
        3 + len,
    ))
}

/// Network-layer message types BacProp participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NetworkMessageType {
    WhoIsRouterToNetwork = 0x00,
    IAmRouterToNetwork = 0x01,
    RejectMessageToNetwork = 0x03,
    WhatIsNetworkNumber = 0x12,
    NetworkNumberIs = 0x13,
}

impl TryFrom<u8> for NetworkMessageType {
    type Error = NpduError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0x00 => NetworkMessageType::WhoIsRouterToNetwork,
            0x01 => NetworkMessageType::IAmRouterToNetwork,
            0x03 => NetworkMessageType::RejectMessageToNetwork,
            0x12 => NetworkMessageType::WhatIsNetworkNumber,
            0x13 => NetworkMessageType::NetworkNumberIs,
            other => return Err(NpduError::UnknownMessageType(other)),
        })
    }
}

/// Reject-Message-To-Network reason: no route to the destination network.
pub const REJECT_REASON_NO_ROUTE: u8 = 1;

/// Payload of a network-layer message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkMessage {
    pub message_type: NetworkMessageType,
    pub data: Vec<u8>,
}

impl NetworkMessage {
    pub fn new(message_type: NetworkMessageType, data: Vec<u8>) -> Self {
        Self { message_type, data }
    }

    pub fn i_am_router_to_network(network: u16) -> Self {
        Self::new(
            NetworkMessageType::IAmRouterToNetwork,
            network.to_be_bytes().to_vec(),
        )
    }

    pub fn reject(reason: u8, network: u16) -> Self {
        let mut data = vec![reason];
        data.extend_from_slice(&network.to_be_bytes());
        Self::new(NetworkMessageType::RejectMessageToNetwork, data)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = vec![self.message_type as u8];
        buffer.extend_from_slice(&self.data);
        buffer
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let first = *data.first().ok_or(NpduError::Truncated)?;
        Ok(Self {
            message_type: NetworkMessageType::try_from(first)?,
            data: data[1..].to_vec(),
        })
    }
}
