//! BACnet Virtual Link Layer framing (ASHRAE 135 Annex J).
//!
//! Every BACnet/IP datagram starts with the four-octet BVLL header
//! `0x81, function, length(2)`. BacProp speaks the NPDU-bearing functions
//! and NAKs the BBMD table functions it does not implement.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BvllError>;

/// BVLL type octet for BACnet/IP.
const BVLL_TYPE_BACNET_IP: u8 = 0x81;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BvllError {
    #[error("frame too short")]
    Truncated,
    #[error("not a BACnet/IP frame (type {0:#04x})")]
    WrongType(u8),
    #[error("frame length field {field} disagrees with datagram length {actual}")]
    LengthMismatch { field: u16, actual: usize },
    #[error("unknown BVLL function {0:#04x}")]
    UnknownFunction(u8),
    #[error("IPv6 endpoints are not supported")]
    NotIpv4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BvllFunction {
    Result = 0x00,
    WriteBroadcastDistributionTable = 0x01,
    ReadBroadcastDistributionTable = 0x02,
    ReadBroadcastDistributionTableAck = 0x03,
    ForwardedNpdu = 0x04,
    RegisterForeignDevice = 0x05,
    ReadForeignDeviceTable = 0x06,
    ReadForeignDeviceTableAck = 0x07,
    DeleteForeignDeviceTableEntry = 0x08,
    DistributeBroadcastToNetwork = 0x09,
    OriginalUnicastNpdu = 0x0A,
    OriginalBroadcastNpdu = 0x0B,
}

impl TryFrom<u8> for BvllFunction {
    type Error = BvllError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0x00 => BvllFunction::Result,
            0x01 => BvllFunction::WriteBroadcastDistributionTable,
            0x02 => BvllFunction::ReadBroadcastDistributionTable,
            0x03 => BvllFunction::ReadBroadcastDistributionTableAck,
            0x04 => BvllFunction::ForwardedNpdu,
            0x05 => BvllFunction::RegisterForeignDevice,
            0x06 => BvllFunction::ReadForeignDeviceTable,
            0x07 => BvllFunction::ReadForeignDeviceTableAck,
            0x08 => BvllFunction::DeleteForeignDeviceTableEntry,
            0x09 => BvllFunction::DistributeBroadcastToNetwork,
            0x0A => BvllFunction::OriginalUnicastNpdu,
            0x0B => BvllFunction::OriginalBroadcastNpdu,
            other => return Err(BvllError::UnknownFunction(other)),
        })
    }
}

/// Result codes for the BVLL functions BacProp refuses.
pub mod result_code {
    pub const SUCCESS: u16 = 0x0000;
    pub const WRITE_BDT_NAK: u16 = 0x0010;
    pub const READ_BDT_NAK: u16 = 0x0020;
    pub const REGISTER_FOREIGN_DEVICE_NAK: u16 = 0x0030;
    pub const READ_FDT_NAK: u16 = 0x0040;
    pub const DELETE_FDT_ENTRY_NAK: u16 = 0x0050;
    pub const DISTRIBUTE_BROADCAST_NAK: u16 = 0x0060;
}

/// A decoded inbound BVLL frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BvllPdu {
    /// NPDU sent directly to us.
    OriginalUnicast { npdu: Vec<u8> },
    /// NPDU broadcast on the local subnet.
    OriginalBroadcast { npdu: Vec<u8> },
    /// NPDU relayed by a BBMD on behalf of `origin`.
    Forwarded { origin: SocketAddrV4, npdu: Vec<u8> },
    /// Foreign device asking us (as a BBMD) to rebroadcast.
    DistributeBroadcast { npdu: Vec<u8> },
    /// BBMD bookkeeping we do not implement; answered with a NAK.
    Unsupported { function: BvllFunction },
    /// Result frame from a peer.
    Result { code: u16 },
}

/// Decode one datagram.
pub fn decode(data: &[u8]) -> Result<BvllPdu> {
    if data.len() < 4 {
        return Err(BvllError::Truncated);
    }
    if data[0] != BVLL_TYPE_BACNET_IP {
        return Err(BvllError::WrongType(data[0]));
    }
    let function = BvllFunction::try_from(data[1])?;
    let length = u16::from_be_bytes([data[2], data[3]]);
    if length as usize != data.len() {
        return Err(BvllError::LengthMismatch {
            field: length,
            actual: data.len(),
        });
    }
    let body = &data[4..];

    Ok(match function {
        BvllFunction::OriginalUnicastNpdu => BvllPdu::OriginalUnicast {
            npdu: body.to_vec(),
        },
        BvllFunction::OriginalBroadcastNpdu => BvllPdu::OriginalBroadcast {
            npdu: body.to_vec(),
        },
        BvllFunction::ForwardedNpdu => {
            if body.len() < 6 {
                return Err(BvllError::Truncated);
            }
            let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
            let port = u16::from_be_bytes([body[4], body[5]]);
            BvllPdu::Forwarded {
                origin: SocketAddrV4::new(ip, port),
                npdu: body[6..].to_vec(),
            }
        }
        BvllFunction::DistributeBroadcastToNetwork => BvllPdu::DistributeBroadcast {
            npdu: body.to_vec(),
        },
        BvllFunction::Result => {
            if body.len() < 2 {
                return Err(BvllError::Truncated);
            }
            BvllPdu::Result {
                code: u16::from_be_bytes([body[0], body[1]]),
            }
        }
        other => BvllPdu::Unsupported { function: other },
    })
}

fn frame(function: BvllFunction, body: &[u8]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(4 + body.len());
    buffer.push(BVLL_TYPE_BACNET_IP);
    buffer.push(function as u8);
    buffer.extend_from_slice(&(4 + body.len() as u16).to_be_bytes());
    buffer.extend_from_slice(body);
    buffer
}

/// Frame an NPDU for unicast transmission.
pub fn encode_unicast(npdu: &[u8]) -> Vec<u8> {
    frame(BvllFunction::OriginalUnicastNpdu, npdu)
}

/// Frame an NPDU for local broadcast transmission.
pub fn encode_broadcast(npdu: &[u8]) -> Vec<u8> {
    frame(BvllFunction::OriginalBroadcastNpdu, npdu)
}

/// Frame an NPDU relayed on behalf of `origin`.
pub fn encode_forwarded(origin: SocketAddrV4, npdu: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(6 + npdu.len());
    body.extend_from_slice(&origin.ip().octets());
    body.extend_from_slice(&origin.port().to_be_bytes());
    body.extend_from_slice(npdu);
    frame(BvllFunction::ForwardedNpdu, &body)
}

/// Frame a BVLL-Result.
pub fn encode_result(code: u16) -> Vec<u8> {
    frame(BvllFunction::Result, &code.to_be_bytes())
}

/// NAK code for an unsupported function, if the function expects a Result.
pub fn nak_code(function: BvllFunction) -> Option<u16> {
    match function {
        BvllFunction::WriteBroadcastDistributionTable => Some(result_code::WRITE_BDT_NAK),
        BvllFunction::ReadBroadcastDistributionTable => Some(result_code::READ_BDT_NAK),
        BvllFunction::RegisterForeignDevice => Some(result_code::REGISTER_FOREIGN_DEVICE_NAK),
        BvllFunction::ReadForeignDeviceTable => Some(result_code::READ_FDT_NAK),
        BvllFunction::DeleteForeignDeviceTableEntry => Some(result_code::DELETE_FDT_ENTRY_NAK),
        _ => None,
    }
}

/// Require an IPv4 endpoint; BACnet/IP MAC addresses are 6 octets.
pub fn require_ipv4(addr: SocketAddr) -> Result<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Ok(v4),
        SocketAddr::V6(_) => Err(BvllError::NotIpv4),
    }
}

/// Encode a BACnet/IP MAC address: 4 IP octets followed by the port.
pub fn mac_from_socket(addr: SocketAddrV4) -> Vec<u8> {
    let mut mac = Vec::with_capacity(6);
    mac.extend_from_slice(&addr.ip().octets());
    mac.extend_from_slice(&addr.port().to_be_bytes());
    mac
}

/// Decode a BACnet/IP MAC address back into a socket address.
pub fn socket_from_mac(mac: &[u8]) -> Option<SocketAddrV4> {
    if mac.len() != 6 {
        return None;
    }
    let ip = Ipv4Addr::new(mac[0], mac[1], mac[2], mac[3]);
    let port = u16::from_be_bytes([mac[4], mac[5]]);
    Some(SocketAddrV4::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unicast_frame_layout() {
        let framed = encode_unicast(&[0x01, 0x00]);
        assert_eq!(framed, vec![0x81, 0x0A, 0x00, 0x06, 0x01, 0x00]);
        assert_eq!(
            decode(&framed).unwrap(),
            BvllPdu::OriginalUnicast {
                npdu: vec![0x01, 0x00]
            }
        );
    }

    #[test]
    fn forwarded_frame_carries_origin() {
        let origin = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 47808);
        let framed = encode_forwarded(origin, &[0x01, 0x00]);
        match decode(&framed).unwrap() {
            BvllPdu::Forwarded { origin: got, npdu } => {
                assert_eq!(got, origin);
                assert_eq!(npdu, vec![0x01, 0x00]);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn length_field_is_checked() {
        let mut framed = encode_broadcast(&[0x01, 0x00]);
        framed.push(0xFF);
        assert!(matches!(
            decode(&framed),
            Err(BvllError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn bbmd_functions_are_unsupported() {
        let framed = frame(BvllFunction::RegisterForeignDevice, &[0x00, 0x3C]);
        match decode(&framed).unwrap() {
            BvllPdu::Unsupported { function } => {
                assert_eq!(function, BvllFunction::RegisterForeignDevice);
                assert_eq!(nak_code(function), Some(result_code::REGISTER_FOREIGN_DEVICE_NAK));
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn mac_round_trips() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 12), 47808);
        assert_eq!(socket_from_mac(&mac_from_socket(addr)), Some(addr));
    }
}
