//! The BACnet side of the gateway: codec layers, the virtual network, and
//! the event-loop actor that ties them to the UDP endpoint.

pub mod apdu;
pub mod bvll;
pub mod device;
pub mod encoding;
pub mod engine;
pub mod npdu;
pub mod object;
pub mod registry;
pub mod router;
pub mod segment;
pub mod services;
pub mod transport;
pub mod vlan;

pub use engine::{Engine, EngineCommand, EngineHandle};
pub use transport::{BACNET_IP_PORT, Transport, UdpTransport};
