//! BacProp: exposes MQTT sensor telemetry as a virtual BACnet/IP network.
//!
//! One UDP endpoint acts as a BACnet router onto an in-process VLAN where
//! every sensor that has ever published a reading appears as its own BACnet
//! device, discoverable and readable by any BACnet/IP client.

pub mod bacnet;
pub mod config;
pub mod mqtt;
pub mod service;
pub mod translator;
