//! Sensor registry: maps sensor ids to VLAN nodes and allocates addresses.
//!
//! The router takes VLAN ordinal 1; sensors get ordinals from 2, strictly
//! monotonic and never reused. Devices live for the life of the process.

use std::collections::BTreeMap;
use std::time::Instant;

use thiserror::Error;
use tracing::info;

use super::device::SensorDevice;
use super::vlan::{ROUTER_ORDINAL, Vlan, VlanAddr};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("sensor {0} already registered")]
    Duplicate(u32),
}

/// Point-in-time view of one sensor, safe to inspect while the registry moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorSummary {
    pub sensor_id: u32,
    pub address: VlanAddr,
    pub last_updated: Instant,
    pub has_fault: bool,
}

/// Owns the sensor-id → VLAN-node mapping. The devices themselves are owned
/// by the [`Vlan`]; the registry stores node indices.
#[derive(Debug, Default)]
pub struct SensorRegistry {
    index: BTreeMap<u32, usize>,
    next_ordinal: u32,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self {
            index: BTreeMap::new(),
            next_ordinal: ROUTER_ORDINAL + 1,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, sensor_id: u32) -> bool {
        self.index.contains_key(&sensor_id)
    }

    pub fn get_mut<'a>(
        &self,
        vlan: &'a mut Vlan,
        sensor_id: u32,
    ) -> Option<&'a mut SensorDevice> {
        let index = *self.index.get(&sensor_id)?;
        vlan.node_at_mut(index)
    }

    /// Create a device for `sensor_id` and attach it to the fabric.
    pub fn create<'a>(
        &mut self,
        vlan: &'a mut Vlan,
        sensor_id: u32,
        now: Instant,
    ) -> Result<&'a mut SensorDevice, RegistryError> {
        if self.index.contains_key(&sensor_id) {
            return Err(RegistryError::Duplicate(sensor_id));
        }
        let address = VlanAddr::from_ordinal(self.next_ordinal);
        self.next_ordinal += 1;
        info!(sensor = sensor_id, vlan_address = %address, "creating sensor device");
        let node_index = vlan.node_count();
        vlan.attach(SensorDevice::new(sensor_id, address, now));
        self.index.insert(sensor_id, node_index);
        Ok(vlan.node_at_mut(node_index).expect("node just attached"))
    }

    /// Snapshot of every sensor, independent of later registry mutation.
    pub fn snapshot(&self, vlan: &Vlan) -> BTreeMap<u32, SensorSummary> {
        self.index
            .iter()
            .filter_map(|(sensor_id, index)| {
                vlan.node_at(*index).map(|device| {
                    (
                        *sensor_id,
                        SensorSummary {
                            sensor_id: *sensor_id,
                            address: *device.address(),
                            last_updated: device.last_updated(),
                            has_fault: device.has_fault(),
                        },
                    )
                })
            })
            .collect()
    }
}
