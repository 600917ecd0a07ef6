//! BACnet object model for the sensor fabric.
//!
//! Each virtual device hosts its device object plus one analog-value object
//! per measurement key. Only the read-side of the object model exists here;
//! mutation happens through the device application.

use std::fmt;

/// Object types BacProp hosts or recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum ObjectType {
    AnalogValue = 2,
    Device = 8,
}

impl TryFrom<u16> for ObjectType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, u16> {
        match value {
            2 => Ok(ObjectType::AnalogValue),
            8 => Ok(ObjectType::Device),
            other => Err(other),
        }
    }
}

/// An object identifier as carried on the wire: raw type plus 22-bit instance.
///
/// The type is kept raw so requests naming types this gateway does not host
/// still decode and produce an `unknown-object` error rather than a reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectIdentifier {
    pub type_id: u16,
    pub instance: u32,
}

impl ObjectIdentifier {
    pub fn new(object_type: ObjectType, instance: u32) -> Self {
        Self {
            type_id: object_type as u16,
            instance,
        }
    }

    pub fn from_raw(type_id: u16, instance: u32) -> Self {
        Self { type_id, instance }
    }

    pub fn object_type(&self) -> Option<ObjectType> {
        ObjectType::try_from(self.type_id).ok()
    }
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.object_type() {
            Some(ObjectType::AnalogValue) => write!(f, "analog-value,{}", self.instance),
            Some(ObjectType::Device) => write!(f, "device,{}", self.instance),
            None => write!(f, "type-{},{}", self.type_id, self.instance),
        }
    }
}

/// Property identifiers BacProp serves, plus the three special selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PropertyIdentifier {
    All = 8,
    MaxApduLengthAccepted = 62,
    ObjectIdentifier = 75,
    ObjectList = 76,
    ObjectName = 77,
    ObjectType = 79,
    Optional = 80,
    PresentValue = 85,
    ProtocolVersion = 98,
    Required = 105,
    SegmentationSupported = 107,
    StatusFlags = 111,
    VendorIdentifier = 120,
}

impl TryFrom<u32> for PropertyIdentifier {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        Ok(match value {
            8 => PropertyIdentifier::All,
            62 => PropertyIdentifier::MaxApduLengthAccepted,
            75 => PropertyIdentifier::ObjectIdentifier,
            76 => PropertyIdentifier::ObjectList,
            77 => PropertyIdentifier::ObjectName,
            79 => PropertyIdentifier::ObjectType,
            80 => PropertyIdentifier::Optional,
            85 => PropertyIdentifier::PresentValue,
            98 => PropertyIdentifier::ProtocolVersion,
            105 => PropertyIdentifier::Required,
            107 => PropertyIdentifier::SegmentationSupported,
            111 => PropertyIdentifier::StatusFlags,
            120 => PropertyIdentifier::VendorIdentifier,
            other => return Err(other),
        })
    }
}

/// BACnetSegmentation enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Segmentation {
    Both = 0,
    Transmit = 1,
    Receive = 2,
    None = 3,
}

/// The status-flags bit string: in-alarm, fault, overridden, out-of-service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusFlags {
    pub in_alarm: bool,
    pub fault: bool,
    pub overridden: bool,
    pub out_of_service: bool,
}

impl StatusFlags {
    pub fn bits(&self) -> [bool; 4] {
        [self.in_alarm, self.fault, self.overridden, self.out_of_service]
    }
}

/// One measurement exposed as an analog-value object.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorValue {
    pub identifier: ObjectIdentifier,
    pub name: String,
    pub present_value: f64,
    pub status_flags: StatusFlags,
}

impl SensorValue {
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            identifier: ObjectIdentifier::new(ObjectType::AnalogValue, index),
            name: name.into(),
            present_value: 0.0,
            status_flags: StatusFlags::default(),
        }
    }

    pub fn set_value(&mut self, value: f64) {
        self.present_value = value;
    }

    pub fn set_fault(&mut self, fault: bool) {
        self.status_flags.fault = fault;
    }
}

/// The device object's descriptor, fixed at device creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub instance: u32,
    pub object_name: String,
    pub max_apdu_length_accepted: u32,
    pub segmentation: Segmentation,
    pub vendor_identifier: u32,
    pub protocol_version: u32,
}

impl DeviceInfo {
    pub const VENDOR_IDENTIFIER: u32 = 15;
    pub const MAX_APDU_LENGTH: u32 = 1024;

    pub fn for_sensor(sensor_id: u32) -> Self {
        Self {
            instance: sensor_id,
            object_name: format!("Sensor {sensor_id}"),
            max_apdu_length_accepted: Self::MAX_APDU_LENGTH,
            segmentation: Segmentation::Both,
            vendor_identifier: Self::VENDOR_IDENTIFIER,
            protocol_version: 1,
        }
    }

    pub fn identifier(&self) -> ObjectIdentifier {
        ObjectIdentifier::new(ObjectType::Device, self.instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_descriptor_defaults() {
        let info = DeviceInfo::for_sensor(42);
        assert_eq!(info.object_name, "Sensor 42");
        assert_eq!(info.max_apdu_length_accepted, 1024);
        assert_eq!(info.segmentation, Segmentation::Both);
        assert_eq!(info.vendor_identifier, 15);
        assert_eq!(
            info.identifier(),
            ObjectIdentifier::new(ObjectType::Device, 42)
        );
    }

    #[test]
    fn unknown_object_types_stay_raw() {
        let id = ObjectIdentifier::from_raw(5, 3);
        assert_eq!(id.object_type(), None);
        assert_eq!(id.to_string(), "type-5,3");
    }

    #[test]
    fn fault_is_bit_one() {
        let mut value = SensorValue::new(0, "temp");
        value.set_fault(true);
        assert_eq!(value.status_flags.bits(), [false, true, false, false]);
    }
}
