//! Application-service payload codecs: Who-Is / I-Am discovery and the two
//! read services, plus the BACnet error taxonomy they return.

use thiserror::Error;

use super::encoding::{self, EncodingError};
use super::object::ObjectIdentifier;

pub type Result<T> = std::result::Result<T, EncodingError>;

/// Confirmed service choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConfirmedServiceChoice {
    ReadProperty = 12,
    ReadPropertyMultiple = 14,
}

impl TryFrom<u8> for ConfirmedServiceChoice {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            12 => Ok(ConfirmedServiceChoice::ReadProperty),
            14 => Ok(ConfirmedServiceChoice::ReadPropertyMultiple),
            other => Err(other),
        }
    }
}

/// Unconfirmed service choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnconfirmedServiceChoice {
    IAm = 0,
    WhoIs = 8,
}

impl TryFrom<u8> for UnconfirmedServiceChoice {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0 => Ok(UnconfirmedServiceChoice::IAm),
            8 => Ok(UnconfirmedServiceChoice::WhoIs),
            other => Err(other),
        }
    }
}

/// BACnet error classes.
pub mod error_class {
    pub const OBJECT: u32 = 1;
    pub const PROPERTY: u32 = 2;
    pub const SERVICES: u32 = 5;
}

/// BACnet error codes.
pub mod error_code {
    pub const OTHER: u32 = 0;
    pub const UNKNOWN_OBJECT: u32 = 31;
    pub const UNKNOWN_PROPERTY: u32 = 32;
    pub const INVALID_ARRAY_INDEX: u32 = 42;
    pub const PROPERTY_IS_NOT_AN_ARRAY: u32 = 50;
}

/// A service-level error destined for an Error-PDU or an embedded RPM error.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("error class {class} code {code}")]
pub struct PropertyError {
    pub class: u32,
    pub code: u32,
}

impl PropertyError {
    pub fn unknown_object() -> Self {
        Self {
            class: error_class::OBJECT,
            code: error_code::UNKNOWN_OBJECT,
        }
    }

    pub fn unknown_property() -> Self {
        Self {
            class: error_class::PROPERTY,
            code: error_code::UNKNOWN_PROPERTY,
        }
    }

    pub fn invalid_array_index() -> Self {
        Self {
            class: error_class::PROPERTY,
            code: error_code::INVALID_ARRAY_INDEX,
        }
    }

    pub fn not_an_array() -> Self {
        Self {
            class: error_class::PROPERTY,
            code: error_code::PROPERTY_IS_NOT_AN_ARRAY,
        }
    }
}

/// Who-Is request: optional inclusive device-instance range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WhoIsRequest {
    pub low_limit: Option<u32>,
    pub high_limit: Option<u32>,
}

impl WhoIsRequest {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_range(low: u32, high: u32) -> Self {
        Self {
            low_limit: Some(low),
            high_limit: Some(high),
        }
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        if let (Some(low), Some(high)) = (self.low_limit, self.high_limit) {
            encoding::encode_context_unsigned(buffer, 0, low)?;
            encoding::encode_context_unsigned(buffer, 1, high)?;
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::all());
        }
        let (low, consumed) = encoding::decode_context_unsigned(data, 0)?;
        let (high, _) = encoding::decode_context_unsigned(&data[consumed..], 1)?;
        Ok(Self::for_range(low, high))
    }

    /// True if a device with this instance should answer.
    pub fn matches(&self, instance: u32) -> bool {
        match (self.low_limit, self.high_limit) {
            (Some(low), Some(high)) => instance >= low && instance <= high,
            _ => true,
        }
    }
}

/// I-Am announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IAmRequest {
    pub device_identifier: ObjectIdentifier,
    pub max_apdu_length_accepted: u32,
    pub segmentation_supported: u32,
    pub vendor_identifier: u32,
}

impl IAmRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) {
        encoding::encode_object_identifier(
            buffer,
            self.device_identifier.type_id,
            self.device_identifier.instance,
        );
        encoding::encode_unsigned(buffer, self.max_apdu_length_accepted);
        encoding::encode_enumerated(buffer, self.segmentation_supported);
        encoding::encode_unsigned(buffer, self.vendor_identifier);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let ((type_id, instance), mut pos) = encoding::decode_object_identifier(data)?;
        let (max_apdu_length_accepted, consumed) = encoding::decode_unsigned(&data[pos..])?;
        pos += consumed;
        let (segmentation_supported, consumed) = encoding::decode_enumerated(&data[pos..])?;
        pos += consumed;
        let (vendor_identifier, _) = encoding::decode_unsigned(&data[pos..])?;
        Ok(Self {
            device_identifier: ObjectIdentifier::from_raw(type_id, instance),
            max_apdu_length_accepted,
            segmentation_supported,
            vendor_identifier,
        })
    }
}

/// ReadProperty request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPropertyRequest {
    pub object_identifier: ObjectIdentifier,
    pub property_identifier: u32,
    pub property_array_index: Option<u32>,
}

impl ReadPropertyRequest {
    pub fn new(object_identifier: ObjectIdentifier, property_identifier: u32) -> Self {
        Self {
            object_identifier,
            property_identifier,
            property_array_index: None,
        }
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        encoding::encode_context_object_id(
            buffer,
            0,
            self.object_identifier.type_id,
            self.object_identifier.instance,
        )?;
        encoding::encode_context_unsigned(buffer, 1, self.property_identifier)?;
        if let Some(index) = self.property_array_index {
            encoding::encode_context_unsigned(buffer, 2, index)?;
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let ((type_id, instance), mut pos) = encoding::decode_context_object_id(data, 0)?;
        let (property_identifier, consumed) =
            encoding::decode_context_unsigned(&data[pos..], 1)?;
        pos += consumed;
        let property_array_index = if encoding::is_context_tag(&data[pos..], 2) {
            let (index, _) = encoding::decode_context_unsigned(&data[pos..], 2)?;
            Some(index)
        } else {
            None
        };
        Ok(Self {
            object_identifier: ObjectIdentifier::from_raw(type_id, instance),
            property_identifier,
            property_array_index,
        })
    }
}

/// ReadProperty acknowledgment. The value is carried pre-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPropertyAck {
    pub object_identifier: ObjectIdentifier,
    pub property_identifier: u32,
    pub property_array_index: Option<u32>,
    pub property_value: Vec<u8>,
}

impl ReadPropertyAck {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        encoding::encode_context_object_id(
            buffer,
            0,
            self.object_identifier.type_id,
            self.object_identifier.instance,
        )?;
        encoding::encode_context_unsigned(buffer, 1, self.property_identifier)?;
        if let Some(index) = self.property_array_index {
            encoding::encode_context_unsigned(buffer, 2, index)?;
        }
        encoding::encode_opening_tag(buffer, 3)?;
        buffer.extend_from_slice(&self.property_value);
        encoding::encode_closing_tag(buffer, 3)?;
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let ((type_id, instance), mut pos) = encoding::decode_context_object_id(data, 0)?;
        let (property_identifier, consumed) =
            encoding::decode_context_unsigned(&data[pos..], 1)?;
        pos += consumed;
        let property_array_index = if encoding::is_context_tag(&data[pos..], 2) {
            let (index, consumed) = encoding::decode_context_unsigned(&data[pos..], 2)?;
            pos += consumed;
            Some(index)
        } else {
            None
        };
        if !encoding::is_opening_tag(&data[pos..], 3) {
            return Err(EncodingError::InvalidTag);
        }
        pos += 1;
        let value_start = pos;
        while pos < data.len() && !encoding::is_closing_tag(&data[pos..], 3) {
            pos += encoding::skip_application_value(&data[pos..])?;
        }
        if pos >= data.len() {
            return Err(EncodingError::BufferUnderflow);
        }
        Ok(Self {
            object_identifier: ObjectIdentifier::from_raw(type_id, instance),
            property_identifier,
            property_array_index,
            property_value: data[value_start..pos].to_vec(),
        })
    }
}

/// One requested property inside a ReadPropertyMultiple specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyReference {
    pub property_identifier: u32,
    pub property_array_index: Option<u32>,
}

/// One (object, properties) pair of a ReadPropertyMultiple request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadAccessSpecification {
    pub object_identifier: ObjectIdentifier,
    pub properties: Vec<PropertyReference>,
}

/// ReadPropertyMultiple request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadPropertyMultipleRequest {
    pub specifications: Vec<ReadAccessSpecification>,
}

impl ReadPropertyMultipleRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        for spec in &self.specifications {
            encoding::encode_context_object_id(
                buffer,
                0,
                spec.object_identifier.type_id,
                spec.object_identifier.instance,
            )?;
            encoding::encode_opening_tag(buffer, 1)?;
            for property in &spec.properties {
                encoding::encode_context_unsigned(buffer, 0, property.property_identifier)?;
                if let Some(index) = property.property_array_index {
                    encoding::encode_context_unsigned(buffer, 1, index)?;
                }
            }
            encoding::encode_closing_tag(buffer, 1)?;
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut specifications = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let ((type_id, instance), consumed) =
                encoding::decode_context_object_id(&data[pos..], 0)?;
            pos += consumed;
            if !encoding::is_opening_tag(&data[pos..], 1) {
                return Err(EncodingError::InvalidTag);
            }
            pos += 1;
            let mut properties = Vec::new();
            while !encoding::is_closing_tag(&data[pos..], 1) {
                if pos >= data.len() {
                    return Err(EncodingError::BufferUnderflow);
                }
                let (property_identifier, consumed) =
                    encoding::decode_context_unsigned(&data[pos..], 0)?;
                pos += consumed;
                let property_array_index = if encoding::is_context_tag(&data[pos..], 1) {
                    let (index, consumed) = encoding::decode_context_unsigned(&data[pos..], 1)?;
                    pos += consumed;
                    Some(index)
                } else {
                    None
                };
                properties.push(PropertyReference {
                    property_identifier,
                    property_array_index,
                });
            }
            pos += 1; // closing bracket
            specifications.push(ReadAccessSpecification {
                object_identifier: ObjectIdentifier::from_raw(type_id, instance),
                properties,
            });
        }
        Ok(Self { specifications })
    }
}

/// Outcome of one property read inside an RPM response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyResult {
    pub property_identifier: u32,
    pub property_array_index: Option<u32>,
    pub outcome: std::result::Result<Vec<u8>, PropertyError>,
}

/// One object's results inside an RPM response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadAccessResult {
    pub object_identifier: ObjectIdentifier,
    pub results: Vec<PropertyResult>,
}

impl ReadAccessResult {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        encoding::encode_context_object_id(
            buffer,
            0,
            self.object_identifier.type_id,
            self.object_identifier.instance,
        )?;
        encoding::encode_opening_tag(buffer, 1)?;
        for result in &self.results {
            encoding::encode_context_unsigned(buffer, 2, result.property_identifier)?;
            if let Some(index) = result.property_array_index {
                encoding::encode_context_unsigned(buffer, 3, index)?;
            }
            match &result.outcome {
                Ok(value) => {
                    encoding::encode_opening_tag(buffer, 4)?;
                    buffer.extend_from_slice(value);
                    encoding::encode_closing_tag(buffer, 4)?;
                }
                Err(error) => {
                    encoding::encode_opening_tag(buffer, 5)?;
                    encoding::encode_enumerated(buffer, error.class);
                    encoding::encode_enumerated(buffer, error.code);
                    encoding::encode_closing_tag(buffer, 5)?;
                }
            }
        }
        encoding::encode_closing_tag(buffer, 1)?;
        Ok(())
    }
}

/// Encode a full RPM acknowledgment payload.
pub fn encode_read_access_results(results: &[ReadAccessResult]) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    for result in results {
        result.encode(&mut buffer)?;
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bacnet::object::ObjectType;

    #[test]
    fn who_is_empty_payload_matches_everything() {
        let request = WhoIsRequest::decode(&[]).unwrap();
        assert!(request.matches(0));
        assert!(request.matches(4_194_302));
    }

    #[test]
    fn who_is_range_round_trips_and_filters() {
        let mut buffer = Vec::new();
        WhoIsRequest::for_range(10, 20).encode(&mut buffer).unwrap();
        let request = WhoIsRequest::decode(&buffer).unwrap();
        assert!(!request.matches(9));
        assert!(request.matches(10));
        assert!(request.matches(20));
        assert!(!request.matches(21));
    }

    #[test]
    fn i_am_round_trips() {
        let announce = IAmRequest {
            device_identifier: ObjectIdentifier::new(ObjectType::Device, 1),
            max_apdu_length_accepted: 1024,
            segmentation_supported: 0,
            vendor_identifier: 15,
        };
        let mut buffer = Vec::new();
        announce.encode(&mut buffer);
        assert_eq!(IAmRequest::decode(&buffer).unwrap(), announce);
    }

    #[test]
    fn read_property_request_round_trips() {
        let request = ReadPropertyRequest {
            object_identifier: ObjectIdentifier::new(ObjectType::AnalogValue, 0),
            property_identifier: 85,
            property_array_index: None,
        };
        let mut buffer = Vec::new();
        request.encode(&mut buffer).unwrap();
        assert_eq!(ReadPropertyRequest::decode(&buffer).unwrap(), request);

        let with_index = ReadPropertyRequest {
            property_array_index: Some(0),
            ..request
        };
        buffer.clear();
        with_index.encode(&mut buffer).unwrap();
        assert_eq!(ReadPropertyRequest::decode(&buffer).unwrap(), with_index);
    }

    #[test]
    fn rpm_request_round_trips() {
        let request = ReadPropertyMultipleRequest {
            specifications: vec![ReadAccessSpecification {
                object_identifier: ObjectIdentifier::new(ObjectType::Device, 1),
                properties: vec![
                    PropertyReference {
                        property_identifier: 8,
                        property_array_index: None,
                    },
                    PropertyReference {
                        property_identifier: 76,
                        property_array_index: Some(1),
                    },
                ],
            }],
        };
        let mut buffer = Vec::new();
        request.encode(&mut buffer).unwrap();
        assert_eq!(
            ReadPropertyMultipleRequest::decode(&buffer).unwrap(),
            request
        );
    }

    #[test]
    fn read_access_result_embeds_errors() {
        let result = ReadAccessResult {
            object_identifier: ObjectIdentifier::new(ObjectType::AnalogValue, 9),
            results: vec![PropertyResult {
                property_identifier: 85,
                property_array_index: None,
                outcome: Err(PropertyError::unknown_object()),
            }],
        };
        let mut buffer = Vec::new();
        result.encode(&mut buffer).unwrap();
        // opening tag 5 bracket must appear, followed by class 1 / code 31
        let open5 = buffer.iter().position(|&b| b == 0x5E).unwrap();
        assert_eq!(&buffer[open5 + 1..open5 + 5], &[0x91, 1, 0x91, 31]);
        assert_eq!(buffer[open5 + 5], 0x5F);
    }

    #[test]
    fn read_property_ack_round_trips() {
        let mut value = Vec::new();
        encoding::encode_real(&mut value, 800.0);
        let ack = ReadPropertyAck {
            object_identifier: ObjectIdentifier::new(ObjectType::AnalogValue, 0),
            property_identifier: 85,
            property_array_index: None,
            property_value: value,
        };
        let mut buffer = Vec::new();
        ack.encode(&mut buffer).unwrap();
        let decoded = ReadPropertyAck::decode(&buffer).unwrap();
        assert_eq!(decoded, ack);
        let (read_back, _) = encoding::decode_real(&decoded.property_value).unwrap();
        assert_eq!(read_back, 800.0);
    }
}
