//! Per-sensor BACnet device application.
//!
//! Each sensor is a full BACnet device bound to one VLAN node: it answers
//! Who-Is with I-Am, serves ReadProperty and ReadPropertyMultiple over its
//! device object and analog-value objects, and segments oversized responses.
//! Dispatch is by APDU service choice; the capability set is fixed.

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{debug, trace, warn};

use super::apdu::{Apdu, MaxApduSize, MaxSegments, abort_reason, reject_reason};
use super::encoding;
use super::npdu::NetworkAddress;
use super::object::{
    DeviceInfo, ObjectIdentifier, ObjectType, PropertyIdentifier, SensorValue,
};
use super::segment::{SegmentOutput, Segmenter};
use super::services::{
    ConfirmedServiceChoice, IAmRequest, PropertyError, PropertyResult, ReadAccessResult,
    ReadPropertyAck, ReadPropertyMultipleRequest, ReadPropertyRequest, UnconfirmedServiceChoice,
    encode_read_access_results,
};
use super::vlan::VlanAddr;

/// Properties the device object declares, in object-list order conventions.
const DEVICE_PROPERTIES: [PropertyIdentifier; 8] = [
    PropertyIdentifier::ObjectIdentifier,
    PropertyIdentifier::ObjectName,
    PropertyIdentifier::ObjectType,
    PropertyIdentifier::VendorIdentifier,
    PropertyIdentifier::MaxApduLengthAccepted,
    PropertyIdentifier::SegmentationSupported,
    PropertyIdentifier::ProtocolVersion,
    PropertyIdentifier::ObjectList,
];

/// Properties every analog-value object declares.
const ANALOG_VALUE_PROPERTIES: [PropertyIdentifier; 5] = [
    PropertyIdentifier::ObjectIdentifier,
    PropertyIdentifier::ObjectName,
    PropertyIdentifier::ObjectType,
    PropertyIdentifier::PresentValue,
    PropertyIdentifier::StatusFlags,
];

/// An APDU the device wants sent to a peer on the far side of the router.
#[derive(Debug, PartialEq)]
pub struct DeviceOutput {
    pub destination: NetworkAddress,
    pub expecting_reply: bool,
    pub apdu: Apdu,
}

/// One virtual sensor device.
#[derive(Debug)]
pub struct SensorDevice {
    info: DeviceInfo,
    address: VlanAddr,
    objects: Vec<SensorValue>,
    last_updated: Instant,
    fault: bool,
    segmenter: Segmenter,
}

impl SensorDevice {
    pub fn new(sensor_id: u32, address: VlanAddr, now: Instant) -> Self {
        Self {
            info: DeviceInfo::for_sensor(sensor_id),
            address,
            objects: Vec::new(),
            last_updated: now,
            fault: false,
            segmenter: Segmenter::new(),
        }
    }

    pub fn instance(&self) -> u32 {
        self.info.instance
    }

    pub fn address(&self) -> &VlanAddr {
        &self.address
    }

    pub fn last_updated(&self) -> Instant {
        self.last_updated
    }

    pub fn has_fault(&self) -> bool {
        self.fault
    }

    /// Objects in identifier order; index i holds `("analog-value", i)`.
    pub fn objects(&self) -> &[SensorValue] {
        &self.objects
    }

    /// Apply a sensor reading.
    ///
    /// A changed key set tears the object table down and rebuilds it with
    /// identifiers reassigned 0..n in sorted-name order; discovery caches on
    /// the client side rely on that allocation being deterministic.
    pub fn set_values(&mut self, values: &BTreeMap<String, f64>, now: Instant) {
        let changed = self.objects.len() != values.len()
            || !self
                .objects
                .iter()
                .all(|object| values.contains_key(&object.name));
        if changed {
            self.objects.clear();
            for (index, name) in values.keys().enumerate() {
                let mut object = SensorValue::new(index as u32, name.clone());
                object.set_fault(self.fault);
                self.objects.push(object);
            }
            debug!(
                device = self.info.instance,
                objects = self.objects.len(),
                "rebuilt analog-value table"
            );
        }
        for object in &mut self.objects {
            if let Some(value) = values.get(&object.name) {
                object.set_value(*value);
            }
        }
        self.last_updated = now;
        if self.fault {
            debug!(device = self.info.instance, "fresh data, clearing fault");
            self.mark_ok();
        }
    }

    pub fn mark_fault(&mut self) {
        for object in &mut self.objects {
            object.set_fault(true);
        }
        self.fault = true;
    }

    pub fn mark_ok(&mut self) {
        for object in &mut self.objects {
            object.set_fault(false);
        }
        self.fault = false;
    }

    /// Process one APDU delivered to this device's VLAN node.
    pub fn handle_apdu(
        &mut self,
        source: Option<&NetworkAddress>,
        apdu_bytes: &[u8],
        now: Instant,
    ) -> Vec<DeviceOutput> {
        let apdu = match Apdu::decode(apdu_bytes) {
            Ok(apdu) => apdu,
            Err(error) => {
                warn!(device = self.info.instance, %error, "dropping malformed APDU");
                return Vec::new();
            }
        };
        let Some(source) = source else {
            // A locally originated frame has nobody to answer.
            trace!(device = self.info.instance, "APDU without source, ignoring");
            return Vec::new();
        };

        match &apdu {
            Apdu::UnconfirmedRequest {
                service_choice,
                service_data,
            } => self.handle_unconfirmed(source, *service_choice, service_data),
            Apdu::ConfirmedRequest {
                segmented: false,
                segmented_response_accepted,
                max_segments,
                max_response_size,
                invoke_id,
                service_choice,
                service_data,
                ..
            } => self.handle_confirmed(
                source,
                *invoke_id,
                *service_choice,
                service_data,
                *segmented_response_accepted,
                *max_segments,
                *max_response_size,
                now,
            ),
            Apdu::ConfirmedRequest {
                segmented: true,
                segmented_response_accepted,
                max_segments,
                max_response_size,
                ..
            } => {
                let accepted = *segmented_response_accepted;
                let segments = *max_segments;
                let size = *max_response_size;
                let (acks, complete) =
                    self.segmenter.accept_request_segment(source, &apdu, now);
                let mut outputs: Vec<DeviceOutput> =
                    acks.into_iter().map(segment_output_to_device).collect();
                if let Some((invoke_id, service_choice, data)) = complete {
                    outputs.extend(self.handle_confirmed(
                        source,
                        invoke_id,
                        service_choice,
                        &data,
                        accepted,
                        segments,
                        size,
                        now,
                    ));
                }
                outputs
            }
            Apdu::SegmentAck {
                server: false,
                negative,
                invoke_id,
                sequence_number,
                actual_window_size,
            } => self
                .segmenter
                .handle_segment_ack(
                    source,
                    *invoke_id,
                    *sequence_number,
                    *negative,
                    *actual_window_size,
                    now,
                )
                .into_iter()
                .map(segment_output_to_device)
                .collect(),
            Apdu::Abort { invoke_id, .. } => {
                self.segmenter.handle_abort(source, *invoke_id);
                Vec::new()
            }
            other => {
                trace!(device = self.info.instance, apdu = ?other, "ignoring APDU");
                Vec::new()
            }
        }
    }

    /// Retransmit stalled segmented responses; abort exhausted ones.
    pub fn sweep_segments(&mut self, now: Instant) -> Vec<DeviceOutput> {
        self.segmenter
            .sweep(now)
            .into_iter()
            .map(segment_output_to_device)
            .collect()
    }

    fn handle_unconfirmed(
        &self,
        source: &NetworkAddress,
        service_choice: u8,
        service_data: &[u8],
    ) -> Vec<DeviceOutput> {
        match UnconfirmedServiceChoice::try_from(service_choice) {
            Ok(UnconfirmedServiceChoice::WhoIs) => {
                let request = match super::services::WhoIsRequest::decode(service_data) {
                    Ok(request) => request,
                    Err(error) => {
                        warn!(device = self.info.instance, %error, "bad Who-Is payload");
                        return Vec::new();
                    }
                };
                if !request.matches(self.info.instance) {
                    return Vec::new();
                }
                let announce = IAmRequest {
                    device_identifier: self.info.identifier(),
                    max_apdu_length_accepted: self.info.max_apdu_length_accepted,
                    segmentation_supported: self.info.segmentation as u32,
                    vendor_identifier: self.info.vendor_identifier,
                };
                let mut payload = Vec::new();
                announce.encode(&mut payload);
                vec![DeviceOutput {
                    destination: source.clone(),
                    expecting_reply: false,
                    apdu: Apdu::UnconfirmedRequest {
                        service_choice: UnconfirmedServiceChoice::IAm as u8,
                        service_data: payload,
                    },
                }]
            }
            _ => {
                trace!(
                    device = self.info.instance,
                    service = service_choice,
                    "unconfirmed service ignored"
                );
                Vec::new()
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_confirmed(
        &mut self,
        source: &NetworkAddress,
        invoke_id: u8,
        service_choice: u8,
        service_data: &[u8],
        segmented_response_accepted: bool,
        max_segments: MaxSegments,
        max_response_size: MaxApduSize,
        now: Instant,
    ) -> Vec<DeviceOutput> {
        let service = match ConfirmedServiceChoice::try_from(service_choice) {
            Ok(service) => service,
            Err(other) => {
                debug!(
                    device = self.info.instance,
                    service = other,
                    "rejecting unsupported confirmed service"
                );
                return vec![DeviceOutput {
                    destination: source.clone(),
                    expecting_reply: false,
                    apdu: Apdu::Reject {
                        invoke_id,
                        reject_reason: reject_reason::UNRECOGNIZED_SERVICE,
                    },
                }];
            }
        };

        let reply = match service {
            ConfirmedServiceChoice::ReadProperty => self.read_property_reply(service_data),
            ConfirmedServiceChoice::ReadPropertyMultiple => {
                self.read_property_multiple_reply(service_data)
            }
        };

        match reply {
            Ok(payload) => self.respond(
                source,
                invoke_id,
                service as u8,
                payload,
                segmented_response_accepted,
                max_segments,
                max_response_size,
                now,
            ),
            Err(ServiceOutcome::PropertyError(error)) => vec![DeviceOutput {
                destination: source.clone(),
                expecting_reply: false,
                apdu: Apdu::Error {
                    invoke_id,
                    service_choice: service as u8,
                    error_class: error.class,
                    error_code: error.code,
                },
            }],
            Err(ServiceOutcome::Malformed) => vec![DeviceOutput {
                destination: source.clone(),
                expecting_reply: false,
                apdu: Apdu::Reject {
                    invoke_id,
                    reject_reason: reject_reason::INVALID_TAG,
                },
            }],
        }
    }

    /// Wrap a response payload, segmenting when it exceeds the negotiated size.
    #[allow(clippy::too_many_arguments)]
    fn respond(
        &mut self,
        source: &NetworkAddress,
        invoke_id: u8,
        service_choice: u8,
        payload: Vec<u8>,
        segmented_response_accepted: bool,
        max_segments: MaxSegments,
        max_response_size: MaxApduSize,
        now: Instant,
    ) -> Vec<DeviceOutput> {
        // Unsegmented ComplexAck header is 3 octets.
        if 3 + payload.len() <= max_response_size.octets() {
            return vec![DeviceOutput {
                destination: source.clone(),
                expecting_reply: false,
                apdu: Apdu::ComplexAck {
                    segmented: false,
                    more_follows: false,
                    invoke_id,
                    sequence_number: None,
                    proposed_window_size: None,
                    service_choice,
                    service_data: payload,
                },
            }];
        }
        if !segmented_response_accepted {
            return vec![DeviceOutput {
                destination: source.clone(),
                expecting_reply: false,
                apdu: Apdu::Abort {
                    server: true,
                    invoke_id,
                    abort_reason: abort_reason::BUFFER_OVERFLOW,
                },
            }];
        }
        self.segmenter
            .start_response(
                source.clone(),
                invoke_id,
                service_choice,
                payload,
                max_response_size.octets(),
                max_segments.limit(),
                now,
            )
            .into_iter()
            .map(segment_output_to_device)
            .collect()
    }

    fn read_property_reply(
        &self,
        service_data: &[u8],
    ) -> Result<Vec<u8>, ServiceOutcome> {
        let request = ReadPropertyRequest::decode(service_data)
            .map_err(|_| ServiceOutcome::Malformed)?;
        let value = self
            .read_property(
                request.object_identifier,
                request.property_identifier,
                request.property_array_index,
            )
            .map_err(ServiceOutcome::PropertyError)?;
        let ack = ReadPropertyAck {
            object_identifier: request.object_identifier,
            property_identifier: request.property_identifier,
            property_array_index: request.property_array_index,
            property_value: value,
        };
        let mut payload = Vec::new();
        ack.encode(&mut payload).map_err(|_| ServiceOutcome::Malformed)?;
        Ok(payload)
    }

    fn read_property_multiple_reply(
        &self,
        service_data: &[u8],
    ) -> Result<Vec<u8>, ServiceOutcome> {
        let request = ReadPropertyMultipleRequest::decode(service_data)
            .map_err(|_| ServiceOutcome::Malformed)?;
        let mut results = Vec::new();
        for spec in &request.specifications {
            let mut property_results = Vec::new();
            for reference in &spec.properties {
                match self.expand_special_property(
                    spec.object_identifier,
                    reference.property_identifier,
                ) {
                    Some(expanded) => {
                        // Special selectors: per-property errors for each
                        // expanded property, not for the selector itself.
                        for property in expanded {
                            property_results.push(PropertyResult {
                                property_identifier: property as u32,
                                property_array_index: None,
                                outcome: self.read_property(
                                    spec.object_identifier,
                                    property as u32,
                                    None,
                                ),
                            });
                        }
                    }
                    None => {
                        property_results.push(PropertyResult {
                            property_identifier: reference.property_identifier,
                            property_array_index: reference.property_array_index,
                            outcome: self.read_property(
                                spec.object_identifier,
                                reference.property_identifier,
                                reference.property_array_index,
                            ),
                        });
                    }
                }
            }
            results.push(ReadAccessResult {
                object_identifier: spec.object_identifier,
                results: property_results,
            });
        }
        encode_read_access_results(&results).map_err(|_| ServiceOutcome::Malformed)
    }

    /// Expand `all` / `required` / `optional` against an object we host.
    fn expand_special_property(
        &self,
        object: ObjectIdentifier,
        property: u32,
    ) -> Option<Vec<PropertyIdentifier>> {
        let selector = PropertyIdentifier::try_from(property).ok()?;
        let declared: &[PropertyIdentifier] = match object.object_type() {
            Some(ObjectType::Device) if object.instance == self.info.instance => {
                &DEVICE_PROPERTIES
            }
            Some(ObjectType::AnalogValue)
                if (object.instance as usize) < self.objects.len() =>
            {
                &ANALOG_VALUE_PROPERTIES
            }
            // Let the per-property path produce unknown-object.
            _ => return None,
        };
        match selector {
            PropertyIdentifier::All | PropertyIdentifier::Required => Some(declared.to_vec()),
            PropertyIdentifier::Optional => Some(Vec::new()),
            _ => None,
        }
    }

    /// Serialize one property of one hosted object.
    pub fn read_property(
        &self,
        object: ObjectIdentifier,
        property: u32,
        array_index: Option<u32>,
    ) -> Result<Vec<u8>, PropertyError> {
        match object.object_type() {
            Some(ObjectType::Device) if object.instance == self.info.instance => {
                self.device_property(property, array_index)
            }
            Some(ObjectType::AnalogValue) => {
                let value = self
                    .objects
                    .get(object.instance as usize)
                    .ok_or_else(PropertyError::unknown_object)?;
                Self::value_property(value, property, array_index)
            }
            _ => Err(PropertyError::unknown_object()),
        }
    }

    fn device_property(
        &self,
        property: u32,
        array_index: Option<u32>,
    ) -> Result<Vec<u8>, PropertyError> {
        let property = PropertyIdentifier::try_from(property)
            .map_err(|_| PropertyError::unknown_property())?;
        if array_index.is_some() && property != PropertyIdentifier::ObjectList {
            return Err(PropertyError::not_an_array());
        }
        let mut buffer = Vec::new();
        match property {
            PropertyIdentifier::ObjectIdentifier => {
                let id = self.info.identifier();
                encoding::encode_object_identifier(&mut buffer, id.type_id, id.instance);
            }
            PropertyIdentifier::ObjectName => {
                encoding::encode_character_string(&mut buffer, &self.info.object_name);
            }
            PropertyIdentifier::ObjectType => {
                encoding::encode_enumerated(&mut buffer, ObjectType::Device as u32);
            }
            PropertyIdentifier::VendorIdentifier => {
                encoding::encode_unsigned(&mut buffer, self.info.vendor_identifier);
            }
            PropertyIdentifier::MaxApduLengthAccepted => {
                encoding::encode_unsigned(&mut buffer, self.info.max_apdu_length_accepted);
            }
            PropertyIdentifier::SegmentationSupported => {
                encoding::encode_enumerated(&mut buffer, self.info.segmentation as u32);
            }
            PropertyIdentifier::ProtocolVersion => {
                encoding::encode_unsigned(&mut buffer, self.info.protocol_version);
            }
            PropertyIdentifier::ObjectList => {
                self.encode_object_list(&mut buffer, array_index)?;
            }
            _ => return Err(PropertyError::unknown_property()),
        }
        Ok(buffer)
    }

    /// The object-list array: the device object first, then every
    /// analog-value in identifier order. Index 0 reads the length.
    fn encode_object_list(
        &self,
        buffer: &mut Vec<u8>,
        array_index: Option<u32>,
    ) -> Result<(), PropertyError> {
        let count = 1 + self.objects.len() as u32;
        match array_index {
            None => {
                let id = self.info.identifier();
                encoding::encode_object_identifier(buffer, id.type_id, id.instance);
                for object in &self.objects {
                    encoding::encode_object_identifier(
                        buffer,
                        object.identifier.type_id,
                        object.identifier.instance,
                    );
                }
            }
            Some(0) => encoding::encode_unsigned(buffer, count),
            Some(1) => {
                let id = self.info.identifier();
                encoding::encode_object_identifier(buffer, id.type_id, id.instance);
            }
            Some(index) if index <= count => {
                let object = &self.objects[index as usize - 2];
                encoding::encode_object_identifier(
                    buffer,
                    object.identifier.type_id,
                    object.identifier.instance,
                );
            }
            Some(_) => return Err(PropertyError::invalid_array_index()),
        }
        Ok(())
    }

    fn value_property(
        value: &SensorValue,
        property: u32,
        array_index: Option<u32>,
    ) -> Result<Vec<u8>, PropertyError> {
        let property = PropertyIdentifier::try_from(property)
            .map_err(|_| PropertyError::unknown_property())?;
        if array_index.is_some() {
            return Err(PropertyError::not_an_array());
        }
        let mut buffer = Vec::new();
        match property {
            PropertyIdentifier::ObjectIdentifier => {
                encoding::encode_object_identifier(
                    &mut buffer,
                    value.identifier.type_id,
                    value.identifier.instance,
                );
            }
            PropertyIdentifier::ObjectName => {
                encoding::encode_character_string(&mut buffer, &value.name);
            }
            PropertyIdentifier::ObjectType => {
                encoding::encode_enumerated(&mut buffer, ObjectType::AnalogValue as u32);
            }
            PropertyIdentifier::PresentValue => {
                encoding::encode_real(&mut buffer, value.present_value as f32);
            }
            PropertyIdentifier::StatusFlags => {
                encoding::encode_bit_string(&mut buffer, &value.status_flags.bits());
            }
            _ => return Err(PropertyError::unknown_property()),
        }
        Ok(buffer)
    }
}

enum ServiceOutcome {
    PropertyError(PropertyError),
    Malformed,
}

fn segment_output_to_device(output: SegmentOutput) -> DeviceOutput {
    let expecting_reply = matches!(output.apdu, Apdu::ComplexAck { segmented: true, .. });
    DeviceOutput {
        destination: output.peer,
        expecting_reply,
        apdu: output.apdu,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bacnet::services::WhoIsRequest;

    fn device() -> SensorDevice {
        SensorDevice::new(1, VlanAddr::from_ordinal(2), Instant::now())
    }

    fn requester() -> NetworkAddress {
        NetworkAddress::new(0, vec![192, 168, 1, 20, 0xBA, 0xC0])
    }

    fn values(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect()
    }

    fn who_is_apdu(request: WhoIsRequest) -> Vec<u8> {
        let mut payload = Vec::new();
        request.encode(&mut payload).unwrap();
        Apdu::UnconfirmedRequest {
            service_choice: UnconfirmedServiceChoice::WhoIs as u8,
            service_data: payload,
        }
        .encode()
    }

    fn read_property_apdu(request: ReadPropertyRequest) -> Vec<u8> {
        let mut payload = Vec::new();
        request.encode(&mut payload).unwrap();
        Apdu::ConfirmedRequest {
            segmented: false,
            more_follows: false,
            segmented_response_accepted: true,
            max_segments: MaxSegments::Unspecified,
            max_response_size: MaxApduSize::Up1476,
            invoke_id: 1,
            sequence_number: None,
            proposed_window_size: None,
            service_choice: ConfirmedServiceChoice::ReadProperty as u8,
            service_data: payload,
        }
        .encode()
    }

    fn unwrap_single_ack(outputs: Vec<DeviceOutput>) -> ReadPropertyAck {
        assert_eq!(outputs.len(), 1);
        match &outputs[0].apdu {
            Apdu::ComplexAck { service_data, .. } => {
                ReadPropertyAck::decode(service_data).unwrap()
            }
            other => panic!("expected ComplexAck, got {other:?}"),
        }
    }

    #[test]
    fn rebuild_assigns_sorted_indices_from_zero() {
        let mut device = device();
        let t0 = Instant::now();
        device.set_values(&values(&[("temp", 21.5), ("hum", 40.0)]), t0);
        assert_eq!(device.objects()[0].name, "hum");
        assert_eq!(device.objects()[1].name, "temp");

        // Schema change restarts allocation at zero.
        device.set_values(&values(&[("co2", 800.0)]), t0);
        assert_eq!(device.objects().len(), 1);
        assert_eq!(device.objects()[0].name, "co2");
        assert_eq!(device.objects()[0].identifier.instance, 0);
    }

    #[test]
    fn unchanged_keys_update_in_place() {
        let mut device = device();
        let t0 = Instant::now();
        device.set_values(&values(&[("temp", 1.0)]), t0);
        device.set_values(&values(&[("temp", 2.0)]), t0);
        assert_eq!(device.objects()[0].present_value, 2.0);
        assert_eq!(device.objects()[0].identifier.instance, 0);
    }

    #[test]
    fn who_is_in_range_produces_i_am() {
        let mut device = device();
        let outputs = device.handle_apdu(
            Some(&requester()),
            &who_is_apdu(WhoIsRequest::all()),
            Instant::now(),
        );
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].destination, requester());
        match &outputs[0].apdu {
            Apdu::UnconfirmedRequest {
                service_choice,
                service_data,
            } => {
                assert_eq!(*service_choice, UnconfirmedServiceChoice::IAm as u8);
                let announce = IAmRequest::decode(service_data).unwrap();
                assert_eq!(announce.device_identifier.instance, 1);
                assert_eq!(announce.max_apdu_length_accepted, 1024);
                assert_eq!(announce.segmentation_supported, 0);
                assert_eq!(announce.vendor_identifier, 15);
            }
            other => panic!("expected I-Am, got {other:?}"),
        }
    }

    #[test]
    fn who_is_out_of_range_is_silent() {
        let mut device = device();
        let outputs = device.handle_apdu(
            Some(&requester()),
            &who_is_apdu(WhoIsRequest::for_range(10, 20)),
            Instant::now(),
        );
        assert!(outputs.is_empty());
    }

    #[test]
    fn read_present_value_returns_last_written() {
        let mut device = device();
        let now = Instant::now();
        device.set_values(&values(&[("co2", 800.0)]), now);
        let ack = unwrap_single_ack(device.handle_apdu(
            Some(&requester()),
            &read_property_apdu(ReadPropertyRequest::new(
                ObjectIdentifier::new(ObjectType::AnalogValue, 0),
                PropertyIdentifier::PresentValue as u32,
            )),
            now,
        ));
        let (value, _) = encoding::decode_real(&ack.property_value).unwrap();
        assert_eq!(value, 800.0);
    }

    #[test]
    fn stale_identifier_becomes_unknown_object_after_rebuild() {
        let mut device = device();
        let now = Instant::now();
        device.set_values(&values(&[("temp", 21.5), ("hum", 40.0)]), now);
        device.set_values(&values(&[("co2", 800.0)]), now);

        let outputs = device.handle_apdu(
            Some(&requester()),
            &read_property_apdu(ReadPropertyRequest::new(
                ObjectIdentifier::new(ObjectType::AnalogValue, 1),
                PropertyIdentifier::PresentValue as u32,
            )),
            now,
        );
        assert_eq!(outputs.len(), 1);
        match &outputs[0].apdu {
            Apdu::Error {
                error_class,
                error_code,
                ..
            } => {
                assert_eq!(*error_class, 1);
                assert_eq!(*error_code, 31);
            }
            other => panic!("expected Error PDU, got {other:?}"),
        }
    }

    #[test]
    fn object_list_supports_array_indexing() {
        let mut device = device();
        let now = Instant::now();
        device.set_values(&values(&[("temp", 21.5), ("hum", 40.0)]), now);

        // Index 0: array length
        let ack = unwrap_single_ack(device.handle_apdu(
            Some(&requester()),
            &read_property_apdu(ReadPropertyRequest {
                object_identifier: ObjectIdentifier::new(ObjectType::Device, 1),
                property_identifier: PropertyIdentifier::ObjectList as u32,
                property_array_index: Some(0),
            }),
            now,
        ));
        assert_eq!(encoding::decode_unsigned(&ack.property_value).unwrap().0, 3);

        // Whole array: device id then analog values 0 and 1
        let ack = unwrap_single_ack(device.handle_apdu(
            Some(&requester()),
            &read_property_apdu(ReadPropertyRequest::new(
                ObjectIdentifier::new(ObjectType::Device, 1),
                PropertyIdentifier::ObjectList as u32,
            )),
            now,
        ));
        let data = &ack.property_value;
        let ((type_id, instance), consumed) =
            encoding::decode_object_identifier(data).unwrap();
        assert_eq!((type_id, instance), (8, 1));
        let ((type_id, instance), second) =
            encoding::decode_object_identifier(&data[consumed..]).unwrap();
        assert_eq!((type_id, instance), (2, 0));
        let ((type_id, instance), _) =
            encoding::decode_object_identifier(&data[consumed + second..]).unwrap();
        assert_eq!((type_id, instance), (2, 1));

        // Out of range
        let outputs = device.handle_apdu(
            Some(&requester()),
            &read_property_apdu(ReadPropertyRequest {
                object_identifier: ObjectIdentifier::new(ObjectType::Device, 1),
                property_identifier: PropertyIdentifier::ObjectList as u32,
                property_array_index: Some(9),
            }),
            now,
        );
        match &outputs[0].apdu {
            Apdu::Error { error_code, .. } => assert_eq!(*error_code, 42),
            other => panic!("expected Error PDU, got {other:?}"),
        }
    }

    #[test]
    fn array_index_on_scalar_property_errors() {
        let mut device = device();
        let now = Instant::now();
        device.set_values(&values(&[("temp", 21.5)]), now);
        let outputs = device.handle_apdu(
            Some(&requester()),
            &read_property_apdu(ReadPropertyRequest {
                object_identifier: ObjectIdentifier::new(ObjectType::AnalogValue, 0),
                property_identifier: PropertyIdentifier::PresentValue as u32,
                property_array_index: Some(1),
            }),
            now,
        );
        match &outputs[0].apdu {
            Apdu::Error { error_code, .. } => assert_eq!(*error_code, 50),
            other => panic!("expected Error PDU, got {other:?}"),
        }
    }

    #[test]
    fn rpm_all_expands_and_embeds_errors() {
        let mut device = device();
        let now = Instant::now();
        device.set_values(&values(&[("temp", 21.5)]), now);

        let request = ReadPropertyMultipleRequest {
            specifications: vec![
                crate::bacnet::services::ReadAccessSpecification {
                    object_identifier: ObjectIdentifier::new(ObjectType::AnalogValue, 0),
                    properties: vec![crate::bacnet::services::PropertyReference {
                        property_identifier: PropertyIdentifier::All as u32,
                        property_array_index: None,
                    }],
                },
                crate::bacnet::services::ReadAccessSpecification {
                    object_identifier: ObjectIdentifier::new(ObjectType::AnalogValue, 7),
                    properties: vec![crate::bacnet::services::PropertyReference {
                        property_identifier: PropertyIdentifier::PresentValue as u32,
                        property_array_index: None,
                    }],
                },
            ],
        };
        let mut payload = Vec::new();
        request.encode(&mut payload).unwrap();
        let apdu = Apdu::ConfirmedRequest {
            segmented: false,
            more_follows: false,
            segmented_response_accepted: true,
            max_segments: MaxSegments::Unspecified,
            max_response_size: MaxApduSize::Up1476,
            invoke_id: 2,
            sequence_number: None,
            proposed_window_size: None,
            service_choice: ConfirmedServiceChoice::ReadPropertyMultiple as u8,
            service_data: payload,
        };

        let outputs = device.handle_apdu(Some(&requester()), &apdu.encode(), now);
        assert_eq!(outputs.len(), 1);
        match &outputs[0].apdu {
            Apdu::ComplexAck {
                service_choice,
                service_data,
                ..
            } => {
                assert_eq!(*service_choice, 14);
                // First access result expands `all` into five property values;
                // the second embeds unknown-object instead of failing the APDU.
                let open5 = service_data
                    .windows(1)
                    .position(|window| window[0] == 0x5E)
                    .unwrap();
                assert_eq!(&service_data[open5 + 1..open5 + 5], &[0x91, 1, 0x91, 31]);
            }
            other => panic!("expected ComplexAck, got {other:?}"),
        }
    }

    #[test]
    fn oversized_rpm_response_is_segmented() {
        let mut device = device();
        let now = Instant::now();
        // Enough objects that `all` on every one of them overflows 206 octets.
        let many: Vec<(String, f64)> = (0..24)
            .map(|i| (format!("measurement_{i:02}"), i as f64))
            .collect();
        let map: BTreeMap<String, f64> =
            many.iter().map(|(k, v)| (k.clone(), *v)).collect();
        device.set_values(&map, now);

        let request = ReadPropertyMultipleRequest {
            specifications: vec![crate::bacnet::services::ReadAccessSpecification {
                object_identifier: ObjectIdentifier::new(ObjectType::Device, 1),
                properties: vec![crate::bacnet::services::PropertyReference {
                    property_identifier: PropertyIdentifier::ObjectList as u32,
                    property_array_index: None,
                }],
            }],
        };
        let mut payload = Vec::new();
        request.encode(&mut payload).unwrap();
        let apdu = Apdu::ConfirmedRequest {
            segmented: false,
            more_follows: false,
            segmented_response_accepted: true,
            max_segments: MaxSegments::Unspecified,
            max_response_size: MaxApduSize::Up50,
            invoke_id: 3,
            sequence_number: None,
            proposed_window_size: None,
            service_choice: ConfirmedServiceChoice::ReadPropertyMultiple as u8,
            service_data: payload,
        };

        let outputs = device.handle_apdu(Some(&requester()), &apdu.encode(), now);
        assert_eq!(outputs.len(), 1);
        match &outputs[0].apdu {
            Apdu::ComplexAck {
                segmented,
                more_follows,
                ..
            } => {
                assert!(*segmented);
                assert!(*more_follows);
            }
            other => panic!("expected segmented ComplexAck, got {other:?}"),
        }
    }

    #[test]
    fn unsupported_confirmed_service_is_rejected() {
        let mut device = device();
        let apdu = Apdu::ConfirmedRequest {
            segmented: false,
            more_follows: false,
            segmented_response_accepted: true,
            max_segments: MaxSegments::Unspecified,
            max_response_size: MaxApduSize::Up1476,
            invoke_id: 4,
            sequence_number: None,
            proposed_window_size: None,
            service_choice: 15, // WriteProperty
            service_data: Vec::new(),
        };
        let outputs = device.handle_apdu(Some(&requester()), &apdu.encode(), Instant::now());
        match &outputs[0].apdu {
            Apdu::Reject { reject_reason, .. } => {
                assert_eq!(*reject_reason, reject_reason::UNRECOGNIZED_SERVICE);
            }
            other => panic!("expected Reject, got {other:?}"),
        }
    }

    #[test]
    fn fault_touches_every_object_and_clears_on_data() {
        let mut device = device();
        let t0 = Instant::now();
        device.set_values(&values(&[("temp", 1.0), ("hum", 2.0)]), t0);
        device.mark_fault();
        assert!(device.has_fault());
        for object in device.objects() {
            assert!(object.status_flags.fault);
        }

        device.set_values(&values(&[("temp", 3.0), ("hum", 4.0)]), t0);
        assert!(!device.has_fault());
        for object in device.objects() {
            assert!(!object.status_flags.fault);
        }
    }
}
