//! The BACnet event loop: a single-threaded actor owning the UDP endpoint,
//! router, VLAN fabric, and every device. The MQTT side talks to it through
//! a command channel, so device state has exactly one writer and no locks.

use std::net::SocketAddrV4;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use super::bvll::{self, BvllPdu};
use super::registry::SensorRegistry;
use super::router::{Router, RouterAction};
use super::transport::{SendTo, Transport};
use super::vlan::Vlan;
use crate::translator::SensorReading;

/// Largest BACnet/IP datagram we accept (link MTU).
const MAX_DATAGRAM: usize = 1500;

/// Commands accepted by the engine actor.
#[derive(Debug)]
pub enum EngineCommand {
    /// Apply a validated sensor reading, creating the device if needed.
    Ingest(SensorReading),
    /// Mark devices stale per the fault timeout.
    SweepFaults,
    /// Leave the event loop.
    Shutdown,
}

/// Cloneable sender half for the supervisor, translator, and fault tick.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: Sender<EngineCommand>,
}

impl EngineHandle {
    pub fn ingest(&self, reading: SensorReading) {
        // A closed channel means the engine is already gone; shutdown will
        // surface through the supervisor joining the thread.
        let _ = self.commands.send(EngineCommand::Ingest(reading));
    }

    pub fn sweep_faults(&self) {
        let _ = self.commands.send(EngineCommand::SweepFaults);
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(EngineCommand::Shutdown);
    }
}

#[derive(Debug, Default)]
struct EngineStats {
    datagrams: u64,
    dropped_frames: u64,
    readings: u64,
    faults_raised: u64,
}

/// The BACnet actor. `run` consumes it on a dedicated OS thread.
pub struct Engine<T: Transport> {
    transport: T,
    router: Router,
    vlan: Vlan,
    registry: SensorRegistry,
    commands: Receiver<EngineCommand>,
    fault_timeout: Duration,
    stats: EngineStats,
}

impl<T: Transport> Engine<T> {
    pub fn new(transport: T, vlan_network: u16, fault_timeout: Duration) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                transport,
                router: Router::new(vlan_network),
                vlan: Vlan::new(),
                registry: SensorRegistry::new(),
                commands: rx,
                fault_timeout,
                stats: EngineStats::default(),
            },
            EngineHandle { commands: tx },
        )
    }

    /// Run until shutdown. Alternates a timed UDP receive with a command
    /// drain and a segmentation-timer sweep, so cancellation and ingest are
    /// both observed within the socket timeout.
    pub fn run(mut self) {
        info!(network = self.router.vlan_network(), "BACnet engine starting");
        self.announce();

        let mut buffer = [0u8; MAX_DATAGRAM];
        loop {
            if !self.drain_commands() {
                break;
            }
            match self.transport.recv(&mut buffer) {
                Ok(Some((len, source))) => {
                    self.handle_datagram(&buffer[..len], source, Instant::now());
                }
                Ok(None) => {}
                Err(error) => warn!(%error, "UDP receive failed"),
            }
            self.sweep_segments(Instant::now());
        }

        info!(
            datagrams = self.stats.datagrams,
            dropped = self.stats.dropped_frames,
            readings = self.stats.readings,
            faults = self.stats.faults_raised,
            "BACnet engine stopped"
        );
    }

    /// Advertise the virtual network so discovery tools learn the route.
    fn announce(&mut self) {
        let frame = bvll::encode_broadcast(&self.router.advertisement());
        if let Err(error) = self.transport.send(&frame, SendTo::Broadcast) {
            warn!(%error, "failed to broadcast I-Am-Router-To-Network");
        }
    }

    /// Returns false once a shutdown is observed.
    fn drain_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(EngineCommand::Ingest(reading)) => {
                    self.apply_reading(reading, Instant::now());
                }
                Ok(EngineCommand::SweepFaults) => self.sweep_faults(Instant::now()),
                Ok(EngineCommand::Shutdown) => return false,
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn apply_reading(&mut self, reading: SensorReading, now: Instant) {
        self.stats.readings += 1;
        if !self.registry.contains(reading.sensor_id) {
            if let Err(error) = self.registry.create(&mut self.vlan, reading.sensor_id, now) {
                warn!(%error, "sensor registry refused creation");
                return;
            }
        }
        let Some(device) = self.registry.get_mut(&mut self.vlan, reading.sensor_id) else {
            return;
        };
        device.set_values(&reading.values, now);
    }

    fn sweep_faults(&mut self, now: Instant) {
        for summary in self.registry.snapshot(&self.vlan).values() {
            if summary.has_fault
                || now.duration_since(summary.last_updated) <= self.fault_timeout
            {
                continue;
            }
            if let Some(device) = self.registry.get_mut(&mut self.vlan, summary.sensor_id) {
                warn!(sensor = summary.sensor_id, "sensor data outdated, raising fault");
                device.mark_fault();
                self.stats.faults_raised += 1;
            }
        }
    }

    fn sweep_segments(&mut self, now: Instant) {
        for index in 0..self.vlan.node_count() {
            let Some(node) = self.vlan.node_at_mut(index) else {
                break;
            };
            let address = *node.address();
            let outputs = node.sweep_segments(now);
            for output in outputs {
                if let Some(action) = self.router.route_from_vlan(&address, output) {
                    self.execute_ip_action(action);
                }
            }
        }
    }

    /// Process one raw datagram from the UDP endpoint.
    fn handle_datagram(&mut self, data: &[u8], source: SocketAddrV4, now: Instant) {
        self.stats.datagrams += 1;
        let pdu = match bvll::decode(data) {
            Ok(pdu) => pdu,
            Err(error) => {
                self.stats.dropped_frames += 1;
                debug!(%source, %error, "dropping malformed BVLL frame");
                return;
            }
        };
        match pdu {
            BvllPdu::OriginalUnicast { npdu } | BvllPdu::OriginalBroadcast { npdu } => {
                self.route_ip(&npdu, source, now);
            }
            BvllPdu::Forwarded { origin, npdu } => {
                // Broadcast relayed by a BBMD; the originator is in the header.
                self.route_ip(&npdu, origin, now);
            }
            BvllPdu::DistributeBroadcast { npdu } => {
                // Re-emit on the local wire on the sender's behalf, then route.
                let relay = bvll::encode_forwarded(source, &npdu);
                if let Err(error) = self.transport.send(&relay, SendTo::Broadcast) {
                    warn!(%error, "failed to re-broadcast distributed NPDU");
                }
                self.route_ip(&npdu, source, now);
            }
            BvllPdu::Unsupported { function } => {
                trace!(?function, %source, "refusing BVLL function");
                if let Some(code) = bvll::nak_code(function) {
                    let frame = bvll::encode_result(code);
                    if let Err(error) = self.transport.send(&frame, SendTo::Unicast(source)) {
                        warn!(%error, "failed to send BVLL-Result");
                    }
                }
            }
            BvllPdu::Result { code } => {
                trace!(code, %source, "BVLL-Result ignored");
            }
        }
    }

    fn route_ip(&mut self, npdu: &[u8], source: SocketAddrV4, now: Instant) {
        let actions = match self.router.route_from_ip(npdu, source) {
            Ok(actions) => actions,
            Err(error) => {
                self.stats.dropped_frames += 1;
                debug!(%source, %error, "dropping unroutable NPDU");
                return;
            }
        };
        for action in actions {
            match action {
                RouterAction::VlanDeliver {
                    destination,
                    source: origin,
                    apdu,
                } => {
                    let outputs = self.vlan.deliver(&destination, Some(&origin), &apdu, now);
                    for (address, output) in outputs {
                        if let Some(action) = self.router.route_from_vlan(&address, output) {
                            self.execute_ip_action(action);
                        }
                    }
                }
                other => self.execute_ip_action(other),
            }
        }
    }

    fn execute_ip_action(&mut self, action: RouterAction) {
        let result = match action {
            RouterAction::IpUnicast { destination, npdu } => self
                .transport
                .send(&bvll::encode_unicast(&npdu), SendTo::Unicast(destination)),
            RouterAction::IpBroadcast { npdu } => self
                .transport
                .send(&bvll::encode_broadcast(&npdu), SendTo::Broadcast),
            RouterAction::VlanDeliver { .. } => {
                // route_from_vlan never produces a VLAN delivery.
                debug_assert!(false, "unexpected VLAN action on the IP path");
                Ok(())
            }
        };
        if let Err(error) = result {
            // Failed sends are dropped; the peer will retry.
            warn!(%error, "UDP send failed");
        }
    }

    #[cfg(test)]
    fn vlan_addr_of(&self, sensor_id: u32) -> Option<super::vlan::VlanAddr> {
        self.registry
            .snapshot(&self.vlan)
            .get(&sensor_id)
            .map(|summary| summary.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bacnet::apdu::{Apdu, MaxApduSize, MaxSegments};
    use crate::bacnet::npdu::{GLOBAL_BROADCAST_NETWORK, NetworkAddress, Npdu};
    use crate::bacnet::object::{ObjectIdentifier, ObjectType, PropertyIdentifier};
    use crate::bacnet::services::{
        ConfirmedServiceChoice, IAmRequest, ReadPropertyAck, ReadPropertyRequest,
        UnconfirmedServiceChoice, WhoIsRequest,
    };
    use crate::bacnet::vlan::VlanAddr;
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    /// Captures outbound frames instead of touching a socket.
    #[derive(Default)]
    struct MockTransport {
        sent: Mutex<Vec<(SendTo, Vec<u8>)>>,
    }

    impl Transport for MockTransport {
        fn send(&self, frame: &[u8], to: SendTo) -> std::io::Result<()> {
            self.sent.lock().unwrap().push((to, frame.to_vec()));
            Ok(())
        }

        fn recv(&self, _buffer: &mut [u8]) -> std::io::Result<Option<(usize, SocketAddrV4)>> {
            Ok(None)
        }
    }

    fn engine() -> (Engine<MockTransport>, EngineHandle) {
        Engine::new(MockTransport::default(), 1, Duration::from_secs(600))
    }

    fn client() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 7, 7), 47808)
    }

    fn reading(sensor_id: u32, pairs: &[(&str, f64)]) -> SensorReading {
        SensorReading {
            sensor_id,
            values: pairs
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect::<BTreeMap<_, _>>(),
            dropped: Vec::new(),
        }
    }

    fn who_is_datagram() -> Vec<u8> {
        let mut npdu = Npdu::remote(
            NetworkAddress::broadcast(GLOBAL_BROADCAST_NETWORK),
            false,
        )
        .encode();
        npdu.extend_from_slice(
            &Apdu::UnconfirmedRequest {
                service_choice: UnconfirmedServiceChoice::WhoIs as u8,
                service_data: Vec::new(),
            }
            .encode(),
        );
        bvll::encode_broadcast(&npdu)
    }

    fn read_property_datagram(
        vlan_addr: &VlanAddr,
        request: ReadPropertyRequest,
    ) -> Vec<u8> {
        let mut payload = Vec::new();
        request.encode(&mut payload).unwrap();
        let apdu = Apdu::ConfirmedRequest {
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
        };
        let mut npdu = Npdu::remote(
            NetworkAddress::new(1, vlan_addr.as_bytes().to_vec()),
            true,
        )
        .encode();
        npdu.extend_from_slice(&apdu.encode());
        bvll::encode_unicast(&npdu)
    }

    fn sent_apdus(transport: &MockTransport) -> Vec<(SendTo, Apdu)> {
        transport
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(to, frame)| match bvll::decode(frame).ok()? {
                BvllPdu::OriginalUnicast { npdu } | BvllPdu::OriginalBroadcast { npdu } => {
                    let (header, consumed) = Npdu::decode(&npdu).ok()?;
                    if header.is_network_message() {
                        return None;
                    }
                    Some((*to, Apdu::decode(&npdu[consumed..]).ok()?))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn who_is_elicits_one_i_am_per_registered_device() {
        let (mut engine, _handle) = engine();
        let now = Instant::now();
        engine.apply_reading(reading(1, &[("temp", 21.5), ("hum", 40.0)]), now);
        engine.apply_reading(reading(2, &[("t", 1.0)]), now);

        engine.handle_datagram(&who_is_datagram(), client(), now);

        let replies = sent_apdus(&engine.transport);
        assert_eq!(replies.len(), 2);
        let mut instances = Vec::new();
        for (to, apdu) in &replies {
            assert_eq!(*to, SendTo::Unicast(client()));
            match apdu {
                Apdu::UnconfirmedRequest { service_data, .. } => {
                    let announce = IAmRequest::decode(service_data).unwrap();
                    assert_eq!(announce.vendor_identifier, 15);
                    assert_eq!(announce.max_apdu_length_accepted, 1024);
                    instances.push(announce.device_identifier.instance);
                }
                other => panic!("expected I-Am, got {other:?}"),
            }
        }
        instances.sort_unstable();
        assert_eq!(instances, vec![1, 2]);
    }

    #[test]
    fn read_property_round_trip_through_the_router() {
        let (mut engine, _handle) = engine();
        let now = Instant::now();
        engine.apply_reading(reading(1, &[("co2", 800.0)]), now);
        let vlan_addr = engine.vlan_addr_of(1).unwrap();

        engine.handle_datagram(
            &read_property_datagram(
                &vlan_addr,
                ReadPropertyRequest::new(
                    ObjectIdentifier::new(ObjectType::AnalogValue, 0),
                    PropertyIdentifier::PresentValue as u32,
                ),
            ),
            client(),
            now,
        );

        let replies = sent_apdus(&engine.transport);
        assert_eq!(replies.len(), 1);
        match &replies[0].1 {
            Apdu::ComplexAck { service_data, .. } => {
                let ack = ReadPropertyAck::decode(service_data).unwrap();
                let (value, _) =
                    crate::bacnet::encoding::decode_real(&ack.property_value).unwrap();
                assert_eq!(value, 800.0);
            }
            other => panic!("expected ComplexAck, got {other:?}"),
        }
    }

    #[test]
    fn schema_change_invalidates_old_identifiers() {
        let (mut engine, _handle) = engine();
        let now = Instant::now();
        engine.apply_reading(reading(1, &[("temp", 21.5), ("hum", 40.0)]), now);
        engine.apply_reading(reading(1, &[("co2", 800.0)]), now);
        let vlan_addr = engine.vlan_addr_of(1).unwrap();

        engine.handle_datagram(
            &read_property_datagram(
                &vlan_addr,
                ReadPropertyRequest::new(
                    ObjectIdentifier::new(ObjectType::AnalogValue, 1),
                    PropertyIdentifier::PresentValue as u32,
                ),
            ),
            client(),
            now,
        );

        let replies = sent_apdus(&engine.transport);
        match &replies[0].1 {
            Apdu::Error { error_code, .. } => assert_eq!(*error_code, 31),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn fault_sweep_marks_stale_devices_and_ingest_clears() {
        let (mut engine, _handle) = engine();
        let t0 = Instant::now();
        engine.apply_reading(reading(1, &[("temp", 21.5)]), t0);

        // One second short of the timeout: nothing happens.
        engine.sweep_faults(t0 + Duration::from_secs(599));
        assert!(!engine.registry.snapshot(&engine.vlan)[&1].has_fault);

        // Past the timeout: fault raised on device and objects.
        engine.sweep_faults(t0 + Duration::from_secs(601));
        assert!(engine.registry.snapshot(&engine.vlan)[&1].has_fault);
        let device = engine.registry.get_mut(&mut engine.vlan, 1).unwrap();
        assert!(device.objects()[0].status_flags.fault);

        // Fresh data clears it.
        engine.apply_reading(reading(1, &[("temp", 22.0)]), t0 + Duration::from_secs(602));
        assert!(!engine.registry.snapshot(&engine.vlan)[&1].has_fault);
    }

    #[test]
    fn startup_announces_the_virtual_network() {
        let (mut engine, _handle) = engine();
        engine.announce();
        let sent = engine.transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, SendTo::Broadcast);
        // BVLL broadcast carrying I-Am-Router-To-Network(1)
        assert_eq!(
            sent[0].1,
            vec![0x81, 0x0B, 0x00, 0x09, 0x01, 0x80, 0x01, 0x00, 0x01]
        );
    }

    #[test]
    fn malformed_frames_are_counted_and_dropped() {
        let (mut engine, _handle) = engine();
        engine.handle_datagram(&[0x42, 0x00], client(), Instant::now());
        assert_eq!(engine.stats.dropped_frames, 1);
        assert!(engine.transport.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn bbmd_registration_gets_a_nak() {
        let (mut engine, _handle) = engine();
        // Register-Foreign-Device with TTL 60
        let frame = vec![0x81, 0x05, 0x00, 0x06, 0x00, 0x3C];
        engine.handle_datagram(&frame, client(), Instant::now());
        let sent = engine.transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, SendTo::Unicast(client()));
        assert_eq!(sent[0].1, vec![0x81, 0x00, 0x00, 0x06, 0x00, 0x30]);
    }

    #[test]
    fn who_is_with_range_filters_devices() {
        let (mut engine, _handle) = engine();
        let now = Instant::now();
        engine.apply_reading(reading(1, &[("a", 1.0)]), now);
        engine.apply_reading(reading(9, &[("b", 2.0)]), now);

        let mut payload = Vec::new();
        WhoIsRequest::for_range(5, 20).encode(&mut payload).unwrap();
        let mut npdu = Npdu::remote(
            NetworkAddress::broadcast(GLOBAL_BROADCAST_NETWORK),
            false,
        )
        .encode();
        npdu.extend_from_slice(
            &Apdu::UnconfirmedRequest {
                service_choice: UnconfirmedServiceChoice::WhoIs as u8,
                service_data: payload,
            }
            .encode(),
        );
        engine.handle_datagram(&bvll::encode_broadcast(&npdu), client(), now);

        let replies = sent_apdus(&engine.transport);
        assert_eq!(replies.len(), 1);
        match &replies[0].1 {
            Apdu::UnconfirmedRequest { service_data, .. } => {
                let announce = IAmRequest::decode(service_data).unwrap();
                assert_eq!(announce.device_identifier.instance, 9);
            }
            other => panic!("expected I-Am, got {other:?}"),
        }
    }
}
